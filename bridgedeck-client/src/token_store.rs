use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bridgedeck_core::{ApiError, Credential, credential_fingerprint};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{client_state::ClientStateStore, lock, now_unix_ms, transport::ApiTransport};

pub const TOKEN_QUERY_PARAM: &str = "token";

/// One place a credential can live. Locations are consulted in priority
/// order by [`TokenStore::reconcile`], which is their only writer.
pub trait CredentialLocation: Send + Sync {
    fn name(&self) -> &'static str;
    fn read(&self) -> Option<String>;
    fn write(&self, value: Option<&str>);
}

/// The console URL; the credential is its `token` query parameter.
#[derive(Debug)]
pub struct NavigationContext {
    url: Mutex<Url>,
}

impl NavigationContext {
    pub fn new(url: Url) -> Self {
        Self {
            url: Mutex::new(url),
        }
    }

    pub fn url(&self) -> Url {
        lock(&self.url).clone()
    }
}

impl CredentialLocation for NavigationContext {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn read(&self) -> Option<String> {
        lock(&self.url)
            .query_pairs()
            .find(|(key, _)| key == TOKEN_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
    }

    fn write(&self, value: Option<&str>) {
        let mut url = lock(&self.url);
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != TOKEN_QUERY_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.set_query(None);
        if retained.is_empty() && value.is_none() {
            return;
        }
        let mut pairs = url.query_pairs_mut();
        for (key, existing) in &retained {
            pairs.append_pair(key, existing);
        }
        if let Some(value) = value {
            pairs.append_pair(TOKEN_QUERY_PARAM, value);
        }
    }
}

/// The `credential` slot of the persisted client state.
#[derive(Debug)]
pub struct PersistentSlot {
    store: Arc<ClientStateStore>,
}

impl PersistentSlot {
    pub fn new(store: Arc<ClientStateStore>) -> Self {
        Self { store }
    }
}

impl CredentialLocation for PersistentSlot {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn read(&self) -> Option<String> {
        self.store.snapshot().credential
    }

    fn write(&self, value: Option<&str>) {
        self.store
            .update(|state| state.credential = value.map(str::to_owned));
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    value: Mutex<Option<String>>,
}

impl CredentialLocation for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self) -> Option<String> {
        lock(&self.value).clone()
    }

    fn write(&self, value: Option<&str>) {
        *lock(&self.value) = value.map(str::to_owned);
    }
}

struct InFlightValidation {
    token: String,
    generation: u64,
    outcome: Shared<BoxFuture<'static, Result<bool, ApiError>>>,
}

/// Single source of truth for the credential.
pub struct TokenStore {
    locations: Vec<Box<dyn CredentialLocation>>,
    transport: ApiTransport,
    validation_wait_cap: Duration,
    current: Mutex<Option<Credential>>,
    in_flight: Mutex<Option<InFlightValidation>>,
    generations: AtomicU64,
}

impl TokenStore {
    /// `locations` are in priority order, highest first.
    pub fn new(
        transport: ApiTransport,
        locations: Vec<Box<dyn CredentialLocation>>,
        validation_wait_cap: Duration,
    ) -> Self {
        Self {
            locations,
            transport,
            validation_wait_cap,
            current: Mutex::new(None),
            in_flight: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Credential> {
        lock(&self.current).clone()
    }

    /// Picks the highest-priority non-empty candidate and copies it to every
    /// location holding something else. Locations that already agree are
    /// left untouched.
    pub fn reconcile(&self) -> Option<Credential> {
        let raw: Vec<Option<String>> = self.locations.iter().map(|loc| loc.read()).collect();
        let candidates: Vec<Option<String>> = raw
            .iter()
            .map(|value| {
                value
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_owned)
            })
            .collect();

        let Some(winner) = candidates.iter().flatten().next().cloned() else {
            for (location, value) in self.locations.iter().zip(&raw) {
                if value.is_some() {
                    location.write(None);
                }
            }
            *lock(&self.current) = None;
            return None;
        };

        for (location, value) in self.locations.iter().zip(&raw) {
            if value.as_deref() != Some(winner.as_str()) {
                debug!(
                    location = location.name(),
                    credential = %credential_fingerprint(&winner),
                    "writing reconciled credential"
                );
                location.write(Some(&winner));
            }
        }

        let mut current = lock(&self.current);
        if current.as_ref().map(Credential::value) != Some(winner.as_str()) {
            *current = Credential::new(winner, now_unix_ms());
        }
        current.clone()
    }

    /// `validate` for callers that act on a rejection: `Ok(false)` means the
    /// gateway refused the token, an error means nobody could tell.
    ///
    /// Concurrent callers for the same token share one probe. Nobody waits
    /// longer than the wait cap; a timed-out probe is forgotten and reported
    /// as a network failure.
    pub async fn check(&self, token: &str) -> Result<bool, ApiError> {
        let (generation, outcome) = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some(existing) if existing.token == token => {
                    debug!(credential = %credential_fingerprint(token), "joining in-flight validation");
                    (existing.generation, existing.outcome.clone())
                }
                _ => {
                    let transport = self.transport.clone();
                    let owned = token.to_owned();
                    let outcome = async move { transport.probe_credential(&owned).await }
                        .boxed()
                        .shared();
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                    *in_flight = Some(InFlightValidation {
                        token: token.to_owned(),
                        generation,
                        outcome: outcome.clone(),
                    });
                    (generation, outcome)
                }
            }
        };

        let result = tokio::time::timeout(self.validation_wait_cap, outcome).await;

        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .as_ref()
            .is_some_and(|existing| existing.generation == generation)
        {
            *in_flight = None;
        }

        match result {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    credential = %credential_fingerprint(token),
                    waited = ?self.validation_wait_cap,
                    "credential validation timed out"
                );
                Err(ApiError::Network("credential validation timed out".to_owned()))
            }
        }
    }

    /// Fails closed: anything short of an accepted probe is `false`.
    pub async fn validate(&self, token: &str) -> bool {
        matches!(self.check(token).await, Ok(true))
    }

    pub fn clear(&self) {
        for location in &self.locations {
            if location.read().is_some() {
                location.write(None);
            }
        }
        *lock(&self.current) = None;
        *lock(&self.in_flight) = None;
        info!("credential cleared");
    }
}
