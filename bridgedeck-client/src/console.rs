use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, Weak},
};

use bridgedeck_core::{
    ApiError, ConnectionState, CreateInstanceRequest, Credential, EventKind, InstanceId,
    InstanceSummary, ReconnectDecision, Route, RouteClass, SessionScope, StatusOrigin,
    StatusSnapshot, join_event_set,
};
use rand::{Rng, distr::Alphanumeric};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    client_state::ClientStateStore,
    config::ConsoleConfig,
    connection::{ConnectionStateMachine, PairingArtifact, PairingMethod, ProbeOutcome},
    lock, now_unix_ms,
    registry::{Instance, InstanceRegistry},
    scheduler::{PollingScheduler, TaskKind, TaskToken, TickControl},
    token_store::{CredentialLocation, MemoryCache, NavigationContext, PersistentSlot, TokenStore},
    transport::{ApiTransport, CallContext},
};

pub const GENERATED_TOKEN_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Everything a host needs to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    SignedIn {
        scope: SessionScope,
    },
    SelectionChanged {
        instance_id: Option<InstanceId>,
    },
    StateChanged {
        instance_id: InstanceId,
        previous: ConnectionState,
        current: ConnectionState,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
    PairingArtifact {
        instance_id: InstanceId,
        artifact: PairingArtifact,
    },
    ReauthenticationRequired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewInstance {
    pub name: String,
    pub token: Option<String>,
    pub webhook: Option<String>,
    pub events: BTreeSet<EventKind>,
}

#[derive(Debug, Default)]
struct Session {
    credential: Option<Credential>,
    scope: SessionScope,
}

#[derive(Debug, Clone, Copy)]
enum RefreshOrigin<'a> {
    Manual,
    StatusTask(&'a TaskToken),
    PairingTask(&'a TaskToken),
}

impl RefreshOrigin<'_> {
    fn token(&self) -> Option<&TaskToken> {
        match self {
            RefreshOrigin::Manual => None,
            RefreshOrigin::StatusTask(token) | RefreshOrigin::PairingTask(token) => Some(token),
        }
    }
}

struct ConsoleInner {
    config: ConsoleConfig,
    transport: ApiTransport,
    tokens: TokenStore,
    navigation: Option<Arc<NavigationContext>>,
    client_state: Arc<ClientStateStore>,
    registry: Mutex<InstanceRegistry>,
    session: Mutex<Session>,
    scheduler: PollingScheduler,
    events: mpsc::UnboundedSender<ConsoleEvent>,
}

/// Owned context wiring credential, transport, registry, state machines
/// and scheduler together. Cheap to clone.
#[derive(Clone)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

impl Console {
    pub fn new(
        config: ConsoleConfig,
        client_state: ClientStateStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConsoleEvent>), ApiError> {
        let transport = ApiTransport::new(&config)?;
        let client_state = Arc::new(client_state);
        let navigation = config
            .navigation_url
            .clone()
            .map(|url| Arc::new(NavigationContext::new(url)));

        let mut locations: Vec<Box<dyn CredentialLocation>> = Vec::new();
        if let Some(navigation) = &navigation {
            locations.push(Box::new(SharedLocation(navigation.clone())));
        }
        locations.push(Box::new(PersistentSlot::new(client_state.clone())));
        locations.push(Box::new(MemoryCache::default()));

        let tokens = TokenStore::new(transport.clone(), locations, config.validation_wait_cap);
        let scheduler = PollingScheduler::new(config.max_reconnect_attempts);
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = ConsoleInner {
            config,
            transport,
            tokens,
            navigation,
            client_state,
            registry: Mutex::new(InstanceRegistry::default()),
            session: Mutex::new(Session::default()),
            scheduler,
            events,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.inner.config
    }

    pub fn scope(&self) -> SessionScope {
        lock(&self.inner.session).scope.clone()
    }

    pub fn is_admin(&self) -> bool {
        lock(&self.inner.session).scope.is_admin()
    }

    pub fn credential(&self) -> Option<Credential> {
        lock(&self.inner.session).credential.clone()
    }

    /// Current console URL, with the reconciled `token` parameter.
    pub fn navigation_url(&self) -> Option<url::Url> {
        self.inner.navigation.as_ref().map(|nav| nav.url())
    }

    pub fn instances(&self) -> Vec<Instance> {
        lock(&self.inner.registry).list().to_vec()
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        lock(&self.inner.registry).get(id).cloned()
    }

    pub fn selected_instance(&self) -> Option<InstanceId> {
        lock(&self.inner.registry).selected().map(str::to_owned)
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.inner.scheduler
    }

    pub fn client_state(&self) -> &ClientStateStore {
        &self.inner.client_state
    }

    /// Reconcile, validate, then resolve what the credential may see.
    pub async fn sign_in(&self) -> Result<SessionScope, ApiError> {
        let credential = self.inner.tokens.reconcile().ok_or(ApiError::MissingCredential)?;
        let fingerprint = credential.fingerprint();
        info!(credential = %fingerprint, "signing in");

        // Only an explicit rejection revokes; an unreachable gateway keeps
        // the stored credential for the next attempt.
        match self.inner.tokens.check(credential.value()).await {
            Ok(true) => {}
            Ok(false) => {
                self.revoke_session();
                return Err(ApiError::Auth { status: 401 });
            }
            Err(err) => {
                warn!(credential = %fingerprint, "sign-in deferred: {err}");
                return Err(err);
            }
        }

        let scope = self.resolve_scope(&credential).await?;
        {
            let mut session = lock(&self.inner.session);
            session.credential = Some(credential);
            session.scope = scope.clone();
        }
        info!(credential = %fingerprint, admin = scope.is_admin(), "signed in");
        self.emit(ConsoleEvent::SignedIn {
            scope: scope.clone(),
        });
        Ok(scope)
    }

    pub fn sign_out(&self) {
        self.inner.scheduler.cancel_all();
        self.inner.tokens.clear();
        *lock(&self.inner.session) = Session::default();
        lock(&self.inner.registry).clear();
        self.inner.client_state.update(|state| {
            state.current_instance = None;
            state.instance_status = None;
        });
        info!("signed out");
        self.emit(ConsoleEvent::SelectionChanged { instance_id: None });
    }

    pub async fn load_instances(&self) -> Result<Vec<Instance>, ApiError> {
        let ctx = self.call_context();
        let payload = match self
            .inner
            .transport
            .call(&ctx, Method::GET, &Route::instances(), None, None)
            .await
        {
            Ok(payload) => payload,
            Err(err) => return Err(self.after_failure(err, RouteClass::Standard).await),
        };
        let summaries = InstanceSummary::list_from_payload(&payload)?;
        info!(count = summaries.len(), "instances loaded");

        let persisted = self.inner.client_state.snapshot();
        let restore = {
            let mut registry = lock(&self.inner.registry);
            registry.replace_all(summaries);
            let wanted = registry
                .selected()
                .map(str::to_owned)
                .or(persisted.current_instance.clone())
                .filter(|id| registry.get(id).is_some());
            wanted.or_else(|| registry.first_id().map(str::to_owned))
        };

        if let Some(id) = restore {
            if let Some(snapshot) = persisted.instance_status.filter(|snapshot| {
                snapshot.instance_id == id
                    && snapshot.is_fresh(now_unix_ms(), self.inner.config.snapshot_max_age)
            }) {
                debug!(instance_id = %id, "applying cached status snapshot");
                let change = lock(&self.inner.registry).apply_cached(
                    &id,
                    snapshot.state(),
                    snapshot.phone.clone(),
                );
                if let Some(change) = change.filter(|change| change.changed()) {
                    self.emit(ConsoleEvent::StateChanged {
                        instance_id: id.clone(),
                        previous: change.previous,
                        current: change.current,
                    });
                }
            }
            self.select_instance(&id).await?;
        }

        Ok(self.instances())
    }

    /// Selecting the already-selected instance starts nothing new.
    pub async fn select_instance(&self, id: &str) -> Result<(), ApiError> {
        let previous = {
            let registry = lock(&self.inner.registry);
            registry.require(id)?;
            registry.selected().map(str::to_owned)
        };
        bridgedeck_core::check_scope(&self.scope(), Some(id))?;

        if previous.as_deref() == Some(id)
            && self.inner.scheduler.is_running(id, TaskKind::StatusRefresh)
        {
            debug!(instance_id = %id, "instance already selected");
            return Ok(());
        }
        if let Some(previous) = previous.as_deref().filter(|previous| *previous != id) {
            self.inner.scheduler.cancel_instance(previous);
        }

        lock(&self.inner.registry).select(id)?;
        self.inner
            .client_state
            .update(|state| state.current_instance = Some(id.to_owned()));
        info!(instance_id = %id, "instance selected");
        self.emit(ConsoleEvent::SelectionChanged {
            instance_id: Some(id.to_owned()),
        });

        self.ensure_status_task(id);
        if let Err(err) = self.refresh_instance(id, RefreshOrigin::Manual).await {
            debug!(instance_id = %id, "initial probe failed: {err}");
        }
        Ok(())
    }

    pub fn deselect_instance(&self) {
        let previous = lock(&self.inner.registry).deselect();
        if let Some(id) = previous {
            self.inner.scheduler.cancel_instance(&id);
            self.inner.client_state.update(|state| {
                state.current_instance = None;
                state.instance_status = None;
            });
            info!(instance_id = %id, "instance deselected");
            self.emit(ConsoleEvent::SelectionChanged { instance_id: None });
        }
    }

    pub async fn refresh_status(&self) -> Result<ConnectionState, ApiError> {
        let id = self.require_selected()?;
        self.refresh_instance(&id, RefreshOrigin::Manual).await
    }

    /// Connects the selected instance, waits for the gateway to settle and
    /// re-probes. Re-arms automatic reconnects.
    pub async fn connect(&self) -> Result<ConnectionState, ApiError> {
        let id = self.require_selected()?;
        self.inner.scheduler.with_policy(&id, |policy| policy.reset());

        let before = self.state_of(&id);
        let result = self.machine(&id).connect(None).await;
        self.publish_transition(&id, before);
        if let Err(err) = result {
            return Err(self.report_failure(&id, "connect", err).await);
        }
        self.notice(NoticeLevel::Info, format!("Instance {id} is connecting"));

        self.ensure_status_task(&id);
        tokio::time::sleep(self.inner.config.connect_settle).await;
        self.refresh_instance(&id, RefreshOrigin::Manual).await
    }

    pub async fn disconnect(&self) -> Result<ConnectionState, ApiError> {
        let id = self.require_selected()?;
        let before = self.state_of(&id);
        let result = self.machine(&id).disconnect().await;
        self.publish_transition(&id, before);
        match result {
            Ok(state) => {
                self.inner
                    .scheduler
                    .cancel(&id, TaskKind::PairingConfirmation);
                Ok(state)
            }
            Err(err) => Err(self.report_failure(&id, "disconnect", err).await),
        }
    }

    pub async fn logout(&self) -> Result<ConnectionState, ApiError> {
        let id = self.require_selected()?;
        let before = self.state_of(&id);
        let result = self.machine(&id).logout().await;
        self.publish_transition(&id, before);
        match result {
            Ok(state) => Ok(state),
            Err(err) => Err(self.report_failure(&id, "logout", err).await),
        }
    }

    pub async fn request_qr(&self) -> Result<PairingArtifact, ApiError> {
        self.request_pairing(PairingMethod::QrCode).await
    }

    pub async fn request_linking_code(&self, phone: &str) -> Result<PairingArtifact, ApiError> {
        self.request_pairing(PairingMethod::LinkingCode {
            phone: phone.to_owned(),
        })
        .await
    }

    pub async fn create_instance(&self, request: NewInstance) -> Result<Instance, ApiError> {
        if !self.is_admin() {
            return Err(ApiError::AdminRequired);
        }
        let name = request.name.trim().to_owned();
        if name.is_empty() {
            return Err(ApiError::InvalidRequest("instance name is required".to_owned()));
        }

        let body = CreateInstanceRequest {
            name: name.clone(),
            token: request
                .token
                .map(|token| token.trim().to_owned())
                .filter(|token| !token.is_empty())
                .unwrap_or_else(generate_instance_token),
            webhook: request
                .webhook
                .map(|webhook| webhook.trim().to_owned())
                .filter(|webhook| !webhook.is_empty()),
            events: Some(join_event_set(&request.events)).filter(|events| !events.is_empty()),
        };
        let body = serde_json::to_value(&body)
            .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;

        let ctx = self.call_context();
        let payload = match self
            .inner
            .transport
            .call(&ctx, Method::POST, &Route::create_instance(), Some(&body), None)
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                let err = self.after_failure(err, RouteClass::Standard).await;
                self.notice(NoticeLevel::Error, format!("Failed to create instance: {err}"));
                return Err(err);
            }
        };

        let created = created_instance(&payload, &name, &body)?;
        lock(&self.inner.registry).upsert(created.clone());
        info!(instance_id = %created.id, name = %created.name, "instance created");
        self.notice(NoticeLevel::Info, format!("Instance {} created", created.name));
        Ok(created)
    }

    /// Force-disconnects and logs out a live instance before deleting it.
    pub async fn delete_instance(&self, id: &str) -> Result<(), ApiError> {
        if !self.is_admin() {
            return Err(ApiError::AdminRequired);
        }
        lock(&self.inner.registry).require(id)?;
        self.inner.scheduler.cancel_instance(id);

        // The cached state may be stale; ask the gateway before deciding the
        // session needs tearing down.
        let machine = self.machine(id);
        let live = match machine.probe().await {
            Ok(outcome) => {
                outcome.record.origin == StatusOrigin::OfflineFallback
                    || outcome.record.connected
                    || outcome.record.logged_in
            }
            Err(err) if err.is_auth() => {
                return Err(self.after_failure(err, RouteClass::Standard).await);
            }
            Err(err) => {
                debug!(instance_id = %id, "status before delete unavailable: {err}");
                true
            }
        };

        if live {
            if let Err(err) = machine.send_disconnect().await {
                warn!(instance_id = %id, "disconnect before delete failed: {err}");
            }
            tokio::time::sleep(self.inner.config.step_pause).await;
            if let Err(err) = machine.send_logout().await {
                warn!(instance_id = %id, "logout before delete failed: {err}");
            }
            tokio::time::sleep(self.inner.config.step_pause).await;
        }

        let ctx = self.call_context();
        if let Err(err) = self
            .inner
            .transport
            .call(&ctx, Method::DELETE, &Route::delete_instance_complete(id), None, None)
            .await
        {
            let err = self.after_failure(err, RouteClass::Administrative).await;
            self.notice(NoticeLevel::Error, format!("Failed to delete instance {id}: {err}"));
            return Err(err);
        }

        let was_selected = {
            let mut registry = lock(&self.inner.registry);
            let was_selected = registry.is_selected(id);
            registry.remove(id);
            was_selected
        };
        if was_selected {
            self.inner.client_state.update(|state| {
                state.current_instance = None;
                state.instance_status = None;
            });
            self.emit(ConsoleEvent::SelectionChanged { instance_id: None });
        }
        info!(instance_id = %id, "instance deleted");
        self.notice(NoticeLevel::Info, format!("Instance {id} deleted"));
        Ok(())
    }

    /// Cancels every recurring task.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel_all();
        info!("console shut down");
    }

    async fn request_pairing(&self, method: PairingMethod) -> Result<PairingArtifact, ApiError> {
        let id = self.require_selected()?;
        let before = self.state_of(&id);
        let result = self.machine(&id).request_pairing(&method).await;
        self.publish_transition(&id, before);

        match result {
            Ok(PairingArtifact::AlreadyPaired) => {
                self.inner
                    .scheduler
                    .cancel(&id, TaskKind::PairingConfirmation);
                self.notice(NoticeLevel::Info, format!("Instance {id} is already paired"));
                Ok(PairingArtifact::AlreadyPaired)
            }
            Ok(artifact) => {
                self.ensure_status_task(&id);
                self.ensure_pairing_task(&id);
                self.emit(ConsoleEvent::PairingArtifact {
                    instance_id: id.clone(),
                    artifact: artifact.clone(),
                });
                Ok(artifact)
            }
            Err(err) => Err(self.report_failure(&id, "request a pairing code", err).await),
        }
    }

    /// One guarded probe. Side effects on the selection only apply while the
    /// instance is still selected and the calling task is still active.
    async fn refresh_instance(
        &self,
        id: &str,
        origin: RefreshOrigin<'_>,
    ) -> Result<ConnectionState, ApiError> {
        let Some(_guard) = self.inner.scheduler.begin_reconcile(id) else {
            debug!(instance_id = %id, "status probe already in flight");
            return self
                .state_of(id)
                .ok_or_else(|| ApiError::UnknownInstance(id.to_owned()));
        };

        let before = self.state_of(id);
        let outcome = match self.machine(id).probe().await {
            Ok(outcome) => outcome,
            Err(err) => {
                if self.is_relevant(id, origin) {
                    self.publish_transition(id, before);
                }
                let err = self.after_failure(err, RouteClass::Standard).await;
                warn!(instance_id = %id, "status probe failed: {err}");
                return Err(err);
            }
        };

        if !self.is_relevant(id, origin) {
            debug!(instance_id = %id, state = %outcome.state, "discarding late status result");
            return Ok(outcome.state);
        }

        self.publish_transition(id, before);
        self.persist_snapshot(id, &outcome);

        match outcome.state {
            ConnectionState::Authenticated => {
                self.inner
                    .scheduler
                    .with_policy(id, |policy| policy.observe_authenticated());
                self.inner
                    .scheduler
                    .cancel(id, TaskKind::PairingConfirmation);
            }
            ConnectionState::AwaitingPairing => self.ensure_pairing_task(id),
            _ => {}
        }

        if matches!(origin, RefreshOrigin::StatusTask(_)) && self.is_admin() {
            self.apply_reconnect_policy(id, &outcome).await;
        }
        Ok(outcome.state)
    }

    async fn apply_reconnect_policy(&self, id: &str, outcome: &ProbeOutcome) {
        let decision = self.inner.scheduler.with_policy(id, |policy| {
            policy.evaluate(outcome.state, outcome.record.is_session_absent())
        });

        let attempt = match decision {
            ReconnectDecision::Idle => return,
            ReconnectDecision::Exhausted => {
                warn!(
                    instance_id = %id,
                    max_attempts = self.inner.config.max_reconnect_attempts,
                    "automatic reconnect exhausted"
                );
                self.notice(
                    NoticeLevel::Warning,
                    format!("Instance {id} could not be reconnected automatically"),
                );
                return;
            }
            ReconnectDecision::RecoverSession { attempt } => {
                info!(instance_id = %id, attempt, "recovering absent session");
                attempt
            }
            ReconnectDecision::Retry { attempt } => {
                info!(
                    instance_id = %id,
                    attempt,
                    max_attempts = self.inner.config.max_reconnect_attempts,
                    "reconnecting"
                );
                attempt
            }
        };

        let before = self.state_of(id);
        let result = self.machine(id).connect(None).await;
        self.publish_transition(id, before);
        if let Err(err) = result {
            let err = self.after_failure(err, RouteClass::Standard).await;
            warn!(instance_id = %id, attempt, "automatic reconnect failed: {err}");
        }
        self.inner
            .scheduler
            .with_policy(id, |policy| policy.finish_recovery());
    }

    fn ensure_status_task(&self, id: &str) {
        let interval = if self.is_admin() {
            self.inner.config.admin_status_interval
        } else {
            self.inner.config.status_interval
        };
        let weak = Arc::downgrade(&self.inner);
        let instance_id = id.to_owned();
        self.inner
            .scheduler
            .start(id, TaskKind::StatusRefresh, interval, move |token| {
                let weak = weak.clone();
                let instance_id = instance_id.clone();
                async move {
                    let Some(console) = Console::upgrade(&weak) else {
                        return TickControl::Stop;
                    };
                    let _ = console
                        .refresh_instance(&instance_id, RefreshOrigin::StatusTask(&token))
                        .await;
                    TickControl::Continue
                }
            });
    }

    fn ensure_pairing_task(&self, id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let instance_id = id.to_owned();
        self.inner.scheduler.start(
            id,
            TaskKind::PairingConfirmation,
            self.inner.config.pairing_interval,
            move |token| {
                let weak = weak.clone();
                let instance_id = instance_id.clone();
                async move {
                    let Some(console) = Console::upgrade(&weak) else {
                        return TickControl::Stop;
                    };
                    match console
                        .refresh_instance(&instance_id, RefreshOrigin::PairingTask(&token))
                        .await
                    {
                        Ok(ConnectionState::Authenticated) => {
                            info!(instance_id = %instance_id, "pairing confirmed");
                            TickControl::Stop
                        }
                        _ if !token.is_active() => TickControl::Stop,
                        _ => TickControl::Continue,
                    }
                }
            },
        );
    }

    fn upgrade(weak: &Weak<ConsoleInner>) -> Option<Console> {
        weak.upgrade().map(|inner| Console { inner })
    }

    /// 401/403 on a non-administrative route: try the other credential
    /// locations once, otherwise drop the session.
    async fn after_failure(&self, err: ApiError, class: RouteClass) -> ApiError {
        if !err.is_auth() || class == RouteClass::Administrative {
            return err;
        }
        let Some(stale) = self.credential() else {
            return err;
        };

        if let Some(candidate) = self.inner.tokens.reconcile()
            && candidate.value() != stale.value()
            && self.inner.tokens.validate(candidate.value()).await
        {
            info!(credential = %candidate.fingerprint(), "switched to reconciled credential");
            lock(&self.inner.session).credential = Some(candidate);
            return err;
        }

        warn!(credential = %stale.fingerprint(), "credential rejected; signing out");
        self.revoke_session();
        err
    }

    fn revoke_session(&self) {
        self.inner.scheduler.cancel_all();
        self.inner.tokens.clear();
        *lock(&self.inner.session) = Session::default();
        self.emit(ConsoleEvent::ReauthenticationRequired);
    }

    async fn report_failure(&self, id: &str, operation: &str, err: ApiError) -> ApiError {
        let err = self.after_failure(err, RouteClass::Standard).await;
        warn!(instance_id = %id, operation, "operation failed: {err}");
        self.notice(
            NoticeLevel::Error,
            format!("Failed to {operation} on instance {id}: {err}"),
        );
        err
    }

    async fn resolve_scope(&self, credential: &Credential) -> Result<SessionScope, ApiError> {
        let ctx = CallContext::for_token(credential.clone());
        match self.inner.transport.admin_status(&ctx).await {
            Ok(status) if status.is_admin => {
                return Ok(SessionScope::Administrative {
                    user_id: status.user_id,
                    user_name: status.user_name,
                });
            }
            Ok(_) => debug!("credential is not administrative"),
            Err(ApiError::Network(message)) => return Err(ApiError::Network(message)),
            Err(err) => debug!("admin status probe failed: {err}"),
        }

        let payload = self
            .inner
            .transport
            .call(&ctx, Method::GET, &Route::instances(), None, None)
            .await?;
        let own = InstanceSummary::list_from_payload(&payload)?.into_iter().next();
        Ok(match own {
            Some(own) => SessionScope::Instance {
                instance_id: own.id,
                user_name: own.name,
            },
            None => {
                warn!("credential has no instance; scope left unresolved");
                SessionScope::Unresolved
            }
        })
    }

    fn call_context(&self) -> CallContext {
        let (credential, scope) = {
            let session = lock(&self.inner.session);
            (session.credential.clone(), session.scope.clone())
        };
        CallContext {
            credential,
            scope,
            current_instance: self.selected_instance(),
        }
    }

    fn machine<'a>(&'a self, id: &'a str) -> ConnectionStateMachine<'a> {
        ConnectionStateMachine::new(
            id,
            &self.inner.transport,
            &self.inner.registry,
            self.call_context(),
            self.inner.config.connect_settle,
        )
    }

    fn require_selected(&self) -> Result<InstanceId, ApiError> {
        self.selected_instance().ok_or(ApiError::NoInstanceSelected)
    }

    fn state_of(&self, id: &str) -> Option<ConnectionState> {
        lock(&self.inner.registry).state_of(id)
    }

    fn is_relevant(&self, id: &str, origin: RefreshOrigin<'_>) -> bool {
        lock(&self.inner.registry).is_selected(id)
            && origin.token().is_none_or(TaskToken::is_active)
    }

    fn publish_transition(&self, id: &str, before: Option<ConnectionState>) {
        let (Some(previous), Some(current)) = (before, self.state_of(id)) else {
            return;
        };
        if previous != current {
            info!(instance_id = %id, %previous, %current, "connection state changed");
            self.emit(ConsoleEvent::StateChanged {
                instance_id: id.to_owned(),
                previous,
                current,
            });
        }
    }

    fn persist_snapshot(&self, id: &str, outcome: &ProbeOutcome) {
        let phone = self.instance(id).and_then(|instance| instance.phone);
        let snapshot = StatusSnapshot {
            instance_id: id.to_owned(),
            connected: outcome.state.is_connected(),
            logged_in: outcome.state.is_authenticated(),
            phone,
            checked_at_unix_ms: now_unix_ms(),
        };
        self.inner
            .client_state
            .update(|state| state.instance_status = Some(snapshot));
    }

    fn notice(&self, level: NoticeLevel, message: String) {
        self.emit(ConsoleEvent::Notice { level, message });
    }

    fn emit(&self, event: ConsoleEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Lets the console keep a handle on the navigation context it registered.
struct SharedLocation(Arc<NavigationContext>);

impl CredentialLocation for SharedLocation {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn read(&self) -> Option<String> {
        self.0.read()
    }

    fn write(&self, value: Option<&str>) {
        self.0.write(value);
    }
}

pub fn generate_instance_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn created_instance(payload: &Value, name: &str, request: &Value) -> Result<Instance, ApiError> {
    let mut merged = match payload {
        Value::Object(fields) => fields.clone(),
        _ => {
            return Err(ApiError::Decode(
                "create response is not an object".to_owned(),
            ));
        }
    };
    if let Value::Object(sent) = request {
        for key in ["name", "webhook", "events"] {
            if let Some(value) = sent.get(key)
                && !merged.contains_key(key)
            {
                merged.insert(key.to_owned(), value.clone());
            }
        }
    }
    merged
        .entry("name")
        .or_insert_with(|| Value::String(name.to_owned()));

    InstanceSummary::from_payload(&Value::Object(merged)).map(Instance::from_summary)
}
