use std::time::Duration;

use bridgedeck_core::{
    AdminStatus, ApiError, Credential, INSTANCE_ID_HEADERS, Route, RouteClass, SessionScope,
    StatusRecord, auth_headers, check_scope, classify_status_attempt, credential_fingerprint,
    normalize_response, resolve_target_instance,
};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ConsoleConfig, now_unix_ms};

/// Who is calling: the credential, its scope and the instance the caller is
/// looking at.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub credential: Option<Credential>,
    pub scope: SessionScope,
    pub current_instance: Option<String>,
}

impl CallContext {
    pub fn for_token(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            scope: SessionScope::Unresolved,
            current_instance: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiTransport {
    base_url: Url,
    http: reqwest::Client,
    status_retry_limit: u32,
    status_retry_backoff: Duration,
}

impl ApiTransport {
    pub fn new(config: &ConsoleConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ApiError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(config, http))
    }

    pub fn with_client(config: &ConsoleConfig, http: reqwest::Client) -> Self {
        // Routes are joined relative to the base, so a sub-path prefix must
        // end in a slash to survive the join.
        let mut base_url = config.base_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            http,
            status_retry_limit: config.status_retry_limit,
            status_retry_backoff: config.status_retry_backoff,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn call(
        &self,
        ctx: &CallContext,
        method: Method,
        route: &Route,
        body: Option<&Value>,
        instance_override: Option<&str>,
    ) -> Result<Value, ApiError> {
        let credential = ctx.credential.as_ref().ok_or(ApiError::MissingCredential)?;
        let target = resolve_target_instance(route, instance_override, ctx.current_instance.as_deref());

        if let Err(err) = check_scope(&ctx.scope, target) {
            warn!(route = %route, "request blocked: {err}");
            return Err(err);
        }

        if method == Method::GET && route.is_status() {
            return self.status_with_retry(credential.value(), route, target).await;
        }

        let (status, text) = self
            .send(credential.value(), method, route, target, body)
            .await?;
        normalize_response(status, &text)
    }

    pub async fn fetch_status(
        &self,
        ctx: &CallContext,
        instance_id: &str,
    ) -> Result<StatusRecord, ApiError> {
        let payload = self
            .call(ctx, Method::GET, &Route::instance_status(instance_id), None, None)
            .await?;
        StatusRecord::from_payload(&payload)
    }

    /// Lightweight authenticated probe. `Ok(false)` only for a blank token
    /// or a 401/403; a gateway that cannot answer is an error, not a verdict.
    pub async fn probe_credential(&self, token: &str) -> Result<bool, ApiError> {
        let Some(credential) = Credential::new(token, now_unix_ms()) else {
            return Ok(false);
        };
        let fingerprint = credential_fingerprint(token);
        let ctx = CallContext::for_token(credential);

        match self.call(&ctx, Method::GET, &Route::instances(), None, None).await {
            Ok(_) => {
                debug!(credential = %fingerprint, "credential accepted");
                Ok(true)
            }
            Err(ApiError::Auth { status }) => {
                info!(credential = %fingerprint, status, "credential rejected");
                Ok(false)
            }
            Err(err) => {
                warn!(credential = %fingerprint, "credential probe failed: {err}");
                Err(err)
            }
        }
    }

    pub async fn admin_status(&self, ctx: &CallContext) -> Result<AdminStatus, ApiError> {
        let payload = self
            .call(ctx, Method::GET, &Route::admin_status(), None, None)
            .await?;
        AdminStatus::from_payload(&payload)
    }

    /// Status probes are retried on 500/404 and never surface those as
    /// failures: the caller gets a synthetic record instead.
    async fn status_with_retry(
        &self,
        token: &str,
        route: &Route,
        target: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut retries: u32 = 0;
        loop {
            let (status, text) = self.send(token, Method::GET, route, target, None).await?;
            match classify_status_attempt(status, &text) {
                Ok(()) => return normalize_response(status, &text),
                Err(ApiError::SessionAbsent) => {
                    info!(route = %route, "gateway reports no session");
                    return Ok(StatusRecord::session_absent().to_payload());
                }
                Err(err) if retries >= self.status_retry_limit => {
                    warn!(route = %route, attempts = retries + 1, "status probe gave up: {err}");
                    return Ok(StatusRecord::offline_fallback().to_payload());
                }
                Err(err) => {
                    retries += 1;
                    debug!(route = %route, retry = retries, "status probe failed: {err}");
                    tokio::time::sleep(self.status_retry_backoff).await;
                }
            }
        }
    }

    async fn send(
        &self,
        token: &str,
        method: Method,
        route: &Route,
        target: Option<&str>,
        body: Option<&Value>,
    ) -> Result<(u16, String), ApiError> {
        let url = self.url_for(route, method == Method::GET)?;
        debug!(method = %method, route = %route, "gateway request");

        let mut request = self.http.request(method, url);
        for (name, value) in auth_headers(route.class(), token) {
            request = request.header(name, value);
        }
        if let Some(target) = target
            && route.class() == RouteClass::Standard
            && !route.is_instance_route()
        {
            for name in INSTANCE_ID_HEADERS {
                request = request.header(name, target);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok((status, text))
    }

    fn url_for(&self, route: &Route, cache_bust: bool) -> Result<Url, ApiError> {
        let mut url = self
            .base_url
            .join(route.url_path().trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidRequest(format!("bad route {route}: {err}")))?;
        if cache_bust {
            url.query_pairs_mut()
                .append_pair("_", &now_unix_ms().to_string());
        }
        Ok(url)
    }
}
