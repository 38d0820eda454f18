use std::{
    collections::BTreeSet,
    sync::Mutex,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bridgedeck_core::{
    ApiError, ConnectAck, ConnectRequest, ConnectionEvent, ConnectionState, EventKind,
    PairPhoneRequest, Route, StatusRecord,
};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    lock,
    registry::InstanceRegistry,
    transport::{ApiTransport, CallContext},
};

const QR_FIELDS: [&str; 4] = ["qrImageDataUri", "QRCode", "qrcode", "QrCode"];
const LINKING_CODE_FIELDS: [&str; 2] = ["linkingCode", "LinkingCode"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingArtifact {
    QrCode { data_uri: String, image: Vec<u8> },
    LinkingCode(String),
    AlreadyPaired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingMethod {
    QrCode,
    LinkingCode { phone: String },
}

impl PairingMethod {
    fn route(&self, id: &str) -> Route {
        match self {
            PairingMethod::QrCode => Route::qr(id),
            PairingMethod::LinkingCode { .. } => Route::pair_phone(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub record: StatusRecord,
    pub previous: ConnectionState,
    pub state: ConnectionState,
}

/// Drives one instance through its connection lifecycle. Every remote
/// acknowledgment is folded into the shared registry.
pub struct ConnectionStateMachine<'a> {
    instance_id: &'a str,
    transport: &'a ApiTransport,
    registry: &'a Mutex<InstanceRegistry>,
    ctx: CallContext,
    connect_settle: Duration,
}

impl<'a> ConnectionStateMachine<'a> {
    pub fn new(
        instance_id: &'a str,
        transport: &'a ApiTransport,
        registry: &'a Mutex<InstanceRegistry>,
        ctx: CallContext,
        connect_settle: Duration,
    ) -> Self {
        Self {
            instance_id,
            transport,
            registry,
            ctx,
            connect_settle,
        }
    }

    pub fn state(&self) -> Result<ConnectionState, ApiError> {
        lock(self.registry)
            .state_of(self.instance_id)
            .ok_or_else(|| ApiError::UnknownInstance(self.instance_id.to_owned()))
    }

    /// A failed or ambiguous probe leaves the instance `Unknown`; credential
    /// rejections leave it untouched for the caller to handle.
    pub async fn probe(&self) -> Result<ProbeOutcome, ApiError> {
        let previous = self.state()?;
        match self.transport.fetch_status(&self.ctx, self.instance_id).await {
            Ok(record) => {
                let state = lock(self.registry)
                    .apply_status(self.instance_id, &record)
                    .map(|change| change.current)
                    .unwrap_or_else(|| record.derived_state());
                debug!(instance_id = %self.instance_id, %previous, %state, "status probed");
                Ok(ProbeOutcome {
                    record,
                    previous,
                    state,
                })
            }
            Err(err) if err.is_auth() => Err(err),
            Err(err) => {
                lock(self.registry).apply_event(self.instance_id, ConnectionEvent::ProbeFailed);
                Err(err)
            }
        }
    }

    pub async fn connect(
        &self,
        events: Option<&BTreeSet<EventKind>>,
    ) -> Result<ConnectionState, ApiError> {
        let (subscription, clear_session) = {
            let registry = lock(self.registry);
            let instance = registry.require(self.instance_id)?;
            let subscription = events.cloned().unwrap_or_else(|| instance.events.clone());
            (subscription, instance.session_absent)
        };

        let request = ConnectRequest::new(&subscription, clear_session);
        let body = serde_json::to_value(&request)
            .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
        info!(instance_id = %self.instance_id, clear_session, "connecting instance");

        let payload = self
            .transport
            .call(&self.ctx, Method::POST, &Route::connect(self.instance_id), Some(&body), None)
            .await?;

        let mut registry = lock(self.registry);
        if clear_session {
            registry.mark_session_reset(self.instance_id);
        }
        let change = registry.apply_event(self.instance_id, ConnectionEvent::ConnectAcknowledged);
        registry.merge_ack(self.instance_id, ConnectAck::from_payload(&payload));
        change
            .map(|change| change.current)
            .ok_or_else(|| ApiError::UnknownInstance(self.instance_id.to_owned()))
    }

    /// No-op on a disconnected instance.
    pub async fn disconnect(&self) -> Result<ConnectionState, ApiError> {
        if self.state()? == ConnectionState::Disconnected {
            return Ok(ConnectionState::Disconnected);
        }
        self.send_disconnect().await
    }

    /// No-op on a disconnected instance.
    pub async fn logout(&self) -> Result<ConnectionState, ApiError> {
        if self.state()? == ConnectionState::Disconnected {
            return Ok(ConnectionState::Disconnected);
        }
        self.send_logout().await
    }

    pub(crate) async fn send_disconnect(&self) -> Result<ConnectionState, ApiError> {
        self.transport
            .call(&self.ctx, Method::POST, &Route::disconnect(self.instance_id), None, None)
            .await?;
        info!(instance_id = %self.instance_id, "instance disconnected");
        self.record(ConnectionEvent::DisconnectAcknowledged)
    }

    pub(crate) async fn send_logout(&self) -> Result<ConnectionState, ApiError> {
        self.transport
            .call(&self.ctx, Method::POST, &Route::logout(self.instance_id), None, None)
            .await?;
        info!(instance_id = %self.instance_id, "instance logged out");
        self.record(ConnectionEvent::LogoutAcknowledged)
    }

    /// Probes first; connects if needed; refuses when already paired.
    pub async fn request_pairing(
        &self,
        method: &PairingMethod,
    ) -> Result<PairingArtifact, ApiError> {
        let body = match method {
            PairingMethod::QrCode => None,
            PairingMethod::LinkingCode { phone } => {
                let phone = normalize_phone(phone)?;
                Some(
                    serde_json::to_value(PairPhoneRequest { phone })
                        .map_err(|err| ApiError::InvalidRequest(err.to_string()))?,
                )
            }
        };

        let state = match self.probe().await {
            Ok(outcome) => outcome.state,
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => {
                debug!(instance_id = %self.instance_id, "pre-pairing probe failed: {err}");
                ConnectionState::Unknown
            }
        };

        match state {
            ConnectionState::Authenticated => {
                return Err(ApiError::InvalidTransition {
                    state,
                    operation: "request a pairing code",
                });
            }
            ConnectionState::Disconnected | ConnectionState::Unknown => {
                self.connect(None).await?;
                tokio::time::sleep(self.connect_settle).await;
            }
            ConnectionState::Connecting | ConnectionState::AwaitingPairing => {}
        }

        let http_method = match method {
            PairingMethod::QrCode => Method::GET,
            PairingMethod::LinkingCode { .. } => Method::POST,
        };
        let payload = self
            .transport
            .call(&self.ctx, http_method, &method.route(self.instance_id), body.as_ref(), None)
            .await?;

        let artifact = match method {
            PairingMethod::QrCode => parse_qr_payload(&payload)?,
            PairingMethod::LinkingCode { .. } => parse_linking_code(&payload)?,
        };
        if artifact == PairingArtifact::AlreadyPaired {
            self.record(ConnectionEvent::PairingConfirmed)?;
        }
        Ok(artifact)
    }

    fn record(&self, event: ConnectionEvent) -> Result<ConnectionState, ApiError> {
        lock(self.registry)
            .apply_event(self.instance_id, event)
            .map(|change| change.current)
            .ok_or_else(|| ApiError::UnknownInstance(self.instance_id.to_owned()))
    }
}

fn reports_logged_in(payload: &Value) -> bool {
    ["loggedIn", "LoggedIn"]
        .iter()
        .any(|key| payload.get(*key).and_then(Value::as_bool) == Some(true))
}

pub fn parse_qr_payload(payload: &Value) -> Result<PairingArtifact, ApiError> {
    if reports_logged_in(payload) {
        return Ok(PairingArtifact::AlreadyPaired);
    }

    let data_uri = QR_FIELDS
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .ok_or_else(|| ApiError::Decode("QR response carries no image".to_owned()))?;
    if !data_uri.starts_with("data:image/") {
        return Err(ApiError::Decode("QR response is not an image data URI".to_owned()));
    }
    let (_, encoded) = data_uri
        .split_once(";base64,")
        .ok_or_else(|| ApiError::Decode("QR data URI is not base64".to_owned()))?;
    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|err| ApiError::Decode(format!("QR image: {err}")))?;

    Ok(PairingArtifact::QrCode {
        data_uri: data_uri.to_owned(),
        image,
    })
}

pub fn parse_linking_code(payload: &Value) -> Result<PairingArtifact, ApiError> {
    if reports_logged_in(payload) {
        return Ok(PairingArtifact::AlreadyPaired);
    }
    LINKING_CODE_FIELDS
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| PairingArtifact::LinkingCode(code.to_owned()))
        .ok_or_else(|| ApiError::Decode("pairing response carries no linking code".to_owned()))
}

/// Digits only, with an optional leading `+` and common separators removed.
pub fn normalize_phone(raw: &str) -> Result<String, ApiError> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    if digits.len() < 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::InvalidRequest(format!(
            "phone number must contain at least 8 digits: {raw:?}"
        )));
    }
    Ok(digits)
}
