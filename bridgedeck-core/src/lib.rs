use std::{collections::BTreeSet, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const API_PREFIX: &str = "/api/v1/";
pub const ADMIN_NAMESPACE: &str = "admin/";
pub const INSTANCES_NAMESPACE: &str = "instances/";
pub const TOKEN_HEADER: &str = "token";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const INSTANCE_ID_HEADERS: [&str; 2] = ["Instance-Id", "x-instance-id"];
pub const NO_SESSION_MARKER: &str = "No session";
pub const STATUS_RETRY_LIMIT: u32 = 2;
pub const STATUS_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const SNAPSHOT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SUBSCRIPTION: [EventKind; 4] = [
    EventKind::Message,
    EventKind::ReadReceipt,
    EventKind::Presence,
    EventKind::ChatPresence,
];

pub type InstanceId = String;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum EventKind {
    Message,
    ReadReceipt,
    Presence,
    HistorySync,
    ChatPresence,
    All,
}

impl EventKind {
    pub const ALL_KINDS: [EventKind; 6] = [
        EventKind::Message,
        EventKind::ReadReceipt,
        EventKind::Presence,
        EventKind::HistorySync,
        EventKind::ChatPresence,
        EventKind::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "Message",
            EventKind::ReadReceipt => "ReadReceipt",
            EventKind::Presence => "Presence",
            EventKind::HistorySync => "HistorySync",
            EventKind::ChatPresence => "ChatPresence",
            EventKind::All => "All",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        Self::ALL_KINDS
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag))
    }
}

/// Accepts either a JSON array of tags or a comma-separated string.
/// Unknown tags are dropped.
pub fn parse_event_set(value: &Value) -> BTreeSet<EventKind> {
    match value {
        Value::String(joined) => joined.split(',').filter_map(EventKind::parse).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(EventKind::parse)
            .collect(),
        _ => BTreeSet::new(),
    }
}

pub fn join_event_set(events: &BTreeSet<EventKind>) -> String {
    events
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Short, log-safe identifier for a credential. Never log the credential itself.
pub fn credential_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    resolved_at_unix_ms: u64,
}

impl Credential {
    /// Returns `None` for blank input.
    pub fn new(value: impl Into<String>, resolved_at_unix_ms: u64) -> Option<Self> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return None;
        }
        Some(Self {
            value,
            resolved_at_unix_ms,
        })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn resolved_at_unix_ms(&self) -> u64 {
        self.resolved_at_unix_ms
    }

    pub fn fingerprint(&self) -> String {
        credential_fingerprint(&self.value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .field("resolved_at_unix_ms", &self.resolved_at_unix_ms)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionScope {
    #[default]
    Unresolved,
    Administrative {
        user_id: String,
        user_name: String,
    },
    Instance {
        instance_id: InstanceId,
        user_name: String,
    },
}

impl SessionScope {
    pub fn is_admin(&self) -> bool {
        matches!(self, SessionScope::Administrative { .. })
    }

    pub fn own_instance(&self) -> Option<&str> {
        match self {
            SessionScope::Instance { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingPairing,
    Authenticated,
    Unknown,
}

impl ConnectionState {
    pub fn from_flags(connected: bool, logged_in: bool) -> Self {
        match (connected, logged_in) {
            (true, true) => ConnectionState::Authenticated,
            (true, false) => ConnectionState::AwaitingPairing,
            (false, _) => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingPairing | ConnectionState::Authenticated
        )
    }

    pub fn is_authenticated(self) -> bool {
        self == ConnectionState::Authenticated
    }

    pub fn apply(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionState::*;

        match event {
            ConnectionEvent::ConnectAcknowledged => match self {
                Disconnected | Unknown => Connecting,
                other => other,
            },
            ConnectionEvent::Probed(record) => record.derived_state(),
            ConnectionEvent::ProbeFailed => Unknown,
            ConnectionEvent::PairingConfirmed => Authenticated,
            ConnectionEvent::LogoutAcknowledged => match self {
                Authenticated | AwaitingPairing | Connecting => AwaitingPairing,
                other => other,
            },
            ConnectionEvent::DisconnectAcknowledged => Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingPairing => "awaiting pairing",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectAcknowledged,
    Probed(StatusRecord),
    ProbeFailed,
    PairingConfirmed,
    LogoutAcknowledged,
    DisconnectAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOrigin {
    Remote,
    SessionAbsent,
    OfflineFallback,
}

/// Canonical status of one instance, normalized from whatever casing the
/// gateway used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub connected: bool,
    pub logged_in: bool,
    pub phone: Option<String>,
    pub origin: StatusOrigin,
}

impl StatusRecord {
    pub fn session_absent() -> Self {
        Self {
            connected: false,
            logged_in: false,
            phone: None,
            origin: StatusOrigin::SessionAbsent,
        }
    }

    pub fn offline_fallback() -> Self {
        Self {
            connected: false,
            logged_in: false,
            phone: None,
            origin: StatusOrigin::OfflineFallback,
        }
    }

    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        let map = payload
            .as_object()
            .ok_or_else(|| ApiError::Decode("status payload is not an object".to_owned()))?;

        let origin = if flag(map, &["noSession"]).unwrap_or(false) {
            StatusOrigin::SessionAbsent
        } else if flag(map, &["offlineFallback", "isOfflineFallback"]).unwrap_or(false) {
            StatusOrigin::OfflineFallback
        } else {
            StatusOrigin::Remote
        };

        let connected = flag(map, &["Connected", "connected"]).ok_or_else(|| {
            ApiError::Decode("status payload has no connected flag".to_owned())
        })?;
        let logged_in = flag(map, &["LoggedIn", "loggedIn", "logged_in"]).unwrap_or(false);

        Ok(Self {
            connected,
            logged_in,
            phone: phone_field(map),
            origin,
        })
    }

    pub fn to_payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("connected".to_owned(), Value::Bool(self.connected));
        map.insert("loggedIn".to_owned(), Value::Bool(self.logged_in));
        if let Some(phone) = &self.phone {
            map.insert("phone".to_owned(), Value::String(phone.clone()));
        }
        match self.origin {
            StatusOrigin::Remote => {}
            StatusOrigin::SessionAbsent => {
                map.insert("noSession".to_owned(), Value::Bool(true));
            }
            StatusOrigin::OfflineFallback => {
                map.insert("offlineFallback".to_owned(), Value::Bool(true));
            }
        }
        Value::Object(map)
    }

    pub fn is_session_absent(&self) -> bool {
        self.origin == StatusOrigin::SessionAbsent
    }

    /// Session-absent and offline-fallback records both force a clean
    /// session on the next connect.
    pub fn needs_session_reset(&self) -> bool {
        self.origin != StatusOrigin::Remote
    }

    pub fn derived_state(&self) -> ConnectionState {
        match self.origin {
            StatusOrigin::SessionAbsent | StatusOrigin::OfflineFallback => {
                ConnectionState::Disconnected
            }
            StatusOrigin::Remote => ConnectionState::from_flags(self.connected, self.logged_in),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Administrative,
    Standard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    path: String,
}

impl Route {
    pub fn new(path: impl AsRef<str>) -> Self {
        let trimmed = path.as_ref().trim().trim_start_matches('/');
        let trimmed = trimmed.strip_prefix("api/v1/").unwrap_or(trimmed);
        Self {
            path: trimmed.trim_end_matches('/').to_owned(),
        }
    }

    pub fn instances() -> Self {
        Self::new("instances")
    }

    pub fn create_instance() -> Self {
        Self::new("instances/create")
    }

    pub fn instance_status(id: &str) -> Self {
        Self::new(format!("instances/{id}/status"))
    }

    pub fn connect(id: &str) -> Self {
        Self::new(format!("instances/{id}/connect"))
    }

    pub fn disconnect(id: &str) -> Self {
        Self::new(format!("instances/{id}/disconnect"))
    }

    pub fn logout(id: &str) -> Self {
        Self::new(format!("instances/{id}/logout"))
    }

    pub fn qr(id: &str) -> Self {
        Self::new(format!("instances/{id}/qr"))
    }

    pub fn pair_phone(id: &str) -> Self {
        Self::new(format!("instances/{id}/pairphone"))
    }

    pub fn admin_status() -> Self {
        Self::new("admin/status")
    }

    pub fn delete_instance_complete(id: &str) -> Self {
        Self::new(format!("admin/users/{id}/delete-complete"))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url_path(&self) -> String {
        format!("{API_PREFIX}{}", self.path)
    }

    pub fn class(&self) -> RouteClass {
        if self.path.starts_with(ADMIN_NAMESPACE) {
            RouteClass::Administrative
        } else {
            RouteClass::Standard
        }
    }

    pub fn is_instance_route(&self) -> bool {
        self.path.starts_with(INSTANCES_NAMESPACE)
    }

    pub fn embedded_instance(&self) -> Option<&str> {
        self.path
            .strip_prefix(INSTANCES_NAMESPACE)?
            .split('/')
            .next()
            .filter(|id| !id.is_empty() && *id != "create")
    }

    pub fn is_status(&self) -> bool {
        let segments: Vec<&str> = self.path.split('/').collect();
        matches!(segments.as_slice(), ["instances", id, "status"] if !id.is_empty())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Embedded identifier, then explicit override, then the caller's current
/// instance. Administrative routes never target an instance.
pub fn resolve_target_instance<'a>(
    route: &'a Route,
    override_id: Option<&'a str>,
    current: Option<&'a str>,
) -> Option<&'a str> {
    if route.class() == RouteClass::Administrative {
        return None;
    }
    route.embedded_instance().or(override_id).or(current)
}

pub fn check_scope(scope: &SessionScope, target: Option<&str>) -> Result<(), ApiError> {
    match (scope, target) {
        (SessionScope::Instance { instance_id, .. }, Some(target)) if target != instance_id => {
            Err(ApiError::AuthorizationScope {
                target: target.to_owned(),
                own: instance_id.clone(),
            })
        }
        _ => Ok(()),
    }
}

/// Header set carrying the credential. Standard routes present it three ways
/// at once because gateway builds disagree on which one they read.
pub fn auth_headers(class: RouteClass, token: &str) -> Vec<(&'static str, String)> {
    match class {
        RouteClass::Administrative => vec![(AUTHORIZATION_HEADER, token.to_owned())],
        RouteClass::Standard => vec![
            (TOKEN_HEADER, token.to_owned()),
            (AUTHORIZATION_HEADER, token.to_owned()),
            (AUTHORIZATION_HEADER, format!("Bearer {token}")),
        ],
    }
}

/// Classifies one attempt against the status route. `Ok(())` means the
/// response is final and goes through [`normalize_response`].
pub fn classify_status_attempt(status: u16, body: &str) -> Result<(), ApiError> {
    if status == 500 && body.contains(NO_SESSION_MARKER) {
        return Err(ApiError::SessionAbsent);
    }
    if status == 500 || status == 404 {
        return Err(ApiError::TransientRemote { status });
    }
    Ok(())
}

pub fn normalize_response(status: u16, body: &str) -> Result<Value, ApiError> {
    if status == 401 || status == 403 {
        return Err(ApiError::Auth { status });
    }

    let trimmed = body.trim();
    let parsed = if trimmed.is_empty() {
        None
    } else {
        serde_json::from_str::<Value>(trimmed).ok()
    };

    if !(200..300).contains(&status) {
        let message = parsed
            .as_ref()
            .and_then(error_message)
            .unwrap_or_else(|| format!("HTTP error {status}"));
        return Err(ApiError::Remote { status, message });
    }

    let payload = match parsed {
        Some(payload) => payload,
        None if trimmed.is_empty() => Value::Null,
        None => {
            return Err(ApiError::Decode(
                "response body is not valid JSON".to_owned(),
            ));
        }
    };

    match payload.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(payload.get("data").cloned().unwrap_or(payload)),
        Some(false) => Err(ApiError::Remote {
            status,
            message: error_message(&payload).unwrap_or_else(|| "request failed".to_owned()),
        }),
        None => Ok(payload),
    }
}

fn error_message(payload: &Value) -> Option<String> {
    ["error", "message"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

fn flag(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Bool(value) => Some(*value),
        Value::Number(number) => number.as_i64().map(|value| value != 0),
        Value::String(text) => match text.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        map.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    })
}

fn identifier(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_owned()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    })
}

fn phone_field(map: &Map<String, Value>) -> Option<String> {
    text(map, &["phone", "Phone"]).or_else(|| {
        text(map, &["jid", "JID", "Jid"])
            .map(|jid| phone_from_jid(&jid))
            .filter(|phone| !phone.is_empty())
    })
}

/// `5511999990000.0:12@s.whatsapp.net` -> `5511999990000`
pub fn phone_from_jid(jid: &str) -> String {
    jid.split('@')
        .next()
        .and_then(|user| user.split(':').next())
        .and_then(|user| user.split('.').next())
        .unwrap_or_default()
        .to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub phone: Option<String>,
    pub connected: bool,
    pub logged_in: bool,
    pub webhook: Option<String>,
    pub events: BTreeSet<EventKind>,
}

impl InstanceSummary {
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        let map = payload
            .as_object()
            .ok_or_else(|| ApiError::Decode("instance entry is not an object".to_owned()))?;
        let id = identifier(map, &["id", "Id", "ID"])
            .ok_or_else(|| ApiError::Decode("instance entry has no id".to_owned()))?;

        Ok(Self {
            name: text(map, &["name", "Name"]).unwrap_or_else(|| format!("Instance {id}")),
            phone: phone_field(map),
            connected: flag(map, &["connected", "Connected", "isConnected"]).unwrap_or(false),
            logged_in: flag(map, &["loggedIn", "LoggedIn", "isLoggedIn", "logged_in"])
                .unwrap_or(false),
            webhook: text(map, &["webhook", "Webhook"]),
            events: ["events", "Events"]
                .iter()
                .find_map(|key| map.get(*key))
                .map(parse_event_set)
                .unwrap_or_default(),
            id,
        })
    }

    pub fn list_from_payload(payload: &Value) -> Result<Vec<Self>, ApiError> {
        match payload {
            Value::Array(items) => items.iter().map(Self::from_payload).collect(),
            Value::Null => Ok(Vec::new()),
            _ => Err(ApiError::Decode(
                "instance list payload is not an array".to_owned(),
            )),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_flags(self.connected, self.logged_in)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminStatus {
    pub is_admin: bool,
    pub user_id: String,
    pub user_name: String,
}

impl AdminStatus {
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        let map = payload
            .as_object()
            .ok_or_else(|| ApiError::Decode("admin status payload is not an object".to_owned()))?;
        Ok(Self {
            is_admin: flag(map, &["isAdmin", "IsAdmin"]).unwrap_or(false),
            user_id: identifier(map, &["userId", "UserId"]).unwrap_or_else(|| "1".to_owned()),
            user_name: text(map, &["userName", "UserName"])
                .unwrap_or_else(|| "Administrator".to_owned()),
        })
    }
}

/// Fields a connect acknowledgment may echo back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectAck {
    pub phone: Option<String>,
    pub webhook: Option<String>,
    pub events: Option<BTreeSet<EventKind>>,
}

impl ConnectAck {
    pub fn from_payload(payload: &Value) -> Self {
        let Some(map) = payload.as_object() else {
            return Self::default();
        };
        Self {
            phone: phone_field(map),
            webhook: text(map, &["webhook", "Webhook"]),
            events: ["events", "Events"]
                .iter()
                .find_map(|key| map.get(*key))
                .map(parse_event_set),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub subscribe: Vec<EventKind>,
    pub immediate: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear_session: bool,
}

impl ConnectRequest {
    pub fn new(events: &BTreeSet<EventKind>, clear_session: bool) -> Self {
        let subscribe = if events.is_empty() {
            DEFAULT_SUBSCRIPTION.to_vec()
        } else {
            events.iter().copied().collect()
        };
        Self {
            subscribe,
            immediate: true,
            clear_session,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PairPhoneRequest {
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// Comma-separated, the only shape every gateway build accepts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub instance_id: InstanceId,
    pub connected: bool,
    pub logged_in: bool,
    #[serde(default)]
    pub phone: Option<String>,
    pub checked_at_unix_ms: u64,
}

impl StatusSnapshot {
    pub fn is_fresh(&self, now_unix_ms: u64, max_age: Duration) -> bool {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        now_unix_ms.saturating_sub(self.checked_at_unix_ms) < max_age_ms
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_flags(self.connected, self.logged_in)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Idle,
    RecoverSession { attempt: u32 },
    Retry { attempt: u32 },
    Exhausted,
}

/// Automatic reconnect bookkeeping for administrative sessions.
///
/// Session recovery and plain retries share one counter and one
/// `recovering` flag, so at most one reconnect is outstanding and the total
/// never exceeds `max_attempts` until [`ReconnectPolicy::reset`] or an
/// authenticated probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    attempts: u32,
    session_recovery_used: bool,
    recovering: bool,
    exhaustion_reported: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            session_recovery_used: false,
            recovering: false,
            exhaustion_reported: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn evaluate(&mut self, state: ConnectionState, session_absent: bool) -> ReconnectDecision {
        if state.is_authenticated() {
            self.observe_authenticated();
            return ReconnectDecision::Idle;
        }
        if self.recovering {
            return ReconnectDecision::Idle;
        }
        if !session_absent && state != ConnectionState::Disconnected {
            return ReconnectDecision::Idle;
        }
        if self.attempts >= self.max_attempts {
            if self.exhaustion_reported {
                return ReconnectDecision::Idle;
            }
            self.exhaustion_reported = true;
            return ReconnectDecision::Exhausted;
        }

        self.attempts += 1;
        self.recovering = true;
        if session_absent && !self.session_recovery_used {
            self.session_recovery_used = true;
            ReconnectDecision::RecoverSession {
                attempt: self.attempts,
            }
        } else {
            ReconnectDecision::Retry {
                attempt: self.attempts,
            }
        }
    }

    pub fn finish_recovery(&mut self) {
        self.recovering = false;
    }

    pub fn observe_authenticated(&mut self) {
        self.attempts = 0;
        self.session_recovery_used = false;
        self.exhaustion_reported = false;
    }

    /// External trigger (manual connect) re-arms the policy.
    pub fn reset(&mut self) {
        self.observe_authenticated();
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("no credential available")]
    MissingCredential,
    #[error("credential rejected by the gateway (HTTP {status})")]
    Auth { status: u16 },
    #[error("gateway returned transient HTTP {status}")]
    TransientRemote { status: u16 },
    #[error("gateway reports no active session")]
    SessionAbsent,
    #[error("instance {target} is outside this session's scope (own instance {own})")]
    AuthorizationScope { target: InstanceId, own: InstanceId },
    #[error("network error: {0}")]
    Network(String),
    #[error("gateway error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("unexpected response payload: {0}")]
    Decode(String),
    #[error("operation requires an administrative session")]
    AdminRequired,
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("no instance selected")]
    NoInstanceSelected,
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        state: ConnectionState,
        operation: &'static str,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn remote(connected: bool, logged_in: bool) -> StatusRecord {
        StatusRecord {
            connected,
            logged_in,
            phone: None,
            origin: StatusOrigin::Remote,
        }
    }

    #[test]
    fn pairing_walkthrough_follows_transition_table() {
        let state = ConnectionState::Disconnected.apply(ConnectionEvent::ConnectAcknowledged);
        assert_eq!(state, ConnectionState::Connecting);

        let state = state.apply(ConnectionEvent::Probed(remote(true, false)));
        assert_eq!(state, ConnectionState::AwaitingPairing);

        let state = state.apply(ConnectionEvent::Probed(remote(true, true)));
        assert_eq!(state, ConnectionState::Authenticated);

        let state = state.apply(ConnectionEvent::LogoutAcknowledged);
        assert_eq!(state, ConnectionState::AwaitingPairing);

        let state = state.apply(ConnectionEvent::DisconnectAcknowledged);
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn probe_failure_is_unknown_and_superseded_by_next_probe() {
        let state = ConnectionState::Authenticated.apply(ConnectionEvent::ProbeFailed);
        assert_eq!(state, ConnectionState::Unknown);
        let state = state.apply(ConnectionEvent::Probed(remote(true, true)));
        assert_eq!(state, ConnectionState::Authenticated);
    }

    #[test]
    fn connect_ack_does_not_downgrade_connected_states() {
        assert_eq!(
            ConnectionState::Authenticated.apply(ConnectionEvent::ConnectAcknowledged),
            ConnectionState::Authenticated
        );
        assert_eq!(
            ConnectionState::Unknown.apply(ConnectionEvent::ConnectAcknowledged),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn session_absent_never_reads_as_authenticated() {
        let payload = json!({"Connected": true, "LoggedIn": true, "noSession": true});
        let record = StatusRecord::from_payload(&payload).unwrap();
        assert_eq!(record.origin, StatusOrigin::SessionAbsent);
        for from in [
            ConnectionState::Authenticated,
            ConnectionState::AwaitingPairing,
            ConnectionState::Unknown,
        ] {
            let next = from.apply(ConnectionEvent::Probed(record.clone()));
            assert_ne!(next, ConnectionState::Authenticated);
        }
    }

    #[test]
    fn status_payload_accepts_both_casings_and_jid() {
        let pascal = json!({"Connected": true, "LoggedIn": false});
        let camel = json!({"connected": 1, "loggedIn": true, "jid": "5511999990000.0:7@s.whatsapp.net"});
        let a = StatusRecord::from_payload(&pascal).unwrap();
        let b = StatusRecord::from_payload(&camel).unwrap();
        assert!(a.connected && !a.logged_in);
        assert!(b.connected && b.logged_in);
        assert_eq!(b.phone.as_deref(), Some("5511999990000"));
    }

    #[test]
    fn status_payload_without_connected_flag_is_ambiguous() {
        let err = StatusRecord::from_payload(&json!({"loggedIn": true})).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn synthetic_payloads_survive_normalization() {
        let record = StatusRecord::from_payload(&StatusRecord::offline_fallback().to_payload())
            .unwrap();
        assert_eq!(record, StatusRecord::offline_fallback());
        assert_eq!(record.derived_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn routes_classify_and_extract_instances() {
        let status = Route::new("/api/v1/instances/42/status");
        assert_eq!(status.path(), "instances/42/status");
        assert_eq!(status.embedded_instance(), Some("42"));
        assert!(status.is_status());
        assert_eq!(status.class(), RouteClass::Standard);

        assert_eq!(Route::create_instance().embedded_instance(), None);
        assert_eq!(Route::instances().embedded_instance(), None);
        assert!(!Route::qr("42").is_status());
        assert_eq!(Route::admin_status().class(), RouteClass::Administrative);
        assert_eq!(Route::admin_status().url_path(), "/api/v1/admin/status");
    }

    #[test]
    fn target_resolution_precedence() {
        let embedded = Route::connect("7");
        assert_eq!(
            resolve_target_instance(&embedded, Some("8"), Some("9")),
            Some("7")
        );
        let plain = Route::new("chat/send/text");
        assert_eq!(resolve_target_instance(&plain, Some("8"), Some("9")), Some("8"));
        assert_eq!(resolve_target_instance(&plain, None, Some("9")), Some("9"));
        assert_eq!(
            resolve_target_instance(&Route::admin_status(), Some("8"), Some("9")),
            None
        );
    }

    #[test]
    fn scope_check_rejects_foreign_instances_for_regular_sessions() {
        let scope = SessionScope::Instance {
            instance_id: "5".to_owned(),
            user_name: "five".to_owned(),
        };
        assert!(check_scope(&scope, Some("5")).is_ok());
        assert!(check_scope(&scope, None).is_ok());
        assert_eq!(
            check_scope(&scope, Some("6")),
            Err(ApiError::AuthorizationScope {
                target: "6".to_owned(),
                own: "5".to_owned()
            })
        );

        let admin = SessionScope::Administrative {
            user_id: "1".to_owned(),
            user_name: "root".to_owned(),
        };
        assert!(check_scope(&admin, Some("6")).is_ok());
    }

    #[test]
    fn header_shapes_differ_by_route_class() {
        let admin = auth_headers(RouteClass::Administrative, "tok");
        assert_eq!(admin, vec![(AUTHORIZATION_HEADER, "tok".to_owned())]);

        let standard = auth_headers(RouteClass::Standard, "tok");
        assert_eq!(standard.len(), 3);
        assert!(standard.contains(&(TOKEN_HEADER, "tok".to_owned())));
        assert!(standard.contains(&(AUTHORIZATION_HEADER, "tok".to_owned())));
        assert!(standard.contains(&(AUTHORIZATION_HEADER, "Bearer tok".to_owned())));
    }

    #[test]
    fn status_attempt_classification() {
        assert_eq!(
            classify_status_attempt(500, r#"{"error":"No session"}"#),
            Err(ApiError::SessionAbsent)
        );
        assert_eq!(
            classify_status_attempt(404, ""),
            Err(ApiError::TransientRemote { status: 404 })
        );
        assert_eq!(classify_status_attempt(200, "{}"), Ok(()));
    }

    #[test]
    fn response_normalization() {
        assert_eq!(
            normalize_response(200, r#"{"connected":false}"#).unwrap(),
            json!({"connected": false})
        );
        assert_eq!(
            normalize_response(200, r#"{"success":true,"data":{"id":3}}"#).unwrap(),
            json!({"id": 3})
        );
        assert_eq!(
            normalize_response(200, r#"{"success":false,"error":"nope"}"#),
            Err(ApiError::Remote {
                status: 200,
                message: "nope".to_owned()
            })
        );
        assert_eq!(
            normalize_response(502, "bad gateway"),
            Err(ApiError::Remote {
                status: 502,
                message: "HTTP error 502".to_owned()
            })
        );
        assert_eq!(
            normalize_response(403, "{}"),
            Err(ApiError::Auth { status: 403 })
        );
        assert_eq!(normalize_response(200, "").unwrap(), Value::Null);
    }

    #[test]
    fn reconnect_policy_caps_at_three_and_resets_on_authenticated() {
        let mut policy = ReconnectPolicy::default();

        assert_eq!(
            policy.evaluate(ConnectionState::Disconnected, true),
            ReconnectDecision::RecoverSession { attempt: 1 }
        );
        // Outstanding recovery blocks the retry path.
        assert_eq!(
            policy.evaluate(ConnectionState::Disconnected, false),
            ReconnectDecision::Idle
        );
        policy.finish_recovery();

        for expected in 2..=3 {
            assert_eq!(
                policy.evaluate(ConnectionState::Disconnected, true),
                ReconnectDecision::Retry { attempt: expected }
            );
            policy.finish_recovery();
        }

        assert_eq!(
            policy.evaluate(ConnectionState::Disconnected, false),
            ReconnectDecision::Exhausted
        );
        assert_eq!(
            policy.evaluate(ConnectionState::Disconnected, false),
            ReconnectDecision::Idle
        );
        assert_eq!(policy.attempts(), 3);

        assert_eq!(
            policy.evaluate(ConnectionState::Authenticated, false),
            ReconnectDecision::Idle
        );
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn reconnect_policy_ignores_pairing_and_unknown_states() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(
            policy.evaluate(ConnectionState::AwaitingPairing, false),
            ReconnectDecision::Idle
        );
        assert_eq!(
            policy.evaluate(ConnectionState::Unknown, false),
            ReconnectDecision::Idle
        );
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn snapshot_staleness() {
        let snapshot = StatusSnapshot {
            instance_id: "1".to_owned(),
            connected: true,
            logged_in: true,
            phone: None,
            checked_at_unix_ms: 1_000_000,
        };
        assert!(snapshot.is_fresh(1_000_000 + 299_999, SNAPSHOT_STALE_AFTER));
        assert!(!snapshot.is_fresh(1_000_000 + 300_000, SNAPSHOT_STALE_AFTER));
    }

    #[test]
    fn instance_summary_accepts_numeric_ids_and_comma_events() {
        let payload = json!([
            {"id": 42, "name": "Sales", "connected": 1, "loggedIn": false,
             "events": "Message,ReadReceipt,Bogus", "webhook": ""},
            {"id": "abc", "jid": "5511@s.whatsapp.net", "events": ["All"]}
        ]);
        let list = InstanceSummary::list_from_payload(&payload).unwrap();
        assert_eq!(list[0].id, "42");
        assert_eq!(list[0].state(), ConnectionState::AwaitingPairing);
        assert_eq!(list[0].webhook, None);
        assert_eq!(
            join_event_set(&list[0].events),
            "Message,ReadReceipt"
        );
        assert_eq!(list[1].name, "Instance abc");
        assert_eq!(list[1].phone.as_deref(), Some("5511"));
        assert!(list[1].events.contains(&EventKind::All));
    }

    #[test]
    fn connect_request_only_sends_clear_session_when_needed() {
        let plain = serde_json::to_value(ConnectRequest::new(&BTreeSet::new(), false)).unwrap();
        assert_eq!(
            plain,
            json!({"subscribe": ["Message", "ReadReceipt", "Presence", "ChatPresence"], "immediate": true})
        );
        let clearing = serde_json::to_value(ConnectRequest::new(&BTreeSet::new(), true)).unwrap();
        assert_eq!(clearing["clearSession"], json!(true));
    }

    #[test]
    fn credential_debug_hides_the_secret() {
        let credential = Credential::new("  super-secret  ", 7).unwrap();
        assert_eq!(credential.value(), "super-secret");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(Credential::new("   ", 7).is_none());
    }
}
