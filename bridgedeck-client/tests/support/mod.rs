#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bridgedeck_client::{ClientStateStore, Console, ConsoleConfig, ConsoleEvent};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::mpsc, sync::oneshot};

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const USER_TOKEN: &str = "user-secret";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoteInstance {
    pub name: String,
    pub connected: bool,
    pub logged_in: bool,
    pub phone: Option<String>,
}

#[derive(Debug, Default)]
pub struct GatewayState {
    pub requests: Mutex<Vec<RecordedRequest>>,
    pub admin_tokens: Mutex<HashSet<String>>,
    /// Regular credential -> the single instance it owns.
    pub user_tokens: Mutex<HashMap<String, String>>,
    pub instances: Mutex<Vec<(String, RemoteInstance)>>,
    /// Scripted `(status, body)` replies for the status route, consumed
    /// before falling back to the instance flags.
    pub status_script: Mutex<HashMap<String, VecDeque<(u16, String)>>>,
    /// Instances whose connect is acknowledged but which come up paired on
    /// the next probe.
    pub pair_on_connect: Mutex<HashSet<String>>,
    /// Instances that acknowledge connect but stay offline.
    pub stay_offline: Mutex<HashSet<String>>,
    pub status_delay: Mutex<Option<Duration>>,
    pub list_delay: Mutex<Option<Duration>>,
    next_id: Mutex<u64>,
}

impl GatewayState {
    pub fn add_instance(&self, id: &str, name: &str) {
        self.instances.lock().unwrap().push((
            id.to_owned(),
            RemoteInstance {
                name: name.to_owned(),
                ..RemoteInstance::default()
            },
        ));
    }

    pub fn set_remote(&self, id: &str, connected: bool, logged_in: bool) {
        if let Some((_, remote)) = self
            .instances
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(existing, _)| existing.as_str() == id)
        {
            remote.connected = connected;
            remote.logged_in = logged_in;
            if logged_in {
                remote.phone = Some("5511999990000".to_owned());
            }
        }
    }

    pub fn remote(&self, id: &str) -> Option<RemoteInstance> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|(existing, _)| existing.as_str() == id)
            .map(|(_, remote)| remote.clone())
    }

    pub fn script_status(&self, id: &str, replies: &[(u16, &str)]) {
        self.status_script.lock().unwrap().insert(
            id.to_owned(),
            replies
                .iter()
                .map(|(status, body)| (*status, (*body).to_owned()))
                .collect(),
        );
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    fn record(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: &str) {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            path: uri.path().to_owned(),
            query: uri.query().map(str::to_owned),
            headers: headers.clone(),
            body: serde_json::from_str(body).ok(),
        });
    }

    /// Standard routes authenticate through the `token` header.
    fn caller(&self, headers: &HeaderMap) -> Option<Caller> {
        let token = headers.get("token")?.to_str().ok()?;
        if self.admin_tokens.lock().unwrap().contains(token) {
            return Some(Caller::Admin);
        }
        self.user_tokens
            .lock()
            .unwrap()
            .get(token)
            .map(|own| Caller::User(own.clone()))
    }

    /// Administrative routes read one bare `Authorization` header.
    fn admin_caller(&self, headers: &HeaderMap) -> Option<Caller> {
        let values: Vec<&str> = headers
            .get_all("authorization")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        let [token] = values.as_slice() else {
            return None;
        };
        if self.admin_tokens.lock().unwrap().contains(*token) {
            return Some(Caller::Admin);
        }
        self.user_tokens
            .lock()
            .unwrap()
            .get(*token)
            .map(|own| Caller::User(own.clone()))
    }

    fn instance_json(id: &str, remote: &RemoteInstance) -> Value {
        json!({
            "id": id,
            "name": remote.name,
            "connected": remote.connected,
            "loggedIn": remote.logged_in,
            "jid": remote.phone.as_ref().map(|phone| format!("{phone}.0:1@s.whatsapp.net")),
            "events": "Message,ReadReceipt",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Caller {
    Admin,
    User(String),
}

type Shared = Arc<GatewayState>;

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response()
}

fn allowed(caller: &Caller, id: &str) -> bool {
    match caller {
        Caller::Admin => true,
        Caller::User(own) => own == id,
    }
}

async fn list_instances(
    State(gw): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    gw.record(method, &uri, &headers, "");
    let delay = *gw.list_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let Some(caller) = gw.caller(&headers) else {
        return unauthorized();
    };
    let instances: Vec<Value> = gw
        .instances
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| allowed(&caller, id))
        .map(|(id, remote)| GatewayState::instance_json(id, remote))
        .collect();
    Json(json!({"success": true, "data": instances})).into_response()
}

async fn create_instance(
    State(gw): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    gw.record(method, &uri, &headers, &body);
    if gw.caller(&headers) != Some(Caller::Admin) {
        return unauthorized();
    }
    let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let id = {
        let mut next = gw.next_id.lock().unwrap();
        *next += 1;
        format!("new-{next}")
    };
    let name = request["name"].as_str().unwrap_or_default().to_owned();
    gw.add_instance(&id, &name);
    Json(json!({"success": true, "data": {"id": id, "token": request["token"]}})).into_response()
}

async fn instance_status(
    State(gw): State<Shared>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    gw.record(method, &uri, &headers, "");
    let delay = *gw.status_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let Some(caller) = gw.caller(&headers) else {
        return unauthorized();
    };
    if !allowed(&caller, &id) {
        return forbidden();
    }

    let scripted = gw
        .status_script
        .lock()
        .unwrap()
        .get_mut(&id)
        .and_then(VecDeque::pop_front);
    if let Some((status, body)) = scripted {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, body).into_response();
    }

    match gw.remote(&id) {
        Some(remote) => Json(json!({
            "Connected": remote.connected,
            "LoggedIn": remote.logged_in,
            "jid": remote.phone.as_ref().map(|phone| format!("{phone}.0:1@s.whatsapp.net")),
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn instance_action(
    State(gw): State<Shared>,
    Path((id, action)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    gw.record(method, &uri, &headers, &body);
    let Some(caller) = gw.caller(&headers) else {
        return unauthorized();
    };
    if !allowed(&caller, &id) {
        return forbidden();
    }
    let Some(remote) = gw.remote(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such instance"}))).into_response();
    };

    match action.as_str() {
        "connect" => {
            let offline = gw.stay_offline.lock().unwrap().contains(&id);
            let paired = gw.pair_on_connect.lock().unwrap().contains(&id);
            if !offline {
                gw.set_remote(&id, true, paired || remote.logged_in);
            }
            Json(json!({"success": true, "data": {"details": "Connected!", "events": "Message"}}))
                .into_response()
        }
        "disconnect" => {
            gw.set_remote(&id, false, remote.logged_in);
            Json(json!({"success": true, "data": {"details": "Disconnected"}})).into_response()
        }
        "logout" => {
            gw.set_remote(&id, remote.connected, false);
            Json(json!({"success": true, "data": {"details": "Logged out"}})).into_response()
        }
        "qr" => {
            if remote.logged_in {
                Json(json!({"loggedIn": true})).into_response()
            } else {
                Json(json!({"success": true, "data": {"QRCode": "data:image/png;base64,aGVsbG8="}}))
                    .into_response()
            }
        }
        "pairphone" => Json(json!({"success": true, "data": {"LinkingCode": "ABCD-EFGH"}}))
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "unknown action").into_response(),
    }
}

async fn admin_status(
    State(gw): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    gw.record(method, &uri, &headers, "");
    match gw.admin_caller(&headers) {
        Some(Caller::Admin) => {
            Json(json!({"isAdmin": true, "userId": 1, "userName": "root"})).into_response()
        }
        Some(Caller::User(_)) => Json(json!({"isAdmin": false})).into_response(),
        None => unauthorized(),
    }
}

async fn delete_complete(
    State(gw): State<Shared>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    gw.record(method, &uri, &headers, "");
    if gw.admin_caller(&headers) != Some(Caller::Admin) {
        return unauthorized();
    }
    gw.instances
        .lock()
        .unwrap()
        .retain(|(existing, _)| *existing != id);
    Json(json!({"success": true, "data": {"deleted": id}})).into_response()
}

async fn unknown_route(
    State(gw): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    gw.record(method, &uri, &headers, &body);
    (StatusCode::NOT_FOUND, Json(json!({"error": "no route"}))).into_response()
}

pub fn build_router(state: Shared) -> Router {
    Router::new()
        .route("/api/v1/instances", get(list_instances))
        .route("/api/v1/instances/create", post(create_instance))
        .route("/api/v1/instances/{id}/status", get(instance_status))
        .route("/api/v1/instances/{id}/{action}", get(instance_action).post(instance_action))
        .route("/api/v1/admin/status", get(admin_status))
        .route("/api/v1/admin/users/{id}/delete-complete", delete(delete_complete))
        .fallback(unknown_route)
        .with_state(state)
}

pub struct FakeGateway {
    pub base_url: String,
    pub state: Shared,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral gateway socket");
        let address = listener.local_addr().expect("gateway local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state: Shared = Arc::new(GatewayState::default());
        state.admin_tokens.lock().unwrap().insert(ADMIN_TOKEN.to_owned());

        let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(
            async {
                let _ = shutdown_rx.await;
            },
        );
        tokio::spawn(async move {
            let _ = server.await;
        });

        Self {
            base_url: format!("http://{address}"),
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    /// Millisecond-scale timings so scenarios finish quickly.
    pub fn config(&self) -> ConsoleConfig {
        let mut config = ConsoleConfig::from_base_url(&self.base_url).expect("gateway url");
        config.status_interval = Duration::from_millis(40);
        config.admin_status_interval = Duration::from_millis(40);
        config.pairing_interval = Duration::from_millis(30);
        config.connect_settle = Duration::from_millis(10);
        config.step_pause = Duration::from_millis(10);
        config.status_retry_backoff = Duration::from_millis(10);
        config.validation_wait_cap = Duration::from_millis(500);
        config.request_timeout = Duration::from_secs(2);
        config
    }

    pub fn console_with_token(
        &self,
        token: &str,
    ) -> (Console, mpsc::UnboundedReceiver<ConsoleEvent>) {
        self.console_with(token, self.config())
    }

    /// Same as [`FakeGateway::console_with_token`] but with polling slowed
    /// down so only explicit calls probe.
    pub fn quiet_console(&self, token: &str) -> (Console, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let mut config = self.config();
        config.status_interval = Duration::from_secs(30);
        config.admin_status_interval = Duration::from_secs(30);
        config.pairing_interval = Duration::from_secs(30);
        self.console_with(token, config)
    }

    pub fn console_with(
        &self,
        token: &str,
        config: ConsoleConfig,
    ) -> (Console, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let store = ClientStateStore::in_memory();
        store.update(|state| state.credential = Some(token.to_owned()));
        Console::new(config, store).expect("console")
    }

    pub fn add_user(&self, token: &str, own_instance: &str) {
        self.state
            .user_tokens
            .lock()
            .unwrap()
            .insert(token.to_owned(), own_instance.to_owned());
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn drain(events: &mut mpsc::UnboundedReceiver<ConsoleEvent>) -> Vec<ConsoleEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
