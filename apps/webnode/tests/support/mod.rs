//! In-process stand-in for the task service: the three HTTP endpoints plus the
//! node socket, with counters and a scripted failure mode per endpoint.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use webnode_core::{NodeConfig, RetryPolicy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshScript {
    #[default]
    Succeed,
    /// Every refresh answers HTTP 500.
    Fail,
    /// The first `n` refreshes succeed, later ones answer HTTP 500.
    FailAfter(usize),
    /// The first `n` refreshes succeed, later ones are rejected with code 401.
    RejectAfter(usize),
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub login_code: i64,
    pub refresh: RefreshScript,
    pub register_code: i64,
    /// Answer socket upgrades with 503.
    pub reject_socket: bool,
    /// Text frames pushed to every socket right after it opens.
    pub push_on_open: Vec<String>,
    /// The first `n` sockets are closed by the server right after the pushes.
    pub drop_first_sockets: usize,
    /// The first `n` sockets lose their TCP connection without a close frame.
    pub abort_first_sockets: usize,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub login: AtomicUsize,
    pub refresh: AtomicUsize,
    pub register: AtomicUsize,
    pub socket: AtomicUsize,
}

impl Counters {
    pub fn login(&self) -> usize {
        self.login.load(Ordering::SeqCst)
    }
    pub fn refresh(&self) -> usize {
        self.refresh.load(Ordering::SeqCst)
    }
    pub fn register(&self) -> usize {
        self.register.load(Ordering::SeqCst)
    }
    pub fn socket(&self) -> usize {
        self.socket.load(Ordering::SeqCst)
    }
}

struct MockState {
    script: Script,
    counters: Arc<Counters>,
    socket_tokens: Arc<Mutex<Vec<String>>>,
    register_bodies: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    inbound: mpsc::UnboundedSender<Value>,
}

pub struct MockService {
    pub addr: SocketAddr,
    pub counters: Arc<Counters>,
    pub socket_tokens: Arc<Mutex<Vec<String>>>,
    /// `(authorization header, body)` for every registration.
    pub register_bodies: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    /// Every JSON frame the client wrote on any socket.
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

impl MockService {
    pub async fn start(script: Script) -> Self {
        let counters = Arc::new(Counters::default());
        let socket_tokens = Arc::new(Mutex::new(Vec::new()));
        let register_bodies = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            script,
            counters: counters.clone(),
            socket_tokens: socket_tokens.clone(),
            register_bodies: register_bodies.clone(),
            inbound: inbound_tx,
        });

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/refresh-token", post(refresh))
            .route("/api/webnodes/register", post(register))
            .route("/api/public/webnodes/ws", get(socket))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock service");
        });

        Self {
            addr,
            counters,
            socket_tokens,
            register_bodies,
            inbound,
        }
    }

    /// Node config aimed at this service, with timings shrunk for tests.
    pub fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(&format!("http://{}", self.addr)).expect("config");
        config.login_timeout = Duration::from_secs(2);
        config.api_timeout = Duration::from_secs(2);
        config.connect_timeout = Duration::from_secs(2);
        config.write_timeout = Duration::from_secs(2);
        config.heartbeat_interval = Duration::from_secs(30);
        config.retry = RetryPolicy {
            max_attempts: None,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: false,
        };
        config
    }

    pub fn socket_tokens(&self) -> Vec<String> {
        self.socket_tokens.lock().expect("tokens").clone()
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    state.counters.login.fetch_add(1, Ordering::SeqCst);
    assert!(body.get("user_id").is_some(), "login without user_id: {body}");
    assert!(body.get("password").is_some(), "login without password: {body}");
    if state.script.login_code != 0 {
        return Json(json!({"code": state.script.login_code, "msg": "bad credentials"}));
    }
    Json(json!({"code": 0, "data": {"refresh_token": "refresh-1"}}))
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let n = state.counters.refresh.fetch_add(1, Ordering::SeqCst) + 1;
    assert_eq!(body["refresh_token"], "refresh-1");
    match state.script.refresh {
        RefreshScript::Fail => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        RefreshScript::FailAfter(limit) if n > limit => {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
        }
        RefreshScript::RejectAfter(limit) if n > limit => {
            Json(json!({"code": 401, "msg": "refresh token expired"})).into_response()
        }
        _ => Json(json!({"code": 0, "data": {"access_token": format!("access-{n}")}}))
            .into_response(),
    }
}

async fn register(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.counters.register.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state
        .register_bodies
        .lock()
        .expect("bodies")
        .push((auth, body));
    if state.script.register_code != 0 {
        return Json(json!({"code": state.script.register_code, "msg": "not today"}));
    }
    Json(json!({"code": 0, "data": null}))
}

async fn socket(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<MockState>>,
) -> Response {
    let index = state.counters.socket.fetch_add(1, Ordering::SeqCst);
    state
        .socket_tokens
        .lock()
        .expect("tokens")
        .push(params.get("token").cloned().unwrap_or_default());
    assert!(params.contains_key("device_id"), "socket without device_id");
    if state.script.reject_socket {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state, index))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<MockState>, index: usize) {
    for frame in &state.script.push_on_open {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if index < state.script.abort_first_sockets {
        drop(socket);
        return;
    }
    if index < state.script.drop_first_sockets {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                let _ = state.inbound.send(value);
            }
        }
    }
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}
