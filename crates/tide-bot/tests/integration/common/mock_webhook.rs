//! Mock webhook server for integration tests.
//!
//! Accepts `POST /hook/{name}`, records every body, and replies with scripted
//! status codes (204 once the script for a hook is exhausted).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

/// A request received by the mock server.
#[derive(Debug, Clone)]
pub struct ReceivedHook {
    pub hook: String,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    received: Vec<ReceivedHook>,
    scripts: HashMap<String, VecDeque<u16>>,
}

type SharedState = Arc<Mutex<MockState>>;

/// A mock webhook server for testing.
pub struct MockWebhookServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    state: SharedState,
}

impl MockWebhookServer {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: SharedState = Arc::new(Mutex::new(MockState::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route("/hook/{name}", post(receive))
            .with_state(state.clone());

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                })
                .await;
        });

        Self {
            addr,
            shutdown_tx,
            state,
        }
    }

    /// URL of hook `name`.
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/hook/{}", self.addr, name)
    }

    /// Queue status replies for hook `name`, consumed in order.
    pub async fn script(&self, name: &str, statuses: &[u16]) {
        self.state
            .lock()
            .await
            .scripts
            .entry(name.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// All requests received so far.
    pub async fn received(&self) -> Vec<ReceivedHook> {
        self.state.lock().await.received.clone()
    }

    /// Requests received for hook `name`.
    pub async fn received_for(&self, name: &str) -> Vec<ReceivedHook> {
        self.received()
            .await
            .into_iter()
            .filter(|r| r.hook == name)
            .collect()
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn receive(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let mut state = state.lock().await;
    let status = state
        .scripts
        .get_mut(&name)
        .and_then(|script| script.pop_front())
        .unwrap_or(204);
    state.received.push(ReceivedHook { hook: name, body });
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
