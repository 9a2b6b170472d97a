//! # runlink-mock — Scriptable agent backend
//!
//! Serves the three run endpoints a runlink client talks to, answering each
//! request from a [`MockScript`]:
//!
//! - `GET /threads/{thread_id}/runs/{run_id}/ws?token=` — duplex socket
//! - `GET /threads/{thread_id}/stream?run_id=&stream_mode=` — SSE stream
//! - `GET /threads/{thread_id}/runs/{run_id}` — run snapshot
//!
//! Request counters and the last credential seen are exposed so tests can
//! assert on reconnect behaviour.

pub mod script;

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use script::{
    MockScript, PollScript, SocketEnd, SocketScript, StreamEnd, StreamEvent, StreamScript,
    demo_script,
};

/// Requests seen per endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub socket_attempts: usize,
    pub stream_attempts: usize,
    pub poll_requests: usize,
    /// `{"type":"pong"}` frames received on held sockets.
    pub pongs: usize,
}

#[derive(Debug, Default)]
struct MockState {
    script: MockScript,
    socket_attempts: AtomicUsize,
    stream_attempts: AtomicUsize,
    poll_requests: AtomicUsize,
    pongs: AtomicUsize,
    last_token: Mutex<Option<String>>,
    last_stream_mode: Mutex<Option<String>>,
}

impl MockState {
    fn counters(&self) -> Counters {
        Counters {
            socket_attempts: self.socket_attempts.load(Ordering::SeqCst),
            stream_attempts: self.stream_attempts.load(Ordering::SeqCst),
            poll_requests: self.poll_requests.load(Ordering::SeqCst),
            pongs: self.pongs.load(Ordering::SeqCst),
        }
    }

    fn remember_token(&self, token: Option<String>) {
        if token.is_some() {
            *self.last_token.lock() = token;
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SocketQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamQuery {
    run_id: Option<String>,
    stream_mode: Option<String>,
}

/// A backend bound to a local port. Dropping it stops the server.
#[derive(Debug)]
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockBackend {
    /// Serve `script` on an ephemeral port of 127.0.0.1.
    pub async fn spawn(script: MockScript) -> io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), script).await
    }

    pub async fn bind(addr: SocketAddr, script: MockScript) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            script,
            ..MockState::default()
        });
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&state));
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(error) = served {
                warn!(%error, "mock backend stopped with error");
            }
        });
        debug!(%addr, "mock backend listening");
        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:{port}`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn counters(&self) -> Counters {
        self.state.counters()
    }

    /// Last credential presented on any endpoint.
    pub fn last_token(&self) -> Option<String> {
        self.state.last_token.lock().clone()
    }

    pub fn last_stream_mode(&self) -> Option<String> {
        self.state.last_stream_mode.lock().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

/// Serve `script` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, script: MockScript, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(MockState {
        script,
        ..MockState::default()
    });
    info!(addr = %listener.local_addr()?, "mock backend listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/threads/{thread_id}/runs/{run_id}/ws", get(run_socket))
        .route("/threads/{thread_id}/stream", get(run_stream))
        .route("/threads/{thread_id}/runs/{run_id}", get(run_snapshot))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "runlink-mock"
    }))
}

async fn run_socket(
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<SocketQuery>,
    State(state): State<Arc<MockState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let index = state.socket_attempts.fetch_add(1, Ordering::SeqCst);
    state.remember_token(query.token);
    debug!(%thread_id, %run_id, index, "socket request");

    match state.script.socket_at(index) {
        SocketScript::Reject { status } => status_response(status),
        SocketScript::Accept { frames, end } => {
            let delay = state.script.frame_delay;
            ws.on_upgrade(move |socket| play_socket(socket, frames, end, delay, state))
        }
    }
}

async fn play_socket(
    mut socket: WebSocket,
    frames: Vec<Value>,
    end: SocketEnd,
    delay: Duration,
    state: Arc<MockState>,
) {
    for frame in frames {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    match end {
        SocketEnd::Close { code, reason } => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
        SocketEnd::Drop => drop(socket),
        SocketEnd::Hold => {
            while let Some(Ok(message)) = socket.next().await {
                match message {
                    Message::Text(text) => {
                        let is_pong = serde_json::from_str::<Value>(text.as_str())
                            .ok()
                            .and_then(|frame| {
                                frame.get("type").and_then(Value::as_str).map(|kind| kind == "pong")
                            })
                            .unwrap_or(false);
                        if is_pong {
                            state.pongs.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn run_stream(
    Path(thread_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<Arc<MockState>>,
) -> Response {
    let index = state.stream_attempts.fetch_add(1, Ordering::SeqCst);
    state.remember_token(bearer(&headers));
    *state.last_stream_mode.lock() = query.stream_mode.clone();
    debug!(%thread_id, run_id = ?query.run_id, index, "stream request");

    match state.script.stream_at(index) {
        StreamScript::Reject { status } => status_response(status),
        StreamScript::Events { events, end } => {
            let delay = state.script.frame_delay;
            let stream = stream! {
                for event in events {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let sse = Event::default().data(event.data_text());
                    let sse = match &event.name {
                        Some(name) => sse.event(name),
                        None => sse,
                    };
                    yield Ok::<_, Infallible>(sse);
                }
                if end == StreamEnd::Hold {
                    std::future::pending::<()>().await;
                }
            };
            Sse::new(stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text("keep-alive"),
                )
                .into_response()
        }
    }
}

async fn run_snapshot(
    Path((thread_id, run_id)): Path<(String, String)>,
    headers: HeaderMap,
    State(state): State<Arc<MockState>>,
) -> Response {
    let index = state.poll_requests.fetch_add(1, Ordering::SeqCst);
    state.remember_token(bearer(&headers));
    debug!(%thread_id, %run_id, index, "snapshot request");

    match state.script.poll_at(index) {
        PollScript::Snapshot(body) => Json(body).into_response(),
        PollScript::Empty => StatusCode::OK.into_response(),
        PollScript::Status(status) => status_response(status),
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn status_response(status: u16) -> Response {
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}
