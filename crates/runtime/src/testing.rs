//! In-process stand-in for the backend, served by axum on a random port.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::backend::{BackendClient, SECRET_HEADER};

pub(crate) const SECRET: &str = "test-secret";

#[derive(Default)]
struct Inner {
    events: Mutex<Vec<Value>>,
    results: Mutex<Vec<(String, Value)>>,
    pending: Mutex<Vec<Value>>,
    /// Statuses returned to the next event posts, in order.
    scripted: Mutex<VecDeque<StatusCode>>,
    /// Status once `scripted` is exhausted; `None` means 200.
    fallback: Mutex<Option<StatusCode>>,
    event_delay: Mutex<Duration>,
    pending_delay: Mutex<Duration>,
    result_delay: Mutex<Duration>,
    event_hits: AtomicUsize,
    pending_hits: AtomicUsize,
    bad_secret: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct FakeBackend {
    inner: Arc<Inner>,
    addr: SocketAddr,
}

impl FakeBackend {
    pub(crate) async fn start() -> Self {
        let inner = Arc::new(Inner::default());
        let app = Router::new()
            .route("/api/nfc/events", post(post_event))
            .route("/api/nfc/commands/pending", get(get_pending))
            .route("/api/nfc/commands/{id}/result", post(post_result))
            .with_state(Arc::clone(&inner));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { inner, addr }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn client(&self) -> BackendClient {
        BackendClient::new(self.url(), SECRET, Duration::from_secs(2)).unwrap()
    }

    pub(crate) fn client_with_timeout(&self, timeout: Duration) -> BackendClient {
        BackendClient::new(self.url(), SECRET, timeout).unwrap()
    }

    pub(crate) fn script(&self, statuses: impl IntoIterator<Item = StatusCode>) {
        self.inner.scripted.lock().unwrap().extend(statuses);
    }

    pub(crate) fn set_fallback(&self, status: Option<StatusCode>) {
        *self.inner.fallback.lock().unwrap() = status;
    }

    pub(crate) fn set_event_delay(&self, delay: Duration) {
        *self.inner.event_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_pending_delay(&self, delay: Duration) {
        *self.inner.pending_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_result_delay(&self, delay: Duration) {
        *self.inner.result_delay.lock().unwrap() = delay;
    }

    pub(crate) fn add_pending(&self, id: &str, url: &str) {
        self.inner.pending.lock().unwrap().push(json!({
            "_id": id,
            "petId": format!("pet-{id}"),
            "url": url,
            "status": "pending",
        }));
    }

    pub(crate) fn clear_pending(&self) {
        self.inner.pending.lock().unwrap().clear();
    }

    /// Bodies of accepted event posts, in arrival order.
    pub(crate) fn events(&self) -> Vec<Value> {
        self.inner.events.lock().unwrap().clone()
    }

    pub(crate) fn results(&self) -> Vec<(String, Value)> {
        self.inner.results.lock().unwrap().clone()
    }

    pub(crate) fn event_hits(&self) -> usize {
        self.inner.event_hits.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_hits(&self) -> usize {
        self.inner.pending_hits.load(Ordering::SeqCst)
    }

    pub(crate) fn bad_secret_hits(&self) -> usize {
        self.inner.bad_secret.load(Ordering::SeqCst)
    }
}

fn check_secret(inner: &Inner, headers: &HeaderMap) -> bool {
    let ok = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) == Some(SECRET);
    if !ok {
        inner.bad_secret.fetch_add(1, Ordering::SeqCst);
    }
    ok
}

async fn post_event(State(inner): State<Arc<Inner>>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    inner.event_hits.fetch_add(1, Ordering::SeqCst);
    if !check_secret(&inner, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    pause(&inner.event_delay).await;
    let scripted = inner.scripted.lock().unwrap().pop_front();
    let status = scripted
        .or(*inner.fallback.lock().unwrap())
        .unwrap_or(StatusCode::OK);
    if status.is_success() {
        inner.events.lock().unwrap().push(body);
    }
    status
}

async fn get_pending(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    inner.pending_hits.fetch_add(1, Ordering::SeqCst);
    if !check_secret(&inner, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    pause(&inner.pending_delay).await;
    let pending = inner.pending.lock().unwrap().clone();
    Ok(Json(json!({ "success": true, "data": pending })))
}

async fn post_result(
    State(inner): State<Arc<Inner>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if !check_secret(&inner, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    pause(&inner.result_delay).await;
    inner.results.lock().unwrap().push((id, body));
    StatusCode::OK
}

async fn pause(delay: &Mutex<Duration>) {
    let delay = *delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
