//! In-process push endpoint that answers with scripted status codes and
//! records every request it receives.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use logship::client::metrics::Metrics;
use logship::config::types::{BackoffConfig, ClientConfig};
use logship::logproto::{decode_push_request, PushRequest};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

pub const PUSH_PATH: &str = "/loki/api/v1/push";

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub tenant: Option<String>,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    pub push: PushRequest,
    pub received_at: Instant,
}

impl ReceivedRequest {
    /// Lines per stream label string, in stream order
    pub fn streams(&self) -> Vec<(String, Vec<String>)> {
        self.push
            .streams
            .iter()
            .map(|s| {
                (
                    s.labels.clone(),
                    s.entries.iter().map(|e| e.line.clone()).collect(),
                )
            })
            .collect()
    }

    pub fn lines(&self) -> Vec<String> {
        self.streams().into_iter().flat_map(|(_, lines)| lines).collect()
    }
}

#[derive(Default)]
struct MockState {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<ReceivedRequest>>,
}

pub struct MockPushServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockPushServer {
    /// Start a server that answers 204 unless statuses were scripted
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route(PUSH_PATH, post(push))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Answer the next requests with these statuses, in order
    pub fn script(&self, statuses: &[u16]) {
        self.state.statuses.lock().unwrap().extend(statuses);
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, PUSH_PATH)
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests arrived
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<ReceivedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= count || Instant::now() >= deadline {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn push(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let push = decode_push_request(&body).unwrap_or_default();
    state.requests.lock().unwrap().push(ReceivedRequest {
        tenant: header("x-scope-orgid"),
        user_agent: header("user-agent"),
        content_type: header("content-type"),
        push,
        received_at: Instant::now(),
    });

    let status = state.statuses.lock().unwrap().pop_front().unwrap_or(204);
    let status = StatusCode::from_u16(status).unwrap();
    if status.is_success() {
        (status, String::new())
    } else {
        (status, format!("scripted failure {}\nsecond line", status.as_u16()))
    }
}

/// Client config pointed at `url` with fast retries
pub fn client_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url);
    config.name = "test-client".to_string();
    config.batch_wait = Duration::from_millis(100);
    config.timeout = Duration::from_secs(5);
    config.backoff_config = BackoffConfig {
        min_period: Duration::from_millis(10),
        max_period: Duration::from_millis(50),
        max_retries: 3,
        max_elapsed: None,
    };
    config
}

pub fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new(None, &[]).unwrap())
}
