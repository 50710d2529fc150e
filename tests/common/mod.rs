//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request},
    Router,
};
use edge_guard::config::GuardConfig;
use edge_guard::security::ip_intel::{IpIntelligenceRecord, IpReputationProvider, ProviderError};
use edge_guard::store::{KvStore, MemoryStore, SharedStore, StoreError, WindowCount};
use edge_guard::{Guard, GuardHandle, HttpServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// A request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub head: String,
    pub body: Vec<u8>,
}

impl Captured {
    /// Header value by lowercase name.
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }
}

pub type Captures = Arc<Mutex<Vec<Captured>>>;

/// Start a mock upstream on an ephemeral port that records every request
/// and answers `200 upstream ok`.
pub async fn start_mock_upstream() -> (SocketAddr, Captures) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captures: Captures = Arc::new(Mutex::new(Vec::new()));
    let sink = captures.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < head_end + content_length {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let body = buf[head_end..].to_vec();
                sink.lock().unwrap().push(Captured { head, body });

                let payload = "upstream ok";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, captures)
}

/// Defaults pointed at `upstream`, with a real CSRF secret.
pub fn test_config(upstream: SocketAddr) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.upstream.url = format!("http://{upstream}");
    config.csrf.secret = "integration-test-secret-0123456789".to_string();
    config.observability.metrics_enabled = false;
    config
}

/// Build the full proxy router over `store`.
pub fn build_app(config: GuardConfig, store: SharedStore) -> (Router, GuardHandle) {
    build_app_with_provider(config, store, None)
}

/// Build the full proxy router with a substitute reputation provider.
pub fn build_app_with_provider(
    config: GuardConfig,
    store: SharedStore,
    provider: Option<Arc<dyn IpReputationProvider>>,
) -> (Router, GuardHandle) {
    let monitor = Guard::new_monitor(&config, store.clone());
    let guard = Guard::new(config, store, monitor, provider).unwrap();
    let server = HttpServer::new(guard);
    (server.router(), server.guards())
}

/// Reputation provider answering from a fixed record, or failing.
pub struct StubProvider {
    answer: Option<IpIntelligenceRecord>,
    lookups: AtomicUsize,
}

impl StubProvider {
    pub fn answering(country: Option<&str>, asn: Option<u32>, reputation_score: u8, is_proxy: bool) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(IpIntelligenceRecord {
                ip: String::new(),
                country: country.map(str::to_string),
                asn,
                reputation_score,
                is_proxy,
                is_vpn: false,
                cached_at: 0,
            }),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpReputationProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn lookup(&self, ip: IpAddr) -> Result<IpIntelligenceRecord, ProviderError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(record) => Ok(IpIntelligenceRecord {
                ip: ip.to_string(),
                ..record.clone()
            }),
            None => Err(ProviderError::Status(502)),
        }
    }
}

pub fn memory_store() -> SharedStore {
    Arc::new(MemoryStore::new())
}

/// A request shaped like an ordinary browser's, from `ip`.
pub fn browser(method: Method, uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header(header::USER_AGENT, BROWSER_UA)
        .header(header::ACCEPT, "text/html,application/json")
        .header(header::ACCEPT_LANGUAGE, "en-US")
}

pub fn empty(builder: axum::http::request::Builder) -> Request<Body> {
    builder.body(Body::empty()).unwrap()
}

/// `name=value` of the first `Set-Cookie` for `name`.
pub fn set_cookie_value(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name).then(|| v.trim().to_string())
        })
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Store whose every operation fails.
pub struct FailingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl KvStore for FailingStore {
    async fn incr_window(&self, _key: &str, _window: Duration) -> Result<WindowCount, StoreError> {
        Err(down())
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(down())
    }
    async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Err(down())
    }
    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(down())
    }
    async fn push_capped(&self, _key: &str, _value: &str, _max_len: usize) -> Result<(), StoreError> {
        Err(down())
    }
    async fn range(&self, _key: &str, _offset: usize, _limit: usize) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
    async fn list_len(&self, _key: &str) -> Result<usize, StoreError> {
        Err(down())
    }
    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
