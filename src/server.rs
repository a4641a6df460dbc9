// src/server.rs - Proxy server with concurrent request support

use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use warp::{Filter, Rejection, Reply};

use crate::artifacts::ArtifactStore;
use crate::common::validate_request_size;
use crate::constants::*;
use crate::handlers;
use crate::metrics::{get_global_metrics, init_global_metrics};
use crate::provider::UpstreamProvider;
use crate::utils::{extract_client_ip, validate_config, Logger, ProxyError};

#[derive(Parser, Debug, Clone)]
#[command(name = "serve")]
#[command(about = "Run the StreamFix proxy server")]
pub struct Config {
    #[arg(long, default_value = "127.0.0.1", help = "Host to bind to")]
    pub host: String,

    #[arg(long, default_value = "8000", help = "Port to bind to")]
    pub port: u16,

    #[arg(
        long = "upstream",
        env = "UPSTREAM_BASE_URL",
        default_value = "http://localhost:1234/v1",
        help = "Upstream OpenAI-compatible base URL"
    )]
    pub upstream_base_url: String,

    #[arg(long = "api-key", env = "UPSTREAM_API_KEY", help = "Bearer token presented upstream")]
    pub upstream_api_key: Option<String>,

    #[arg(long, env = "DEFAULT_MODEL", help = "Model used when the request names none")]
    pub default_model: Option<String>,

    #[arg(long, env = "MAX_JSON_CHARS", default_value = "200000", help = "Extraction buffer cap")]
    pub max_json_chars: usize,

    #[arg(long, env = "MAX_STREAM_SECONDS", default_value = "90", help = "Per-stream wall-clock cap in seconds")]
    pub max_stream_seconds: u64,

    #[arg(long, env = "MAX_CONCURRENT_STREAMS", default_value = "50", help = "Process-wide concurrent stream cap")]
    pub max_concurrent_streams: usize,

    #[arg(long, env = "MAX_RPM", default_value = "120", help = "Per-client requests per minute (0 disables)")]
    pub max_rpm: u32,

    #[arg(long, env = "ARTIFACT_CAPACITY", default_value = "100", help = "Artifact store capacity")]
    pub artifact_capacity: usize,

    #[arg(long, default_value = "120", help = "Non-streaming upstream timeout in seconds")]
    pub request_timeout_seconds: u64,

    #[arg(long, default_value = "30", help = "Streaming idle timeout in seconds")]
    pub stream_idle_timeout_seconds: u64,

    #[arg(long, default_value = "52428800", help = "Maximum request size in bytes")]
    pub max_request_size: usize,

    #[arg(long, help = "Disable logging output")]
    pub no_log: bool,
}

/// Per-client token bucket keyed by caller ip.
pub struct RateLimiter {
    rpm: u32,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        Self {
            rpm,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        if self.rpm == 0 {
            return true;
        }

        let mut buckets = self.buckets.lock().await;
        // Bound the per-client map; a reset just grants a fresh burst.
        if buckets.len() > 10_000 {
            buckets.clear();
        }

        let now = Instant::now();
        let capacity = self.rpm as f64;
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity / 60.0).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared server state behind every route.
pub struct ProxyServer {
    pub client: reqwest::Client,
    pub config: Config,
    pub logger: Logger,
    pub provider: UpstreamProvider,
    pub artifacts: ArtifactStore,
    pub stream_permits: Arc<Semaphore>,
    pub rate_limiter: RateLimiter,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        validate_config(&config)?;

        init_runtime_config(RuntimeConfig {
            max_json_chars: config.max_json_chars,
            max_request_size_bytes: config.max_request_size,
            ..Default::default()
        });
        init_global_metrics();

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let logger = Logger::new(!config.no_log);
        let provider =
            UpstreamProvider::from_config(&config.upstream_base_url, config.upstream_api_key.as_deref());
        let artifacts = ArtifactStore::new(config.artifact_capacity);
        let stream_permits = Arc::new(Semaphore::new(config.max_concurrent_streams));
        let rate_limiter = RateLimiter::new(config.max_rpm);

        Ok(Self {
            client,
            config,
            logger,
            provider,
            artifacts,
            stream_permits,
            rate_limiter,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.print_startup_banner();

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| format!("Invalid listen address '{}:{}': {}", self.config.host, self.config.port, e))?;

        let server = Arc::new(self);
        warp::serve(routes(server)).run(addr).await;
        Ok(())
    }

    fn print_startup_banner(&self) {
        if self.logger.enabled {
            println!();
            println!("StreamFix Proxy");
            println!("------------------------------------------------------");
            println!("Version: {}", crate::VERSION);
            println!("Listen Address: {}:{}", self.config.host, self.config.port);
            println!("Upstream: {}", self.config.upstream_base_url);
            println!("Max JSON Chars: {}", self.config.max_json_chars);
            println!("Max Stream Seconds: {}", self.config.max_stream_seconds);
            println!("Max Concurrent Streams: {}", self.config.max_concurrent_streams);
            println!("Rate Limit: {} rpm", self.config.max_rpm);
            println!("Artifact Capacity: {}", self.config.artifact_capacity);
            println!();
        }
    }
}

/// Full route tree; factored out of `run` so tests can exercise the HTTP
/// surface without binding a socket.
pub fn routes(
    server: Arc<ProxyServer>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::header::headers_cloned())
        .and(warp::body::json().or(warp::any().map(|| Value::Null)).unify())
        .and_then(
            move |method: warp::http::Method,
                  path: warp::path::FullPath,
                  headers: warp::http::HeaderMap,
                  body: Value| {
                let server = server.clone();
                async move {
                    handle_concurrent_request(
                        server,
                        method.to_string(),
                        path.as_str().to_string(),
                        headers,
                        body,
                    )
                    .await
                }
            },
        )
        .recover(handle_rejection)
}

/// Thread-safe connection tracker with proper synchronization
struct ConnectionTracker {
    token: CancellationToken,
    completed: Arc<AtomicBool>,
}

impl ConnectionTracker {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark request as completed successfully
    fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Only cancel if the request never completed.
            self.token.cancel();
        }
    }
}

async fn handle_concurrent_request(
    server: Arc<ProxyServer>,
    method: String,
    path: String,
    headers: warp::http::HeaderMap,
    body: Value,
) -> Result<warp::reply::Response, Rejection> {
    if let Some(metrics) = get_global_metrics() {
        metrics.record_request();
    }

    if !body.is_null() {
        if let Err(e) = validate_request_size(&body) {
            return Err(warp::reject::custom(e));
        }
    }

    let cancellation_token = CancellationToken::new();
    let connection_tracker = ConnectionTracker::new(cancellation_token.clone());
    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "local".to_string());

    let result = match (method.as_str(), path.as_str()) {
        ("POST", "/v1/chat/completions") => {
            if !server.rate_limiter.try_acquire(&client_ip).await {
                Err(ProxyError::rate_limited())
            } else {
                handlers::handle_chat_completions(server.clone(), body.clone(), cancellation_token)
                    .await
            }
        }
        ("POST", "/test") => handlers::handle_test(server.clone(), body.clone()).await,
        ("GET", "/health") => handlers::handle_health().await,
        ("GET", "/metrics") => handlers::handle_metrics(server.clone()).await,
        ("GET", "/") => handlers::handle_root().await,
        ("GET", p) if p.starts_with("/result/") => {
            let request_id = &p["/result/".len()..];
            handlers::handle_result(server.clone(), request_id).await
        }
        _ => Err(ProxyError::not_found(&format!(
            "Unknown endpoint: {} {}",
            method, path
        ))),
    };

    match result {
        Ok(response) => {
            connection_tracker.mark_completed();
            Ok(response)
        }
        Err(e) if e.is_cancelled() => {
            if let Some(metrics) = get_global_metrics() {
                metrics.record_request_cancelled();
            }
            let error_response = serde_json::json!({
                "error": {
                    "type": "request_cancelled",
                    "message": ERROR_CANCELLED
                }
            });
            Ok(warp::reply::with_status(
                warp::reply::json(&error_response),
                warp::http::StatusCode::REQUEST_TIMEOUT,
            )
            .into_response())
        }
        Err(e) => {
            connection_tracker.mark_completed();
            if let Some(metrics) = get_global_metrics() {
                metrics.record_request_failure();
            }
            Err(warp::reject::custom(e))
        }
    }
}

/// Map rejections to the JSON error envelope with proper status codes.
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (404, "Not Found".to_string())
    } else if let Some(proxy_error) = err.find::<ProxyError>() {
        (proxy_error.status_code, proxy_error.message.clone())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (405, "Method Not Allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        let max_size_mb = get_runtime_config().max_request_size_bytes / (1024 * 1024);
        (413, format!("Payload Too Large (max: {}MB)", max_size_mb))
    } else {
        (500, "Internal Server Error".to_string())
    };

    let json = warp::reply::json(&serde_json::json!({
        "error": {
            "type": "api_error",
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }));

    Ok(warp::reply::with_status(
        json,
        warp::http::StatusCode::from_u16(code).unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::parse_from(["streamfix-proxy"])
    }

    fn test_server() -> Arc<ProxyServer> {
        Arc::new(ProxyServer::new(test_config()).expect("server builds"))
    }

    #[test]
    fn test_config_defaults() {
        let config = test_config();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_json_chars, 200_000);
        assert_eq!(config.max_rpm, 120);
        assert_eq!(config.artifact_capacity, 100);
    }

    #[test]
    fn test_config_validation_rejects_bad_upstream() {
        let mut config = test_config();
        config.upstream_base_url = "not-a-url".to_string();
        assert!(ProxyServer::new(config).is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_caps() {
        let mut config = test_config();
        config.max_concurrent_streams = 0;
        assert!(ProxyServer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_enforces_budget() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire("client").await);
        assert!(limiter.try_acquire("client").await);
        assert!(limiter.try_acquire("client").await);
        assert!(!limiter.try_acquire("client").await);
        // Separate clients get separate buckets.
        assert!(limiter.try_acquire("other").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_at_zero() {
        let limiter = RateLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire("client").await);
        }
    }

    #[tokio::test]
    async fn test_health_route() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let value: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("GET")
            .path("/nope")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_repair_route_end_to_end() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("POST")
            .path("/test")
            .json(&serde_json::json!({"broken_json": "{\"a\": 1,}"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let value: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["repaired"], "{\"a\": 1}");
        assert_eq!(value["valid_json"], true);
    }

    #[tokio::test]
    async fn test_result_route_unknown_id_is_404() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("GET")
            .path("/result/req_missing")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
        let value: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["error"]["type"], "api_error");
    }

    #[tokio::test]
    async fn test_chat_route_rejects_malformed_body() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("POST")
            .path("/v1/chat/completions")
            .json(&serde_json::json!({"messages": "not an array"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_chat_route_rejects_invalid_schema() {
        let routes = routes(test_server());
        let response = warp::test::request()
            .method("POST")
            .path("/v1/chat/completions")
            .json(&serde_json::json!({
                "model": "m",
                "messages": [],
                "schema": {"type": "not-a-type"}
            }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);
    }
}
