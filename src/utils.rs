// src/utils.rs - Consolidated utilities with enhanced error handling

use std::cell::RefCell;
use std::error::Error;
use std::fmt::{self, Write};
use std::time::{Duration, Instant};
use warp::reject::Reject;

use crate::constants::*;

// Thread-local string buffer for reuse
thread_local! {
    static STRING_BUFFER: RefCell<String> = RefCell::new(String::with_capacity(get_runtime_config().string_buffer_size));
}

/// Macro for cancellation checking
#[macro_export]
macro_rules! check_cancelled {
    ($token:expr) => {
        if $token.is_cancelled() {
            return Err(ProxyError::request_cancelled());
        }
    };
}

/// Enhanced error type for the proxy server
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub message: String,
    pub status_code: u16,
    kind: ProxyErrorKind,
}

#[derive(Debug, Clone)]
enum ProxyErrorKind {
    RequestCancelled,
    InternalServerError,
    BadRequest,
    NotFound,
    RateLimited,
    TooManyStreams,
    UpstreamUnavailable,
    UpstreamTimeout,
    Custom,
}

impl ProxyError {
    /// Upstream status preserved where safe (any non-2xx forwarded as-is).
    pub fn new(message: String, status_code: u16) -> Self {
        Self {
            message,
            status_code,
            kind: ProxyErrorKind::Custom,
        }
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status_code: 500,
            kind: ProxyErrorKind::InternalServerError,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status_code: 400,
            kind: ProxyErrorKind::BadRequest,
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status_code: 404,
            kind: ProxyErrorKind::NotFound,
        }
    }

    pub fn request_cancelled() -> Self {
        Self {
            message: ERROR_CANCELLED.to_string(),
            status_code: 499,
            kind: ProxyErrorKind::RequestCancelled,
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            message: ERROR_RATE_LIMITED.to_string(),
            status_code: 429,
            kind: ProxyErrorKind::RateLimited,
        }
    }

    pub fn too_many_streams() -> Self {
        Self {
            message: ERROR_TOO_MANY_STREAMS.to_string(),
            status_code: 503,
            kind: ProxyErrorKind::TooManyStreams,
        }
    }

    pub fn upstream_unavailable(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status_code: 503,
            kind: ProxyErrorKind::UpstreamUnavailable,
        }
    }

    pub fn upstream_timeout(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status_code: 504,
            kind: ProxyErrorKind::UpstreamTimeout,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ProxyErrorKind::RequestCancelled)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyError {}: {}", self.status_code, self.message)
    }
}

impl Error for ProxyError {}
impl Reject for ProxyError {}

/// Timestamped stdout logger with a global enable flag
#[derive(Debug, Clone)]
pub struct Logger {
    pub enabled: bool,
}

impl Logger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Log with timing information using efficient string buffer
    pub fn log_timed(&self, prefix: &str, operation: &str, start: Instant) {
        if self.enabled {
            let duration = start.elapsed();
            STRING_BUFFER.with(|buf| {
                let mut buffer = buf.borrow_mut();
                buffer.clear();
                let _ = write!(buffer, "{} {} ({})", prefix, operation, format_duration(duration));
                println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), buffer);
            });
        }
    }

    /// Simple log without timing
    pub fn log(&self, message: &str) {
        if self.enabled {
            println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message);
        }
    }

    /// Log request with its assigned id
    pub fn log_request(&self, method: &str, path: &str, request_id: Option<&str>) {
        if self.enabled {
            STRING_BUFFER.with(|buf| {
                let mut buffer = buf.borrow_mut();
                buffer.clear();
                let _ = match request_id {
                    Some(id) => write!(buffer, "{} {} {} [{}]", LOG_PREFIX_REQUEST, method, path, id),
                    None => write!(buffer, "{} {} {}", LOG_PREFIX_REQUEST, method, path),
                };
                println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), buffer);
            });
        }
    }

    /// Log error with operation context
    pub fn log_error(&self, operation: &str, error: &str) {
        if self.enabled {
            STRING_BUFFER.with(|buf| {
                let mut buffer = buf.borrow_mut();
                buffer.clear();
                let _ = write!(buffer, "{} {} failed: {}", LOG_PREFIX_ERROR, operation, sanitize_log_message(error));
                println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), buffer);
            });
        }
    }

    /// Log warning message
    pub fn log_warning(&self, operation: &str, warning: &str) {
        if self.enabled {
            STRING_BUFFER.with(|buf| {
                let mut buffer = buf.borrow_mut();
                buffer.clear();
                let _ = write!(buffer, "{} {} warning: {}", LOG_PREFIX_WARNING, operation, sanitize_log_message(warning));
                println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), buffer);
            });
        }
    }
}

/// Fast duration formatting with better precision
pub fn format_duration(duration: Duration) -> String {
    let total_nanos = duration.as_nanos();

    if total_nanos < 1_000 {
        format!("{}ns", total_nanos)
    } else if total_nanos < 1_000_000 {
        format!("{:.1}µs", total_nanos as f64 / 1_000.0)
    } else if total_nanos < 1_000_000_000 {
        format!("{:.2}ms", total_nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.3}s", total_nanos as f64 / 1_000_000_000.0)
    }
}

/// Startup-time config validation
pub fn validate_config(config: &crate::server::Config) -> Result<(), String> {
    if config.request_timeout_seconds == 0 {
        return Err("Request timeout must be greater than 0".to_string());
    }

    if config.stream_idle_timeout_seconds == 0 {
        return Err("Stream idle timeout must be greater than 0".to_string());
    }

    if config.max_stream_seconds == 0 {
        return Err("MAX_STREAM_SECONDS must be greater than 0".to_string());
    }

    if config.max_concurrent_streams == 0 {
        return Err("MAX_CONCURRENT_STREAMS must be greater than 0".to_string());
    }

    if config.max_json_chars == 0 {
        return Err("MAX_JSON_CHARS must be greater than 0".to_string());
    }

    if config.artifact_capacity == 0 {
        return Err("ARTIFACT_CAPACITY must be greater than 0".to_string());
    }

    if config.max_request_size == 0 {
        return Err("Max request size must be greater than 0".to_string());
    }

    if config.max_request_size > 1024 * 1024 * 1024 {
        return Err("Max request size too large (max: 1GB)".to_string());
    }

    if !config.upstream_base_url.starts_with("http://")
        && !config.upstream_base_url.starts_with("https://")
    {
        return Err(format!(
            "Invalid upstream URL (must start with http:// or https://): {}",
            config.upstream_base_url
        ));
    }

    if let Err(e) = url::Url::parse(&config.upstream_base_url) {
        return Err(format!("Invalid upstream URL format: {}", e));
    }

    Ok(())
}

/// Sanitize log message to prevent log injection
pub fn sanitize_log_message(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_control() && !matches!(c, '\t' | '\n' | '\r') { '?' } else { c })
        .collect()
}

/// Extract client IP from request headers (for rate limiting and logging)
pub fn extract_client_ip(headers: &warp::http::HeaderMap) -> Option<String> {
    let ip_headers = [
        "x-forwarded-for",
        "x-real-ip",
        "cf-connecting-ip",
        "x-client-ip",
    ];

    for header_name in &ip_headers {
        if let Some(header_value) = headers.get(*header_name) {
            if let Ok(ip_str) = header_value.to_str() {
                // Take first IP if comma-separated list
                let ip = ip_str.split(',').next().unwrap_or(ip_str).trim();
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    None
}

/// Short request id in the side-channel's `req_` namespace
pub fn new_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &hex[..12])
}
