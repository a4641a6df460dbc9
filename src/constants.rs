/// src/constants.rs - Runtime configurable constants and static values

use std::sync::OnceLock;

/// Global configuration that can be set at runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_json_chars: usize,
    pub max_request_size_bytes: usize,
    pub max_partial_content_size: usize,
    pub string_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_json_chars: 200_000,
            max_request_size_bytes: 50 * 1024 * 1024,
            max_partial_content_size: 50_000,
            string_buffer_size: 2048,
        }
    }
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Initialize runtime configuration
pub fn init_runtime_config(config: RuntimeConfig) {
    RUNTIME_CONFIG.set(config).ok();
}

/// Get current runtime configuration
pub fn get_runtime_config() -> &'static RuntimeConfig {
    RUNTIME_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<RuntimeConfig> = OnceLock::new();
        DEFAULT.get_or_init(RuntimeConfig::default)
    })
}

/// Response headers
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_SSE: &str = "text/event-stream";
pub const HEADER_CACHE_CONTROL: &str = "no-cache";
pub const HEADER_CONNECTION: &str = "keep-alive";
pub const HEADER_ACCESS_CONTROL_ALLOW_ORIGIN: &str = "*";
pub const HEADER_ACCESS_CONTROL_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const HEADER_ACCESS_CONTROL_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// Request id header advertised to clients (lowercased on the wire)
pub const HEADER_REQUEST_ID: &str = "x-streamfix-request-id";

/// Error messages
pub const ERROR_MISSING_MODEL: &str = "No model specified and no default model configured";
pub const ERROR_STREAM_TIMEOUT: &str = "Stream timeout";
pub const ERROR_STREAM_DEADLINE: &str = "Stream exceeded maximum duration";
pub const ERROR_CANCELLED: &str = "Request cancelled by client";
pub const ERROR_UPSTREAM_UNAVAILABLE: &str = "Upstream not available";
pub const ERROR_REQUEST_TOO_LARGE: &str = "Request body too large";
pub const ERROR_TOO_MANY_STREAMS: &str = "Too many concurrent streams";
pub const ERROR_RATE_LIMITED: &str = "Rate limit exceeded";

/// SSE parsing constants
pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_DONE_MESSAGE: &str = "[DONE]";

/// Logging prefixes
pub const LOG_PREFIX_REQUEST: &str = "🔄";
pub const LOG_PREFIX_SUCCESS: &str = "✅";
pub const LOG_PREFIX_ERROR: &str = "❌";
pub const LOG_PREFIX_WARNING: &str = "⚠️";
pub const LOG_PREFIX_CANCEL: &str = "🚫";
