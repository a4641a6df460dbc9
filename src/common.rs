// src/common.rs - Shared upstream request plumbing with cancellation support

use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::check_cancelled;
use crate::constants::*;
use crate::provider::UpstreamProvider;
use crate::utils::ProxyError;

/// Cancellable upstream chat-completion call. Races the HTTP send against
/// the request's cancellation token so a disconnected client never leaves
/// an orphaned upstream request.
pub struct CancellableRequest<'a> {
    client: &'a reqwest::Client,
    provider: &'a UpstreamProvider,
    token: CancellationToken,
    timeout_seconds: u64,
}

impl<'a> CancellableRequest<'a> {
    pub fn new(
        client: &'a reqwest::Client,
        provider: &'a UpstreamProvider,
        token: CancellationToken,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            client,
            provider,
            token,
            timeout_seconds,
        }
    }

    /// POST the chat-completion body upstream. Streaming responses get no
    /// overall timeout here; the relay loop enforces its own deadlines.
    pub async fn send(&self, body: &Value, streaming: bool) -> Result<reqwest::Response, ProxyError> {
        check_cancelled!(self.token);

        let mut request_builder = self.provider.chat_completion_request(self.client, body);
        if !streaming {
            request_builder = request_builder.timeout(Duration::from_secs(self.timeout_seconds));
        }

        tokio::select! {
            result = request_builder.send() => {
                match result {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        if err.is_timeout() {
                            Err(ProxyError::upstream_timeout("Upstream request timeout"))
                        } else if err.is_connect() {
                            Err(ProxyError::upstream_unavailable(ERROR_UPSTREAM_UNAVAILABLE))
                        } else {
                            Err(ProxyError::internal_server_error(&format!("Upstream request failed: {}", err)))
                        }
                    }
                }
            }
            _ = self.token.cancelled() => {
                Err(ProxyError::request_cancelled())
            }
        }
    }
}

/// Read a JSON body from a successful upstream response; a non-2xx status
/// is forwarded with the upstream status code preserved.
pub async fn handle_json_response(
    response: reqwest::Response,
    cancellation_token: CancellationToken,
) -> Result<Value, ProxyError> {
    check_cancelled!(cancellation_token);

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown upstream error".to_string());
        return Err(ProxyError::new(format!("Upstream error: {}", detail), status));
    }

    tokio::select! {
        result = response.json::<Value>() => {
            result.map_err(|e| {
                ProxyError::internal_server_error(&format!("Invalid JSON from upstream: {}", e))
            })
        }
        _ = cancellation_token.cancelled() => {
            Err(ProxyError::request_cancelled())
        }
    }
}

/// Reject oversized request bodies early, before they reach the upstream.
pub fn validate_request_size(body: &Value) -> Result<(), ProxyError> {
    let config = get_runtime_config();
    let estimated_size = estimate_json_size(body);

    if estimated_size > config.max_request_size_bytes {
        return Err(ProxyError::bad_request(&format!(
            "{} (size: {} bytes, max: {} bytes)",
            ERROR_REQUEST_TOO_LARGE, estimated_size, config.max_request_size_bytes
        )));
    }

    Ok(())
}

/// Fast size estimation without serializing the value back out.
fn estimate_json_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(true) => 4,
        Value::Bool(false) => 5,
        Value::Number(_) => 12,
        Value::String(s) => s.len() + 2,
        Value::Array(arr) => 2 + arr.iter().map(estimate_json_size).sum::<usize>() + arr.len(),
        Value::Object(obj) => {
            2 + obj
                .iter()
                .map(|(k, v)| k.len() + 4 + estimate_json_size(v))
                .sum::<usize>()
        }
    }
}
