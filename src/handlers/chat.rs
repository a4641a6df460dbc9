// src/handlers/chat.rs - OpenAI-compatible chat completions endpoint

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{handle_json_response, CancellableRequest};
use crate::constants::*;
use crate::core::{process_content, ProcessedContent};
use crate::handlers::build_artifact;
use crate::handlers::streaming::{handle_streaming_response, StreamSession};
use crate::metrics::get_global_metrics;
use crate::request::ChatCompletionRequest;
use crate::schema;
use crate::server::ProxyServer;
use crate::utils::{new_request_id, ProxyError};

/// Entry point for POST /v1/chat/completions. Streams iff the request says
/// so; either way the response carries the request id header the side
/// channel is keyed on.
pub async fn handle_chat_completions(
    server: Arc<ProxyServer>,
    body: Value,
    cancellation_token: CancellationToken,
) -> Result<warp::reply::Response, ProxyError> {
    let start_time = Instant::now();

    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| ProxyError::bad_request(&format!("Malformed request body: {}", e)))?;

    // A schema that does not compile is a client error, not an artifact.
    if let Some(schema_value) = request.schema.as_ref() {
        schema::check_schema(schema_value).map_err(|e| ProxyError::bad_request(&e))?;
    }

    let model = match request.model.clone().filter(|m| !m.is_empty()) {
        Some(model) => model,
        None => server
            .config
            .default_model
            .clone()
            .ok_or_else(|| ProxyError::bad_request(ERROR_MISSING_MODEL))?,
    };

    let request_id = new_request_id();
    server
        .logger
        .log_request("POST", "/v1/chat/completions", Some(&request_id));

    let options = request.streamfix();
    let upstream_body = request.upstream_body(&model);
    let upstream = CancellableRequest::new(
        &server.client,
        &server.provider,
        cancellation_token.clone(),
        server.config.request_timeout_seconds,
    );

    if request.is_streaming() {
        let permit = server
            .stream_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ProxyError::too_many_streams())?;

        let response = upstream.send(&upstream_body, true).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown upstream error".to_string());
            return Err(ProxyError::new(format!("Upstream error: {}", detail), status));
        }

        let session = StreamSession::new(
            request_id,
            model,
            options.json_root,
            request.schema.clone(),
            server.config.max_json_chars,
        );
        handle_streaming_response(server.clone(), response, session, cancellation_token, permit)
            .await
    } else {
        let response = upstream.send(&upstream_body, false).await?;
        let mut upstream_json = handle_json_response(response, cancellation_token).await?;

        let content = message_content(&upstream_json);
        let processed = process_content(&content, options.json_root, server.config.max_json_chars);

        if let Some(metrics) = get_global_metrics() {
            metrics
                .record_repair_outcome(&processed.repairs_applied, processed.parse_ok)
                .await;
        }

        let artifact = build_artifact(
            &request_id,
            &model,
            &content,
            &processed,
            request.schema.as_ref(),
        );
        server.artifacts.insert(artifact).await;

        apply_content_policy(&mut upstream_json, &content, &processed);

        server
            .logger
            .log_timed(LOG_PREFIX_SUCCESS, "chat completion", start_time);
        json_response_with_request_id(&upstream_json, &request_id)
    }
}

fn message_content(response: &Value) -> String {
    response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

/// Replace `choices[0].message.content` with the repaired JSON only when
/// repair actually changed the text and the result parses. Unparseable
/// repair output never silently replaces the original.
pub(crate) fn apply_content_policy(
    response: &mut Value,
    original_content: &str,
    processed: &ProcessedContent,
) -> bool {
    if !processed.parse_ok
        || processed.repaired.is_empty()
        || processed.repaired == original_content
    {
        return false;
    }

    let slot = response
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("message"))
        .and_then(|m| m.get_mut("content"));

    match slot {
        Some(content) => {
            *content = Value::String(processed.repaired.clone());
            true
        }
        None => false,
    }
}

fn json_response_with_request_id(
    value: &Value,
    request_id: &str,
) -> Result<warp::reply::Response, ProxyError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| ProxyError::internal_server_error(&format!("Response encoding failed: {}", e)))?;

    warp::http::Response::builder()
        .status(warp::http::StatusCode::OK)
        .header("content-type", CONTENT_TYPE_JSON)
        .header("access-control-allow-origin", HEADER_ACCESS_CONTROL_ALLOW_ORIGIN)
        .header(HEADER_REQUEST_ID, request_id)
        .body(warp::hyper::Body::from(body))
        .map_err(|_| ProxyError::internal_server_error("Failed to create response"))
}
