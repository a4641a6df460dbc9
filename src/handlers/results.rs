// src/handlers/results.rs - Side-channel, repair-test, and status endpoints

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use warp::Reply;

use crate::constants::*;
use crate::core::{attempt_parse, process_content, repair, RepairContext, RootHint};
use crate::metrics::get_global_metrics;
use crate::server::ProxyServer;
use crate::utils::ProxyError;

/// Helper function to convert JSON to Response
pub fn json_response(value: &Value) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(value), warp::http::StatusCode::OK).into_response()
}

/// GET /result/{id} - fetch the artifact recorded for a request.
pub async fn handle_result(
    server: Arc<ProxyServer>,
    request_id: &str,
) -> Result<warp::reply::Response, ProxyError> {
    match server.artifacts.lookup(request_id).await {
        Some(artifact) => {
            let value = serde_json::to_value(&artifact).map_err(|e| {
                ProxyError::internal_server_error(&format!("Artifact encoding failed: {}", e))
            })?;
            Ok(json_response(&value))
        }
        None => Err(ProxyError::not_found("Request ID not found")),
    }
}

#[derive(Debug, Deserialize)]
struct RepairRequest {
    broken_json: String,
}

#[derive(Debug, Serialize)]
struct RepairTestResult {
    success: bool,
    original: String,
    repaired: String,
    valid_json: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /test - run the extraction and repair pipeline synchronously over
/// a caller-supplied string, no upstream involved.
pub async fn handle_test(
    server: Arc<ProxyServer>,
    body: Value,
) -> Result<warp::reply::Response, ProxyError> {
    let request: RepairRequest = serde_json::from_value(body)
        .map_err(|_| ProxyError::bad_request("Missing 'broken_json' field"))?;
    let broken = request.broken_json;

    if attempt_parse(&broken).is_ok() {
        let result = RepairTestResult {
            success: true,
            original: broken.clone(),
            repaired: broken,
            valid_json: true,
            error: Some("Input JSON was already valid".to_string()),
        };
        return encode(&result);
    }

    let processed = process_content(&broken, RootHint::Any, server.config.max_json_chars);

    let repaired = if !processed.extracted.is_empty() {
        processed.repaired
    } else {
        // Nothing extractable; run the repair passes over the raw text.
        let ctx = RepairContext {
            needs_closing: false,
            ended_in_string: false,
        };
        repair(&broken, &ctx).repaired
    };

    let result = match attempt_parse(&repaired) {
        Ok(_) => RepairTestResult {
            success: true,
            original: broken,
            repaired,
            valid_json: true,
            error: None,
        },
        Err(e) => RepairTestResult {
            success: false,
            original: broken,
            repaired,
            valid_json: false,
            error: Some(format!("Repair failed: {}", e)),
        },
    };
    encode(&result)
}

fn encode(result: &RepairTestResult) -> Result<warp::reply::Response, ProxyError> {
    let value = serde_json::to_value(result)
        .map_err(|e| ProxyError::internal_server_error(&format!("Encoding failed: {}", e)))?;
    Ok(json_response(&value))
}

/// GET /metrics - cumulative counters plus windowed artifact aggregates.
pub async fn handle_metrics(server: Arc<ProxyServer>) -> Result<warp::reply::Response, ProxyError> {
    let store_stats = server.artifacts.stats().await;
    let value = match get_global_metrics() {
        Some(metrics) => metrics.snapshot(&store_stats).await,
        None => json!({
            "total_requests": store_stats.total,
            "repair_types": store_stats.repair_types,
        }),
    };
    Ok(json_response(&value))
}

/// GET /health - liveness.
pub async fn handle_health() -> Result<warp::reply::Response, ProxyError> {
    Ok(json_response(&json!({
        "status": "healthy",
        "version": crate::VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// GET / - service banner with the endpoint map.
pub async fn handle_root() -> Result<warp::reply::Response, ProxyError> {
    Ok(json_response(&json!({
        "name": "StreamFix Proxy",
        "version": crate::VERSION,
        "description": "Real-time JSON repair proxy for AI streaming APIs",
        "endpoints": {
            "chat": "/v1/chat/completions",
            "result": "/result/{id}",
            "test": "/test",
            "health": "/health",
            "metrics": "/metrics"
        }
    })))
}
