// src/handlers/streaming.rs - SSE relay that drives extraction on the side

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::constants::*;
use crate::core::{finish_extraction, JsonExtractor, Preprocessor, ProcessedContent, RootHint};
use crate::handlers::build_artifact;
use crate::metrics::get_global_metrics;
use crate::server::ProxyServer;
use crate::utils::ProxyError;

/// Inspection buffer cap; an SSE line larger than this stops feeding the
/// extractor but never affects passthrough.
const MAX_SSE_LINE_BYTES: usize = 1 << 20;

/// Per-request extraction state ridden along the relay. Owns the
/// preprocessor and extractor exclusively; nothing here is shared across
/// tasks.
pub struct StreamSession {
    pub request_id: String,
    pub model: String,
    root: RootHint,
    schema: Option<Value>,
    preprocessor: Preprocessor,
    extractor: JsonExtractor,
    line_buffer: Vec<u8>,
    raw_content: String,
    done_seen: bool,
    max_json_chars: usize,
}

impl StreamSession {
    pub fn new(
        request_id: String,
        model: String,
        root: RootHint,
        schema: Option<Value>,
        max_json_chars: usize,
    ) -> Self {
        Self {
            request_id,
            model,
            root,
            schema,
            preprocessor: Preprocessor::new(),
            extractor: JsonExtractor::with_root(root, max_json_chars),
            line_buffer: Vec::new(),
            raw_content: String::new(),
            done_seen: false,
            max_json_chars,
        }
    }

    /// Splits raw upstream bytes into lines and inspects the complete
    /// ones. `\n` is ASCII, so a multi-byte character never straddles the
    /// line boundary even when chunks split it mid-sequence.
    pub fn inspect_chunk(&mut self, chunk: &[u8]) {
        self.line_buffer.extend_from_slice(chunk);
        if self.line_buffer.len() > MAX_SSE_LINE_BYTES {
            self.line_buffer.clear();
            return;
        }
        while let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.inspect_line(line.trim_end_matches(|c| c == '\r' || c == '\n'));
        }
    }

    /// `[DONE]` has been observed; the session is ready to finalize.
    pub fn done_seen(&self) -> bool {
        self.done_seen
    }

    fn inspect_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return;
        };
        if data.trim() == SSE_DONE_MESSAGE {
            self.done_seen = true;
            return;
        }
        // Lines that do not parse as JSON are passed through but ignored.
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let delta = event
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());

        if let Some(content) = delta {
            if self.raw_content.len() < get_runtime_config().max_partial_content_size {
                self.raw_content.push_str(content);
            }
            let emitted = self.preprocessor.feed(content);
            self.extractor.feed(&emitted);
        }
    }

    /// Run the finalization pipeline: preprocessor tail into the
    /// extractor, then the global fence decision. When fences were seen
    /// the incremental extractor may have latched onto prose JSON, so the
    /// fence-only stream is rescanned; this keeps the artifact equal to
    /// one-shot processing of the full output.
    fn finish(mut self) -> (ProcessedContent, String, Option<Value>) {
        let tail = self.preprocessor.finalize();
        self.extractor.feed(&tail);

        if self.preprocessor.has_fences() {
            let mut rescan = JsonExtractor::with_root(self.root, self.max_json_chars);
            rescan.feed(self.preprocessor.result());
            self.extractor = rescan;
        }

        let processed = finish_extraction(self.extractor);
        (processed, self.raw_content, self.schema)
    }
}

/// Wrap the relay task around an upstream response and hand the client an
/// SSE response backed by the channel.
pub async fn handle_streaming_response(
    server: Arc<ProxyServer>,
    response: reqwest::Response,
    session: StreamSession,
    cancellation_token: CancellationToken,
    permit: OwnedSemaphorePermit,
) -> Result<warp::reply::Response, ProxyError> {
    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();

    if let Some(metrics) = get_global_metrics() {
        metrics.record_stream_start();
    }

    let request_id = session.request_id.clone();
    let logger = server.logger.clone();
    let start_time = Instant::now();
    let log_id = request_id.clone();

    tokio::spawn(async move {
        relay_upstream(server, response.bytes_stream(), tx, session, cancellation_token).await;
        drop(permit);
        logger.log_timed(LOG_PREFIX_SUCCESS, &format!("stream {} closed", log_id), start_time);
    });

    create_sse_response(rx, &request_id)
}

/// Core relay loop. Every upstream chunk is forwarded downstream before it
/// is inspected, so the happy path adds zero latency and the downstream
/// byte sequence equals the upstream one. Generic over the input stream so
/// the loop can be driven from memory in tests.
pub(crate) async fn relay_upstream<S, E>(
    server: Arc<ProxyServer>,
    mut upstream: S,
    tx: mpsc::UnboundedSender<Result<Bytes, std::io::Error>>,
    session: StreamSession,
    cancellation_token: CancellationToken,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let idle = Duration::from_secs(server.config.stream_idle_timeout_seconds);
    let deadline = Instant::now() + Duration::from_secs(server.config.max_stream_seconds);

    let mut session = Some(session);
    let mut upstream_failed = false;
    let mut client_gone = false;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            upstream_failed = true;
            let _ = tx.send(Ok(Bytes::from(format!(
                "data: {{\"error\": \"{}\"}}\n\n",
                ERROR_STREAM_DEADLINE
            ))));
            break;
        }

        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                client_gone = true;
                break;
            }
            chunk_result = timeout(idle.min(remaining), upstream.next()) => {
                match chunk_result {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk.clone())).is_err() {
                            client_gone = true;
                            break;
                        }
                        let done = match session.as_mut() {
                            Some(live) => {
                                live.inspect_chunk(&chunk);
                                live.done_seen()
                            }
                            None => false,
                        };
                        if done {
                            if let Some(finished) = session.take() {
                                finalize_session(&server, finished, false).await;
                            }
                        }
                    }
                    Ok(Some(Err(e))) => {
                        upstream_failed = true;
                        server.logger.log_error("Upstream stream", &e.to_string());
                        let _ = tx.send(Ok(Bytes::from(format!(
                            "data: {{\"error\": \"Streaming error: {}\"}}\n\n",
                            e
                        ))));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        upstream_failed = true;
                        let _ = tx.send(Ok(Bytes::from(format!(
                            "data: {{\"error\": \"{}\"}}\n\n",
                            ERROR_STREAM_TIMEOUT
                        ))));
                        break;
                    }
                }
            }
        }
    }

    if let Some(metrics) = get_global_metrics() {
        metrics.record_stream_end(upstream_failed);
    }

    match session.take() {
        // Client disconnect discards extraction state without an artifact.
        Some(pending) if client_gone => {
            server.logger.log(&format!(
                "{} stream {} cancelled by client",
                LOG_PREFIX_CANCEL, pending.request_id
            ));
        }
        Some(pending) => finalize_session(&server, pending, upstream_failed).await,
        None => {}
    }
}

async fn finalize_session(server: &Arc<ProxyServer>, session: StreamSession, upstream_failed: bool) {
    let request_id = session.request_id.clone();
    let model = session.model.clone();
    let (processed, raw_content, schema) = session.finish();

    if let Some(metrics) = get_global_metrics() {
        metrics
            .record_repair_outcome(&processed.repairs_applied, processed.parse_ok)
            .await;
    }

    let mut artifact = build_artifact(&request_id, &model, &raw_content, &processed, schema.as_ref());
    if upstream_failed {
        artifact.status = crate::artifacts::ArtifactStatus::Failed;
    }
    server.artifacts.insert(artifact).await;
}

/// SSE response carrying the relay channel and the request id header.
fn create_sse_response(
    rx: mpsc::UnboundedReceiver<Result<Bytes, std::io::Error>>,
    request_id: &str,
) -> Result<warp::reply::Response, ProxyError> {
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

    warp::http::Response::builder()
        .status(warp::http::StatusCode::OK)
        .header("content-type", CONTENT_TYPE_SSE)
        .header("cache-control", HEADER_CACHE_CONTROL)
        .header("connection", HEADER_CONNECTION)
        .header("access-control-allow-origin", HEADER_ACCESS_CONTROL_ALLOW_ORIGIN)
        .header("access-control-allow-methods", HEADER_ACCESS_CONTROL_ALLOW_METHODS)
        .header("access-control-allow-headers", HEADER_ACCESS_CONTROL_ALLOW_HEADERS)
        .header(HEADER_REQUEST_ID, request_id)
        .body(warp::hyper::Body::wrap_stream(stream))
        .map_err(|_| ProxyError::internal_server_error("Failed to create streaming response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Config, ProxyServer};
    use clap::Parser;
    use futures_util::stream;

    fn test_server() -> Arc<ProxyServer> {
        let config = Config::parse_from(["streamfix-proxy"]);
        Arc::new(ProxyServer::new(config).expect("server builds"))
    }

    fn session() -> StreamSession {
        StreamSession::new(
            "req_test00000001".to_string(),
            "test-model".to_string(),
            RootHint::Any,
            None,
            200_000,
        )
    }

    fn sse_delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn test_session_extracts_across_split_lines() {
        let mut s = session();
        let event = sse_delta("{\"a\": 1,");
        let (left, right) = event.split_at(10);
        s.inspect_chunk(left.as_bytes());
        s.inspect_chunk(right.as_bytes());
        s.inspect_chunk(sse_delta(" \"b\": 2}").as_bytes());
        s.inspect_chunk(b"data: [DONE]\n\n");
        assert!(s.done_seen());

        let (processed, _, _) = s.finish();
        assert_eq!(processed.extracted, "{\"a\": 1, \"b\": 2}");
        assert!(processed.parse_ok);
    }

    #[test]
    fn test_session_ignores_non_data_and_malformed_lines() {
        let mut s = session();
        s.inspect_chunk(b": comment line\n");
        s.inspect_chunk(b"event: ping\n");
        s.inspect_chunk(b"data: {not valid json\n");
        s.inspect_chunk(sse_delta("{\"ok\": true}").as_bytes());
        let (processed, _, _) = s.finish();
        assert_eq!(processed.extracted, "{\"ok\": true}");
    }

    #[test]
    fn test_session_prefers_fenced_content() {
        let mut s = session();
        s.inspect_chunk(sse_delta("draft {\"draft\": 1} then ").as_bytes());
        s.inspect_chunk(sse_delta("```json\n{\"final\": 2}\n```").as_bytes());
        let (processed, _, _) = s.finish();
        assert_eq!(processed.extracted, "{\"final\": 2}");
    }

    #[test]
    fn test_session_repairs_truncated_stream() {
        let mut s = session();
        s.inspect_chunk(sse_delta("{\"users\":[{\"id\":1},{\"id\":2").as_bytes());
        let (processed, _, _) = s.finish();
        assert_eq!(processed.repaired, "{\"users\":[{\"id\":1},{\"id\":2}]}");
        assert!(processed.parse_ok);
    }

    #[tokio::test]
    async fn test_relay_passes_bytes_through_unchanged() {
        let server = test_server();
        let chunks = vec![
            Bytes::from(sse_delta("{\"a\":")),
            Bytes::from(sse_delta(" 1}")),
            Bytes::from("data: [DONE]\n\n"),
        ];
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        let upstream = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

        let (tx, mut rx) = mpsc::unbounded_channel();
        relay_upstream(server.clone(), upstream, tx, session(), CancellationToken::new()).await;

        let mut received = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            received.extend_from_slice(&chunk.expect("relay sends data"));
        }
        assert_eq!(received, expected);

        let artifact = server
            .artifacts
            .lookup("req_test00000001")
            .await
            .expect("artifact recorded");
        assert_eq!(artifact.repaired_content, "{\"a\": 1}");
        assert!(artifact.parse_success);
    }

    #[tokio::test]
    async fn test_relay_finalizes_on_upstream_close_without_done() {
        let server = test_server();
        let chunks = vec![Bytes::from(sse_delta("{\"users\":[{\"id\":1},{\"id\":2"))];
        let upstream = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

        let (tx, _rx) = mpsc::unbounded_channel();
        relay_upstream(server.clone(), upstream, tx, session(), CancellationToken::new()).await;

        let artifact = server
            .artifacts
            .lookup("req_test00000001")
            .await
            .expect("artifact recorded");
        assert_eq!(artifact.repaired_content, "{\"users\":[{\"id\":1},{\"id\":2}]}");
    }

    #[tokio::test]
    async fn test_relay_cancellation_discards_state() {
        let server = test_server();
        let upstream = stream::iter(
            vec![Bytes::from(sse_delta("{\"a\": 1}"))]
                .into_iter()
                .map(Ok::<_, std::io::Error>),
        );

        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        relay_upstream(server.clone(), upstream, tx, session(), token).await;

        assert!(server.artifacts.lookup("req_test00000001").await.is_none());
    }

    #[tokio::test]
    async fn test_relay_marks_artifact_failed_on_upstream_error() {
        let server = test_server();
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(sse_delta("{\"a\": 1}"))),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];
        let upstream = stream::iter(items);

        let (tx, _rx) = mpsc::unbounded_channel();
        relay_upstream(server.clone(), upstream, tx, session(), CancellationToken::new()).await;

        let artifact = server
            .artifacts
            .lookup("req_test00000001")
            .await
            .expect("best-effort artifact recorded");
        assert_eq!(artifact.status, crate::artifacts::ArtifactStatus::Failed);
    }
}
