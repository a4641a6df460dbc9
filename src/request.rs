// src/request.rs - Typed OpenAI-compatible request model with StreamFix extensions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::RootHint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String or content-part array; both forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// StreamFix configuration tucked inside the request's `metadata` field so
/// standard OpenAI clients never see an unknown top-level key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFixOptions {
    pub json_root: RootHint,
    pub rule_pack_key: Option<String>,
}

/// OpenAI-compatible chat completions request. Known fields are typed; the
/// flattened extras map keeps unrecognized fields intact for forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// StreamFix extension: JSON-Schema the repaired output is checked
    /// against. Never forwarded upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Extract `metadata.streamfix` hints, tolerating any malformed shape.
    pub fn streamfix(&self) -> StreamFixOptions {
        let nested = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("streamfix"))
            .and_then(|v| v.as_object());

        let Some(options) = nested else {
            return StreamFixOptions::default();
        };

        let json_root = match options.get("json_root").and_then(|v| v.as_str()) {
            Some("object") => RootHint::Object,
            Some("array") => RootHint::Array,
            _ => RootHint::Any,
        };

        let rule_pack_key = options
            .get("rule_pack_key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        StreamFixOptions {
            json_root,
            rule_pack_key,
        }
    }

    /// Request body forwarded upstream: the StreamFix extension fields are
    /// stripped, everything else passes through unchanged.
    pub fn upstream_body(&self, model: &str) -> Value {
        let mut body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.remove("schema");
        body.remove("metadata");
        body.insert("model".to_string(), Value::String(model.to_string()));
        Value::Object(body)
    }
}
