// Main handlers module - organizes submodules and provides public API

pub mod chat;
pub mod results;
pub mod streaming;

pub use chat::handle_chat_completions;
pub use results::{handle_health, handle_metrics, handle_result, handle_root, handle_test};
pub use streaming::{handle_streaming_response, StreamSession};

use serde_json::Value;

use crate::artifacts::{Artifact, ArtifactStatus};
use crate::core::ProcessedContent;
use crate::schema;

/// Assemble the side-channel artifact from a finalized extraction. When
/// nothing was extracted, the raw model content is kept in
/// `original_content` so the side channel still shows what the model said.
pub(crate) fn build_artifact(
    request_id: &str,
    model: &str,
    raw_content: &str,
    processed: &ProcessedContent,
    schema_value: Option<&Value>,
) -> Artifact {
    let (original, repaired) = if processed.extracted.is_empty() {
        (raw_content.to_string(), String::new())
    } else {
        (processed.extracted.clone(), processed.repaired.clone())
    };

    let mut status = if processed.extracted.is_empty() {
        // A stream that never opened a root was non-JSON by intent; one
        // that opened and overflowed is a real failure.
        if processed.started {
            ArtifactStatus::Failed
        } else {
            ArtifactStatus::Passthrough
        }
    } else if !processed.parse_ok {
        ArtifactStatus::Failed
    } else if processed.repairs_applied.is_empty() {
        ArtifactStatus::Passthrough
    } else {
        ArtifactStatus::Repaired
    };

    let mut schema_valid = None;
    let mut schema_errors = None;
    if processed.parse_ok {
        if let Some(schema_value) = schema_value {
            if let Ok(parsed) = crate::core::attempt_parse(&repaired) {
                // The schema was compile-checked at request entry.
                if let Ok((valid, errors)) = schema::validate(schema_value, &parsed) {
                    schema_valid = Some(valid);
                    if !valid {
                        status = ArtifactStatus::SchemaInvalid;
                        schema_errors = Some(errors);
                    }
                }
            }
        }
    }

    Artifact {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        model: model.to_string(),
        original_content: original,
        repaired_content: repaired,
        repairs_applied: processed
            .repairs_applied
            .iter()
            .map(|r| r.as_str().to_string())
            .collect(),
        parse_success: processed.parse_ok,
        schema_valid,
        schema_errors,
        status,
    }
}
