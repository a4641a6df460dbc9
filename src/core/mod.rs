// src/core/mod.rs - Streaming preprocessor, extraction FSM, and repair pipeline

pub mod extract;
pub mod preprocess;
pub mod repair;

pub use extract::{ExtractStatus, JsonExtractor, RepairContext, RootHint};
pub use preprocess::{Preprocessor, TAIL};
pub use repair::{attempt_parse, repair, RepairKind, RepairOutcome};

/// Result of running cleanup, extraction, and repair over a complete piece
/// of model content.
#[derive(Debug, Clone)]
pub struct ProcessedContent {
    /// Whether the extractor ever consumed an opening delimiter.
    pub started: bool,
    pub extracted: String,
    pub status: ExtractStatus,
    pub repaired: String,
    pub repairs_applied: Vec<RepairKind>,
    pub parse_ok: bool,
}

impl ProcessedContent {
    fn unextracted(status: ExtractStatus, started: bool) -> Self {
        Self {
            started,
            extracted: String::new(),
            status,
            repaired: String::new(),
            repairs_applied: Vec::new(),
            parse_ok: false,
        }
    }
}

/// Finalizes an extractor and runs repair over whatever it captured. The
/// repair decisions are driven by the raw machine facts (open containers,
/// string state) rather than the reported status, so a stream upgraded to
/// `Done` at finalization still gets its containers closed.
pub fn finish_extraction(mut extractor: JsonExtractor) -> ProcessedContent {
    extractor.finalize();
    let started = extractor.started();
    let ctx = extractor.repair_context();
    let (extracted, status) = extractor.result();

    if extracted.is_empty() {
        return ProcessedContent::unextracted(status, started);
    }

    let outcome = repair(&extracted, &ctx);
    ProcessedContent {
        started,
        extracted,
        status,
        repaired: outcome.repaired,
        repairs_applied: outcome.applied,
        parse_ok: outcome.parse_ok,
    }
}

/// One-shot pipeline over complete content, used by the non-streaming path
/// and the direct repair endpoint. Equivalent to feeding the same text
/// chunk-by-chunk and finalizing.
pub fn process_content(content: &str, root: RootHint, max_chars: usize) -> ProcessedContent {
    let mut pp = Preprocessor::new();
    pp.feed(content);
    pp.finalize();

    let mut extractor = JsonExtractor::with_root(root, max_chars);
    extractor.feed(pp.result());
    finish_extraction(extractor)
}
