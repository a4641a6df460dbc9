// src/core/extract.rs - Byte-driven recognizer for the first balanced JSON root in a noisy stream

/// Restricts which root delimiter the extractor will lock onto. Clients can
/// supply the hint through `metadata.streamfix.json_root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootHint {
    Object,
    Array,
    #[default]
    Any,
}

impl RootHint {
    fn accepts(self, c: char) -> bool {
        match self {
            RootHint::Object => c == '{',
            RootHint::Array => c == '[',
            RootHint::Any => c == '{' || c == '[',
        }
    }
}

/// Terminal verdict reported by [`JsonExtractor::result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStatus {
    Done,
    Truncated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SeekStart,
    InJson,
    Done,
    Failed,
}

/// Terminal facts the repair pass needs about how extraction ended. Derived
/// from the raw machine state, not from the reported status: a stream that
/// ends cleanly outside a string literal is reported `Done`, but its open
/// containers still need closing.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext {
    pub needs_closing: bool,
    pub ended_in_string: bool,
}

/// Resumable state machine that captures the first balanced JSON object or
/// array from a character stream, tolerating arbitrary bytes before the
/// opening delimiter. String literals are tracked so structural characters
/// inside them never affect depth, and `Done`/`Failed` are absorbing.
#[derive(Debug)]
pub struct JsonExtractor {
    phase: Phase,
    depth: usize,
    in_string: bool,
    escape: bool,
    started_with: Option<char>,
    buf: String,
    max_chars: usize,
    completable: bool,
    root: RootHint,
}

impl JsonExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self::with_root(RootHint::Any, max_chars)
    }

    pub fn with_root(root: RootHint, max_chars: usize) -> Self {
        Self {
            phase: Phase::SeekStart,
            depth: 0,
            in_string: false,
            escape: false,
            started_with: None,
            buf: String::new(),
            max_chars,
            completable: false,
            root,
        }
    }

    pub fn feed(&mut self, text: &str) {
        for c in text.chars() {
            match self.phase {
                Phase::Done | Phase::Failed => return,
                Phase::SeekStart => {
                    if self.root.accepts(c) {
                        self.phase = Phase::InJson;
                        self.started_with = Some(c);
                        self.depth = 1;
                        self.buf.push(c);
                    }
                }
                Phase::InJson => {
                    self.buf.push(c);

                    if self.in_string {
                        if self.escape {
                            self.escape = false;
                        } else if c == '\\' {
                            self.escape = true;
                        } else if c == '"' {
                            self.in_string = false;
                        }
                    } else if c == '"' {
                        self.in_string = true;
                    } else if c == '{' || c == '[' {
                        self.depth += 1;
                    } else if c == '}' || c == ']' {
                        self.depth -= 1;
                        if self.depth == 0 {
                            self.phase = Phase::Done;
                            continue;
                        }
                    }

                    if self.buf.len() >= self.max_chars {
                        self.phase = Phase::Failed;
                    }
                }
            }
        }
    }

    /// Marks the stream as ended by the caller. Enables the upgrade of a
    /// still-open root to `Done` when the stream stopped outside a string
    /// literal, which lets downstream repair close the remaining containers
    /// with confidence.
    pub fn finalize(&mut self) {
        if self.phase == Phase::InJson && !self.in_string && !self.buf.is_empty() {
            self.completable = true;
        }
    }

    /// `(captured_text, status)`. `Failed` always carries an empty string.
    pub fn result(&self) -> (String, ExtractStatus) {
        match self.phase {
            Phase::Done => (self.buf.clone(), ExtractStatus::Done),
            Phase::InJson => {
                if self.completable && !self.in_string && !self.buf.is_empty() {
                    (self.buf.clone(), ExtractStatus::Done)
                } else {
                    (self.buf.clone(), ExtractStatus::Truncated)
                }
            }
            Phase::SeekStart | Phase::Failed => (String::new(), ExtractStatus::Failed),
        }
    }

    pub fn repair_context(&self) -> RepairContext {
        RepairContext {
            needs_closing: self.phase == Phase::InJson && self.depth > 0,
            ended_in_string: self.in_string,
        }
    }

    /// Whether an opening delimiter was ever consumed. Distinguishes a
    /// stream that simply contained no JSON from one that overflowed.
    pub fn started(&self) -> bool {
        self.started_with.is_some()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}
