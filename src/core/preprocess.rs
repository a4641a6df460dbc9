// src/core/preprocess.rs - Chunk-safe cleanup of model output ahead of JSON extraction

/// Reasoning region markers emitted by DeepSeek-style models.
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Code fence marker, optionally followed by a language tag line.
const FENCE: &str = "```";

/// Longest recognized marker length minus one. A marker that straddles a
/// chunk boundary always fits inside a carry of this many characters, so
/// deferring the trailing TAIL characters of every chunk guarantees no
/// marker is ever split.
pub const TAIL: usize = THINK_CLOSE.len() - 1;

/// Streaming-safe preprocessor that removes `<think>`..`</think>` regions
/// and tracks fenced code block content in a parallel stream.
///
/// Two candidate outputs are accumulated while feeding: `all_content`
/// (everything outside reasoning regions, fence markers and language tag
/// lines stripped) and `fence_only` (just the fenced block bodies,
/// concatenated). The choice between them is global and deferred until
/// [`Preprocessor::result`]: if any fence was observed the fenced content
/// wins, otherwise the full cleaned text is used.
#[derive(Debug, Default)]
pub struct Preprocessor {
    in_think: bool,
    fence_open: bool,
    fence_lang_captured: bool,
    has_fences: bool,
    carry: String,
    fence_only: String,
    all_content: String,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of raw model output. Returns the characters emitted
    /// to the all-content stream by this call, for callers that forward
    /// cleaned text incrementally. No scan starts within the trailing
    /// `TAIL` characters, so every position is decided with any marker
    /// from it fully visible; what is not consumed stays in the carry.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(chunk);

        // A buffer of TAIL characters or fewer is carried whole.
        let boundary = match buf.char_indices().rev().nth(TAIL - 1) {
            Some((idx, _)) => idx,
            None => {
                self.carry = buf;
                return String::new();
            }
        };

        let (emitted, consumed) = self.scan(&buf, boundary);
        self.carry = buf[consumed..].to_string();
        emitted
    }

    /// Scan whatever remains in the carry with the same rules and return
    /// the emitted tail. The carry is empty afterwards.
    pub fn finalize(&mut self) -> String {
        let buf = std::mem::take(&mut self.carry);
        let (emitted, _) = self.scan(&buf, buf.len());
        emitted
    }

    /// Final cleaned text after `finalize`: the concatenated fenced content
    /// when any fence was seen, the full cleaned stream otherwise.
    pub fn result(&self) -> &str {
        if self.has_fences {
            &self.fence_only
        } else {
            &self.all_content
        }
    }

    pub fn has_fences(&self) -> bool {
        self.has_fences
    }

    /// Scan `buf` starting new positions only below `boundary`; a marker
    /// match may consume past it. Returns the emitted characters and the
    /// byte offset consumed.
    fn scan(&mut self, buf: &str, boundary: usize) -> (String, usize) {
        let mut out = String::with_capacity(boundary);
        let mut i = 0;

        while i < boundary {
            let rest = &buf[i..];

            if rest.starts_with(THINK_OPEN) {
                self.in_think = true;
                i += THINK_OPEN.len();
                continue;
            }

            if self.in_think && rest.starts_with(THINK_CLOSE) {
                self.in_think = false;
                i += THINK_CLOSE.len();
                continue;
            }

            if rest.starts_with(FENCE) {
                self.has_fences = true;
                self.fence_open = !self.fence_open;
                self.fence_lang_captured = false;
                i += FENCE.len();
                continue;
            }

            let c = match rest.chars().next() {
                Some(c) => c,
                None => break,
            };
            i += c.len_utf8();

            if self.in_think {
                continue;
            }

            // The fence's language tag line is swallowed up to the first
            // newline.
            if self.fence_open && !self.fence_lang_captured {
                if c == '\n' {
                    self.fence_lang_captured = true;
                }
                continue;
            }

            if self.fence_open {
                self.fence_only.push(c);
            }
            self.all_content.push(c);
            out.push(c);
        }

        (out, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_single(text: &str) -> String {
        let mut pp = Preprocessor::new();
        pp.feed(text);
        pp.finalize();
        pp.result().to_string()
    }

    fn run_chunked(chunks: &[&str]) -> String {
        let mut pp = Preprocessor::new();
        for chunk in chunks {
            pp.feed(chunk);
        }
        pp.finalize();
        pp.result().to_string()
    }

    fn chunk_text(text: &str, size: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }

    #[test]
    fn test_fenced_json_extraction() {
        let input = "```json\n{\"name\": \"John\", \"age\": 30}\n```";
        assert_eq!(run_single(input).trim(), "{\"name\": \"John\", \"age\": 30}");
    }

    #[test]
    fn test_think_block_removal() {
        let input = "<think>reasoning</think>{\"result\": \"success\"}";
        assert_eq!(run_single(input), "{\"result\": \"success\"}");
    }

    #[test]
    fn test_prose_kept_without_fences() {
        let input = "Here is the answer: {\"ok\": true}";
        assert_eq!(run_single(input), "Here is the answer: {\"ok\": true}");
    }

    #[test]
    fn test_fence_language_line_swallowed() {
        let input = "```javascript\n{\"x\": 1}\n```";
        assert_eq!(run_single(input).trim(), "{\"x\": 1}");
    }

    #[test]
    fn test_multiple_fences_concatenated() {
        let input = "before ```json\n{\"a\":1}\n``` middle ```json\n{\"b\":2}\n``` after";
        let result = run_single(input);
        assert!(result.contains("{\"a\":1}"));
        assert!(result.contains("{\"b\":2}"));
        assert!(!result.contains("before"));
        assert!(!result.contains("middle"));
    }

    #[test]
    fn test_think_close_split_across_chunks() {
        let text = "<think>\nsome reasoning\n</think>\n{\"boundary\": \"ok\"}";
        let split = text.find("</thi").unwrap() + 5;
        let chunked = run_chunked(&[&text[..split], &text[split..]]);
        assert_eq!(chunked, run_single(text));
        assert!(!chunked.contains("<think>"));
        assert!(chunked.contains("{\"boundary\": \"ok\"}"));
    }

    #[test]
    fn test_fence_marker_split_across_chunks() {
        let text = "```json\n{\"x\": 1}\n```";
        for split in 1..text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let chunked = run_chunked(&[&text[..split], &text[split..]]);
            assert_eq!(chunked, run_single(text), "split at {}", split);
        }
    }

    #[test]
    fn test_chunking_equivalence_exhaustive() {
        let text = "prose <think>internal\nstate</think> more ```json\n{\"k\": \"v\", \"n\": [1, 2]}\n``` trailing";
        let expected = run_single(text);
        for size in 1..=text.chars().count() {
            let chunks = chunk_text(text, size);
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            assert_eq!(run_chunked(&refs), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_carry_stays_bounded() {
        let mut pp = Preprocessor::new();
        for chunk in ["abc", "defghij", "<thi", "nk>x</think>", "{\"a\": 1}"] {
            pp.feed(chunk);
            assert!(pp.carry.chars().count() <= TAIL);
        }
    }

    #[test]
    fn test_multibyte_content_survives_chunking() {
        let text = "```json\n{\"name\": \"héllo wörld ✓\"}\n```";
        let expected = run_single(text);
        for size in 1..=6 {
            let chunks = chunk_text(text, size);
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            assert_eq!(run_chunked(&refs), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_multiple_think_blocks() {
        let input = "<think>one</think>a<think>two</think>{\"analysis\": \"complete\"}";
        let result = run_single(input);
        assert!(!result.contains("one"));
        assert!(!result.contains("two"));
        assert!(result.contains("{\"analysis\": \"complete\"}"));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(run_single(""), "");
        assert_eq!(run_chunked(&["", "", ""]), "");
    }
}
