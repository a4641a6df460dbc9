// src/core/repair.rs - Conservative syntactic repair of extracted JSON

use serde_json::Value;

use crate::core::extract::RepairContext;

/// Repair passes that can be applied, in application order. The wire names
/// feed the artifact's `repairs_applied` list and the metrics histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairKind {
    QuoteUnquotedKeys,
    NormalizeSingleQuotes,
    RemoveTrailingComma,
    CloseTruncated,
    EscapeInnerQuotes,
}

impl RepairKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairKind::QuoteUnquotedKeys => "quote_unquoted_keys",
            RepairKind::NormalizeSingleQuotes => "normalize_single_quotes",
            RepairKind::RemoveTrailingComma => "remove_trailing_comma",
            RepairKind::CloseTruncated => "close_truncated",
            RepairKind::EscapeInnerQuotes => "escape_inner_quotes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub repaired: String,
    pub applied: Vec<RepairKind>,
    pub parse_ok: bool,
}

pub fn attempt_parse(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| e.to_string())
}

fn parses(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

/// Applies the ordered repair passes to an extracted (possibly truncated)
/// JSON string. Already-valid input is returned byte-identical with no
/// repairs recorded. Each pass returns `(output, applied)` and the driver
/// composes them; no pass may panic on any input. If nothing applied and
/// the text still fails to parse, the input comes back unchanged; if
/// passes applied but the result still fails, the best-effort candidate is
/// returned with `parse_ok = false`.
pub fn repair(extracted: &str, ctx: &RepairContext) -> RepairOutcome {
    if extracted.is_empty() {
        return RepairOutcome {
            repaired: String::new(),
            applied: Vec::new(),
            parse_ok: false,
        };
    }

    if parses(extracted) {
        return RepairOutcome {
            repaired: extracted.to_string(),
            applied: Vec::new(),
            parse_ok: true,
        };
    }

    let mut current = extracted.to_string();
    let mut applied = Vec::new();

    let (next, changed) = quote_unquoted_keys(&current);
    if changed {
        current = next;
        applied.push(RepairKind::QuoteUnquotedKeys);
    }

    if !parses(&current) {
        let (next, changed) = normalize_single_quotes(&current);
        if changed {
            current = next;
            applied.push(RepairKind::NormalizeSingleQuotes);
        }
    }

    let (next, changed) = remove_trailing_commas(&current);
    if changed {
        current = next;
        applied.push(RepairKind::RemoveTrailingComma);
    }

    if ctx.needs_closing {
        let (next, changed) = close_truncated(&current, ctx.ended_in_string);
        if changed {
            current = next;
            applied.push(RepairKind::CloseTruncated);
        }
    }

    if !parses(&current) {
        let (candidate, changed) = escape_inner_quotes(&current);
        // Kept only when it strictly improves parse success.
        if changed && parses(&candidate) {
            current = candidate;
            applied.push(RepairKind::EscapeInnerQuotes);
        }
    }

    let parse_ok = parses(&current);
    if !parse_ok && applied.is_empty() {
        return RepairOutcome {
            repaired: extracted.to_string(),
            applied,
            parse_ok: false,
        };
    }

    RepairOutcome {
        repaired: current,
        applied,
        parse_ok,
    }
}

/// Quotes identifier-shaped object keys: an `[A-Za-z_][A-Za-z0-9_]*` run
/// that follows `{` or `,` (through whitespace) and precedes `:`.
fn quote_unquoted_keys(text: &str) -> (String, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut changed = false;
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '{' | ',' => {
                out.push(c);
                i += 1;

                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j].is_ascii_alphabetic() || chars[j] == '_') {
                    let ident_start = j;
                    let mut k = j + 1;
                    while k < chars.len() && (chars[k].is_ascii_alphanumeric() || chars[k] == '_')
                    {
                        k += 1;
                    }
                    let mut m = k;
                    while m < chars.len() && chars[m].is_whitespace() {
                        m += 1;
                    }
                    if m < chars.len() && chars[m] == ':' {
                        out.extend(&chars[i..ident_start]);
                        out.push('"');
                        out.extend(&chars[ident_start..k]);
                        out.push('"');
                        changed = true;
                        i = k;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, changed)
}

/// Converts single-quoted strings to double-quoted ones, escaping any
/// embedded double quotes. Only invoked when the candidate does not
/// already parse, so valid JSON containing apostrophes is never touched.
fn normalize_single_quotes(text: &str) -> (String, bool) {
    if !text.contains('\'') {
        return (text.to_string(), false);
    }

    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut in_double = false;
    let mut in_single = false;
    let mut escape = false;

    for c in text.chars() {
        if in_double {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }

        if in_single {
            if escape {
                // `\'` needs no escape once the delimiters are double quotes.
                if c == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(c);
                }
                escape = false;
                continue;
            }
            match c {
                '\\' => escape = true,
                '\'' => {
                    out.push('"');
                    in_single = false;
                }
                '"' => {
                    out.push('\\');
                    out.push('"');
                }
                _ => out.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                in_single = true;
                out.push('"');
                changed = true;
            }
            _ => out.push(c),
        }
    }

    (out, changed)
}

/// Removes commas that directly precede `}` or `]`, optionally through
/// whitespace, outside string literals.
fn remove_trailing_commas(text: &str) -> (String, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                // Drop the comma and the run of whitespace before the closer.
                changed = true;
                i = j;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    (out, changed)
}

/// Completes a truncated buffer: closes a dangling string, finishes a
/// dangling `true`/`false`/`null` literal prefix, or drops an incomplete
/// `"key": <partial>` tail, then closes every still-open container in LIFO
/// order.
fn close_truncated(text: &str, ended_in_string: bool) -> (String, bool) {
    let mut out = text.to_string();
    let mut changed = false;

    if ended_in_string {
        out.push('"');
        changed = true;
    } else if let Some(completion) = dangling_literal_completion(&out) {
        out.push_str(completion);
        changed = true;
    } else if let Some(start) = dangling_pair_start(&out) {
        out.truncate(start);
        changed = true;
    }

    // A comma left dangling at the cut would sit directly before the
    // appended closer.
    if !out.ends_with('"') || !ended_in_string {
        let trimmed_len = out.trim_end().len();
        if out[..trimmed_len].ends_with(',') {
            out.truncate(trimmed_len - 1);
            changed = true;
        }
    }

    // Rescan with string-state tracking and close whatever remains open.
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for c in out.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    for closer in stack.into_iter().rev() {
        out.push(closer);
        changed = true;
    }

    (out, changed)
}

/// `tru` -> `true`, `fals` -> `false`, `nul` -> `null`, longest prefix
/// first, with a word boundary before the fragment.
fn dangling_literal_completion(text: &str) -> Option<&'static str> {
    for (fragment, completion) in [("fals", "e"), ("tru", "e"), ("nul", "l")] {
        if text.ends_with(fragment) {
            let before = text[..text.len() - fragment.len()].chars().next_back();
            let boundary = match before {
                Some(c) => !(c.is_ascii_alphanumeric() || c == '_'),
                None => true,
            };
            if boundary {
                return Some(completion);
            }
        }
    }
    None
}

/// Byte offset of the opening key quote in a trailing `"key": <partial>`
/// fragment, where `<partial>` is a bare alphabetic run at end-of-buffer.
fn dangling_pair_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = bytes.len();

    let value_end = i;
    while i > 0 && bytes[i - 1].is_ascii_alphabetic() {
        i -= 1;
    }
    if i == value_end {
        return None;
    }
    while i > 0 && (bytes[i - 1] as char).is_whitespace() {
        i -= 1;
    }
    if i == 0 || bytes[i - 1] != b':' {
        return None;
    }
    i -= 1;
    if i == 0 || bytes[i - 1] != b'"' {
        return None;
    }
    i -= 1;
    let key_end = i;
    while i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_') {
        i -= 1;
    }
    if i == key_end || i == 0 || bytes[i - 1] != b'"' {
        return None;
    }
    Some(i - 1)
}

/// Best-effort local fix for values of the shape `"key": "he said "hi""`:
/// a double quote inside a value string is escaped when the next
/// non-whitespace character does not end the value. The caller reverts the
/// pass unless it makes the candidate parse.
fn escape_inner_quotes(text: &str) -> (String, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut changed = false;
    let mut stack: Vec<char> = Vec::new();
    let mut in_value_string = false;
    let mut in_key_string = false;
    let mut after_colon = false;
    let mut escape = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_value_string {
            if escape {
                out.push(c);
                escape = false;
            } else if c == '\\' {
                out.push(c);
                escape = true;
            } else if c == '"' {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let closes = j >= chars.len() || matches!(chars[j], ',' | '}' | ']');
                if closes {
                    in_value_string = false;
                    out.push('"');
                } else {
                    out.push('\\');
                    out.push('"');
                    changed = true;
                }
            } else {
                out.push(c);
            }
            i += 1;
            continue;
        }

        if in_key_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_key_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                // A string after a colon or inside an array is a value;
                // otherwise it is an object key.
                if after_colon || stack.last() == Some(&'[') {
                    in_value_string = true;
                } else {
                    in_key_string = true;
                }
                after_colon = false;
                out.push(c);
            }
            ':' => {
                after_colon = true;
                out.push(c);
            }
            '{' | '[' => {
                stack.push(c);
                after_colon = false;
                out.push(c);
            }
            '}' | ']' => {
                stack.pop();
                after_colon = false;
                out.push(c);
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                // A bare literal or number consumed the pending value.
                after_colon = false;
                out.push(c);
            }
        }
        i += 1;
    }

    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_complete() -> RepairContext {
        RepairContext {
            needs_closing: false,
            ended_in_string: false,
        }
    }

    fn ctx_truncated(in_string: bool) -> RepairContext {
        RepairContext {
            needs_closing: true,
            ended_in_string: in_string,
        }
    }

    #[test]
    fn test_valid_json_returned_unchanged() {
        let inputs = [
            "{\"name\": \"John\", \"age\": 30}",
            "[1, 2, 3]",
            "{\"nested\": {\"a\": [true, false, null]}}",
            "{\"apostrophe\": \"it's fine\"}",
        ];
        for input in inputs {
            let outcome = repair(input, &ctx_complete());
            assert_eq!(outcome.repaired, input);
            assert!(outcome.applied.is_empty());
            assert!(outcome.parse_ok);
        }
    }

    #[test]
    fn test_trailing_commas_removed() {
        let outcome = repair("{\"items\":[1,2,3,],}", &ctx_complete());
        assert_eq!(outcome.repaired, "{\"items\":[1,2,3]}");
        assert_eq!(outcome.applied, vec![RepairKind::RemoveTrailingComma]);
        assert!(outcome.parse_ok);
    }

    #[test]
    fn test_unquoted_keys_quoted() {
        let outcome = repair("{name: \"John\", age: 30}", &ctx_complete());
        assert_eq!(outcome.repaired, "{\"name\": \"John\", \"age\": 30}");
        assert!(outcome.applied.contains(&RepairKind::QuoteUnquotedKeys));
        assert!(outcome.parse_ok);
    }

    #[test]
    fn test_single_quotes_normalized() {
        let outcome = repair("{'name': 'John', 'age': 30}", &ctx_complete());
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["name"], "John");
        assert_eq!(value["age"], 30);
    }

    #[test]
    fn test_single_quotes_with_embedded_double_quote() {
        let outcome = repair("{'text': 'he said \"hi\"'}", &ctx_complete());
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["text"], "he said \"hi\"");
    }

    #[test]
    fn test_mixed_issues() {
        let outcome = repair(
            "{name: \"John\", age: 30, \"hobbies\": [\"reading\", \"coding\",],}",
            &ctx_complete(),
        );
        assert!(outcome.parse_ok);
        assert!(outcome.applied.contains(&RepairKind::QuoteUnquotedKeys));
        assert!(outcome.applied.contains(&RepairKind::RemoveTrailingComma));
    }

    #[test]
    fn test_truncated_containers_closed() {
        let outcome = repair("{\"users\":[{\"id\":1},{\"id\":2", &ctx_truncated(false));
        assert_eq!(outcome.repaired, "{\"users\":[{\"id\":1},{\"id\":2}]}");
        assert!(outcome.parse_ok);
    }

    #[test]
    fn test_truncated_string_closed_before_containers() {
        let outcome = repair(
            "{\"message\": \"unterminated string without quote",
            &ctx_truncated(true),
        );
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["message"], "unterminated string without quote");
    }

    #[test]
    fn test_truncated_inside_string_not_blindly_closed() {
        // Closing only the containers without the string quote would be
        // parseable garbage; the string must be terminated first.
        let outcome = repair("{\"a\": \"partial", &ctx_truncated(true));
        assert!(outcome.repaired.ends_with("\"}"));
        assert!(outcome.parse_ok);
    }

    #[test]
    fn test_truncated_after_comma_closes_cleanly() {
        let outcome = repair("{\"a\": 1, ", &ctx_truncated(false));
        assert!(outcome.parse_ok);
        assert_eq!(outcome.repaired, "{\"a\": 1}");
    }

    #[test]
    fn test_dangling_true_completed() {
        let outcome = repair("{\"active\": tru", &ctx_truncated(false));
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["active"], true);
    }

    #[test]
    fn test_dangling_false_completed() {
        let outcome = repair("{\"active\": fals", &ctx_truncated(false));
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["active"], false);
    }

    #[test]
    fn test_dangling_null_completed() {
        let outcome = repair("{\"value\": nul", &ctx_truncated(false));
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert!(value["value"].is_null());
    }

    #[test]
    fn test_dangling_partial_value_dropped() {
        let outcome = repair("{\"a\": 1, \"status\": pend", &ctx_truncated(false));
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["a"], 1);
        assert!(value.get("status").is_none());
    }

    #[test]
    fn test_unescaped_inner_quotes_fixed() {
        let outcome = repair(
            "{\"message\": \"He said \"Hello\" to me\"}",
            &ctx_complete(),
        );
        assert!(outcome.parse_ok);
        assert!(outcome.applied.contains(&RepairKind::EscapeInnerQuotes));
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["message"], "He said \"Hello\" to me");
    }

    #[test]
    fn test_unescaped_inner_quotes_with_sibling_key() {
        let outcome = repair(
            "{\"message\": \"He said \"Hello world\" to everyone\", \"status\": \"ok\"}",
            &ctx_complete(),
        );
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn test_unparseable_input_without_applicable_pass_unchanged() {
        let input = "{\"a\" 1 2 3 zzz}";
        let outcome = repair(input, &ctx_complete());
        assert_eq!(outcome.repaired, input);
        assert!(!outcome.parse_ok);
    }

    #[test]
    fn test_repair_idempotent_on_own_output() {
        let first = repair("{\"items\":[1,2,3,],}", &ctx_complete());
        assert!(first.parse_ok);
        let second = repair(&first.repaired, &ctx_complete());
        assert_eq!(second.repaired, first.repaired);
        assert!(second.applied.is_empty());
    }

    #[test]
    fn test_complex_nested_with_multiple_issues() {
        let input = "{\n  \"response\": {\n    \"data\": [\n      {\"id\": 1, \"name\": \"Product A\", \"price\": 29.99,},\n      {\"id\": 2, name: \"Product B\", \"price\": 39.99}\n    ],\n    \"meta\": {\n      \"total\": 2,\n      \"page\": 1,\n    }\n  },\n}";
        let outcome = repair(input, &ctx_complete());
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["response"]["data"][1]["name"], "Product B");
        assert_eq!(value["response"]["meta"]["total"], 2);
    }

    #[test]
    fn test_structural_chars_inside_strings_untouched() {
        let input = "{\"text\": \"a, } and ] stay\", }";
        let outcome = repair(input, &ctx_complete());
        assert!(outcome.parse_ok);
        let value: serde_json::Value = serde_json::from_str(&outcome.repaired).unwrap();
        assert_eq!(value["text"], "a, } and ] stay");
    }
}
