//! Token extraction: given raw response bytes, produce
//! `(input_tokens, output_tokens, cache_n, prompt_n)` using the
//! SSE-frame → whole-body-JSON → greedy-subobject-scan precedence from the
//! specification's Request Router section.

use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_n: i64,
    pub prompt_n: i64,
}

impl TokenCounts {
    fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cache_n == 0 && self.prompt_n == 0
    }
}

fn extract_from_object(value: &Value) -> Option<TokenCounts> {
    let usage = value.get("usage");
    let timings = value.get("timings");
    if usage.is_none() && timings.is_none() {
        return None;
    }

    let get_i64 = |obj: Option<&Value>, field: &str| -> i64 {
        obj.and_then(|o| o.get(field)).and_then(|v| v.as_i64()).unwrap_or(0)
    };

    Some(TokenCounts {
        input_tokens: get_i64(usage, "prompt_tokens"),
        output_tokens: get_i64(usage, "completion_tokens"),
        cache_n: get_i64(timings, "cache_n"),
        prompt_n: get_i64(timings, "prompt_n"),
    })
}

/// Phase 1: split on newlines, iterate **in reverse** over `data: ` lines,
/// skipping empty payloads and `[DONE]`. Returns the first frame whose
/// parsed object yields any non-zero value.
fn extract_from_sse(body: &str) -> Option<TokenCounts> {
    for line in body.lines().rev() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else { continue };
        if let Some(counts) = extract_from_object(&value) {
            if !counts.is_zero() {
                return Some(counts);
            }
        }
    }
    None
}

/// Phase 3: extract all balanced `{...}` substrings (greedy, brace-depth
/// tracked, string-aware so braces inside string literals don't confuse the
/// scan) and try each in order, returning the first hit.
fn extract_from_subobjects(body: &str) -> Option<TokenCounts> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(bytes, i) {
                let candidate = &body[i..=end];
                if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                    if let Some(counts) = extract_from_object(&value) {
                        if !counts.is_zero() {
                            return Some(counts);
                        }
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Full precedence: SSE frames, then whole-body JSON, then the greedy
/// subobject scan. Returns all-zero counts if nothing yields a non-zero
/// value, in which case the caller suppresses the ledger write.
pub fn extract(body: &[u8]) -> TokenCounts {
    let Ok(text) = std::str::from_utf8(body) else { return TokenCounts::default() };

    if let Some(counts) = extract_from_sse(text) {
        return counts;
    }
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if let Some(counts) = extract_from_object(&value) {
            if !counts.is_zero() {
                return counts;
            }
        }
    }
    extract_from_subobjects(text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_body_json_usage_wins_when_no_sse() {
        let body = br#"{"id":"1","usage":{"prompt_tokens":12,"completion_tokens":5}}"#;
        let counts = extract(body);
        assert_eq!(counts.input_tokens, 12);
        assert_eq!(counts.output_tokens, 5);
    }

    #[test]
    fn sse_reverse_scan_finds_the_last_usage_frame() {
        let body = "data: {\"choices\":[]}\n\ndata: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7}}\n\ndata: [DONE]\n";
        let counts = extract(body.as_bytes());
        assert_eq!(counts.input_tokens, 3);
        assert_eq!(counts.output_tokens, 7);
    }

    #[test]
    fn all_zero_when_nothing_present() {
        let body = br#"{"id":"1","choices":[]}"#;
        assert_eq!(extract(body), TokenCounts::default());
    }

    #[test]
    fn timings_fields_are_read_from_greedy_scan() {
        let body = br#"some preamble {"garbage": true} then {"timings":{"cache_n": 4, "prompt_n": 9}} trailer"#;
        let counts = extract(body);
        assert_eq!(counts.cache_n, 4);
        assert_eq!(counts.prompt_n, 9);
    }

    #[test]
    fn extraction_is_deterministic() {
        let body = br#"{"usage":{"prompt_tokens":1,"completion_tokens":2}}"#;
        assert_eq!(extract(body), extract(body));
    }
}
