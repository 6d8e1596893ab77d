//! Reply parsing shared by the planner and the stage agents.
//!
//! Strict parsing looks for the first top-level JSON object in the reply.
//! When that fails, a caller-supplied heuristic reads `key: value` lines.
//! The two outcomes are distinct variants so the degraded path can never be
//! mistaken for a structured one.

use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply<T> {
    Structured(T),
    Heuristic { value: T, diagnostic: String },
}

impl<T> ParsedReply<T> {
    pub fn into_parts(self) -> (T, Option<String>) {
        match self {
            ParsedReply::Structured(v) => (v, None),
            ParsedReply::Heuristic { value, diagnostic } => (value, Some(diagnostic)),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ParsedReply::Structured(_))
    }
}

/// Parse `reply` as `T`, falling back to `heuristic` only when strict parsing fails.
pub fn parse_reply<T, H>(agent: &str, reply: &str, heuristic: H) -> Option<ParsedReply<T>>
where
    T: DeserializeOwned,
    H: FnOnce(&str) -> Option<T>,
{
    let strict_error = match extract_json_object(reply) {
        Some(json) => match serde_json::from_str::<T>(json) {
            Ok(value) => return Some(ParsedReply::Structured(value)),
            Err(e) => format!("JSON did not match the expected shape: {}", e),
        },
        None => "no JSON object found in reply".to_string(),
    };

    warn!(agent, reason = %strict_error, "Strict parse failed, using heuristic extraction");
    heuristic(reply).map(|value| ParsedReply::Heuristic {
        value,
        diagnostic: format!("{} output was parsed heuristically ({})", agent, strict_error),
    })
}

/// Return the first balanced `{...}` span that is itself valid JSON.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            let candidate = &text[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok_and(|v| v.is_object()) {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read the value of the first `key: value` (or `key = value`) line whose key matches.
pub fn field_value(text: &str, keys: &[&str]) -> Option<String> {
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '#', '>', ' ']);
        let Some(split) = line.find([':', '=']) else {
            continue;
        };
        let (raw_key, raw_value) = line.split_at(split);
        let key = normalize_key(raw_key);
        if !keys.iter().any(|k| normalize_key(k) == key) {
            continue;
        }
        let value = clean_value(&raw_value[1..]);
        if !value.is_empty() && !is_null_word(&value) {
            return Some(value);
        }
    }
    None
}

/// Like [`field_value`] but splits the value into a list.
pub fn list_value(text: &str, keys: &[&str]) -> Vec<String> {
    let Some(raw) = field_value(text, keys) else {
        return Vec::new();
    };
    raw.trim_matches(['[', ']'])
        .split([',', ';'])
        .flat_map(|part| part.split(" and "))
        .map(clean_value)
        .filter(|item| !item.is_empty() && !is_null_word(item))
        .collect()
}

pub fn number_value(text: &str, keys: &[&str]) -> Option<f64> {
    let raw = field_value(text, keys)?;
    let numeric: String = raw
        .chars()
        .skip_while(|c| !(c.is_ascii_digit() || *c == '-' || *c == '.'))
        .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '.' | 'e' | 'E'))
        .collect();
    numeric.parse().ok()
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .trim_matches(['"', '\'', '*', '`'])
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn clean_value(value: &str) -> String {
    value
        .trim()
        .trim_end_matches(',')
        .trim_matches(['"', '\'', '*', '`'])
        .trim()
        .to_string()
}

fn is_null_word(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "null" | "none" | "n/a" | "unknown" | "not specified"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::cell::Cell;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        treatment: String,
        outcome: String,
    }

    #[test]
    fn test_extracts_first_object_from_prose_and_fences() {
        let reply = "Sure! Here you go:\n```json\n{\"a\": {\"b\": \"}\"}}\n```\nand {\"c\": 1}";
        assert_eq!(extract_json_object(reply), Some("{\"a\": {\"b\": \"}\"}}"));
    }

    #[test]
    fn test_skips_unbalanced_or_invalid_spans() {
        assert_eq!(extract_json_object("{not json} {\"ok\": true}"), Some("{\"ok\": true}"));
        assert_eq!(extract_json_object("{\"open\": 1"), None);
        assert_eq!(extract_json_object("no braces"), None);
    }

    #[test]
    fn test_heuristic_not_invoked_when_strict_succeeds() {
        let calls = Cell::new(0);
        let parsed = parse_reply::<Pair, _>(
            "test",
            r#"{"treatment": "aspirin", "outcome": "stroke"}"#,
            |_| {
                calls.set(calls.get() + 1);
                None
            },
        )
        .unwrap();
        assert!(parsed.is_structured());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_heuristic_fallback_is_marked() {
        let reply = "Treatment: aspirin\nOutcome: stroke";
        let parsed = parse_reply::<Pair, _>("formulation", reply, |text| {
            Some(Pair {
                treatment: field_value(text, &["treatment"])?,
                outcome: field_value(text, &["outcome"])?,
            })
        })
        .unwrap();

        match parsed {
            ParsedReply::Heuristic { value, diagnostic } => {
                assert_eq!(value.treatment, "aspirin");
                assert!(diagnostic.contains("heuristically"));
            }
            other => panic!("expected heuristic parse, got {:?}", other),
        }
    }

    #[test]
    fn test_field_value_variants() {
        let text = "- **Treatment**: \"smoking\",\n adjustment set = [age, sex]\noutcome: null";
        assert_eq!(field_value(text, &["treatment"]).as_deref(), Some("smoking"));
        assert_eq!(field_value(text, &["outcome"]), None);
        assert_eq!(
            list_value(text, &["adjustment_set"]),
            vec!["age".to_string(), "sex".to_string()]
        );
    }

    #[test]
    fn test_list_value_splits_on_and() {
        let text = "Confounders: age, income and education";
        assert_eq!(list_value(text, &["confounders"]), vec!["age", "income", "education"]);
    }

    #[test]
    fn test_number_value() {
        assert_eq!(number_value("effect: -0.25 (ATE)", &["effect"]), Some(-0.25));
        assert_eq!(number_value("effect: large", &["effect"]), None);
    }
}
