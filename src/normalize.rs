//! Message normalization and session grouping.
//!
//! Rows in the chat history table carry payloads in whatever shape the
//! upstream automation wrote them: plain text, JSON-encoded text, arrays of
//! fragments, or envelope objects ({"content": ...}, {"text": ...}, ...).
//! This module flattens every shape into a single display string and buckets
//! the flat rows into conversation sessions ordered by recency.
//!
//! The transform is total: every row produces exactly one record, malformed
//! payloads degrade to a placeholder string, and nothing here returns an
//! error. Upstream fetch failures are the provider's to report.

use crate::sessions::{MessageRecord, SessionGroup};
use serde::Deserialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Recursion bound for nested payloads
const MAX_DEPTH: usize = 6;

/// Shown when a payload nests deeper than the recursion bound
pub const DEPTH_PLACEHOLDER: &str = "Message is nested too deeply to display";

/// Shown when a payload is missing or normalizes to nothing
pub const MISSING_PLACEHOLDER: &str = "Message not found";

/// Grouping key used when a row has no session id
pub const SESSION_PLACEHOLDER: &str = "unknown-session";

/// Sort key for ids with no usable digits, so they sort last
pub const SORT_KEY_SENTINEL: u64 = u64::MAX;

/// Envelope keys probed on object payloads, in priority order
const DEFAULT_PROBE_KEYS: &[&str] = &["content", "text", "message", "data"];

/// One row from the chat history table. Every field is shape-tolerant:
/// ids arrive as numbers or text, session ids may be null or missing,
/// and the message column holds arbitrary JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub session_id: Option<Value>,
    #[serde(default)]
    pub message: Value,
}

/// Tuning knobs for the normalizer. Probe keys are configuration rather
/// than hard-coded branches so new upstream envelope shapes can be added
/// without touching the recursion.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub probe_keys: Vec<String>,
    pub max_depth: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            probe_keys: DEFAULT_PROBE_KEYS.iter().map(|k| k.to_string()).collect(),
            max_depth: MAX_DEPTH,
        }
    }
}

/// Flatten an arbitrary payload into a display string.
/// Never empty: whitespace-only results collapse to the placeholder.
pub fn normalize_message(value: &Value, opts: &NormalizeOptions) -> String {
    let text = normalize_value(value, 0, opts);
    if text.trim().is_empty() {
        MISSING_PLACEHOLDER.to_string()
    } else {
        text
    }
}

/// Recursive worker. May return an empty string (empty text fragments),
/// which array flattening drops and the public entry point replaces.
fn normalize_value(value: &Value, depth: usize, opts: &NormalizeOptions) -> String {
    if depth > opts.max_depth {
        return DEPTH_PLACEHOLDER.to_string();
    }

    match value {
        Value::Null => MISSING_PLACEHOLDER.to_string(),

        Value::String(raw) => match sniff_json(raw) {
            Some(parsed) => normalize_value(&parsed, depth + 1, opts),
            None => raw.trim().to_string(),
        },

        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| normalize_value(item, depth + 1, opts))
                .filter(|part| !part.is_empty())
                .collect();
            if parts.is_empty() {
                MISSING_PLACEHOLDER.to_string()
            } else {
                parts.join("\n\n")
            }
        }

        Value::Object(map) => {
            for key in &opts.probe_keys {
                if let Some(inner) = map.get(key.as_str()) {
                    // Recurse into container shapes (and null, which degrades
                    // to the placeholder); scalars like numeric ids under
                    // these keys are not message bodies, keep probing.
                    if matches!(
                        inner,
                        Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Null
                    ) {
                        return normalize_value(inner, depth + 1, opts);
                    }
                }
            }
            // No recognized envelope key: render the object itself
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }

        other => other.to_string(),
    }
}

/// Parse a string as JSON only when it plausibly is JSON.
/// Ordinary prose often contains braces; parsing is attempted only for
/// brace- or bracket-delimited strings, and a parse failure means the
/// string was prose after all.
fn sniff_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let delimited = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !delimited {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Normalized identifier: display text plus numeric ordering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdInfo {
    pub text: String,
    pub sort_key: u64,
}

/// Derive the display id and sort key for a row.
/// Rows without an id get a deterministic `row-{position}` token so output
/// stays reproducible across fetches of the same batch.
pub fn normalize_id(raw: &Value, position: usize) -> IdInfo {
    let text = match raw {
        Value::Null => format!("row-{}", position),
        Value::String(s) if s.trim().is_empty() => format!("row-{}", position),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };

    let sort_key = first_digit_run(&text)
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(SORT_KEY_SENTINEL);

    IdInfo { text, sort_key }
}

/// First run of consecutive decimal digits in `text`, if any
fn first_digit_run(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Grouping key for a row (placeholder when the session id is absent)
pub fn session_key(row: &RawRow) -> String {
    match &row.session_id {
        None | Some(Value::Null) => SESSION_PLACEHOLDER.to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => SESSION_PLACEHOLDER.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// Bucket rows into session groups ordered by recency.
///
/// Rows arrive already ordered (session_id asc, id asc) from the upstream
/// query. Messages are re-sorted ascending within each bucket anyway, and
/// groups are ordered by the sort key of their last message descending
/// (most recently active conversation first). Ties keep encounter order.
pub fn group_rows(rows: &[RawRow], opts: &NormalizeOptions) -> Vec<SessionGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<MessageRecord>> = HashMap::new();

    for (position, row) in rows.iter().enumerate() {
        let id = normalize_id(&row.id, position);
        let record = MessageRecord {
            id: id.text,
            sort_key: id.sort_key,
            text: normalize_message(&row.message, opts),
        };

        match buckets.entry(session_key(row)) {
            Entry::Vacant(slot) => {
                order.push(slot.key().clone());
                slot.insert(vec![record]);
            }
            Entry::Occupied(mut slot) => slot.get_mut().push(record),
        }
    }

    let mut groups: Vec<SessionGroup> = order
        .into_iter()
        .map(|session_id| {
            let mut messages = buckets.remove(&session_id).unwrap_or_default();
            // Stable; input order should already satisfy this
            messages.sort_by_key(|m| m.sort_key);
            SessionGroup { session_id, messages }
        })
        .collect();

    // None (empty group) sorts after every Some under descending order
    groups.sort_by(|a, b| b.last_sort_key().cmp(&a.last_sort_key()));

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn norm(value: Value) -> String {
        normalize_message(&value, &NormalizeOptions::default())
    }

    #[test]
    fn test_plain_string_trimmed() {
        assert_eq!(norm(json!("  hello there  ")), "hello there");
    }

    #[test]
    fn test_null_is_placeholder() {
        assert_eq!(norm(json!(null)), MISSING_PLACEHOLDER);
    }

    #[test]
    fn test_empty_string_is_placeholder() {
        assert_eq!(norm(json!("   ")), MISSING_PLACEHOLDER);
    }

    #[test]
    fn test_sniff_rejects_prose_with_brace() {
        // Not brace-delimited on both ends, so no parse is attempted
        assert_eq!(norm(json!("hello {not json")), "hello {not json");
    }

    #[test]
    fn test_sniff_swallows_malformed_json() {
        // Delimited but unparseable: the raw string is the message
        assert_eq!(norm(json!("{not json}")), "{not json}");
    }

    #[test]
    fn test_sniff_parses_encoded_envelope() {
        assert_eq!(norm(json!(r#"{"content":"hi"}"#)), "hi");
    }

    #[test]
    fn test_probe_priority_content_first() {
        assert_eq!(norm(json!({"content": "a", "text": "b"})), "a");
        assert_eq!(norm(json!({"text": "b", "message": "c"})), "b");
        assert_eq!(norm(json!({"message": "c", "data": "d"})), "c");
    }

    #[test]
    fn test_probe_skips_scalar_values() {
        // A numeric "content" is not a message body; "text" wins
        assert_eq!(norm(json!({"content": 7, "text": "b"})), "b");
    }

    #[test]
    fn test_probe_recurses_into_null() {
        assert_eq!(norm(json!({"content": null})), MISSING_PLACEHOLDER);
    }

    #[test]
    fn test_array_drops_empty_and_joins() {
        assert_eq!(norm(json!(["a", "", "b"])), "a\n\nb");
    }

    #[test]
    fn test_array_of_empties_is_placeholder() {
        assert_eq!(norm(json!(["", "  "])), MISSING_PLACEHOLDER);
    }

    #[test]
    fn test_unrecognized_object_pretty_printed() {
        let out = norm(json!({"payload": "x"}));
        assert!(out.contains("\"payload\": \"x\""));
    }

    #[test]
    fn test_scalars_stringified() {
        assert_eq!(norm(json!(42)), "42");
        assert_eq!(norm(json!(true)), "true");
    }

    #[test]
    fn test_depth_guard_returns_placeholder() {
        // 7 levels of {"content": ...} exceeds the bound of 6
        let mut value = json!("leaf");
        for _ in 0..7 {
            value = json!({ "content": value });
        }
        assert_eq!(norm(value), DEPTH_PLACEHOLDER);
    }

    #[test]
    fn test_nested_within_bound_unwraps() {
        let mut value = json!("leaf");
        for _ in 0..5 {
            value = json!({ "content": value });
        }
        assert_eq!(norm(value), "leaf");
    }

    #[test]
    fn test_custom_probe_keys() {
        let opts = NormalizeOptions {
            probe_keys: vec!["body".to_string()],
            ..NormalizeOptions::default()
        };
        assert_eq!(normalize_message(&json!({"body": "hi"}), &opts), "hi");
        // Default keys are no longer probed
        let out = normalize_message(&json!({"content": "hi"}), &opts);
        assert!(out.contains("\"content\""));
    }

    #[test]
    fn test_normalize_id_digit_run() {
        assert_eq!(
            normalize_id(&json!("msg-42"), 0),
            IdInfo { text: "msg-42".to_string(), sort_key: 42 }
        );
    }

    #[test]
    fn test_normalize_id_no_digits_sorts_last() {
        assert_eq!(normalize_id(&json!("no-digits"), 0).sort_key, SORT_KEY_SENTINEL);
    }

    #[test]
    fn test_normalize_id_numeric() {
        let info = normalize_id(&json!(17), 3);
        assert_eq!(info.text, "17");
        assert_eq!(info.sort_key, 17);
    }

    #[test]
    fn test_normalize_id_missing_is_positional() {
        let info = normalize_id(&Value::Null, 3);
        assert_eq!(info.text, "row-3");
        assert_eq!(info.sort_key, 3);
    }

    #[test]
    fn test_normalize_id_overflow_sorts_last() {
        let info = normalize_id(&json!("99999999999999999999999"), 0);
        assert_eq!(info.sort_key, SORT_KEY_SENTINEL);
    }

    fn row(id: Value, session: Value, message: Value) -> RawRow {
        RawRow { id, session_id: Some(session), message }
    }

    #[test]
    fn test_group_rows_by_session_and_recency() {
        let rows = vec![
            row(json!(1), json!("s1"), json!("a")),
            row(json!(2), json!("s1"), json!("b")),
            row(json!(3), json!("s2"), json!("c")),
        ];
        let groups = group_rows(&rows, &NormalizeOptions::default());

        assert_eq!(groups.len(), 2);
        // s2's last sort key (3) beats s1's (2), so s2 leads
        assert_eq!(groups[0].session_id, "s2");
        assert_eq!(groups[1].session_id, "s1");

        let texts: Vec<&str> = groups[1].messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_group_rows_empty_input() {
        let groups = group_rows(&[], &NormalizeOptions::default());
        assert!(groups.is_empty());
    }

    #[test]
    fn test_group_rows_missing_session_id() {
        let rows = vec![RawRow { id: json!(1), session_id: None, message: json!("x") }];
        let groups = group_rows(&rows, &NormalizeOptions::default());
        assert_eq!(groups[0].session_id, SESSION_PLACEHOLDER);
    }

    #[test]
    fn test_group_rows_null_payload_still_present() {
        let rows = vec![row(json!(1), json!("s1"), json!(null))];
        let groups = group_rows(&rows, &NormalizeOptions::default());
        assert_eq!(groups[0].messages.len(), 1);
        assert_eq!(groups[0].messages[0].text, MISSING_PLACEHOLDER);
    }

    #[test]
    fn test_group_rows_resorts_out_of_order_ids() {
        let rows = vec![
            row(json!(5), json!("s1"), json!("later")),
            row(json!(2), json!("s1"), json!("earlier")),
        ];
        let groups = group_rows(&rows, &NormalizeOptions::default());
        assert_eq!(groups[0].messages[0].text, "earlier");
        assert_eq!(groups[0].messages[1].text, "later");
    }

    #[test]
    fn test_raw_row_tolerates_sparse_json() {
        let row: RawRow = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert!(row.id.is_null());
        assert!(row.session_id.is_none());

        // serde folds an explicit null into None as well
        let row: RawRow =
            serde_json::from_str(r#"{"id":7,"session_id":null,"message":{"text":"t"}}"#).unwrap();
        assert_eq!(row.id, json!(7));
        assert!(row.session_id.is_none());
    }
}
