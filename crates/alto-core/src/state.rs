//! STATE message deep-merge and persistence.
//!
//! A state document is free-form JSON with one legacy quirk: a top-level
//! `singer_state` key wraps the real document. The unwrap happens once,
//! on load, and the document is never re-wrapped on write — ambiguous in
//! the original, preserved here deliberately (see design notes).

use chrono::Utc;
use serde_json::Value;

/// Unwrap a legacy `{"singer_state": {...}}` container. One-shot: if the
/// value isn't wrapped, it is returned unchanged.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(inner) = map.remove("singer_state") {
                inner
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// Deep-merge `source` into `destination`: for each key in `source`, if
/// both the existing and incoming values are objects, recurse;
/// otherwise the source value replaces the destination's.
pub fn merge(destination: &Value, source: &Value) -> Value {
    match (destination, source) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            let mut out = dest_map.clone();
            for (key, src_val) in src_map {
                let merged = match out.get(key) {
                    Some(dest_val) => merge(dest_val, src_val),
                    None => src_val.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, src) => src.clone(),
    }
}

/// Parse target stdout, one JSON STATE-document value per non-empty
/// line, skipping lines that fail to decode.
pub fn parse_state_lines(text: &str) -> Vec<Value> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .collect()
}

/// Fold a sequence of STATE `value` payloads into a single document via
/// repeated [`merge`], starting from an empty object.
pub fn fold_state_lines(lines: &[Value]) -> Value {
    lines
        .iter()
        .fold(Value::Object(serde_json::Map::new()), |acc, v| merge(&acc, v))
}

/// A timestamped suffix for the immutable copy written alongside the
/// mutable state file, e.g. `state.json` -> `state.20250101120000.json`.
pub fn immutable_copy_path(mutable_path: &str) -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S").to_string();
    match mutable_path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{ts}.{ext}"),
        None => format!("{mutable_path}.{ts}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_unwraps_singer_state_once() {
        let wrapped = json!({"singer_state": {"bookmarks": {"a": 1}}});
        assert_eq!(normalize(wrapped), json!({"bookmarks": {"a": 1}}));
    }

    #[test]
    fn normalize_passes_through_unwrapped() {
        let plain = json!({"bookmarks": {"a": 1}});
        assert_eq!(normalize(plain.clone()), plain);
    }

    #[test]
    fn merge_is_right_biased_for_scalars() {
        let dest = json!({"a": 1, "b": 2});
        let src = json!({"a": 99});
        let merged = merge(&dest, &src);
        assert_eq!(merged["a"], json!(99));
        assert_eq!(merged["b"], json!(2));
    }

    #[test]
    fn merge_recurses_only_into_existing_maps() {
        let dest = json!({"bookmarks": {"orders": {"id": 1}}});
        let src = json!({"bookmarks": {"orders": {"id": 2, "ts": "x"}}});
        let merged = merge(&dest, &src);
        assert_eq!(merged["bookmarks"]["orders"]["id"], json!(2));
        assert_eq!(merged["bookmarks"]["orders"]["ts"], json!("x"));
    }

    #[test]
    fn merge_with_empty_source_is_identity() {
        let dest = json!({"a": {"b": 1}});
        assert_eq!(merge(&dest, &json!({})), dest);
    }

    #[test]
    fn merge_into_empty_destination_yields_source() {
        let src = json!({"a": {"b": 1}});
        assert_eq!(merge(&json!({}), &src), src);
    }

    #[test]
    fn parse_state_lines_skips_invalid_json() {
        let text = "{\"value\":{\"a\":1}}\nnot json\n{\"value\":{\"b\":2}}\n";
        let lines = parse_state_lines(text);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn fold_state_lines_applies_in_order() {
        let lines = vec![json!({"a": 1}), json!({"a": 2, "b": 3})];
        let folded = fold_state_lines(&lines);
        assert_eq!(folded, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn immutable_copy_path_inserts_timestamp_before_extension() {
        let p = immutable_copy_path("state/dev/tap-to-target.json");
        assert!(p.starts_with("state/dev/tap-to-target."));
        assert!(p.ends_with(".json"));
        assert_ne!(p, "state/dev/tap-to-target.json");
    }
}
