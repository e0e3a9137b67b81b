//! Schema/record transform chain.
//!
//! A stream map matches JSON nodes by a dotted crumb (`<stream>.<field>`,
//! `<stream>.<field>.<nested>`) against a list of glob selectors, and
//! transforms matched nodes in place. Maps form an ordered chain: the
//! first map sees the tap's original message, each subsequent map sees
//! the previous map's output.

use std::collections::HashSet;
use std::sync::Mutex;

use md5::{Digest, Md5};
use serde_json::Value;

pub trait StreamMap: Send + Sync {
    /// Glob patterns of the form `<stream-glob>.<field-glob>` this map
    /// applies to.
    fn select(&self) -> &[String];

    /// Called once per matched node in a SCHEMA message's `properties`
    /// tree (crumb is the dotted path from the stream name).
    fn transform_schema_node(&self, crumb: &str, node: &mut Value);

    /// Called once per matched leaf in a RECORD message's `record` tree.
    fn transform_record_leaf(&self, crumb: &str, value: &mut Value);
}

fn selector_matches(selectors: &[String], crumb: &str) -> bool {
    selectors.iter().any(|pattern| {
        globset::Glob::new(pattern)
            .ok()
            .map(|g| g.compile_matcher().is_match(crumb))
            .unwrap_or(false)
    })
}

/// Chain of maps applied in order, with a per-map "this stream has no
/// matching selector" cache to skip walking messages for streams no map
/// touches.
pub struct MapChain {
    maps: Vec<Box<dyn StreamMap>>,
    ignored_streams: Vec<Mutex<HashSet<String>>>,
}

impl MapChain {
    pub fn new(maps: Vec<Box<dyn StreamMap>>) -> Self {
        let ignored_streams = maps.iter().map(|_| Mutex::new(HashSet::new())).collect();
        Self { maps, ignored_streams }
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn transform_schema(&self, mut message: Value) -> Value {
        let Some(stream) = message.get("stream").and_then(Value::as_str).map(String::from) else {
            return message;
        };
        for (idx, map) in self.maps.iter().enumerate() {
            if self.stream_is_ignored(idx, &stream) {
                continue;
            }
            let matched = if let Some(schema) = message.get_mut("schema") {
                walk_schema(schema, &stream, map.select(), map.as_ref())
            } else {
                false
            };
            if !matched {
                self.ignored_streams[idx].lock().unwrap().insert(stream.clone());
            }
        }
        message
    }

    pub fn transform_record(&self, mut message: Value) -> Value {
        let Some(stream) = message.get("stream").and_then(Value::as_str).map(String::from) else {
            return message;
        };
        for (idx, map) in self.maps.iter().enumerate() {
            if self.stream_is_ignored(idx, &stream) {
                continue;
            }
            if let Some(record) = message.get_mut("record") {
                walk_record(record, &stream, map.select(), map.as_ref());
            }
        }
        message
    }

    fn stream_is_ignored(&self, idx: usize, stream: &str) -> bool {
        self.ignored_streams[idx].lock().unwrap().contains(stream)
    }
}

/// Walk a JSON Schema's `properties`/`items` tree, invoking
/// `transform_schema_node` on every node whose dotted crumb matches a
/// selector. Returns whether anything matched.
fn walk_schema(node: &mut Value, crumb: &str, selectors: &[String], map: &dyn StreamMap) -> bool {
    let mut matched = selector_matches(selectors, crumb);
    if matched {
        map.transform_schema_node(crumb, node);
    }
    if let Some(props) = node.get_mut("properties").and_then(Value::as_object_mut) {
        let keys: Vec<String> = props.keys().cloned().collect();
        for key in keys {
            let child_crumb = format!("{crumb}.{key}");
            if let Some(child) = props.get_mut(&key) {
                matched |= walk_schema(child, &child_crumb, selectors, map);
            }
        }
    }
    if let Some(items) = node.get_mut("items") {
        matched |= walk_schema(items, crumb, selectors, map);
    }
    matched
}

fn walk_record(node: &mut Value, crumb: &str, selectors: &[String], map: &dyn StreamMap) {
    if selector_matches(selectors, crumb) {
        map.transform_record_leaf(crumb, node);
        return;
    }
    match node {
        Value::Object(obj) => {
            let keys: Vec<String> = obj.keys().cloned().collect();
            for key in keys {
                let child_crumb = format!("{crumb}.{key}");
                if let Some(child) = obj.get_mut(&key) {
                    walk_record(child, &child_crumb, selectors, map);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk_record(item, crumb, selectors, map);
            }
        }
        _ => {}
    }
}

/// Built-in PII-hash map: replaces matched leaf values with
/// `md5(str(value))` and rewrites the schema node's type to
/// `{"type": "string", "format": "hash"}`.
pub struct PiiHashMap {
    patterns: Vec<String>,
}

impl PiiHashMap {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl StreamMap for PiiHashMap {
    fn select(&self) -> &[String] {
        &self.patterns
    }

    fn transform_schema_node(&self, _crumb: &str, node: &mut Value) {
        if let Some(obj) = node.as_object_mut() {
            obj.insert("type".to_string(), Value::String("string".to_string()));
            obj.insert("format".to_string(), Value::String("hash".to_string()));
            obj.remove("properties");
            obj.remove("items");
        }
    }

    fn transform_record_leaf(&self, _crumb: &str, value: &mut Value) {
        let stringified = value_as_python_str(value);
        *value = Value::String(hash_value(&stringified));
    }
}

fn value_as_python_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

pub fn hash_value(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pii_hash_is_deterministic_for_equal_inputs() {
        assert_eq!(hash_value("a@b"), hash_value("a@b"));
        assert_eq!(hash_value("a@b"), "ab53a2911ddf9b4817ac01ddcd3d975f");
    }

    #[test]
    fn pii_hash_schema_rewrite_matches_scenario_5() {
        let chain = MapChain::new(vec![Box::new(PiiHashMap::new(vec!["users.email".to_string()]))]);
        let schema_msg = json!({
            "type": "SCHEMA",
            "stream": "users",
            "schema": {
                "properties": {
                    "email": {"type": "string"},
                    "id": {"type": "integer"}
                }
            }
        });
        let out = chain.transform_schema(schema_msg);
        assert_eq!(
            out["schema"]["properties"]["email"],
            json!({"type": "string", "format": "hash"})
        );
        assert_eq!(out["schema"]["properties"]["id"], json!({"type": "integer"}));
    }

    #[test]
    fn pii_hash_record_rewrite_matches_scenario_5() {
        let chain = MapChain::new(vec![Box::new(PiiHashMap::new(vec!["users.email".to_string()]))]);
        let record_msg = json!({
            "type": "RECORD",
            "stream": "users",
            "record": {"email": "a@b", "id": 1}
        });
        let out = chain.transform_record(record_msg);
        assert_eq!(out["record"]["email"], json!("ab53a2911ddf9b4817ac01ddcd3d975f"));
        assert_eq!(out["record"]["id"], json!(1));
    }

    #[test]
    fn unrelated_stream_passes_through_unchanged() {
        let chain = MapChain::new(vec![Box::new(PiiHashMap::new(vec!["users.email".to_string()]))]);
        let record_msg = json!({"type": "RECORD", "stream": "orders", "record": {"id": 1}});
        let out = chain.transform_record(record_msg.clone());
        assert_eq!(out, record_msg);
    }

    #[test]
    fn empty_chain_is_a_passthrough() {
        let chain = MapChain::new(vec![]);
        assert!(chain.is_empty());
        let msg = json!({"type": "RECORD", "stream": "orders", "record": {"id": 1}});
        assert_eq!(chain.transform_record(msg.clone()), msg);
    }
}
