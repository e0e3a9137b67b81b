//! Two-pass Singer stream/field selection and metadata overlay.
//!
//! A catalog entry's `selected` state is tri-state per metadata node
//! (explicit true/false, or unset deferring to `selected-by-default`),
//! resolved in two passes: pattern application, then propagation.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Prune,
    Deselect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingerCatalogStreamMetadata {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl SingerCatalogStreamMetadata {
    pub fn root() -> Self {
        Self {
            breadcrumb: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.breadcrumb.is_empty()
    }

    /// The dotted field path implied by a Singer breadcrumb, stripping
    /// the literal `"properties"` separators: `["properties", "addr",
    /// "properties", "city"]` -> `"addr.city"`.
    pub fn field_path(&self) -> String {
        self.breadcrumb
            .iter()
            .filter(|s| s.as_str() != "properties")
            .cloned()
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingerCatalogStream {
    pub tap_stream_id: String,
    pub schema: Value,
    pub metadata: Vec<SingerCatalogStreamMetadata>,
    pub key_properties: Vec<String>,
    pub replication_key: Option<String>,
    pub replication_method: Option<String>,
    pub selected: bool,
}

impl SingerCatalogStream {
    pub fn root_metadata(&self) -> Option<&SingerCatalogStreamMetadata> {
        self.metadata.iter().find(|m| m.is_root())
    }

    pub fn root_metadata_mut(&mut self) -> Option<&mut SingerCatalogStreamMetadata> {
        self.metadata.iter_mut().find(|m| m.is_root())
    }

    /// Clears `replication_key` if it is set but absent from the schema's
    /// top-level properties (§3 invariant).
    pub fn enforce_replication_key_invariant(&mut self) {
        if self.replication_method.as_deref() == Some("INCREMENTAL") {
            if let Some(key) = &self.replication_key {
                let present = self
                    .schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|p| p.contains_key(key))
                    .unwrap_or(false);
                if !present {
                    self.replication_key = None;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SingerCatalog {
    pub streams: Vec<SingerCatalogStream>,
}

impl SingerCatalog {
    pub fn get(&self, tap_stream_id: &str) -> Option<&SingerCatalogStream> {
        self.streams.iter().find(|s| s.tap_stream_id == tap_stream_id)
    }

    pub fn get_mut(&mut self, tap_stream_id: &str) -> Option<&mut SingerCatalogStream> {
        self.streams.iter_mut().find(|s| s.tap_stream_id == tap_stream_id)
    }
}

struct Pattern {
    negate: bool,
    stream_glob: String,
    field_glob: Option<String>,
}

fn parse_pattern(raw: &str) -> Option<Pattern> {
    if raw.starts_with('~') {
        return None; // PII patterns are not a selection operator
    }
    let (negate, rest) = match raw.strip_prefix('!') {
        Some(r) => (true, r),
        None => (false, raw),
    };
    let (stream_glob, field_glob) = match rest.split_once('.') {
        Some((s, f)) => (s.to_string(), Some(f.to_string())),
        None => (rest.to_string(), None),
    };
    Some(Pattern {
        negate,
        stream_glob,
        field_glob,
    })
}

/// If every non-PII pattern is a negation, an implicit `*.*` selects
/// everything before the negations are applied.
fn normalize_patterns(raw: &[String]) -> Vec<String> {
    let non_pii: Vec<&String> = raw.iter().filter(|p| !p.starts_with('~')).collect();
    let all_negated = !non_pii.is_empty() && non_pii.iter().all(|p| p.starts_with('!'));
    let mut out = Vec::new();
    if all_negated {
        out.push("*.*".to_string());
    }
    out.extend(raw.iter().cloned());
    out
}

fn glob_match(pattern: &str, value: &str) -> bool {
    globset::Glob::new(pattern)
        .ok()
        .map(|g| g.compile_matcher().is_match(value))
        .unwrap_or(false)
}

pub fn apply_selected(mut catalog: SingerCatalog, patterns: &[String], strategy: Strategy) -> SingerCatalog {
    let normalized = normalize_patterns(patterns);
    let parsed: Vec<Pattern> = normalized.iter().filter_map(|p| parse_pattern(p)).collect();

    // Pass 1: clear/create the root entry, then apply every pattern to
    // every matching metadata entry.
    for stream in &mut catalog.streams {
        match stream.root_metadata_mut() {
            Some(root) => {
                root.metadata.remove("selected");
            }
            None => stream.metadata.insert(0, SingerCatalogStreamMetadata::root()),
        }

        for pattern in &parsed {
            if !glob_match(&pattern.stream_glob, &stream.tap_stream_id) {
                continue;
            }
            for entry in &mut stream.metadata {
                let applies = match &pattern.field_glob {
                    None => entry.is_root(),
                    Some(field_glob) => !entry.is_root() && glob_match(field_glob, &entry.field_path()),
                };
                if applies {
                    entry
                        .metadata
                        .insert("selected".to_string(), Value::Bool(!pattern.negate));
                }
            }
        }
    }

    // Pass 2: tri-state propagation.
    let mut removed_stream_ids = Vec::new();
    for stream in &mut catalog.streams {
        let mut any_propagates = false;
        let mut removable_breadcrumbs = Vec::new();

        for entry in stream.metadata.iter_mut().filter(|e| !e.is_root()) {
            match decide_attribute(&mut entry.metadata) {
                AttrDecision::Propagate => any_propagates = true,
                AttrDecision::ForcedNoPropagate => {}
                AttrDecision::Remove => removable_breadcrumbs.push(entry.breadcrumb.clone()),
            }
        }

        if any_propagates {
            stream.selected = true;
            if let Some(root) = stream.root_metadata_mut() {
                root.metadata.insert("selected".to_string(), Value::Bool(true));
            }
            if strategy == Strategy::Prune {
                for breadcrumb in &removable_breadcrumbs {
                    remove_breadcrumb(&mut stream.schema, breadcrumb);
                }
                let dropped: std::collections::HashSet<_> = removable_breadcrumbs.into_iter().collect();
                stream.metadata.retain(|e| !dropped.contains(&e.breadcrumb));
            }
        } else {
            removed_stream_ids.push(stream.tap_stream_id.clone());
        }
    }

    if strategy == Strategy::Prune {
        catalog.streams.retain(|s| !removed_stream_ids.contains(&s.tap_stream_id));
    } else {
        for id in &removed_stream_ids {
            if let Some(stream) = catalog.get_mut(id) {
                stream.selected = false;
                if let Some(root) = stream.root_metadata_mut() {
                    root.metadata.insert("selected".to_string(), Value::Bool(false));
                }
            }
        }
    }

    catalog
}

enum AttrDecision {
    Propagate,
    ForcedNoPropagate,
    Remove,
}

fn decide_attribute(metadata: &mut Map<String, Value>) -> AttrDecision {
    let selected = metadata.get("selected").and_then(Value::as_bool);
    let selected_by_default = metadata
        .get("selected-by-default")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let inclusion_automatic = metadata.get("inclusion").and_then(Value::as_str) == Some("automatic");

    match selected {
        Some(true) => AttrDecision::Propagate,
        None if selected_by_default => {
            metadata.insert("selected".to_string(), Value::Bool(true));
            AttrDecision::Propagate
        }
        Some(false) if inclusion_automatic => {
            metadata.insert("selected".to_string(), Value::Bool(true));
            AttrDecision::ForcedNoPropagate
        }
        _ => AttrDecision::Remove,
    }
}

/// Pure breadcrumb removal: returns nothing, mutates `schema` in place,
/// dropping the parent `properties` object too if it becomes empty and
/// the breadcrumb is longer than two segments.
fn remove_breadcrumb(schema: &mut Value, breadcrumb: &[String]) {
    if breadcrumb.len() < 2 {
        return;
    }
    let parent_path = &breadcrumb[..breadcrumb.len() - 2];
    let leaf = &breadcrumb[breadcrumb.len() - 1];

    if let Some(parent_props) = navigate(schema, parent_path).and_then(|v| v.as_object_mut()) {
        parent_props.remove(leaf);
        let became_empty = parent_props.is_empty();
        if became_empty && breadcrumb.len() > 2 {
            remove_breadcrumb(schema, parent_path);
        }
    }
}

fn navigate<'a>(schema: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut node = schema;
    for segment in path {
        node = node.get_mut(segment)?;
    }
    Some(node)
}

/// Metadata overlay: `selected` is ignored here (selection subsystem's
/// concern); `replication-method`/`replication-key` are promoted to
/// stream-level fields as well as written to the root metadata entry.
pub fn apply_metadata(mut catalog: SingerCatalog, overlay: &[(String, Map<String, Value>)]) -> SingerCatalog {
    for (pattern, attrs) in overlay {
        for stream in &mut catalog.streams {
            if !glob_match(pattern, &stream.tap_stream_id) {
                continue;
            }
            if let Some(method) = attrs.get("replication-method").and_then(Value::as_str) {
                stream.replication_method = Some(method.to_string());
            }
            if let Some(key) = attrs.get("replication-key").and_then(Value::as_str) {
                stream.replication_key = Some(key.to_string());
            }
            if let Some(root) = stream.root_metadata_mut() {
                for (k, v) in attrs {
                    if k == "selected" {
                        continue;
                    }
                    root.metadata.insert(k.clone(), v.clone());
                }
            }
            stream.enforce_replication_key_invariant();
        }
    }
    catalog
}

impl SingerCatalogStreamMetadata {
    fn from_value(value: &Value) -> Self {
        let breadcrumb = value
            .get("breadcrumb")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let metadata = value.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default();
        Self { breadcrumb, metadata }
    }

    fn to_value(&self) -> Value {
        Value::Object(Map::from_iter([
            ("breadcrumb".to_string(), Value::Array(self.breadcrumb.iter().cloned().map(Value::String).collect())),
            ("metadata".to_string(), Value::Object(self.metadata.clone())),
        ]))
    }
}

impl SingerCatalogStream {
    fn from_value(value: &Value) -> Self {
        let tap_stream_id = value.get("tap_stream_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let schema = value.get("schema").cloned().unwrap_or(Value::Object(Map::new()));
        let metadata = value
            .get("metadata")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(SingerCatalogStreamMetadata::from_value).collect())
            .unwrap_or_default();
        let key_properties = value
            .get("key_properties")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let replication_key = value.get("replication_key").and_then(Value::as_str).map(String::from);
        let replication_method = value.get("replication_method").and_then(Value::as_str).map(String::from);
        let selected = value.get("selected").and_then(Value::as_bool).unwrap_or(false);
        let mut stream = Self {
            tap_stream_id,
            schema,
            metadata,
            key_properties,
            replication_key,
            replication_method,
            selected,
        };
        stream.enforce_replication_key_invariant();
        stream
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("tap_stream_id".to_string(), Value::String(self.tap_stream_id.clone()));
        obj.insert("schema".to_string(), self.schema.clone());
        obj.insert(
            "metadata".to_string(),
            Value::Array(self.metadata.iter().map(SingerCatalogStreamMetadata::to_value).collect()),
        );
        obj.insert(
            "key_properties".to_string(),
            Value::Array(self.key_properties.iter().cloned().map(Value::String).collect()),
        );
        if let Some(key) = &self.replication_key {
            obj.insert("replication_key".to_string(), Value::String(key.clone()));
        }
        if let Some(method) = &self.replication_method {
            obj.insert("replication_method".to_string(), Value::String(method.clone()));
        }
        obj.insert("selected".to_string(), Value::Bool(self.selected));
        Value::Object(obj)
    }
}

impl SingerCatalog {
    /// Parses a discovered Singer catalog document: `{"streams": [...]}`.
    pub fn from_value(value: &Value) -> Self {
        let streams = value
            .get("streams")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(SingerCatalogStream::from_value).collect())
            .unwrap_or_default();
        Self { streams }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "streams".to_string(),
            Value::Array(self.streams.iter().map(SingerCatalogStream::to_value).collect()),
        );
        Value::Object(obj)
    }
}
