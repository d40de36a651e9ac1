use std::collections::BTreeMap;

use common::utils::config::{AppConfig, ArrayKeySetting};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::normalize::normalize;

/// Flattened document: dotted path -> leaf value.
pub type FlatMap = BTreeMap<String, Value>;

/// Suffix marking a path whose value was null or an empty list.
pub const EMPTY_SENTINEL: &str = "_empty";

/// Array fields whose items are keyed by content instead of position.
///
/// Maps a dotted array path (e.g. `medications.medications`) to the ordered item
/// fields that make up the semantic key, so reordering items never produces diffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayKeys {
    selectors: BTreeMap<String, Vec<String>>,
}

impl Default for ArrayKeys {
    fn default() -> Self {
        Self::empty()
            .with_field("medications.medications", &["med_name", "dosage", "med_sig"])
            .with_field("icd10_codes.codes", &["code"])
    }
}

impl ArrayKeys {
    pub fn empty() -> Self {
        Self {
            selectors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, path: &str, fields: &[&str]) -> Self {
        self.selectors.insert(
            path.to_string(),
            fields.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Explicit selectors from configuration; defaults when none are usable.
    pub fn from_settings(settings: &[ArrayKeySetting]) -> Self {
        let selectors: BTreeMap<String, Vec<String>> = settings
            .iter()
            .filter(|setting| !setting.path.is_empty() && !setting.fields.is_empty())
            .map(|setting| (setting.path.clone(), setting.fields.clone()))
            .collect();

        if selectors.is_empty() {
            Self::default()
        } else {
            Self { selectors }
        }
    }

    /// Discover selectors from a sample-shaped schema document.
    ///
    /// Every array whose first item is an object is keyed by that item's first field.
    /// Falls back to the defaults when nothing is discovered.
    pub fn from_schema(schema: &Value) -> Self {
        let mut discovered = BTreeMap::new();
        discover_arrays(schema, "", &mut discovered);

        let selectors: BTreeMap<String, Vec<String>> = discovered
            .into_iter()
            .filter_map(|(path, fields)| fields.into_iter().next().map(|first| (path, vec![first])))
            .collect();

        if selectors.is_empty() {
            Self::default()
        } else {
            Self { selectors }
        }
    }

    /// Resolve selectors for a deployment: explicit settings win, then the schema
    /// file, then the defaults.
    pub async fn from_config(config: &AppConfig) -> Self {
        if !config.array_keys.is_empty() {
            return Self::from_settings(&config.array_keys);
        }

        let Some(schema_path) = config.schema_path.as_deref() else {
            return Self::default();
        };

        let schema = match tokio::fs::read(schema_path).await {
            Ok(raw) => serde_json::from_slice::<Value>(&raw),
            Err(err) => {
                warn!(schema_path, error = %err, "schema unreadable; using default array keys");
                return Self::default();
            }
        };

        match schema {
            Ok(schema) => {
                let keys = Self::from_schema(&schema);
                debug!(schema_path, selectors = keys.len(), "array keys discovered from schema");
                keys
            }
            Err(err) => {
                warn!(schema_path, error = %err, "schema is not valid JSON; using default array keys");
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn fields(&self, path: &str) -> Option<&[String]> {
        self.selectors.get(path).map(Vec::as_slice)
    }

    /// Content key for one array item, e.g. `aspirin|10 mg|1/day`.
    pub fn semantic_key(fields: &[String], item: &Value) -> String {
        let Value::Object(object) = item else {
            return normalize(item);
        };

        fields
            .iter()
            .map(|field| match object.get(field) {
                Some(Value::String(text)) => normalize_selector_text(text),
                Some(other) => normalize(other),
                None => String::new(),
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn normalize_selector_text(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .replace("  ", " ")
        .replace(" per day", "/day")
}

fn discover_arrays(node: &Value, path: &str, found: &mut BTreeMap<String, Vec<String>>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                discover_arrays(value, &join_path(path, key), found);
            }
        }
        Value::Array(items) => {
            if let Some(item @ Value::Object(fields)) = items.first() {
                found.insert(path.to_string(), fields.keys().cloned().collect());
                discover_arrays(item, path, found);
            }
        }
        _ => {}
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Flatten a nested document into `path -> value`.
///
/// Objects recurse with `.`; configured arrays are keyed `path[semantic_key]` and
/// colliding leaves are merged into a list, an empty configured array emits nothing;
/// other arrays are keyed by index; null and other empty arrays become
/// `path._empty = true`. Non-object roots flatten to
/// an empty map.
pub fn flatten(doc: &Value, keys: &ArrayKeys) -> FlatMap {
    let mut flat = FlatMap::new();
    if let Value::Object(map) = doc {
        flatten_into(map, "", keys, &mut flat);
    }
    flat
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, keys: &ArrayKeys, flat: &mut FlatMap) {
    for (key, value) in map {
        let path = join_path(prefix, key);
        match value {
            Value::Array(items) => match keys.fields(&path) {
                Some(fields) => flatten_keyed_array(items, &path, fields, keys, flat),
                None if items.is_empty() => {
                    flat.insert(format!("{path}.{EMPTY_SENTINEL}"), Value::Bool(true));
                }
                None => {
                    for (index, item) in items.iter().enumerate() {
                        let item_path = format!("{path}[{index}]");
                        match item {
                            Value::Object(inner) => flatten_into(inner, &item_path, keys, flat),
                            other => {
                                flat.insert(item_path, other.clone());
                            }
                        }
                    }
                }
            },
            Value::Null => {
                flat.insert(format!("{path}.{EMPTY_SENTINEL}"), Value::Bool(true));
            }
            Value::Object(inner) => flatten_into(inner, &path, keys, flat),
            scalar => {
                flat.insert(path, scalar.clone());
            }
        }
    }
}

fn flatten_keyed_array(
    items: &[Value],
    path: &str,
    fields: &[String],
    keys: &ArrayKeys,
    flat: &mut FlatMap,
) {
    for item in items {
        let item_path = format!("{path}[{}]", ArrayKeys::semantic_key(fields, item));
        match item {
            Value::Object(inner) => {
                let mut item_flat = FlatMap::new();
                flatten_into(inner, &item_path, keys, &mut item_flat);
                for (leaf, value) in item_flat {
                    merge_leaf(flat, leaf, value);
                }
            }
            other => merge_leaf(flat, item_path, other.clone()),
        }
    }
}

/// Insert without overwriting: a second value turns the slot into a list.
fn merge_leaf(flat: &mut FlatMap, path: String, value: Value) {
    match flat.get_mut(&path) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            flat.insert(path, value);
        }
    }
}
