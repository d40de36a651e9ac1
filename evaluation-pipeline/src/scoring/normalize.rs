use serde_json::Value;

/// Canonical comparable form of a value.
///
/// Strings are trimmed and lowercased, lists keep their order, objects are
/// rendered with sorted keys so key order never affects equality.
pub fn normalize(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string().to_lowercase(),
        Value::String(text) => text.trim().to_lowercase(),
        Value::Array(items) => items.iter().map(normalize).collect::<Vec<_>>().join(", "),
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
            pairs
                .into_iter()
                .map(|(key, nested)| format!("{key}:{}", normalize(nested)))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

/// Human-readable rendering used in mismatch messages and set-valued keys.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
