use std::cmp::Reverse;

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Keep only the requested top-level sections. An empty selection keeps everything.
pub fn select_extraction_types(doc: &Value, extraction_types: &[String]) -> Value {
    let Value::Object(map) = doc else {
        return doc.clone();
    };
    if extraction_types.is_empty() {
        return doc.clone();
    }

    let selected: Map<String, Value> = extraction_types
        .iter()
        .filter_map(|name| map.get(name).map(|section| (name.clone(), section.clone())))
        .collect();
    Value::Object(selected)
}

/// Remove every field matched by the slash-delimited `patterns`.
///
/// Segments are object keys or array indices; a non-numeric segment applied to an
/// array fans out over every element. Deeper patterns are applied first. Returns the
/// new tree and the number of fields removed; `doc` is left untouched.
pub fn remove_fields(doc: &Value, patterns: &[String]) -> (Value, usize) {
    let mut ordered: Vec<(&String, Vec<&str>)> = patterns
        .iter()
        .map(|pattern| (pattern, segments(pattern)))
        .collect();
    ordered.sort_by_key(|(_, parts)| Reverse(parts.len()));

    let mut current = doc.clone();
    let mut removed_total = 0_usize;
    for (pattern, parts) in ordered {
        if parts.is_empty() {
            warn!(pattern = %pattern, "skipping malformed exclusion pattern");
            continue;
        }
        let (next, removed) = remove_path(&current, &parts);
        if removed == 0 {
            debug!(pattern = %pattern, "exclusion pattern matched nothing");
        }
        current = next;
        removed_total = removed_total.saturating_add(removed);
    }

    debug!(patterns = patterns.len(), removed = removed_total, "applied field exclusions");
    (current, removed_total)
}

fn segments(pattern: &str) -> Vec<&str> {
    pattern.split('/').filter(|part| !part.is_empty()).collect()
}

/// `None` when the segment is a key; `Some(None)` for an all-digit segment too
/// large to address any element.
fn as_index(segment: &str) -> Option<Option<usize>> {
    segment
        .bytes()
        .all(|b| b.is_ascii_digit())
        .then(|| segment.parse().ok())
}

fn without_key(map: &Map<String, Value>, key: &str) -> Map<String, Value> {
    map.iter()
        .filter(|(name, _)| name.as_str() != key)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn remove_path(node: &Value, parts: &[&str]) -> (Value, usize) {
    let Some((&head, rest)) = parts.split_first() else {
        return (node.clone(), 0);
    };

    match node {
        Value::Object(map) => {
            let Some(child) = map.get(head) else {
                return (node.clone(), 0);
            };
            if rest.is_empty() {
                return (Value::Object(without_key(map, head)), 1);
            }
            let (child, removed) = remove_path(child, rest);
            if removed == 0 {
                return (node.clone(), 0);
            }
            let mut rebuilt = map.clone();
            rebuilt.insert(head.to_string(), child);
            (Value::Object(rebuilt), removed)
        }
        Value::Array(items) => match as_index(head) {
            Some(Some(index)) if index < items.len() => {
                if rest.is_empty() {
                    let kept = items
                        .iter()
                        .enumerate()
                        .filter(|(position, _)| *position != index)
                        .map(|(_, item)| item.clone())
                        .collect();
                    return (Value::Array(kept), 1);
                }
                let mut removed = 0;
                let rebuilt = items
                    .iter()
                    .enumerate()
                    .map(|(position, item)| {
                        if position == index {
                            let (item, count) = remove_path(item, rest);
                            removed = count;
                            item
                        } else {
                            item.clone()
                        }
                    })
                    .collect();
                (Value::Array(rebuilt), removed)
            }
            Some(_) => (node.clone(), 0),
            None if rest.is_empty() => {
                let mut removed = 0_usize;
                let rebuilt = items
                    .iter()
                    .map(|item| match item {
                        Value::Object(map) if map.contains_key(head) => {
                            removed = removed.saturating_add(1);
                            Value::Object(without_key(map, head))
                        }
                        other => other.clone(),
                    })
                    .collect();
                (Value::Array(rebuilt), removed)
            }
            None => {
                let mut removed = 0_usize;
                let rebuilt = items
                    .iter()
                    .map(|item| {
                        let (item, count) = remove_path(item, parts);
                        removed = removed.saturating_add(count);
                        item
                    })
                    .collect();
                (Value::Array(rebuilt), removed)
            }
        },
        _ => (node.clone(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patterns(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    fn medications() -> Value {
        json!({"medications": {"medications": [
            {"med_name": "Aspirin", "frequency": "daily"},
            {"med_name": "Ibuprofen", "frequency": "bid"},
            {"med_name": "Metformin"}
        ]}})
    }

    #[test]
    fn wildcard_removes_field_from_every_item() {
        let doc = medications();
        let (filtered, removed) =
            remove_fields(&doc, &patterns(&["/medications/medications/frequency"]));

        assert_eq!(removed, 2);
        for item in filtered["medications"]["medications"]
            .as_array()
            .expect("array")
        {
            assert!(item.get("frequency").is_none());
            assert!(item.get("med_name").is_some());
        }
        assert_eq!(doc, medications(), "input must stay untouched");
    }

    #[test]
    fn numeric_segments_target_one_element() {
        let (filtered, removed) =
            remove_fields(&medications(), &patterns(&["/medications/medications/0/frequency"]));
        assert_eq!(removed, 1);
        let items = filtered["medications"]["medications"].as_array().expect("array");
        assert!(items[0].get("frequency").is_none());
        assert_eq!(items[1]["frequency"], "bid");

        let (filtered, removed) =
            remove_fields(&medications(), &patterns(&["/medications/medications/2"]));
        assert_eq!(removed, 1);
        assert_eq!(filtered["medications"]["medications"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn deeper_patterns_apply_before_their_parents() {
        let doc = json!({"patient_profile": {"name": "Jane", "address": {"city": "Oslo"}}});
        let (filtered, removed) = remove_fields(
            &doc,
            &patterns(&["/patient_profile/address", "/patient_profile/address/city"]),
        );
        assert_eq!(removed, 2);
        assert_eq!(filtered, json!({"patient_profile": {"name": "Jane"}}));
    }

    #[test]
    fn unresolvable_and_malformed_patterns_are_skipped() {
        let doc = medications();
        let (filtered, removed) = remove_fields(
            &doc,
            &patterns(&["", "///", "/allergy/allergies", "/medications/medications/9"]),
        );
        assert_eq!(removed, 0);
        assert_eq!(filtered, doc);
    }

    #[test]
    fn oversized_index_is_never_treated_as_a_key() {
        let huge = "99999999999999999999999";
        let doc = json!({"items": [
            {"99999999999999999999999": 1, "name": "a"},
            {"99999999999999999999999": 2}
        ]});
        let (filtered, removed) = remove_fields(
            &doc,
            &patterns(&[&format!("/items/{huge}"), &format!("/items/{huge}/name")]),
        );
        assert_eq!(removed, 0);
        assert_eq!(filtered, doc);
    }

    #[test]
    fn selection_keeps_only_requested_sections() {
        let doc = json!({"patient_profile": {"name": "Jane"}, "allergy": {}, "extra": 1});
        let selected = select_extraction_types(&doc, &patterns(&["patient_profile", "allergy", "missing"]));
        assert_eq!(selected, json!({"patient_profile": {"name": "Jane"}, "allergy": {}}));
        assert_eq!(select_extraction_types(&doc, &[]), doc);
    }
}
