//! Metadata containment semantics.
//!
//! A metadata document contains a filter document when every key-value pair
//! in the filter is present and equal in the metadata: objects recurse
//! key-by-key, arrays match when every filter element is contained in some
//! metadata element, scalars compare by equality. An empty filter contains
//! everything.

use serde_json::Value;

/// Structural containment check. Numbers compare by JSON value identity
/// (`1` and `1.0` are distinct).
#[inline]
pub fn contains(metadata: &Value, filter: &Value) -> bool {
    match (metadata, filter) {
        (Value::Object(meta_map), Value::Object(filter_map)) => filter_map
            .iter()
            .all(|(key, expected)| meta_map.get(key).is_some_and(|found| contains(found, expected))),
        (Value::Array(meta_items), Value::Array(filter_items)) => filter_items
            .iter()
            .all(|expected| meta_items.iter().any(|found| contains(found, expected))),
        (found, expected) => found == expected,
    }
}

/// Flatten a document into `(path, value)` pairs for the inverted index:
/// one pair per scalar leaf, object keys joined with `.`, array elements
/// collapsed under a `[]` segment. Matching all of a filter's flattened
/// pairs is necessary but not sufficient for containment (array-of-object
/// filters can match across elements), so index hits are always re-checked
/// with [`contains`].
#[inline]
pub fn flatten_pairs(document: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    flatten_into(document, String::new(), &mut pairs);
    pairs
}

fn flatten_into(value: &Value, path: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten_into(child, child_path, out);
            }
        }
        Value::Array(items) => {
            let child_path = format!("{path}[]");
            for child in items {
                flatten_into(child, child_path.clone(), out);
            }
        }
        scalar => out.push((path, scalar.to_string())),
    }
}
