//! Canonical JSON rendering used as hash input.
//!
//! Object keys are emitted in sorted order at every depth, with no
//! insignificant whitespace, so two structurally equal values always render
//! to the same bytes regardless of how their maps were built.

use serde_json::Value;

/// Render a JSON value canonically.
pub(crate) fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": 1, "c": 2}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[3,{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut first = Map::new();
        first.insert("metric".into(), json!("cosine"));
        first.insert("eps".into(), json!(0.5));

        let mut second = Map::new();
        second.insert("eps".into(), json!(0.5));
        second.insert("metric".into(), json!("cosine"));

        assert_eq!(
            canonical_json(&Value::Object(first)),
            canonical_json(&Value::Object(second))
        );
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }
}
