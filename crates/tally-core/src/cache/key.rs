use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Cache key over (model spec, payload, options). Options are serialized through a
/// `BTreeMap` so two option objects with the same entries hash identically
/// regardless of insertion order.
pub fn cache_key(model: &str, payload: &str, options: &serde_json::Value) -> String {
    let mut h = Sha256::new();
    h.update(model.as_bytes());
    h.update(b"\n");
    h.update(payload.as_bytes());
    h.update(b"\n");
    h.update(canonical_options(options).as_bytes());
    hex::encode(h.finalize())
}

fn canonical_options(options: &serde_json::Value) -> String {
    fn sort(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(options).to_string()
}
