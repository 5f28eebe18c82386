use tally_core::model::Sample;

/// Text of a field. Strings are taken as-is; other non-null values use their
/// JSON rendering.
pub(crate) fn field_text(sample: &Sample, key: &str) -> Option<String> {
    match sample.field(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Trim and collapse internal whitespace; lowercase unless `case_sensitive`.
pub(crate) fn normalize(s: &str, case_sensitive: bool) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_sensitive {
        collapsed
    } else {
        collapsed.to_lowercase()
    }
}

pub(crate) fn option_bool(options: &serde_json::Value, key: &str, default: bool) -> bool {
    options.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}
