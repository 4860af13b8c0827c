//! Internal volume naming
//!
//! The name a volume carries on the array is `prefix + name`, where the prefix
//! comes from the backend's `storagePrefix` setting when that is a usable
//! string and from the orchestrator name otherwise.

use serde_json::Value;

/// Resolve the storage prefix from a parsed `storagePrefix` value.
///
/// Only a non-empty JSON string is used as given. Absent, `null`, empty
/// strings, objects and every other JSON kind fall back to the orchestrator
/// name.
pub fn resolve_storage_prefix(raw: Option<&Value>, orchestrator_name: &str) -> String {
    match raw {
        Some(Value::String(prefix)) if !prefix.is_empty() => prefix.clone(),
        _ => orchestrator_name.to_string(),
    }
}

/// Resolve the storage prefix from unparsed JSON text.
///
/// Malformed JSON falls back to the orchestrator name like any other
/// unusable value.
pub fn resolve_storage_prefix_text(raw: Option<&str>, orchestrator_name: &str) -> String {
    let parsed = raw.and_then(|text| serde_json::from_str::<Value>(text).ok());
    resolve_storage_prefix(parsed.as_ref(), orchestrator_name)
}

/// Derive the array-side name. Pure: equal inputs always give equal output.
pub fn derive_internal_name(prefix: &str, name: &str) -> String {
    if prefix.ends_with('_') || prefix.ends_with('-') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}_{}", prefix, name)
    }
}
