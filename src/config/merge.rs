//! Layering of configuration tiers.
//!
//! Each tier is parsed into a JSON value and merged over the tiers below it.
//! Mappings merge key by key; any other value, sequences included, replaces
//! the lower tier's value. A `null` leaves the lower value in place, so an
//! empty `port:` line in YAML does not reset the port.

use serde_json::Value;

/// Merge `overlay` into `base` in place.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        if !value.is_null() {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Merge `overlay` over `base`, returning the result.
///
/// ```
/// use serde_json::json;
/// use trackdb::config::deep_merge;
///
/// let defaults = json!({"server": {"host": "127.0.0.1", "port": 3307}});
/// let project = json!({"server": {"port": 0}});
/// let merged = deep_merge(defaults, project);
/// assert_eq!(merged["server"]["port"], 0);
/// assert_eq!(merged["server"]["host"], "127.0.0.1");
/// ```
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

/// Merge tiers lowest first; later tiers win.
pub fn deep_merge_all(tiers: impl IntoIterator<Item = Value>) -> Value {
    let mut merged = Value::Null;
    for tier in tiers {
        if merged.is_null() {
            merged = tier;
        } else {
            merge_into(&mut merged, tier);
        }
    }
    merged
}
