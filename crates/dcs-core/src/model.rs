//! JSON algebra for object-model transport.
//!
//! Patches are opaque JSON trees dispatched on top-level keys; typed views
//! of the model belong to clients, not this crate. Patch semantics are JSON
//! Merge Patch (RFC 7396): present keys overwrite, `null` deletes, objects
//! recurse.

use serde_json::{Map, Value};

/// Apply an RFC 7396 merge patch to `base` in place.
pub fn merge_patch(base: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *base = patch.clone();
        return;
    };
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let Value::Object(base_map) = base else {
        unreachable!("base was just coerced to an object");
    };
    for (key, patch_value) in patch_map {
        if patch_value.is_null() {
            base_map.remove(key);
        } else {
            merge_patch(
                base_map.entry(key.clone()).or_insert(Value::Null),
                patch_value,
            );
        }
    }
}

/// Compute the minimum merge patch turning `old` into `new`.
///
/// Returns `None` when the values are equal. Only object values diff
/// recursively; everything else is replaced wholesale, mirroring
/// [`merge_patch`].
pub fn diff_merge_patch(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, old_value) in old_map {
                match new_map.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(child) = diff_merge_patch(old_value, new_value) {
                            patch.insert(key.clone(), child);
                        }
                    }
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// Restrict a snapshot to a set of top-level keys; `None` keeps everything.
pub fn filter_keys(snapshot: &Value, filter: Option<&[String]>) -> Value {
    let Some(keys) = filter else {
        return snapshot.clone();
    };
    let Value::Object(map) = snapshot else {
        return snapshot.clone();
    };
    let mut filtered = Map::new();
    for key in keys {
        if let Some(value) = map.get(key) {
            filtered.insert(key.clone(), value.clone());
        }
    }
    Value::Object(filtered)
}

/// Look up a dotted property path such as `state.status` or
/// `move.axes.0.homed`.
pub fn lookup_path<'a>(model: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = model;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted property path, creating intermediate objects as needed.
/// Fails (returns `false`) when the path traverses through a non-container
/// or indexes an array out of bounds.
pub fn set_path(model: &mut Value, path: &str, value: Value) -> bool {
    let mut current = model;
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok() {
                Some(index) if index < items.len() => &mut items[index],
                _ => return false,
            },
            _ => return false,
        };
    }
    match current {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            true
        }
        Value::Array(items) => match last.parse::<usize>().ok() {
            Some(index) if index < items.len() => {
                items[index] = value;
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_overwrites_deletes_and_recurses() {
        let mut base = json!({"state": {"status": "idle", "upTime": 30}, "heat": {"bed": 60.0}});
        merge_patch(
            &mut base,
            &json!({"state": {"status": "printing"}, "heat": null}),
        );
        assert_eq!(base, json!({"state": {"status": "printing", "upTime": 30}}));
    }

    #[test]
    fn merge_patch_replaces_non_objects_wholesale() {
        let mut base = json!({"axes": [1, 2, 3]});
        merge_patch(&mut base, &json!({"axes": [4]}));
        assert_eq!(base, json!({"axes": [4]}));

        let mut scalar = json!(42);
        merge_patch(&mut scalar, &json!({"a": 1}));
        assert_eq!(scalar, json!({"a": 1}));
    }

    #[test]
    fn diff_produces_the_minimum_patch() {
        let old = json!({"state": {"status": "idle", "upTime": 30}, "heat": {"bed": 60.0}});
        let new = json!({"state": {"status": "printing", "upTime": 30}, "heat": {"bed": 60.0}});
        assert_eq!(
            diff_merge_patch(&old, &new),
            Some(json!({"state": {"status": "printing"}}))
        );
        assert_eq!(diff_merge_patch(&new, &new), None);
    }

    #[test]
    fn diff_then_apply_reconstructs_the_target() {
        let old = json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"});
        let new = json!({"a": {"c": [3]}, "e": {"f": true}});
        let patch = diff_merge_patch(&old, &new).expect("patch");
        let mut applied = old.clone();
        merge_patch(&mut applied, &patch);
        assert_eq!(applied, new);
    }

    #[test]
    fn key_filter_restricts_top_level() {
        let snapshot = json!({"state": {"status": "idle"}, "heat": {"bed": 60.0}});
        let filter = vec!["state".to_string()];
        assert_eq!(
            filter_keys(&snapshot, Some(&filter)),
            json!({"state": {"status": "idle"}})
        );
        assert_eq!(filter_keys(&snapshot, None), snapshot);
    }

    #[test]
    fn path_lookup_and_set() {
        let mut model = json!({"move": {"axes": [{"letter": "X", "homed": false}]}});
        assert_eq!(
            lookup_path(&model, "move.axes.0.letter"),
            Some(&json!("X"))
        );
        assert_eq!(lookup_path(&model, "move.axes.3"), None);

        assert!(set_path(&mut model, "move.axes.0.homed", json!(true)));
        assert_eq!(lookup_path(&model, "move.axes.0.homed"), Some(&json!(true)));

        assert!(set_path(&mut model, "state.status", json!("idle")));
        assert_eq!(lookup_path(&model, "state.status"), Some(&json!("idle")));

        assert!(!set_path(&mut model, "move.axes.9.homed", json!(true)));
    }
}
