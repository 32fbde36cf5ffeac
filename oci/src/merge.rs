use serde_json::Value;

/// Deep-union merge of two OCI config documents, expressed over the
/// generic JSON tree rather than the typed `RuntimeConfig` so that
/// extension fields the runtime doesn't model pass through unscathed.
///
/// Scalars in `overlay` overwrite `base`. Arrays are concatenated
/// (`base` elements first). Objects are merged recursively.
pub fn merge_configs(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, overlay_value) in overlay {
                let merged = match base.remove(&key) {
                    Some(base_value) => merge_configs(base_value, overlay_value),
                    None => overlay_value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(overlay)) => {
            base.extend(overlay);
            Value::Array(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_overwrite() {
        let base = json!({"cwd": "/", "terminal": false});
        let overlay = json!({"terminal": true});

        assert_eq!(
            merge_configs(base, overlay),
            json!({"cwd": "/", "terminal": true})
        );
    }

    #[test]
    fn test_array_append() {
        let base = json!({"env": ["A=1"]});
        let overlay = json!({"env": ["B=2"]});

        assert_eq!(merge_configs(base, overlay), json!({"env": ["A=1", "B=2"]}));
    }

    #[test]
    fn test_object_recurse() {
        let base = json!({"user": {"uid": 0, "gid": 0}});
        let overlay = json!({"user": {"uid": 1000}});

        assert_eq!(
            merge_configs(base, overlay),
            json!({"user": {"uid": 1000, "gid": 0}})
        );
    }
}
