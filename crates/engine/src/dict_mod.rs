//! Spec update language.
//!
//! `deep_merge` folds task fragments and `update_spec` documents into a
//! spec. `apply_mod` interprets DictMod-style `mod_spec` documents:
//!
//! ```json
//! {"_push": {"history->relax": "done"}, "_inc": {"attempts": 1}}
//! ```
//!
//! Keys inside an operator are `->`-separated paths into nested objects.

use serde_json::{Map, Value};
use thiserror::Error;

use tasks::Spec;

const PATH_SEPARATOR: &str = "->";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModError {
    #[error("unknown mod operation '{0}'")]
    UnknownOperation(String),

    #[error("mod_spec entry must be an object of operations")]
    Malformed,

    #[error("'{0}' is not an array")]
    NotAnArray(String),

    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error("'{0}' crosses a non-object value")]
    NotAnObject(String),
}

/// Recursively merge `fragment` into `target`: nested objects merge key by
/// key, every other value replaces what was there.
pub fn deep_merge(target: &mut Spec, fragment: &Spec) {
    for (key, incoming) in fragment {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => deep_merge(existing, nested),
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Check a modification without applying it anywhere.
pub fn validate_mod(modification: &Value) -> Result<(), ModError> {
    let ops = modification.as_object().ok_or(ModError::Malformed)?;
    for (op, args) in ops {
        if !matches!(
            op.as_str(),
            "_set" | "_unset" | "_push" | "_push_all" | "_add_to_set" | "_pull" | "_inc"
        ) {
            return Err(ModError::UnknownOperation(op.clone()));
        }
        if !args.is_object() {
            return Err(ModError::Malformed);
        }
    }
    Ok(())
}

/// Apply one `mod_spec` document to `target`.
///
/// On error `target` may be partially modified; callers apply mods to a
/// copy and keep it only when every mod succeeded.
pub fn apply_mod(target: &mut Spec, modification: &Value) -> Result<(), ModError> {
    validate_mod(modification)?;
    let ops = modification.as_object().ok_or(ModError::Malformed)?;

    for (op, args) in ops {
        let Some(args) = args.as_object() else {
            return Err(ModError::Malformed);
        };
        for (path, arg) in args {
            match op.as_str() {
                "_set" => {
                    let (parent, leaf) = walk(target, path, true)?;
                    if let Some(parent) = parent {
                        parent.insert(leaf, arg.clone());
                    }
                }
                "_unset" => {
                    if let (Some(parent), leaf) = walk(target, path, false)? {
                        parent.remove(&leaf);
                    }
                }
                "_push" => array_at(target, path)?.push(arg.clone()),
                "_push_all" => {
                    let items = arg.as_array().ok_or_else(|| ModError::NotAnArray(path.clone()))?;
                    array_at(target, path)?.extend(items.iter().cloned());
                }
                "_add_to_set" => {
                    let array = array_at(target, path)?;
                    if !array.contains(arg) {
                        array.push(arg.clone());
                    }
                }
                "_pull" => array_at(target, path)?.retain(|item| item != arg),
                "_inc" => increment(target, path, arg)?,
                other => return Err(ModError::UnknownOperation(other.to_owned())),
            }
        }
    }
    Ok(())
}

/// Resolve `path` to its parent object and leaf key. With `create`, missing
/// intermediate objects are created; without it a missing parent yields
/// `None`.
fn walk<'a>(
    target: &'a mut Spec,
    path: &str,
    create: bool,
) -> Result<(Option<&'a mut Map<String, Value>>, String), ModError> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    let (leaf, parents) = segments.split_last().ok_or(ModError::Malformed)?;

    let mut current = target;
    for segment in parents {
        if !current.contains_key(*segment) {
            if !create {
                return Ok((None, (*leaf).to_owned()));
            }
            current.insert((*segment).to_owned(), Value::Object(Map::new()));
        }
        current = match current.get_mut(*segment) {
            Some(Value::Object(nested)) => nested,
            _ => return Err(ModError::NotAnObject(path.to_owned())),
        };
    }
    Ok((Some(current), (*leaf).to_owned()))
}

fn array_at<'a>(target: &'a mut Spec, path: &str) -> Result<&'a mut Vec<Value>, ModError> {
    let (parent, leaf) = walk(target, path, true)?;
    let parent = parent.ok_or(ModError::Malformed)?;
    let slot = parent
        .entry(leaf)
        .or_insert_with(|| Value::Array(Vec::new()));
    slot.as_array_mut()
        .ok_or_else(|| ModError::NotAnArray(path.to_owned()))
}

fn increment(target: &mut Spec, path: &str, by: &Value) -> Result<(), ModError> {
    let not_a_number = || ModError::NotANumber(path.to_owned());
    let (parent, leaf) = walk(target, path, true)?;
    let parent = parent.ok_or(ModError::Malformed)?;

    let next = match parent.get(&leaf) {
        None => by.clone(),
        Some(current) => match (current.as_i64(), by.as_i64()) {
            (Some(a), Some(b)) => Value::from(a + b),
            _ => {
                let a = current.as_f64().ok_or_else(not_a_number)?;
                let b = by.as_f64().ok_or_else(not_a_number)?;
                Value::from(a + b)
            }
        },
    };
    if !next.is_number() {
        return Err(not_a_number());
    }
    parent.insert(leaf, next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> Spec {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn deep_merge_merges_objects_and_replaces_scalars() {
        let mut target = spec(json!({ "a": { "x": 1, "y": 2 }, "b": [1], "c": "keep" }));
        deep_merge(&mut target, &spec(json!({ "a": { "y": 3, "z": 4 }, "b": [2] })));
        assert_eq!(
            Value::Object(target),
            json!({ "a": { "x": 1, "y": 3, "z": 4 }, "b": [2], "c": "keep" })
        );
    }

    #[test]
    fn set_and_unset_nested_paths() {
        let mut target = Spec::new();
        apply_mod(&mut target, &json!({ "_set": { "calc->incar->ISPIN": 2 } })).unwrap();
        assert_eq!(target["calc"]["incar"]["ISPIN"], json!(2));

        apply_mod(&mut target, &json!({ "_unset": { "calc->incar->ISPIN": true, "nope->x": true } }))
            .unwrap();
        assert_eq!(Value::Object(target), json!({ "calc": { "incar": {} } }));
    }

    #[test]
    fn array_operations() {
        let mut target = spec(json!({ "tags": ["a"] }));
        apply_mod(&mut target, &json!({ "_push": { "tags": "b" } })).unwrap();
        apply_mod(&mut target, &json!({ "_push_all": { "tags": ["c", "a"] } })).unwrap();
        apply_mod(&mut target, &json!({ "_add_to_set": { "tags": "b" } })).unwrap();
        apply_mod(&mut target, &json!({ "_pull": { "tags": "a" } })).unwrap();
        assert_eq!(target["tags"], json!(["b", "c"]));

        apply_mod(&mut target, &json!({ "_push": { "fresh": 1 } })).unwrap();
        assert_eq!(target["fresh"], json!([1]));
    }

    #[test]
    fn inc_handles_missing_int_and_float() {
        let mut target = spec(json!({ "n": 1, "f": 0.5 }));
        apply_mod(&mut target, &json!({ "_inc": { "n": 2, "f": 1, "m": 7 } })).unwrap();
        assert_eq!(target["n"], json!(3));
        assert_eq!(target["f"], json!(1.5));
        assert_eq!(target["m"], json!(7));
    }

    #[test]
    fn type_mismatches_are_errors() {
        let mut target = spec(json!({ "s": "text", "leaf": 1 }));
        assert_eq!(
            apply_mod(&mut target, &json!({ "_push": { "s": 1 } })),
            Err(ModError::NotAnArray("s".into()))
        );
        assert_eq!(
            apply_mod(&mut target, &json!({ "_inc": { "s": 1 } })),
            Err(ModError::NotANumber("s".into()))
        );
        assert_eq!(
            apply_mod(&mut target, &json!({ "_set": { "leaf->x": 1 } })),
            Err(ModError::NotAnObject("leaf->x".into()))
        );
        assert_eq!(
            validate_mod(&json!({ "_rename": {} })),
            Err(ModError::UnknownOperation("_rename".into()))
        );
    }
}
