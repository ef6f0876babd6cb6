//! Partial updates applied onto an existing asset.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use super::model::{Asset, Data};
use super::types::AssetType;
use crate::error::{InvalidError, Result};
use crate::user::User;

/// Maximum nesting followed by [`merge`].
pub const MAX_MERGE_DEPTH: usize = 32;

/// Arrays inside `data` that merge element-wise by an identifier field.
///
/// Keys are dot-joined paths relative to `data` (for example `columns`),
/// values name the field identifying an element (for example `name`).
pub type ArrayMergeRules = BTreeMap<String, String>;

impl Asset {
    /// Apply `patch` onto this asset.
    ///
    /// Scalar fields are replaced, `data` is merged recursively and an empty
    /// string on `labels` or `owners` clears them. Unknown keys are ignored.
    pub fn patch(&mut self, patch: &Map<String, Value>, rules: &ArrayMergeRules) -> Result<()> {
        for (key, value) in patch {
            match key.as_str() {
                "urn" => patch_string(&mut self.urn, value),
                "service" => patch_string(&mut self.service, value),
                "name" => patch_string(&mut self.name, value),
                "description" => patch_string(&mut self.description, value),
                "url" => patch_string(&mut self.url, value),
                "type" => {
                    if let Value::String(s) = value {
                        self.asset_type = AssetType::new(s.as_str());
                    }
                }
                "labels" => self.labels = patch_labels(value)?,
                "owners" => self.owners = patch_owners(value)?,
                "data" => match value {
                    Value::Object(src) => {
                        let mut dst = self.data.take().unwrap_or_default();
                        merge(&mut dst, src, rules)?;
                        self.data = Some(dst);
                    }
                    Value::Null => {}
                    _ => return Err(patch_error("data", "must be an object")),
                },
                _ => {}
            }
        }
        Ok(())
    }
}

fn patch_string(field: &mut String, value: &Value) {
    if let Value::String(s) = value {
        *field = s.clone();
    }
}

fn patch_labels(value: &Value) -> Result<BTreeMap<String, String>> {
    match value {
        Value::String(s) if s.is_empty() => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Ok((k.clone(), other.to_string())),
            })
            .collect(),
        _ => Err(patch_error("labels", "must be an object or an empty string")),
    }
}

fn patch_owners(value: &Value) -> Result<Vec<User>> {
    match value {
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(email) => Ok(User::with_email(email.as_str())),
                Value::Object(_) => serde_json::from_value::<User>(item.clone())
                    .map_err(|e| patch_error("owners", &e.to_string())),
                _ => Err(patch_error("owners", "entries must be objects or emails")),
            })
            .collect(),
        _ => Err(patch_error("owners", "must be a list or an empty string")),
    }
}

/// Recursively merge `src` into `dst`.
///
/// On a key present in both, two objects are merged and anything else is
/// replaced by the source value. Arrays named in `rules` are merged by
/// identifier instead: the source array decides membership and order, and
/// each element is merged with the destination element of the same id.
pub fn merge(dst: &mut Data, src: &Data, rules: &ArrayMergeRules) -> Result<()> {
    merge_at(dst, src, 0, &mut Vec::new(), rules)
}

fn merge_at(
    dst: &mut Data,
    src: &Data,
    depth: usize,
    path: &mut Vec<String>,
    rules: &ArrayMergeRules,
) -> Result<()> {
    if depth > MAX_MERGE_DEPTH {
        return Err(patch_error(
            "data",
            &format!("nesting exceeds {MAX_MERGE_DEPTH} levels"),
        ));
    }

    for (key, src_value) in src {
        path.push(key.clone());
        let merged = match dst.get_mut(key) {
            Some(dst_value) => {
                let identifier = rules.get(&path.join("."));
                match (dst_value, src_value, identifier) {
                    (Value::Array(d), Value::Array(s), Some(id_field)) => {
                        let items = merge_arrays_by_identifier(d, s, id_field, depth, rules)?;
                        Some(Value::Array(items))
                    }
                    (Value::Object(d), Value::Object(s), _) => {
                        merge_at(d, s, depth + 1, path, rules)?;
                        None
                    }
                    _ => Some(src_value.clone()),
                }
            }
            None => Some(src_value.clone()),
        };
        if let Some(value) = merged {
            dst.insert(key.clone(), value);
        }
        path.pop();
    }
    Ok(())
}

fn merge_arrays_by_identifier(
    dst: &[Value],
    src: &[Value],
    id_field: &str,
    depth: usize,
    rules: &ArrayMergeRules,
) -> Result<Vec<Value>> {
    let mut existing: HashMap<&str, &Data> = HashMap::new();
    for item in dst {
        if let Some((object, id)) = identified(item, id_field) {
            existing.insert(id, object);
        }
    }

    let mut result = Vec::with_capacity(src.len());
    for item in src {
        // elements without an identifier cannot be matched and are dropped
        let Some((object, id)) = identified(item, id_field) else {
            continue;
        };
        match existing.get(id) {
            Some(previous) => {
                let mut merged = (*previous).clone();
                merge_at(&mut merged, object, depth + 1, &mut Vec::new(), rules)?;
                result.push(Value::Object(merged));
            }
            None => result.push(Value::Object(object.clone())),
        }
    }
    Ok(result)
}

fn identified<'a>(item: &'a Value, id_field: &str) -> Option<(&'a Data, &'a str)> {
    let object = item.as_object()?;
    let id = object.get(id_field)?.as_str()?;
    if id.is_empty() {
        return None;
    }
    Some((object, id))
}

fn patch_error(field: &str, message: &str) -> crate::error::CompassError {
    InvalidError::Field {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Data {
        value.as_object().cloned().unwrap()
    }

    fn asset() -> Asset {
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "core".to_string());
        Asset {
            urn: "urn:x:1".to_string(),
            name: "orders".to_string(),
            data: Some(object(json!({
                "owner": {"team": "a", "slack": "#a"},
                "columns": [{"name": "id", "type": "int"}, {"name": "ts", "type": "time"}],
                "count": 1
            }))),
            labels,
            owners: vec![User::with_email("a@x.io")],
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_scalars_and_recursive_data() {
        let mut a = asset();
        let patch = object(json!({
            "name": "orders_v2",
            "description": "d",
            "data": {"owner": {"team": "b"}, "count": "many", "new": true},
            "unknown": 1
        }));
        a.patch(&patch, &ArrayMergeRules::new()).unwrap();

        assert_eq!(a.name, "orders_v2");
        assert_eq!(a.description, "d");
        let data = a.data.unwrap();
        assert_eq!(data["owner"], json!({"team": "b", "slack": "#a"}));
        assert_eq!(data["count"], json!("many"));
        assert_eq!(data["new"], json!(true));
        // arrays without a rule are replaced only when patched
        assert_eq!(data["columns"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_patch_clears_labels_and_owners() {
        let mut a = asset();
        a.patch(
            &object(json!({"labels": "", "owners": ""})),
            &ArrayMergeRules::new(),
        )
        .unwrap();
        assert!(a.labels.is_empty());
        assert!(a.owners.is_empty());
    }

    #[test]
    fn test_patch_owners_accepts_emails_and_objects() {
        let mut a = asset();
        a.patch(
            &object(json!({"owners": ["b@x.io", {"id": "u-3", "email": "c@x.io"}]})),
            &ArrayMergeRules::new(),
        )
        .unwrap();
        assert_eq!(a.owners.len(), 2);
        assert_eq!(a.owners[0].email, "b@x.io");
        assert_eq!(a.owners[1].id, "u-3");
    }

    #[test]
    fn test_array_replaced_without_rule() {
        let mut a = asset();
        a.patch(
            &object(json!({"data": {"columns": [{"name": "id", "description": "pk"}]}})),
            &ArrayMergeRules::new(),
        )
        .unwrap();
        assert_eq!(
            a.data.unwrap()["columns"],
            json!([{"name": "id", "description": "pk"}])
        );
    }

    #[test]
    fn test_array_merged_by_identifier() {
        let mut rules = ArrayMergeRules::new();
        rules.insert("columns".to_string(), "name".to_string());

        let mut a = asset();
        a.patch(
            &object(json!({"data": {"columns": [
                {"name": "ts", "description": "event time"},
                {"name": "amount", "type": "float"},
                {"type": "orphan"}
            ]}})),
            &rules,
        )
        .unwrap();
        assert_eq!(
            a.data.unwrap()["columns"],
            json!([
                {"name": "ts", "type": "time", "description": "event time"},
                {"name": "amount", "type": "float"}
            ])
        );
    }

    #[test]
    fn test_merge_depth_cap() {
        let mut deep = json!("leaf");
        for _ in 0..40 {
            deep = json!({ "n": deep });
        }
        let mut dst = object(deep.clone());
        let src = object(deep);
        assert!(merge(&mut dst, &src, &ArrayMergeRules::new()).is_err());
    }

    #[test]
    fn test_patch_rejects_non_object_data() {
        let mut a = asset();
        assert!(a
            .patch(&object(json!({"data": [1, 2]})), &ArrayMergeRules::new())
            .is_err());
    }
}
