//! Structural changelog between two versions of an asset.
//!
//! Only the user-editable fields take part: `name`, `description`, `data`,
//! `url`, `labels`, `owners` and `is_deleted`. Identity, timestamps,
//! version, author, probes and the stored changelog are ignored. Inside
//! `data` a leaf may change type; the change is recorded as an update.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::{Asset, Data};
use crate::error::{InvalidError, Result};
use crate::user::User;

/// Kind of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One entry of a changelog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: Vec<String>,
    pub from: Value,
    pub to: Value,
}

impl Change {
    fn new(kind: ChangeKind, path: Vec<String>, from: Value, to: Value) -> Self {
        Self {
            kind,
            path,
            from,
            to,
        }
    }
}

/// Changelog recorded when an asset is soft deleted.
pub fn soft_delete_changelog() -> Vec<Change> {
    vec![Change::new(
        ChangeKind::Delete,
        vec!["is_deleted".to_string()],
        Value::Bool(false),
        Value::Bool(true),
    )]
}

impl Asset {
    /// Changes that turn `self` into `other`. Empty when they are equal in
    /// every diffed field.
    pub fn diff(&self, other: &Asset) -> Vec<Change> {
        let mut changes = Vec::new();

        diff_string("name", &self.name, &other.name, &mut changes);
        diff_string(
            "description",
            &self.description,
            &other.description,
            &mut changes,
        );

        let empty = Data::new();
        let from = self.data.as_ref().unwrap_or(&empty);
        let to = other.data.as_ref().unwrap_or(&empty);
        diff_object(vec!["data".to_string()], from, to, &mut changes);

        diff_string("url", &self.url, &other.url, &mut changes);
        diff_labels(self, other, &mut changes);
        diff_owners(&self.owners, &other.owners, &mut changes);

        if self.is_deleted != other.is_deleted {
            changes.push(Change::new(
                ChangeKind::Update,
                vec!["is_deleted".to_string()],
                Value::Bool(self.is_deleted),
                Value::Bool(other.is_deleted),
            ));
        }

        changes
    }

    /// Replay `changes` onto this asset.
    pub fn apply_changelog(&mut self, changes: &[Change]) -> Result<()> {
        for change in changes {
            let Some((field, rest)) = change.path.split_first() else {
                return Err(changelog_error("empty change path"));
            };
            match field.as_str() {
                "name" => self.name = string_value(&change.to),
                "description" => self.description = string_value(&change.to),
                "url" => self.url = string_value(&change.to),
                "is_deleted" => self.is_deleted = change.to.as_bool().unwrap_or(false),
                "labels" => {
                    let key = rest
                        .first()
                        .ok_or_else(|| changelog_error("label change without key"))?;
                    match change.kind {
                        ChangeKind::Delete => {
                            self.labels.remove(key);
                        }
                        _ => {
                            self.labels.insert(key.clone(), string_value(&change.to));
                        }
                    }
                }
                "owners" => apply_owner_change(&mut self.owners, rest, change)?,
                "data" => {
                    let data = self.data.get_or_insert_with(Data::new);
                    if rest.is_empty() {
                        return Err(changelog_error("data change without path"));
                    }
                    apply_object_change(data, rest, change)?;
                }
                other => return Err(changelog_error(&format!("unknown field {other:?}"))),
            }
        }
        Ok(())
    }
}

fn diff_string(field: &str, from: &str, to: &str, changes: &mut Vec<Change>) {
    if from != to {
        changes.push(Change::new(
            ChangeKind::Update,
            vec![field.to_string()],
            Value::String(from.to_string()),
            Value::String(to.to_string()),
        ));
    }
}

fn diff_labels(from: &Asset, to: &Asset, changes: &mut Vec<Change>) {
    let keys: BTreeSet<&String> = from.labels.keys().chain(to.labels.keys()).collect();
    for key in keys {
        let path = vec!["labels".to_string(), key.clone()];
        match (from.labels.get(key), to.labels.get(key)) {
            (Some(a), Some(b)) if a != b => changes.push(Change::new(
                ChangeKind::Update,
                path,
                Value::String(a.clone()),
                Value::String(b.clone()),
            )),
            (Some(a), None) => changes.push(Change::new(
                ChangeKind::Delete,
                path,
                Value::String(a.clone()),
                Value::Null,
            )),
            (None, Some(b)) => changes.push(Change::new(
                ChangeKind::Create,
                path,
                Value::Null,
                Value::String(b.clone()),
            )),
            _ => {}
        }
    }
}

/// Owners are matched by email, falling back to id for owners without one.
fn owner_key(user: &User) -> (&'static str, &str) {
    if user.email.is_empty() {
        ("id", user.id.as_str())
    } else {
        ("email", user.email.as_str())
    }
}

fn diff_owners(from: &[User], to: &[User], changes: &mut Vec<Change>) {
    let to_keys: BTreeSet<_> = to.iter().map(owner_key).collect();
    let from_keys: BTreeSet<_> = from.iter().map(owner_key).collect();

    for (i, owner) in from.iter().enumerate().rev() {
        let (field, key) = owner_key(owner);
        if !to_keys.contains(&(field, key)) {
            changes.push(Change::new(
                ChangeKind::Delete,
                vec!["owners".to_string(), i.to_string(), field.to_string()],
                Value::String(key.to_string()),
                Value::Null,
            ));
        }
    }
    for (i, owner) in to.iter().enumerate() {
        let (field, key) = owner_key(owner);
        if !from_keys.contains(&(field, key)) {
            changes.push(Change::new(
                ChangeKind::Create,
                vec!["owners".to_string(), i.to_string(), field.to_string()],
                Value::Null,
                Value::String(key.to_string()),
            ));
        }
    }
}

fn diff_value(path: Vec<String>, from: &Value, to: &Value, changes: &mut Vec<Change>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => diff_object(path, a, b, changes),
        (Value::Array(a), Value::Array(b)) => diff_array(path, a, b, changes),
        _ if from != to => changes.push(Change::new(
            ChangeKind::Update,
            path,
            from.clone(),
            to.clone(),
        )),
        _ => {}
    }
}

fn diff_object(
    path: Vec<String>,
    from: &Map<String, Value>,
    to: &Map<String, Value>,
    changes: &mut Vec<Change>,
) {
    let keys: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
    for key in keys {
        let mut child = path.clone();
        child.push(key.clone());
        match (from.get(key), to.get(key)) {
            (Some(a), Some(b)) => diff_value(child, a, b, changes),
            (Some(a), None) => {
                changes.push(Change::new(ChangeKind::Delete, child, a.clone(), Value::Null))
            }
            (None, Some(b)) => {
                changes.push(Change::new(ChangeKind::Create, child, Value::Null, b.clone()))
            }
            (None, None) => {}
        }
    }
}

fn diff_array(path: Vec<String>, from: &[Value], to: &[Value], changes: &mut Vec<Change>) {
    let common = from.len().min(to.len());
    for i in 0..common {
        let mut child = path.clone();
        child.push(i.to_string());
        diff_value(child, &from[i], &to[i], changes);
    }
    for (i, value) in to.iter().enumerate().skip(common) {
        let mut child = path.clone();
        child.push(i.to_string());
        changes.push(Change::new(
            ChangeKind::Create,
            child,
            Value::Null,
            value.clone(),
        ));
    }
    // highest index first so replay can remove by position
    for i in (common..from.len()).rev() {
        let mut child = path.clone();
        child.push(i.to_string());
        changes.push(Change::new(
            ChangeKind::Delete,
            child,
            from[i].clone(),
            Value::Null,
        ));
    }
}

fn apply_owner_change(owners: &mut Vec<User>, rest: &[String], change: &Change) -> Result<()> {
    let (index, field) = match rest {
        [index, field] => (index, field.as_str()),
        _ => return Err(changelog_error("owner change must be owners.<index>.<field>")),
    };
    let index: usize = index
        .parse()
        .map_err(|_| changelog_error("owner index is not a number"))?;

    match change.kind {
        ChangeKind::Delete => {
            let key = string_value(&change.from);
            owners.retain(|o| owner_key(o) != (owner_field(field), key.as_str()));
        }
        _ => {
            let key = string_value(&change.to);
            let user = match field {
                "id" => User::with_id(key),
                _ => User::with_email(key),
            };
            let at = index.min(owners.len());
            owners.insert(at, user);
        }
    }
    Ok(())
}

fn owner_field(field: &str) -> &'static str {
    if field == "id" {
        "id"
    } else {
        "email"
    }
}

fn apply_object_change(
    object: &mut Map<String, Value>,
    path: &[String],
    change: &Change,
) -> Result<()> {
    let Some((key, rest)) = path.split_first() else {
        return Err(changelog_error("empty data path"));
    };
    if rest.is_empty() {
        match change.kind {
            ChangeKind::Delete => {
                object.remove(key);
            }
            _ => {
                object.insert(key.clone(), change.to.clone());
            }
        }
        return Ok(());
    }
    let child = object
        .get_mut(key)
        .ok_or_else(|| changelog_error(&format!("missing data key {key:?}")))?;
    apply_value_change(child, rest, change)
}

fn apply_value_change(value: &mut Value, path: &[String], change: &Change) -> Result<()> {
    match value {
        Value::Object(object) => apply_object_change(object, path, change),
        Value::Array(items) => {
            let Some((index, rest)) = path.split_first() else {
                return Err(changelog_error("empty data path"));
            };
            let index: usize = index
                .parse()
                .map_err(|_| changelog_error("array index is not a number"))?;
            if rest.is_empty() {
                match change.kind {
                    ChangeKind::Delete if index < items.len() => {
                        items.remove(index);
                    }
                    ChangeKind::Delete => {}
                    _ if index < items.len() => items[index] = change.to.clone(),
                    _ => items.push(change.to.clone()),
                }
                return Ok(());
            }
            let child = items
                .get_mut(index)
                .ok_or_else(|| changelog_error("array index out of range"))?;
            apply_value_change(child, rest, change)
        }
        _ => Err(changelog_error("path descends into a scalar")),
    }
}

fn string_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn changelog_error(message: &str) -> crate::error::CompassError {
    InvalidError::Field {
        field: "changelog".to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn asset(data: Value) -> Asset {
        Asset {
            urn: "urn:x:1".to_string(),
            name: "orders".to_string(),
            data: data.as_object().cloned(),
            ..Default::default()
        }
    }

    fn owner_keys(owners: &[User]) -> BTreeSet<String> {
        owners
            .iter()
            .map(|o| owner_key(o).1.to_string())
            .collect()
    }

    fn assert_round_trip(a: &Asset, b: &Asset) {
        let changes = a.diff(b);
        let mut replayed = a.clone();
        replayed.apply_changelog(&changes).unwrap();
        assert!(replayed.diff(b).is_empty(), "replay left {:?}", replayed.diff(b));
        assert_eq!(owner_keys(&replayed.owners), owner_keys(&b.owners));
    }

    #[test]
    fn test_identical_assets_have_no_changes() {
        let a = asset(json!({"k": 1}));
        let mut b = a.clone();
        b.version = "0.9".to_string();
        b.refreshed_at = Some(chrono::Utc::now());
        b.service = "other".to_string();
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_description_update() {
        let a = asset(json!({}));
        let mut b = a.clone();
        b.description = "new".to_string();
        let changes = a.diff(&b);
        assert_eq!(
            changes,
            vec![Change::new(
                ChangeKind::Update,
                vec!["description".to_string()],
                json!(""),
                json!("new")
            )]
        );
    }

    #[test]
    fn test_data_type_mismatch_is_update() {
        let a = asset(json!({"count": 1}));
        let b = asset(json!({"count": "one"}));
        let changes = a.diff(&b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Update);
        assert_eq!(changes[0].path, vec!["data", "count"]);
        assert_eq!(changes[0].to, json!("one"));
    }

    #[test]
    fn test_nested_data_changes() {
        let a = asset(json!({"columns": [{"name": "a"}, {"name": "b"}], "owner": {"team": "x"}}));
        let b = asset(json!({"columns": [{"name": "a", "type": "int"}], "stats": 3}));
        let changes = a.diff(&b);

        let paths: Vec<String> = changes.iter().map(|c| c.path.join(".")).collect();
        assert!(paths.contains(&"data.columns.0.type".to_string()));
        assert!(paths.contains(&"data.columns.1".to_string()));
        assert!(paths.contains(&"data.owner".to_string()));
        assert!(paths.contains(&"data.stats".to_string()));
        assert_round_trip(&a, &b);
    }

    #[test]
    fn test_array_shrink_round_trip() {
        let a = asset(json!({"tags": ["a", "b", "c", "d"]}));
        let b = asset(json!({"tags": ["a"]}));
        assert_round_trip(&a, &b);
        assert_round_trip(&b, &a);
    }

    #[test]
    fn test_labels_and_owners() {
        let mut a = asset(json!({}));
        a.labels.insert("team".to_string(), "core".to_string());
        a.labels.insert("tier".to_string(), "1".to_string());
        a.owners = vec![User::with_email("a@x.io"), User::with_id("u-2")];

        let mut b = asset(json!({}));
        b.labels.insert("team".to_string(), "growth".to_string());
        b.labels.insert("pii".to_string(), "true".to_string());
        b.owners = vec![User::with_email("c@x.io"), User::with_id("u-2")];

        let changes = a.diff(&b);
        assert!(changes.iter().any(|c| c.path == ["owners", "0", "email"]
            && c.kind == ChangeKind::Delete
            && c.from == json!("a@x.io")));
        assert!(changes.iter().any(|c| c.path == ["owners", "0", "email"]
            && c.kind == ChangeKind::Create
            && c.to == json!("c@x.io")));
        assert!(changes
            .iter()
            .any(|c| c.path == ["labels", "tier"] && c.kind == ChangeKind::Delete));
        assert_round_trip(&a, &b);
    }

    #[test]
    fn test_missing_data_equals_empty_data() {
        let a = asset(json!({}));
        let mut b = a.clone();
        b.data = None;
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_is_deleted_change_and_replay() {
        let a = asset(json!({"k": 1}));
        let mut deleted = a.clone();
        deleted.apply_changelog(&soft_delete_changelog()).unwrap();
        assert!(deleted.is_deleted);
        assert_round_trip(&deleted, &a);
    }

    #[test]
    fn test_apply_rejects_bad_path() {
        let mut a = asset(json!({"k": 1}));
        let bad = Change::new(
            ChangeKind::Update,
            vec!["data".to_string(), "k".to_string(), "deeper".to_string()],
            json!(1),
            json!(2),
        );
        assert!(a.apply_changelog(&[bad]).is_err());
    }
}
