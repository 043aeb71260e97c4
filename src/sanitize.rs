//! Sanitizing writer - the single choke point in front of every store write.
//!
//! Partial client state must never corrupt the stored document schema, so
//! every write is built here: fields that were never set are omitted from
//! the wire form entirely, fields that became absent are written as an
//! explicit `null` (the store's deletion sentinel), timestamps are
//! canonicalized to RFC 3339 UTC by the chrono serde impls, and a write that
//! would lose a required identity field fails with `MalformedWrite` before
//! anything else happens.

use serde_json::{Map, Value};

use crate::model::UserRecord;
use crate::types::{Result, SyncError};

/// Fields that must be present and non-null in every stored document
const REQUIRED_FIELDS: [&str; 1] = ["external_id"];

/// A sanitized partial update: field name -> new wire value, with `null`
/// meaning "delete this field".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    fields: Map<String, Value>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Build the patch that turns `before` into `after`.
///
/// Only changed fields appear. A field present on `before` but absent on
/// `after` maps to `null`. Fails with `MalformedWrite` if the patch would
/// change or delete a required identity field.
pub fn diff(before: &UserRecord, after: &UserRecord) -> Result<RecordPatch> {
    let before_doc = to_object(before)?;
    let after_doc = to_object(after)?;

    let mut fields = Map::new();
    for (name, after_value) in &after_doc {
        if before_doc.get(name) != Some(after_value) {
            fields.insert(name.clone(), after_value.clone());
        }
    }
    for name in before_doc.keys() {
        if !after_doc.contains_key(name) {
            fields.insert(name.clone(), Value::Null);
        }
    }

    for required in REQUIRED_FIELDS {
        match fields.get(required) {
            None => {}
            Some(Value::Null) => {
                return Err(SyncError::MalformedWrite(format!(
                    "patch deletes required field {required}"
                )));
            }
            Some(_) => {
                return Err(SyncError::MalformedWrite(format!(
                    "patch rewrites immutable field {required}"
                )));
            }
        }
    }
    check_farming_window(&fields)?;

    Ok(RecordPatch { fields })
}

/// Sanitized full document for initial record creation.
pub fn full_document(record: &UserRecord) -> Result<Value> {
    let object = to_object(record)?;
    for required in REQUIRED_FIELDS {
        match object.get(required) {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(SyncError::MalformedWrite(format!(
                    "document missing required field {required}"
                )));
            }
        }
    }
    check_farming_window(&object)?;
    Ok(Value::Object(object))
}

/// Apply a sanitized patch onto a stored document, field by field.
/// `null` deletes; anything else replaces. Untouched fields survive, which
/// is what makes concurrent patches to disjoint fields safe.
pub fn merge_into(document: &mut Value, patch: &RecordPatch) {
    let Some(object) = document.as_object_mut() else {
        return;
    };
    for (name, value) in patch.fields() {
        match value {
            Value::Null => {
                object.remove(name);
            }
            other => {
                object.insert(name.clone(), other.clone());
            }
        }
    }
}

fn to_object(record: &UserRecord) -> Result<Map<String, Value>> {
    match serde_json::to_value(record) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(SyncError::MalformedWrite(
            "record did not serialize to a document".to_string(),
        )),
        Err(e) => Err(SyncError::MalformedWrite(e.to_string())),
    }
}

/// The window travels whole or not at all, even in hand-inspected wire form.
fn check_farming_window(object: &Map<String, Value>) -> Result<()> {
    match object.get("farming_window") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(window)) => {
            if window.contains_key("started_at") && window.contains_key("ends_at") {
                Ok(())
            } else {
                Err(SyncError::MalformedWrite(
                    "farming window missing one of its bounds".to_string(),
                ))
            }
        }
        Some(_) => Err(SyncError::MalformedWrite(
            "farming window is not a document".to_string(),
        )),
    }
}
