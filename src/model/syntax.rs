//! Helpers over raw syntax documents.
//!
//! Syntax stays an untyped JSON object at the engine layer. The only keys the engine itself
//! relies on are `id` and the optional `model_schema_id` foreign reference.

use serde_json::Value;

use crate::model::{parse_id, Id};

pub const ID_KEY: &str = "id";
pub const MODEL_SCHEMA_ID_KEY: &str = "model_schema_id";

pub fn syntax_id(syntax: &Value) -> Option<Id> {
    syntax.get(ID_KEY).and_then(parse_id)
}

pub fn model_schema_ref(syntax: &Value) -> Option<Id> {
    syntax.get(MODEL_SCHEMA_ID_KEY).and_then(parse_id)
}

pub fn set_syntax_id(syntax: &mut Value, id: Id) {
    if let Some(object) = syntax.as_object_mut() {
        object.insert(ID_KEY.to_string(), Value::String(id.to_string()));
    }
}

pub fn set_model_schema_ref(syntax: &mut Value, id: Id) {
    if let Some(object) = syntax.as_object_mut() {
        object.insert(MODEL_SCHEMA_ID_KEY.to_string(), Value::String(id.to_string()));
    }
}

/// Copy the identifying fields of a superseded document onto its replacement.
///
/// The id always wins from `previous`; `model_schema_id` is only filled in when the new
/// document does not set one itself.
pub fn carry_identity(previous: &Value, next: &mut Value) {
    if let Some(id) = syntax_id(previous) {
        set_syntax_id(next, id);
    }
    if model_schema_ref(next).is_none() {
        if let Some(schema_id) = model_schema_ref(previous) {
            set_model_schema_ref(next, schema_id);
        }
    }
}

pub fn find_by_id<'a>(items: &'a [Value], id: &Id) -> Option<&'a Value> {
    items.iter().find(|item| syntax_id(item).as_ref() == Some(id))
}
