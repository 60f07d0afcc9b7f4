use serde_json::{json, Value};

use crate::model::EntityKind;

pub const SEED_RELEASE_LABEL: &str = "0.1.0";
pub const SEED_RELEASE_NOTES: &str = "Initial release";

/// Demo application: a small book rental model with two helper functions
pub fn seed_definitions() -> Vec<(EntityKind, Value)> {
    vec![
        (
            EntityKind::ModelSchema,
            json!({
                "model_name": "Book",
                "fields": [
                    {"field_name": "book_name", "field_type": "text", "required": true},
                    {"field_name": "author", "field_type": "text", "required": true}
                ]
            }),
        ),
        (
            EntityKind::ModelSchema,
            json!({
                "model_name": "Rental",
                "fields": [
                    {"field_name": "book_name", "field_type": "text", "required": true},
                    {"field_name": "loaned_at", "field_type": "datetime", "required": true}
                ]
            }),
        ),
        (EntityKind::Function, json!({"function_name": "Send Email"})),
        (EntityKind::Function, json!({"function_name": "Export as CSV"})),
    ]
}
