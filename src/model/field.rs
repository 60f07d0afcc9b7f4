use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReleaseError;

/// One column of a model-schema, as the dynamic-table collaborator sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field_name: String,
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

/// Read the `fields` array of a model-schema document
pub fn fields_of(syntax: &Value) -> Result<Vec<FieldSpec>, ReleaseError> {
    match syntax.get("fields") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(fields) => serde_json::from_value(fields.clone())
            .map_err(|e| ReleaseError::Validation(format!("malformed model-schema fields: {}", e))),
    }
}

pub fn model_name_of(syntax: &Value) -> Option<&str> {
    syntax.get("model_name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fields_of_defaults_required() {
        let syntax = json!({
            "model_name": "Book",
            "fields": [
                {"field_name": "title", "field_type": "text"},
                {"field_name": "author", "field_type": "text", "required": true}
            ]
        });

        let fields = fields_of(&syntax).unwrap();
        assert_eq!(fields.len(), 2);
        assert!(!fields[0].required);
        assert!(fields[1].required);
        assert_eq!(model_name_of(&syntax), Some("Book"));
    }

    #[test]
    fn test_fields_of_rejects_malformed_entries() {
        let syntax = json!({"fields": [{"field_type": "text"}]});
        assert!(matches!(fields_of(&syntax), Err(ReleaseError::Validation(_))));
        assert!(fields_of(&json!({})).unwrap().is_empty());
    }
}
