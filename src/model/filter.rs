use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{model_schema_ref, Id};

/// Narrowing applied to a listed entity collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntaxFilter {
    /// Keep only documents bound to this model-schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_schema_id: Option<Id>,

    /// Top-level keys that must equal the given values
    #[serde(default, rename = "where", skip_serializing_if = "Map::is_empty")]
    pub equals: Map<String, Value>,
}

impl SyntaxFilter {
    pub fn for_model_schema(model_schema_id: Id) -> Self {
        Self {
            model_schema_id: Some(model_schema_id),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.equals.insert(key.into(), value);
        self
    }

    pub fn matches(&self, syntax: &Value) -> bool {
        if let Some(schema_id) = &self.model_schema_id {
            if model_schema_ref(syntax).as_ref() != Some(schema_id) {
                return false;
            }
        }

        self.equals
            .iter()
            .all(|(key, expected)| syntax.get(key) == Some(expected))
    }
}
