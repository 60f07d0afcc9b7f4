use serde_json::Value;

use crate::error::{ReleaseError, Result};
use crate::model::{ChangeType, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    String,
    Array,
}

impl KeyType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            KeyType::String => value.is_string(),
            KeyType::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            KeyType::String => "a string",
            KeyType::Array => "a list",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RequiredKey {
    key: &'static str,
    key_type: KeyType,
    max_length: Option<usize>,
}

const MODEL_SCHEMA_KEYS: &[RequiredKey] = &[
    RequiredKey {
        key: "model_name",
        key_type: KeyType::String,
        max_length: Some(255),
    },
    RequiredKey {
        key: "fields",
        key_type: KeyType::Array,
        max_length: None,
    },
];

const PAGE_KEYS: &[RequiredKey] = &[RequiredKey {
    key: "page_name",
    key_type: KeyType::String,
    max_length: None,
}];

const PACKAGE_KEYS: &[RequiredKey] = &[RequiredKey {
    key: "package_name",
    key_type: KeyType::String,
    max_length: None,
}];

const FUNCTION_KEYS: &[RequiredKey] = &[RequiredKey {
    key: "function_name",
    key_type: KeyType::String,
    max_length: None,
}];

/// Shape checks applied to syntax before it is staged
pub struct SyntaxValidator;

impl SyntaxValidator {
    fn required_keys(kind: EntityKind) -> &'static [RequiredKey] {
        match kind {
            EntityKind::ModelSchema => MODEL_SCHEMA_KEYS,
            EntityKind::Page => PAGE_KEYS,
            EntityKind::Package => PACKAGE_KEYS,
            EntityKind::Function => FUNCTION_KEYS,
            EntityKind::Workflow => &[],
        }
    }

    /// Validate a payload for staging. DELETE payloads only need to be objects.
    pub fn validate(kind: EntityKind, change_type: ChangeType, syntax: &Value) -> Result<()> {
        let object = syntax.as_object().ok_or_else(|| {
            ReleaseError::Validation(format!("{} syntax must be a JSON object", kind))
        })?;

        if change_type == ChangeType::Delete {
            return Ok(());
        }

        for required in Self::required_keys(kind) {
            let value = object.get(required.key).ok_or_else(|| {
                ReleaseError::Validation(format!("Missing {} key in {} syntax", required.key, kind))
            })?;

            if !required.key_type.matches(value) {
                return Err(ReleaseError::Validation(format!(
                    "{} must be {}",
                    required.key,
                    required.key_type.name()
                )));
            }

            if let (Some(max), Some(text)) = (required.max_length, value.as_str()) {
                if text.chars().count() > max {
                    return Err(ReleaseError::Validation(format!(
                        "{} exceeds {} characters",
                        required.key, max
                    )));
                }
            }
        }

        Ok(())
    }
}
