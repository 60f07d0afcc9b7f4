use serde::{Deserialize, Serialize};

use crate::error::ReleaseError;

/// The closed set of entity kinds whose syntax is versioned by releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    ModelSchema,
    Page,
    Package,
    Workflow,
    Function,
}

impl EntityKind {
    /// Every kind, in the order snapshots are written on publish
    pub const ALL: [EntityKind; 5] = [
        EntityKind::ModelSchema,
        EntityKind::Page,
        EntityKind::Package,
        EntityKind::Workflow,
        EntityKind::Function,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ModelSchema => "model-schema",
            EntityKind::Page => "page",
            EntityKind::Package => "package",
            EntityKind::Workflow => "workflow",
            EntityKind::Function => "function",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model-schema" | "modelschema" | "model_schema" => Ok(EntityKind::ModelSchema),
            "page" => Ok(EntityKind::Page),
            "package" => Ok(EntityKind::Package),
            "workflow" => Ok(EntityKind::Workflow),
            "function" => Ok(EntityKind::Function),
            _ => Err(ReleaseError::InvalidReference(format!(
                "unknown entity kind: {}",
                s
            ))),
        }
    }
}
