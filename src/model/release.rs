use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReleaseError;
use crate::model::{generate_id, Id};

/// Lifecycle of a release row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    /// Persisted with its snapshots but not yet visible; publish is still in flight
    Pending,
    /// Immutable and readable
    Active,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Active => "active",
        }
    }
}

impl std::str::FromStr for ReleaseStatus {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReleaseStatus::Pending),
            "active" => Ok(ReleaseStatus::Active),
            _ => Err(ReleaseError::Storage(anyhow::anyhow!(
                "unknown release status: {}",
                s
            ))),
        }
    }
}

/// An immutable, versioned snapshot of the whole application's syntax.
///
/// Releases form a tree through `parent_id`; exactly one active release is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: Id,
    /// Unique human-facing version, e.g. `0.1.0` or `K3Q9Z`
    pub version_label: String,
    pub notes: String,
    pub released_at: DateTime<Utc>,
    /// User id of whoever published the release
    pub released_by: Option<String>,
    pub is_current: bool,
    /// None for a root release
    pub parent_id: Option<Id>,
    pub status: ReleaseStatus,
}

impl Release {
    /// The first release of an application: no parent, active and current
    pub fn new_root(version_label: String, notes: String, released_by: Option<String>) -> Self {
        Self {
            id: generate_id(),
            version_label,
            notes,
            released_at: Utc::now(),
            released_by,
            is_current: true,
            parent_id: None,
            status: ReleaseStatus::Active,
        }
    }

    /// A child of `parent` that is still being published
    pub fn new_pending_child(
        parent: &Release,
        version_label: String,
        notes: String,
        released_by: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            version_label,
            notes,
            released_at: Utc::now(),
            released_by,
            is_current: false,
            parent_id: Some(parent.id),
            status: ReleaseStatus::Pending,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.status == ReleaseStatus::Active
    }
}

/// Active releases arranged by parent link
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseTree {
    /// Ordered by release time
    pub releases: Vec<Release>,
}

impl ReleaseTree {
    pub fn new(mut releases: Vec<Release>) -> Self {
        releases.sort_by_key(|r| r.released_at);
        Self { releases }
    }

    pub fn roots(&self) -> impl Iterator<Item = &Release> {
        self.releases.iter().filter(|r| r.is_root())
    }

    pub fn children(&self, id: &Id) -> impl Iterator<Item = &Release> {
        let id = *id;
        self.releases.iter().filter(move |r| r.parent_id == Some(id))
    }

    pub fn current(&self) -> Option<&Release> {
        self.releases.iter().find(|r| r.is_current)
    }

    /// Indented outline, one release per line, current release starred
    pub fn render(&self) -> String {
        use itertools::Itertools;

        let by_parent = self
            .releases
            .iter()
            .filter_map(|r| r.parent_id.map(|parent| (parent, r)))
            .into_group_map();

        fn walk(
            release: &Release,
            depth: usize,
            by_parent: &std::collections::HashMap<Id, Vec<&Release>>,
            lines: &mut Vec<String>,
        ) {
            lines.push(format!(
                "{}{}{}",
                "  ".repeat(depth),
                release.version_label,
                if release.is_current { " *" } else { "" }
            ));
            for child in by_parent.get(&release.id).into_iter().flatten() {
                walk(child, depth + 1, by_parent, lines);
            }
        }

        let mut lines = Vec::new();
        for root in self.roots() {
            walk(root, 0, &by_parent, &mut lines);
        }
        lines.iter().join("\n")
    }
}
