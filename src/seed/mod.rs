mod data;

pub use data::*;

use anyhow::{Context, Result};

use crate::config::BootstrapConfig;
use crate::logic::TableMigrator;
use crate::model::{Release, UserContext};
use crate::service::{ReleaseRef, SyntaxService};
use crate::store::traits::Store;

/// Create the root release unless a current release already exists
pub async fn ensure_root_release<S: Store, M: TableMigrator>(
    service: &SyntaxService<S, M>,
    config: &BootstrapConfig,
) -> Result<Release> {
    if let Some(current) = service.current_release().await? {
        log::info!("Current release is {}", current.version_label);
        return Ok(current);
    }

    let release = service
        .create_root_release(
            &config.initial_version,
            &config.initial_notes,
            Some(&UserContext::system()),
        )
        .await
        .context("Failed to create root release")?;
    Ok(release)
}

/// Stage the demo application against the current release and publish it.
/// Does nothing when the seed release already exists.
pub async fn load_seed_data<S: Store, M: TableMigrator>(
    service: &SyntaxService<S, M>,
) -> Result<Option<Release>> {
    if service.store().label_exists(SEED_RELEASE_LABEL).await? {
        log::info!("Seed release {} already present", SEED_RELEASE_LABEL);
        return Ok(None);
    }

    let current = ReleaseRef::Current;
    for (kind, syntax) in seed_definitions() {
        let id = service
            .create(kind, &current, syntax)
            .await
            .with_context(|| format!("Failed to stage seed {}", kind))?;
        log::debug!("Staged seed {} {}", kind, id);
    }

    let release = service
        .publish(
            &current,
            Some(SEED_RELEASE_LABEL),
            SEED_RELEASE_NOTES,
            Some(&UserContext::system()),
        )
        .await
        .context("Failed to publish seed release")?;
    log::info!("Published seed release {}", release.version_label);
    Ok(Some(release))
}
