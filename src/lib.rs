pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod service;
pub mod store;

pub use error::{ReleaseError, Result};

// Export logic types
pub use logic::{
    ChangeLog, MigrationPlan, NoopMigrator, Overlay, PageTemplate, PublishEngine, PublishRequest,
    StageOutcome, StageRequest, SyntaxValidator, TableMigrator, TableOperation,
};

// Export all model types
pub use model::*;

pub use service::{ReleaseRef, SyntaxService};

// Export store types
pub use store::{InMemoryStore, PostgresStore, Store};
