// Quota Holder - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod api;
pub mod batch;
pub mod commission;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod holder;
pub mod holding;
pub mod logging;
pub mod policy;
pub mod store;
pub mod timeline;

mod sync;

// Re-export commonly used types
pub use api::{dispatch, Request, Response};
pub use batch::{BatchResult, IssueOutcome, Lookup, ProvisionFailure, Rejection};
pub use commission::{
    Commission, CommissionBook, CommissionState, Decision, Provision, Resolution,
};
pub use config::{EngineConfig, ServerConfig, DEFAULT_CONFIG_FILE};
pub use db::{setup_database, SqliteStore};
pub use entity::{
    Authority, Context, Entity, EntityInfo, EntityRegistry, KeyRotation, ListQuery, NewEntity,
};
pub use error::{QuotaError, QuotaResult};
pub use holder::QuotaHolder;
pub use holding::{Holding, HoldingKey, HoldingLedger, HoldingUpdate, QuotaSnapshot, QuotaUpdate};
pub use policy::{quota_policy_name, Flags, Limits, Policy, PolicyLimits, PolicyStore};
pub use store::{Change, MemoryStore, Store, StoredState};
pub use timeline::{write_csv, TimelineEntry, TimelineQuery, OVERRIDE_SERIAL};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
