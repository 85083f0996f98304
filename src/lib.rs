// Event Registry - Core Library
// Batch registration, approval tracking and mirror synchronization, shared by the CLI and the API server

pub mod approval;
pub mod config;
pub mod db;
pub mod error;
pub mod mirror;
pub mod model;
pub mod registrar;
pub mod service;
pub mod sync;

// Re-export commonly used types
pub use approval::ApprovalTracker;
pub use config::{Config, LogConfig, MirrorConfig, ServerConfig, ValidationConfig};
pub use db::{RegistryStore, StatusChange};
pub use error::{MirrorError, MirrorResult, RegistryError, RegistryResult};
pub use mirror::{Mirror, MirrorRecord, NoMirror, SheetMirror};
pub use model::{
    AdminFilter, AdminFilters, AdminRow, GroupStatus, MemberStatus, RawArea, Registrant, Status,
};
pub use registrar::{AreaRule, BatchRegistrar};
pub use service::{RegisterRequest, RegisterResponse, RegistrationService};
pub use sync::{MirrorSynchronizer, PushOutcome, RecoveryOutcome, SyncEvent, SyncHandle};

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the fmt subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));
    // No-op when a subscriber is already installed
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Mirror described by the config: the sheet API when a URL is set, otherwise none.
pub fn build_mirror(config: &MirrorConfig) -> MirrorResult<Arc<dyn Mirror>> {
    let mirror: Arc<dyn Mirror> = match config.url.as_deref() {
        Some(url) => Arc::new(SheetMirror::new(url, config.timeout())?),
        None => Arc::new(NoMirror),
    };
    Ok(mirror)
}
