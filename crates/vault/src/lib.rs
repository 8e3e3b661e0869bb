pub mod config;
pub mod ledger;
pub mod retry;
pub mod sidecar;
pub mod jobs;
pub mod staging;
pub mod remux;
pub mod nfo;
pub mod finalize;
pub mod library;
pub mod probe;
pub mod retention;

pub use config::VaultConfig;
pub use ledger::ArchiveLedger;
pub use jobs::{FsJobLedger, JobLedger, JobStatus};
pub use staging::StagingTranslator;
pub use finalize::{FinalizeContext, FinalizeError, FinalizeReport, Finalizer};
pub use library::{CatalogLibrary, FsDeleter};
pub use probe::DiskProbe;
pub use retention::{Mode, RetentionEngine, RetentionError, RetentionPlan, RetentionRequest};
