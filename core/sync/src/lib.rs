//! VaultSync sync engine
//!
//! Keeps a local vault and a shared remote folder in step across devices:
//! - Pull from the remote change feed or by diffing the shared index
//! - Push dirty paths with optimistic drift checks
//! - Three-way merge of concurrent text edits under a remote lock
//! - Background full-vault scan that can be paused and resumed
//! - A state machine that coalesces overlapping sync requests

pub mod ancestor;
pub mod config;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod lock;
pub mod merge;
pub mod notify;
pub mod orchestrator;
pub mod pull;
pub mod push;
pub mod retry;
pub mod scan;
pub mod state;
pub mod store;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::Resolution;
pub use engine::{LockInfo, PassReport, PassRequest, RebuildReport, SyncEngine, SyncStatus};
pub use lock::{LockManager, LockOutcome, MergeLockEntry};
pub use notify::{NotifyEvent, Notifier, SyncTrigger, TracingNotifier, Verbosity, VisibilityMatrix};
pub use orchestrator::{SyncOrchestrator, SyncState};
pub use pull::PullReport;
pub use push::PushReport;
pub use retry::{RetryConfig, RetryExecutor};
pub use scan::{FullScanProgress, ScanOutcome, ScanReport};
pub use state::{FileEntry, LastAction, SyncIndex};
