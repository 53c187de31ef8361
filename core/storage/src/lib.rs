//! Storage seams for vaultsync.
//!
//! The sync engine talks to two collaborators it does not implement itself:
//! the shared remote object store and the local vault file system. This
//! crate defines both traits and ships implementations of each.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the sync engine
//! - Async operations: all I/O operations are async
//! - Unified error semantics: missing objects are always `Error::NotFound`

pub mod folder;
pub mod local;
pub mod memory;
pub mod remote;

pub use folder::FolderRemote;
pub use local::{DiskFs, LocalFs, LocalStat, TRASH_DIR};
pub use memory::{MemoryFs, MemoryRemote};
pub use remote::{ChangesPage, RemoteCapabilities, RemoteChange, RemoteFile, RemoteStore, Revision};
