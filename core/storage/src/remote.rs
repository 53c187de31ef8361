//! Remote object store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultsync_common::{ContentHash, Error, Result, VaultPath};

/// Optional features a remote store may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteCapabilities {
    /// The store exposes a paginated change feed.
    pub supports_changes_api: bool,
    /// The store keeps per-file revision history.
    pub supports_history: bool,
}

/// Metadata for an object held by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Stable identifier; survives renames.
    pub id: String,
    /// Vault-relative path of the object.
    pub path: VaultPath,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Hash of the stored bytes (None for folders).
    pub content_hash: Option<ContentHash>,
    /// Hash of the content before end-to-end encryption, when the payload is encrypted.
    pub plaintext_hash: Option<ContentHash>,
    /// Whether this is a folder.
    pub is_folder: bool,
}

impl RemoteFile {
    /// Hash to compare against local content.
    ///
    /// Prefers the plaintext hash so encrypted payloads compare equal to
    /// their decrypted local copies.
    pub fn effective_hash(&self) -> Option<&ContentHash> {
        self.plaintext_hash.as_ref().or(self.content_hash.as_ref())
    }
}

/// A single record of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Id of the object that changed.
    pub file_id: String,
    /// The object was removed (deleted or trashed).
    pub removed: bool,
    /// Current metadata for upserts.
    pub file: Option<RemoteFile>,
}

/// One page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<RemoteChange>,
    /// Token for the next page; None once the feed is drained.
    pub next_page_token: Option<String>,
    /// Token to resume from on the next pass; set on the last page.
    pub new_start_page_token: Option<String>,
}

/// One stored revision of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub content_hash: ContentHash,
    pub modified: DateTime<Utc>,
}

/// Remote object store shared by every device.
///
/// Implementations handle their own authentication, rate limiting and
/// transport. Missing objects are reported as [`Error::NotFound`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "memory", "folder").
    fn name(&self) -> &str;

    /// Optional features this store supports.
    fn capabilities(&self) -> RemoteCapabilities;

    /// Get metadata for the object at `path`.
    async fn get_metadata(&self, path: &VaultPath) -> Result<RemoteFile>;

    /// Get metadata for the object with the given id.
    async fn get_metadata_by_id(&self, id: &str) -> Result<RemoteFile>;

    /// Download the full content of an object.
    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Create or replace a file.
    ///
    /// When `existing_id` is given the object keeps its id and gains a new
    /// revision; otherwise the object at `path` (if any) is replaced.
    /// Parent folders must already exist.
    async fn upload(
        &self,
        path: &VaultPath,
        data: Vec<u8>,
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile>;

    /// Delete an object by id.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Move and/or rename an object, keeping its id.
    async fn move_file(&self, id: &str, new_name: &str, new_parent: &VaultPath)
        -> Result<RemoteFile>;

    /// List every file (not folder) in the store.
    async fn list_all(&self) -> Result<Vec<RemoteFile>>;

    /// Token marking the current head of the change feed.
    async fn start_page_token(&self) -> Result<String> {
        Err(Error::NotPermitted(format!(
            "{} has no change feed",
            self.name()
        )))
    }

    /// Fetch one page of changes starting at `token`.
    async fn changes_page(&self, _token: &str) -> Result<ChangesPage> {
        Err(Error::NotPermitted(format!(
            "{} has no change feed",
            self.name()
        )))
    }

    /// Revisions of the file at `path`, oldest first.
    async fn list_revisions(&self, _path: &VaultPath) -> Result<Vec<Revision>> {
        Err(Error::NotPermitted(format!(
            "{} keeps no revision history",
            self.name()
        )))
    }

    /// Content of one revision.
    async fn revision_content(&self, _path: &VaultPath, _revision_id: &str) -> Result<Vec<u8>> {
        Err(Error::NotPermitted(format!(
            "{} keeps no revision history",
            self.name()
        )))
    }

    /// Create every folder in `paths` (and their ancestors) if missing.
    async fn ensure_folders_exist(&self, paths: &[VaultPath]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_hash_prefers_plaintext() {
        let mut file = RemoteFile {
            id: "id-1".to_string(),
            path: VaultPath::parse("a.md").unwrap(),
            size: 3,
            modified: Utc::now(),
            content_hash: Some(ContentHash::of(b"cipher")),
            plaintext_hash: None,
            is_folder: false,
        };
        assert_eq!(file.effective_hash(), Some(&ContentHash::of(b"cipher")));

        file.plaintext_hash = Some(ContentHash::of(b"abc"));
        assert_eq!(file.effective_hash(), Some(&ContentHash::of(b"abc")));
    }
}
