//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use vaultsync_common::{Result, VaultPath};
use vaultsync_storage::TRASH_DIR;

use crate::notify::Verbosity;
use crate::retry::RetryConfig;

/// Configuration for the sync engine.
///
/// Passed explicitly at construction; every field has a default so partial
/// JSON files are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Overrides the device identity persisted in the local index.
    pub device_id: Option<String>,
    /// Number of per-file I/O operations run concurrently.
    pub concurrency: usize,
    /// Maximum number of retries for network operations.
    pub max_retries: u32,
    /// Initial backoff delay for network retries.
    #[serde(with = "duration_ms")]
    pub retry_initial_delay: Duration,
    /// Lease length of a merge lock.
    #[serde(with = "duration_ms")]
    pub lock_ttl: Duration,
    /// Attempts made to acquire a merge lock before deferring.
    pub lock_attempts: u32,
    /// Lower bound of the random pause between lock attempts.
    #[serde(with = "duration_ms")]
    pub lock_jitter_min: Duration,
    /// Upper bound of the random pause between lock attempts.
    #[serde(with = "duration_ms")]
    pub lock_jitter_max: Duration,
    /// Confirmation pulls attempted after a push that did work.
    pub post_push_retries: u32,
    /// Patch context margins, in lines, tried widest first.
    pub merge_margins: Vec<usize>,
    /// Remote files examined per background-scan chunk.
    pub scan_chunk_size: usize,
    /// Saved scan progress older than this is discarded.
    #[serde(with = "duration_ms")]
    pub scan_staleness: Duration,
    /// An empty remote index larger than this many bytes is treated as corrupt.
    pub empty_index_max_bytes: usize,
    /// An empty remote index while tracking more local files than this halts the pass.
    pub local_file_safety_threshold: usize,
    /// Gzip the shared index document on upload.
    pub compress_index: bool,
    /// Remote folder holding the shared index and coordination documents.
    pub sync_folder: String,
    /// Local folder holding this device's private index.
    pub local_state_folder: String,
    /// Exclusion patterns: `dir/`, `*.ext` or an exact path.
    pub exclude: Vec<String>,
    /// Extensions (lowercase, no dot) eligible for three-way text merge.
    pub text_extensions: Vec<String>,
    /// How chatty user-facing notifications are.
    pub verbosity: Verbosity,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            concurrency: 4,
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(500),
            lock_ttl: Duration::from_secs(60),
            lock_attempts: 3,
            lock_jitter_min: Duration::from_millis(100),
            lock_jitter_max: Duration::from_millis(600),
            post_push_retries: 2,
            merge_margins: vec![4, 2, 1],
            scan_chunk_size: 50,
            scan_staleness: Duration::from_secs(30 * 60),
            empty_index_max_bytes: 100,
            local_file_safety_threshold: 20,
            compress_index: true,
            sync_folder: ".vaultsync".to_string(),
            local_state_folder: ".vaultsync-local".to_string(),
            exclude: Vec::new(),
            text_extensions: ["md", "txt", "canvas", "json", "css", "js", "csv", "html", "yaml", "yml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            verbosity: Verbosity::Normal,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Retry policy for network-class operations.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries).with_initial_delay(self.retry_initial_delay)
    }

    /// Remote folder with the shared documents.
    pub fn sync_folder_path(&self) -> Result<VaultPath> {
        VaultPath::parse(&self.sync_folder)
    }

    /// Remote path of the shared index document.
    pub fn shared_index_path(&self) -> Result<VaultPath> {
        self.sync_folder_path()?.join("sync-index.json")
    }

    /// Remote path of the uncompressed shared index backup.
    pub fn shared_index_backup_path(&self) -> Result<VaultPath> {
        self.sync_folder_path()?.join("sync-index-raw.json")
    }

    /// Remote path of the coordination document.
    pub fn communication_path(&self) -> Result<VaultPath> {
        self.sync_folder_path()?.join("communication.json")
    }

    /// Local path of this device's private index.
    pub fn local_index_path(&self) -> Result<VaultPath> {
        VaultPath::parse(&self.local_state_folder)?.join("local-index.json")
    }

    /// Whether a path is outside the synchronized set.
    pub fn is_excluded(&self, path: &VaultPath) -> bool {
        let text = path.to_string_path();
        let first = path.components().first().map(String::as_str);
        if first == Some(self.sync_folder.trim_matches('/'))
            || first == Some(self.local_state_folder.trim_matches('/'))
            || first == Some(TRASH_DIR)
        {
            return true;
        }

        self.exclude.iter().any(|pattern| {
            if let Some(ext) = pattern.strip_prefix("*.") {
                path.extension().as_deref() == Some(ext.to_ascii_lowercase().as_str())
            } else if let Some(dir) = pattern.strip_suffix('/') {
                text == dir || text.starts_with(&format!("{}/", dir.trim_start_matches('/')))
            } else {
                text == pattern.trim_start_matches('/')
            }
        })
    }

    /// Whether a path holds text eligible for three-way merge.
    pub fn is_text(&self, path: &VaultPath) -> bool {
        path.extension()
            .is_some_and(|ext| self.text_extensions.iter().any(|t| t == &ext))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> VaultPath {
        VaultPath::parse(s).unwrap()
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"concurrency": 8, "lockTtl": 5}"#).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
        assert_eq!(config.merge_margins, vec![4, 2, 1]);
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let config = SyncConfig::from_json(r#"{"lock_ttl": 1500}"#).unwrap();
        assert_eq!(config.lock_ttl, Duration::from_millis(1500));
    }

    #[test]
    fn test_internal_folders_always_excluded() {
        let config = SyncConfig::default();
        assert!(config.is_excluded(&path(".vaultsync/sync-index.json")));
        assert!(config.is_excluded(&path(".vaultsync-local/local-index.json")));
        assert!(config.is_excluded(&path(".trash/old.md")));
        assert!(!config.is_excluded(&path("notes/a.md")));
    }

    #[test]
    fn test_exclusion_patterns() {
        let config = SyncConfig {
            exclude: vec!["private/".into(), "*.PDF".into(), "todo.md".into()],
            ..Default::default()
        };
        assert!(config.is_excluded(&path("private/x.md")));
        assert!(!config.is_excluded(&path("privateer/x.md")));
        assert!(config.is_excluded(&path("docs/scan.pdf")));
        assert!(config.is_excluded(&path("todo.md")));
        assert!(!config.is_excluded(&path("notes/todo.md")));
    }

    #[test]
    fn test_text_detection() {
        let config = SyncConfig::default();
        assert!(config.is_text(&path("a.md")));
        assert!(config.is_text(&path("board.Canvas")));
        assert!(!config.is_text(&path("photo.png")));
        assert!(!config.is_text(&path("README")));
    }
}
