//! Explicit state shared by the pull, push, conflict and scan phases.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use vaultsync_common::{ContentHash, DeviceId, Result, VaultPath};
use vaultsync_storage::{LocalFs, RemoteFile, RemoteStore};

use crate::config::SyncConfig;
use crate::lock::LockManager;
use crate::notify::{Notifier, NotifyEvent, SyncTrigger};
use crate::retry::RetryExecutor;

/// Collaborators and settings for one device, passed by reference into
/// every phase function.
///
/// Cloning is cheap; [`SyncContext::with_trigger`] makes a per-pass copy
/// so notifications carry the trigger of the pass that raised them.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<SyncConfig>,
    pub device_id: DeviceId,
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalFs>,
    pub notifier: Arc<dyn Notifier>,
    pub locks: LockManager,
    pub retry: RetryExecutor,
    pub trigger: SyncTrigger,
}

impl SyncContext {
    /// Create a new context.
    pub fn new(
        config: SyncConfig,
        device_id: DeviceId,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalFs>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let locks = LockManager::new(remote.clone(), device_id.clone(), &config)?;
        let retry = RetryExecutor::new(config.retry_config());
        Ok(Self {
            config: Arc::new(config),
            device_id,
            remote,
            local,
            notifier,
            locks,
            retry,
            trigger: SyncTrigger::Manual,
        })
    }

    /// Copy of this context for a pass started by `trigger`.
    pub fn with_trigger(&self, trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            ..self.clone()
        }
    }

    pub fn notify(&self, event: NotifyEvent, detail: Option<&str>) {
        self.notifier.notify(event, self.trigger, detail);
    }

    /// Current remote metadata for a path; None if absent.
    pub async fn remote_metadata(&self, path: &VaultPath) -> Result<Option<RemoteFile>> {
        match self
            .retry
            .execute("get metadata", || self.remote.get_metadata(path))
            .await
        {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn download(&self, id: &str) -> Result<Vec<u8>> {
        self.retry
            .execute("download", || self.remote.download(id))
            .await
    }

    /// Upload content, creating the remote parent folders first.
    pub async fn upload(
        &self,
        path: &VaultPath,
        data: &[u8],
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile> {
        if let Some(parent) = path.parent() {
            if !parent.is_root() {
                self.ensure_folders(std::slice::from_ref(&parent)).await?;
            }
        }
        self.upload_file(path, data, modified, existing_id).await
    }

    /// Upload content whose remote parent folders already exist.
    pub async fn upload_file(
        &self,
        path: &VaultPath,
        data: &[u8],
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile> {
        self.retry
            .execute("upload", || {
                self.remote.upload(path, data.to_vec(), modified, existing_id)
            })
            .await
    }

    /// Delete a remote object; an already missing object is not an error.
    pub async fn delete_remote(&self, id: &str) -> Result<()> {
        match self
            .retry
            .execute("delete", || self.remote.delete(id))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn ensure_folders(&self, paths: &[VaultPath]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.retry
            .execute("ensure folders", || self.remote.ensure_folders_exist(paths))
            .await
    }

    /// Local content of a file; None if absent.
    pub async fn read_local(&self, path: &VaultPath) -> Result<Option<Vec<u8>>> {
        match self.local.read_binary(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether the path takes part in synchronization.
    pub fn is_synced_path(&self, path: &VaultPath) -> bool {
        !path.is_root() && !self.config.is_excluded(path)
    }
}

/// Hash to compare a remote object by, hashing the bytes if the store
/// reports none.
pub fn remote_hash(file: &RemoteFile, data: Option<&[u8]>) -> Option<ContentHash> {
    file.effective_hash()
        .cloned()
        .or_else(|| data.map(ContentHash::of))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the engine tests.

    use super::*;
    use crate::notify::RecordingNotifier;
    use std::time::Duration;
    use vaultsync_storage::{MemoryFs, MemoryRemote};

    pub(crate) fn path(s: &str) -> VaultPath {
        VaultPath::parse(s).unwrap()
    }

    /// Configuration with millisecond retry and lock delays.
    pub(crate) fn fast_config() -> SyncConfig {
        SyncConfig {
            retry_initial_delay: Duration::from_millis(1),
            lock_jitter_min: Duration::from_millis(1),
            lock_jitter_max: Duration::from_millis(2),
            ..Default::default()
        }
    }

    pub(crate) struct Fixture {
        pub remote: Arc<MemoryRemote>,
        pub local: Arc<MemoryFs>,
        pub notifier: Arc<RecordingNotifier>,
        pub ctx: SyncContext,
    }

    pub(crate) fn fixture_with(remote: Arc<MemoryRemote>, device: &str) -> Fixture {
        let local = Arc::new(MemoryFs::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = SyncContext::new(
            fast_config(),
            DeviceId::new(device).unwrap(),
            remote.clone(),
            local.clone(),
            notifier.clone(),
        )
        .unwrap();
        Fixture {
            remote,
            local,
            notifier,
            ctx,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryRemote::new()), "device-a")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_upload_creates_parent_folders() {
        let f = fixture();
        let meta = f
            .ctx
            .upload(&path("deep/dir/a.md"), b"x", Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(meta.path, path("deep/dir/a.md"));
        assert_eq!(f.remote.read_file(&path("deep/dir/a.md")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_missing_objects_are_none() {
        let f = fixture();
        assert!(f.ctx.remote_metadata(&path("nope.md")).await.unwrap().is_none());
        assert!(f.ctx.read_local(&path("nope.md")).await.unwrap().is_none());
        f.ctx.delete_remote("no-such-id").await.unwrap();
    }

    #[test]
    fn test_remote_hash_falls_back_to_bytes() {
        let file = RemoteFile {
            id: "1".into(),
            path: path("a.md"),
            size: 1,
            modified: Utc::now(),
            content_hash: None,
            plaintext_hash: None,
            is_folder: false,
        };
        assert_eq!(remote_hash(&file, None), None);
        assert_eq!(remote_hash(&file, Some(b"x")), Some(ContentHash::of(b"x")));
    }

    #[test]
    fn test_with_trigger_keeps_collaborators() {
        let f = fixture();
        let pass = f.ctx.with_trigger(SyncTrigger::Interval);
        assert_eq!(pass.trigger, SyncTrigger::Interval);
        assert_eq!(pass.device_id, f.ctx.device_id);
        pass.notify(NotifyEvent::UpToDate, None);
        assert_eq!(f.notifier.events(), vec![NotifyEvent::UpToDate]);
    }
}
