//! Core sync engine: one device's index plus the pass that reconciles it.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use vaultsync_common::{ContentHash, DeviceId, Error, Result, VaultPath};
use vaultsync_storage::{LocalFs, RemoteFile, RemoteStore};

use crate::config::SyncConfig;
use crate::conflict::with_local_stat;
use crate::context::{remote_hash, SyncContext};
use crate::notify::{Notifier, NotifyEvent, SyncTrigger};
use crate::pull::{self, PullReport};
use crate::push::{self, PushReport};
use crate::scan::{self, FullScanProgress, ScanOutcome, ScanReport};
use crate::state::{FileEntry, PendingMove, SyncIndex};
use crate::store;

/// Parameters of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRequest {
    pub trigger: SyncTrigger,
    /// Run a full-vault scan before pulling.
    pub full_vault_scan: bool,
}

impl PassRequest {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            full_vault_scan: false,
        }
    }

    pub fn with_full_scan(mut self) -> Self {
        self.full_vault_scan = true;
        self
    }

    /// Fold another request into this one: the higher-priority trigger
    /// wins and a requested full scan is kept.
    pub fn merge(self, other: PassRequest) -> Self {
        Self {
            trigger: self.trigger.max(other.trigger),
            full_vault_scan: self.full_vault_scan || other.full_vault_scan,
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub trigger: SyncTrigger,
    pub pull: PullReport,
    pub push: PushReport,
    /// Pulls run after the push to see our own writes echoed back.
    pub confirmation_pulls: usize,
    pub scan: Option<ScanReport>,
    pub duration: Duration,
}

impl PassReport {
    /// Whether the pass changed anything on either side.
    pub fn did_work(&self) -> bool {
        self.pull.did_work() || self.push.did_work()
    }
}

/// A live lease seen in the coordination document.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub path: VaultPath,
    pub holder: DeviceId,
    pub expires_in: Duration,
}

/// Counts describing this device's sync state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub device_id: DeviceId,
    pub tracked: usize,
    pub dirty: usize,
    pub pending_conflicts: usize,
    pub awaiting_confirmation: usize,
    pub locks: Vec<LockInfo>,
}

/// Outcome of rebuilding the index from the remote listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Local files identical to their remote counterpart.
    pub adopted: usize,
    /// Remote files missing locally and written from the remote.
    pub downloaded: usize,
    /// Files differing on the two sides, left for the next pass.
    pub diverged: usize,
    /// Local files the remote does not have, left for the next pass.
    pub local_only: usize,
}

/// Main sync engine for one device.
///
/// The index sits behind a mutex: passes, scans and the `record_*`
/// hooks each take it for their duration.
pub struct SyncEngine {
    ctx: SyncContext,
    index: Mutex<SyncIndex>,
}

impl SyncEngine {
    /// Open the engine, restoring this device's index if one was saved.
    ///
    /// The device id comes from the configuration, else from the saved
    /// index, else is generated.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalFs>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let saved = store::load_local(local.as_ref(), &config.local_index_path()?).await?;
        let device_id = match (&config.device_id, &saved) {
            (Some(id), _) => DeviceId::new(id.clone())?,
            (None, Some(doc)) => doc.device_id.clone(),
            (None, None) => DeviceId::generate(),
        };

        let index = match saved {
            Some(doc) => {
                debug!(entries = doc.index.len(), "Restored local index");
                doc.into_index(device_id.clone())
            }
            None => SyncIndex::new(device_id.clone()),
        };

        info!(device = %device_id, remote = remote.name(), "Sync engine opened");
        let ctx = SyncContext::new(config, device_id, remote, local, notifier)?;
        Ok(Self {
            ctx,
            index: Mutex::new(index),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.ctx.device_id
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Run one pass: pre-warm, pull, push, then confirmation pulls.
    pub async fn run_pass(&self, request: PassRequest) -> Result<PassReport> {
        let ctx = self.ctx.with_trigger(request.trigger);
        let start = Instant::now();
        ctx.notify(NotifyEvent::SyncStarted, None);
        info!(trigger = %request.trigger, full_scan = request.full_vault_scan, "Starting sync pass");

        let mut index = self.index.lock().await;
        let result = self.pass(&ctx, &mut index, request).await;
        if let Err(e) = store::save_local(&ctx, &index).await {
            warn!(error = %e, "Failed to save local index");
        }

        match result {
            Ok(mut report) => {
                report.duration = start.elapsed();
                if report.did_work() {
                    info!(duration = ?report.duration, "Sync pass complete");
                } else {
                    ctx.notify(NotifyEvent::UpToDate, None);
                }
                Ok(report)
            }
            Err(e @ Error::SafetyHalt(_)) => {
                error!(error = %e, "Sync pass halted");
                ctx.notify(NotifyEvent::SafetyHalt, Some(&e.to_string()));
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Sync pass failed");
                ctx.notify(NotifyEvent::SyncFailed, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    async fn pass(
        &self,
        ctx: &SyncContext,
        index: &mut SyncIndex,
        request: PassRequest,
    ) -> Result<PassReport> {
        ctx.ensure_folders(&[ctx.config.sync_folder_path()?]).await?;

        let scan = if request.full_vault_scan {
            match scan::run(ctx, index, None, &AtomicBool::new(false)).await? {
                ScanOutcome::Completed(report) => Some(report),
                ScanOutcome::Paused(_) => None,
            }
        } else {
            None
        };

        let pull = pull::run(ctx, index).await?;
        let push = push::run(ctx, index).await?;

        let mut confirmation_pulls: usize = 0;
        if push.did_work() {
            while confirmation_pulls < ctx.config.post_push_retries as usize {
                confirmation_pulls += 1;
                pull::run(ctx, index).await?;
                if index.awaiting_confirmation_count() == 0 {
                    break;
                }
                debug!(
                    remaining = index.awaiting_confirmation_count(),
                    "Writes not yet confirmed"
                );
            }
        }

        Ok(PassReport {
            trigger: request.trigger,
            pull,
            push,
            confirmation_pulls,
            scan,
            duration: Duration::ZERO,
        })
    }

    /// Start or resume a background full scan.
    pub async fn run_scan(
        &self,
        trigger: SyncTrigger,
        resume: Option<FullScanProgress>,
        interrupt: &AtomicBool,
    ) -> Result<ScanOutcome> {
        let ctx = self.ctx.with_trigger(trigger);
        let mut index = self.index.lock().await;
        let outcome = scan::run(&ctx, &mut index, resume, interrupt).await;
        if let Err(e) = store::save_local(&ctx, &index).await {
            warn!(error = %e, "Failed to save local index");
        }
        outcome
    }

    /// Note that a file was created or modified locally.
    pub async fn record_local_change(&self, path: &VaultPath) {
        if self.ctx.is_synced_path(path) {
            self.index.lock().await.mark_dirty(path.clone());
        }
    }

    /// Note that a file was deleted locally.
    pub async fn record_local_delete(&self, path: &VaultPath) {
        if self.ctx.is_synced_path(path) {
            self.index.lock().await.mark_dirty(path.clone());
        }
    }

    /// Note that a file was renamed locally.
    ///
    /// A tracked file keeps its index entries under the new path and is
    /// moved on the remote by the next push instead of re-uploaded.
    pub async fn record_local_rename(&self, from: &VaultPath, to: &VaultPath) {
        let mut index = self.index.lock().await;
        let from_synced = self.ctx.is_synced_path(from);
        let to_synced = self.ctx.is_synced_path(to);

        if !to_synced {
            if from_synced {
                index.mark_dirty(from.clone());
            }
            return;
        }
        if !from_synced || index.local(from).is_none() {
            index.mark_dirty(to.clone());
            return;
        }

        index.rename(from, to);
        if let Some(entry) = index.local_mut(to) {
            if entry.remote_id.is_some() && entry.pending_move.is_none() {
                entry.pending_move = Some(PendingMove {
                    from_path: from.clone(),
                });
            }
        }
        index.mark_dirty(to.clone());
        debug!(from = %from, to = %to, "Recorded local rename");
    }

    /// Current counts and the leases visible in the coordination document.
    pub async fn status(&self) -> Result<SyncStatus> {
        let snapshot = self.ctx.locks.snapshot().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let locks = snapshot
            .entries()
            .iter()
            .map(|(path, entry)| LockInfo {
                path: path.clone(),
                holder: entry.holder.clone(),
                expires_in: entry.remaining(now),
            })
            .collect();

        let index = self.index.lock().await;
        Ok(SyncStatus {
            device_id: self.ctx.device_id.clone(),
            tracked: index.tracked_count(),
            dirty: index.dirty_set().len(),
            pending_conflicts: index.pending_conflict_count(),
            awaiting_confirmation: index.awaiting_confirmation_count(),
            locks,
        })
    }

    /// Throw the index away and rebuild it from the remote listing.
    ///
    /// Local files identical to the remote are adopted, files only on the
    /// remote are written locally, and everything else is marked dirty for
    /// the next pass. The shared index is published afterwards.
    pub async fn rebuild_index(&self, trigger: SyncTrigger) -> Result<RebuildReport> {
        let ctx = self.ctx.with_trigger(trigger);
        let mut index = self.index.lock().await;
        info!("Rebuilding index from remote listing");

        let mut fresh = SyncIndex::new(ctx.device_id.clone());
        fresh.shared_doc_id = index.shared_doc_id.clone();
        if ctx.remote.capabilities().supports_changes_api {
            fresh.start_page_token = Some(
                ctx.retry
                    .execute("start page token", || ctx.remote.start_page_token())
                    .await?,
            );
        }

        let remote_files: Vec<RemoteFile> = ctx
            .retry
            .execute("list remote", || ctx.remote.list_all())
            .await?
            .into_iter()
            .filter(|f| !f.is_folder && ctx.is_synced_path(&f.path))
            .collect();
        let remote_paths: std::collections::HashSet<VaultPath> =
            remote_files.iter().map(|f| f.path.clone()).collect();

        let concurrency = ctx.config.concurrency.max(1);
        let results: Vec<(VaultPath, Result<Rebuilt>)> = stream::iter(remote_files)
            .map(|remote| {
                let ctx = &ctx;
                async move {
                    let path = remote.path.clone();
                    (path, rebuild_one(ctx, remote).await)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = RebuildReport::default();
        for (path, result) in results {
            let (remote, hash, downloaded) = match result? {
                Rebuilt::Matched { remote, hash } => (remote, hash, false),
                Rebuilt::Downloaded { remote, hash } => (remote, hash, true),
                Rebuilt::Diverged => {
                    fresh.mark_dirty(path);
                    report.diverged += 1;
                    continue;
                }
            };
            let entry = FileEntry::confirmed(&remote, hash);
            let local_entry = with_local_stat(&ctx, &path, entry.clone()).await?;
            fresh.set_shared(path.clone(), entry);
            fresh.set_local(path, local_entry);
            if downloaded {
                report.downloaded += 1;
            } else {
                report.adopted += 1;
            }
        }

        for stat in ctx.local.list().await? {
            if !stat.is_dir && ctx.is_synced_path(&stat.path) && !remote_paths.contains(&stat.path)
            {
                fresh.mark_dirty(stat.path);
                report.local_only += 1;
            }
        }

        *index = fresh;
        store::save_shared(&ctx, &mut index).await?;
        store::save_local(&ctx, &index).await?;

        let detail = format!(
            "{} adopted, {} downloaded, {} diverged, {} local only",
            report.adopted, report.downloaded, report.diverged, report.local_only
        );
        info!(report = %detail, "Index rebuilt");
        ctx.notify(NotifyEvent::IndexRebuilt, Some(&detail));
        Ok(report)
    }
}

enum Rebuilt {
    Matched { remote: RemoteFile, hash: ContentHash },
    Downloaded { remote: RemoteFile, hash: ContentHash },
    Diverged,
}

async fn rebuild_one(ctx: &SyncContext, remote: RemoteFile) -> Result<Rebuilt> {
    let local = ctx.read_local(&remote.path).await?;
    let mut data = None;
    let hash = match remote_hash(&remote, None) {
        Some(hash) => hash,
        None => {
            let bytes = ctx.download(&remote.id).await?;
            let hash = ContentHash::of(&bytes);
            data = Some(bytes);
            hash
        }
    };

    match local {
        Some(bytes) if ContentHash::of(&bytes) == hash => Ok(Rebuilt::Matched { remote, hash }),
        Some(_) => Ok(Rebuilt::Diverged),
        None => {
            let bytes = match data {
                Some(bytes) => bytes,
                None => ctx.download(&remote.id).await?,
            };
            ctx.local.write_binary(&remote.path, &bytes).await?;
            Ok(Rebuilt::Downloaded { remote, hash })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{fast_config, path};
    use crate::notify::RecordingNotifier;
    use crate::state::LastAction;
    use vaultsync_storage::{MemoryFs, MemoryRemote, RemoteCapabilities};

    struct Device {
        engine: SyncEngine,
        local: Arc<MemoryFs>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn device(remote: &Arc<MemoryRemote>, name: &str) -> Device {
        device_with(remote, name, Arc::new(MemoryFs::new())).await
    }

    async fn device_with(remote: &Arc<MemoryRemote>, name: &str, local: Arc<MemoryFs>) -> Device {
        let config = SyncConfig {
            device_id: Some(name.to_string()),
            ..fast_config()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = SyncEngine::open(config, remote.clone(), local.clone(), notifier.clone())
            .await
            .unwrap();
        Device {
            engine,
            local,
            notifier,
        }
    }

    async fn sync(d: &Device) -> PassReport {
        d.engine
            .run_pass(PassRequest::new(SyncTrigger::Manual))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        let b = device(&remote, "device-b").await;

        a.local.put(&path("notes/a.md"), b"hello\n");
        let report = sync(&a).await;
        assert_eq!(report.push.uploaded, 1);
        assert!(report.confirmation_pulls >= 1);

        sync(&b).await;
        assert_eq!(b.local.get(&path("notes/a.md")).unwrap(), b"hello\n");

        b.local.put(&path("notes/a.md"), b"hello again\n");
        sync(&b).await;
        sync(&a).await;
        assert_eq!(a.local.get(&path("notes/a.md")).unwrap(), b"hello again\n");

        let status = a.engine.status().await.unwrap();
        assert_eq!(status.tracked, 1);
        assert_eq!(status.dirty, 0);
        assert_eq!(status.awaiting_confirmation, 0);
        assert!(status.locks.is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_pulls_bounded_by_config() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(MemoryFs::new());
        let config = SyncConfig {
            device_id: Some("device-a".to_string()),
            post_push_retries: 0,
            ..fast_config()
        };
        let engine = SyncEngine::open(
            config,
            remote.clone(),
            local.clone(),
            Arc::new(RecordingNotifier::default()),
        )
        .await
        .unwrap();

        local.put(&path("a.md"), b"x\n");
        let report = engine
            .run_pass(PassRequest::new(SyncTrigger::Manual))
            .await
            .unwrap();
        assert_eq!(report.push.uploaded, 1);
        assert_eq!(report.confirmation_pulls, 0);
    }

    #[tokio::test]
    async fn test_pushed_write_is_confirmed_in_same_pass() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        a.local.put(&path("a.md"), b"x\n");
        sync(&a).await;

        let index = a.engine.index.lock().await;
        let entry = index.local(&path("a.md")).unwrap();
        assert_eq!(entry.last_action, LastAction::Pull);
        assert_eq!(entry.ancestor_hash, Some(ContentHash::of(b"x\n")));
    }

    #[tokio::test]
    async fn test_concurrent_edits_merge() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        let b = device(&remote, "device-b").await;

        a.local.put(&path("a.md"), b"A\nB\nC\n");
        sync(&a).await;
        sync(&b).await;

        a.local.put(&path("a.md"), b"A\nB2\nC\n");
        b.local.put(&path("a.md"), b"A\nB\nC\nD\n");
        sync(&b).await;
        let report = sync(&a).await;
        assert_eq!(report.pull.merged, 1);
        assert_eq!(a.local.get(&path("a.md")).unwrap(), b"A\nB2\nC\nD\n");
        assert!(a.notifier.events().contains(&NotifyEvent::MergeApplied));

        sync(&b).await;
        assert_eq!(b.local.get(&path("a.md")).unwrap(), b"A\nB2\nC\nD\n");
        assert_eq!(remote.read_file(&path("a.md")).unwrap(), b"A\nB2\nC\nD\n");
    }

    #[tokio::test]
    async fn test_unmergeable_creation_forks() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        let b = device(&remote, "device-b").await;

        a.local.put(&path("a.md"), b"mine\n");
        b.local.put(&path("a.md"), b"theirs\n");
        sync(&a).await;
        let report = sync(&b).await;
        assert_eq!(report.pull.forked, 1);
        assert_eq!(b.local.get(&path("a.md")).unwrap(), b"mine\n");

        let copies: Vec<VaultPath> = b
            .local
            .file_paths()
            .into_iter()
            .filter(|p| p.to_string_path().contains("Conflict"))
            .collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(b.local.get(&copies[0]).unwrap(), b"theirs\n");
        assert!(b.notifier.events().contains(&NotifyEvent::ConflictForked));

        sync(&a).await;
        assert_eq!(a.local.get(&copies[0]).unwrap(), b"theirs\n");
    }

    #[tokio::test]
    async fn test_idle_pass_reports_up_to_date() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        sync(&a).await;
        a.notifier.clear();

        let report = sync(&a).await;
        assert!(!report.did_work());
        assert_eq!(a.notifier.events(), vec![NotifyEvent::SyncStarted, NotifyEvent::UpToDate]);
    }

    #[tokio::test]
    async fn test_safety_halt_surfaces() {
        let remote = Arc::new(MemoryRemote::with_capabilities(RemoteCapabilities::default()));
        let a = device(&remote, "device-a").await;
        for i in 0..25 {
            a.local.put(&path(&format!("n{}.md", i)), b"x");
        }
        sync(&a).await;

        remote.put_file(&path(".vaultsync/sync-index.json"), b"{}");
        let err = a
            .engine
            .run_pass(PassRequest::new(SyncTrigger::Interval))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SafetyHalt(_)));
        assert!(a.notifier.events().contains(&NotifyEvent::SafetyHalt));
        assert_eq!(a.local.file_paths().len(), 26);
    }

    #[tokio::test]
    async fn test_local_rename_moves_remote_object() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        a.local.put(&path("old.md"), b"body\n");
        sync(&a).await;
        remote.clear_operations();

        a.local
            .rename(&path("old.md"), &path("archive/new.md"))
            .await
            .unwrap();
        a.engine
            .record_local_rename(&path("old.md"), &path("archive/new.md"))
            .await;
        let report = sync(&a).await;

        assert_eq!(report.push.moved, 1);
        assert_eq!(report.push.uploaded, 0);
        assert!(remote
            .operations()
            .contains(&"move:old.md->archive/new.md".to_string()));
        assert_eq!(remote.read_file(&path("archive/new.md")).unwrap(), b"body\n");
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(MemoryFs::new());
        let config = SyncConfig {
            device_id: None,
            ..fast_config()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let first = SyncEngine::open(config.clone(), remote.clone(), local.clone(), notifier.clone())
            .await
            .unwrap();
        local.put(&path("a.md"), b"a");
        first
            .run_pass(PassRequest::new(SyncTrigger::Startup))
            .await
            .unwrap();
        let id = first.device_id().clone();
        drop(first);

        let second = SyncEngine::open(config, remote.clone(), local.clone(), notifier)
            .await
            .unwrap();
        assert_eq!(second.device_id(), &id);
        let status = second.status().await.unwrap();
        assert_eq!(status.tracked, 1);
        assert_eq!(status.dirty, 0);
    }

    #[tokio::test]
    async fn test_rebuild_index() {
        let remote = Arc::new(MemoryRemote::new());
        let a = device(&remote, "device-a").await;
        remote.put_file(&path("same.md"), b"same");
        remote.put_file(&path("remote-only.md"), b"r");
        remote.put_file(&path("differs.md"), b"remote");
        a.local.put(&path("same.md"), b"same");
        a.local.put(&path("differs.md"), b"local");
        a.local.put(&path("local-only.md"), b"l");

        let report = a.engine.rebuild_index(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.diverged, 1);
        assert_eq!(report.local_only, 1);
        assert_eq!(a.local.get(&path("remote-only.md")).unwrap(), b"r");
        assert!(remote.read_file(&path(".vaultsync/sync-index.json")).is_some());
        assert!(a.notifier.events().contains(&NotifyEvent::IndexRebuilt));

        let status = a.engine.status().await.unwrap();
        assert_eq!(status.tracked, 2);
        assert_eq!(status.dirty, 2);
    }

    #[tokio::test]
    async fn test_pass_request_merge() {
        let merged = PassRequest::new(SyncTrigger::Interval)
            .merge(PassRequest::new(SyncTrigger::Manual))
            .merge(PassRequest::new(SyncTrigger::FileChange).with_full_scan());
        assert_eq!(merged.trigger, SyncTrigger::Manual);
        assert!(merged.full_vault_scan);
    }
}
