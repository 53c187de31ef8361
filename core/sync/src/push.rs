//! Local to remote: upload, delete and move what changed on this device.
//!
//! Every path is checked against the remote right before it is written. If
//! the remote moved on since this device last looked, the path goes
//! through conflict resolution first and only the result is uploaded.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use vaultsync_common::{ContentHash, Error, Result, VaultPath};
use vaultsync_storage::RemoteFile;

use crate::conflict::{pull_file_safely, with_local_stat, Resolution};
use crate::context::{remote_hash, SyncContext};
use crate::lock::LockSnapshot;
use crate::notify::NotifyEvent;
use crate::state::{FileEntry, SyncIndex};
use crate::store;

/// What a push did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub uploaded: usize,
    pub deleted: usize,
    pub moved: usize,
    pub adopted: usize,
    pub merged: usize,
    pub forked: usize,
    pub deferred: usize,
    pub skipped_locked: usize,
    pub failed: usize,
}

impl PushReport {
    /// Whether the remote changed.
    pub fn did_work(&self) -> bool {
        self.uploaded + self.deleted + self.moved > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} uploaded, {} deleted, {} moved, {} merged",
            self.uploaded, self.deleted, self.moved, self.merged
        )
    }
}

/// Run one push and publish the shared index if it changed.
pub async fn run(ctx: &SyncContext, index: &mut SyncIndex) -> Result<PushReport> {
    let mut report = PushReport::default();
    let dirty = collect_dirty(ctx, index).await?;
    if !dirty.is_empty() {
        debug!(paths = dirty.len(), "Pushing dirty paths");
        let locks = ctx.locks.snapshot().await?;
        let forked = push_paths(ctx, index, dirty, &locks, &mut report).await?;
        // Conflict copies created along the way go up in the same pass.
        if !forked.is_empty() {
            push_paths(ctx, index, forked, &locks, &mut report).await?;
        }
    }

    if index.shared_changed() {
        if let Err(e) = store::save_shared(ctx, index).await {
            warn!(error = %e, "Failed to publish shared index, retrying next pass");
        }
    }

    if report.did_work() {
        info!(report = %report.summary(), "Push complete");
        ctx.notify(NotifyEvent::PushComplete, Some(&report.summary()));
    }
    Ok(report)
}

/// Paths needing a push: the recorded dirty set, files whose size or mtime
/// no longer match their baseline, forced entries, pending moves and
/// tracked files that disappeared.
///
/// Racily clean entries are compared by content instead of by stat.
pub async fn collect_dirty(ctx: &SyncContext, index: &SyncIndex) -> Result<BTreeSet<VaultPath>> {
    let mut dirty: BTreeSet<VaultPath> = index.dirty_set().clone();
    let listing = ctx.local.list().await?;
    let mut present = HashSet::new();

    for stat in listing {
        if stat.is_dir || !ctx.is_synced_path(&stat.path) {
            continue;
        }
        let changed = match index.local(&stat.path) {
            None => true,
            Some(entry) if !entry.stat_matches(stat.size, stat.modified) => true,
            Some(entry) if entry.is_racily_clean() => match ctx.read_local(&stat.path).await? {
                Some(data) => &ContentHash::of(&data) != entry.effective_hash(),
                None => true,
            },
            Some(_) => false,
        };
        if changed {
            dirty.insert(stat.path.clone());
        }
        present.insert(stat.path);
    }

    for (path, entry) in index.local_entries() {
        if entry.force_push || entry.pending_move.is_some() || !present.contains(path) {
            dirty.insert(path.clone());
        }
    }
    Ok(dirty)
}

struct Prepared {
    path: VaultPath,
    local: Option<Vec<u8>>,
    remote: Option<RemoteFile>,
}

enum Action {
    Upload {
        path: VaultPath,
        data: Vec<u8>,
        hash: ContentHash,
        existing_id: Option<String>,
    },
    Delete {
        path: VaultPath,
        id: String,
    },
}

enum Done {
    Uploaded { remote: RemoteFile, hash: ContentHash },
    Deleted,
}

/// Push a set of paths. Returns conflict copies created while doing so.
async fn push_paths(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    paths: BTreeSet<VaultPath>,
    locks: &LockSnapshot,
    report: &mut PushReport,
) -> Result<BTreeSet<VaultPath>> {
    let mut forked = BTreeSet::new();
    let mut work = Vec::new();
    for path in paths {
        if !ctx.is_synced_path(&path) {
            index.clear_dirty(&path);
            continue;
        }
        if locks.is_locked_by_other(&path) {
            debug!(path = %path, "Locked by another device, push deferred");
            report.skipped_locked += 1;
            continue;
        }
        let remote_id = index.local(&path).and_then(|e| e.remote_id.clone());
        work.push((path, remote_id));
    }

    let concurrency = ctx.config.concurrency.max(1);
    let prepared: Vec<Result<Prepared>> = stream::iter(work)
        .map(|(path, remote_id)| async move { prepare(ctx, path, remote_id).await })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut actions = Vec::new();
    for item in prepared {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Failed to inspect path for push");
                report.failed += 1;
                continue;
            }
        };
        let path = item.path.clone();
        match plan(ctx, index, item, report).await {
            Ok(Planned::Action(action)) => actions.push(action),
            Ok(Planned::Forked(copy)) => {
                forked.insert(copy);
            }
            Ok(Planned::Nothing) => {}
            Err(e @ Error::SafetyHalt(_)) => return Err(e),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to prepare push");
                report.failed += 1;
            }
        }
    }

    if actions.is_empty() {
        return Ok(forked);
    }

    let folders: BTreeSet<VaultPath> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Upload { path, .. } => Some(path.ancestors()),
            Action::Delete { .. } => None,
        })
        .flatten()
        .collect();
    ctx.ensure_folders(&folders.into_iter().collect::<Vec<_>>())
        .await?;

    let results: Vec<(VaultPath, Result<Done>)> = stream::iter(actions)
        .map(|action| async move { execute(ctx, action).await })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (path, result) in results {
        match result {
            Ok(Done::Uploaded { remote, hash }) => {
                let entry = FileEntry::pushed(&remote, hash, index.local(&path));
                index.set_shared(path.clone(), entry.clone());
                report.uploaded += 1;
                match with_local_stat(ctx, &path, entry.clone()).await {
                    Ok(local) => {
                        index.set_local(path.clone(), local);
                        index.clear_dirty(&path);
                        debug!(path = %path, "Uploaded");
                    }
                    Err(e) => {
                        // The upload stands; restat on the next pass.
                        warn!(path = %path, error = %e, "Uploaded but failed to stat local file");
                        index.set_local(path.clone(), entry);
                        index.mark_dirty(path);
                        report.failed += 1;
                    }
                }
            }
            Ok(Done::Deleted) => {
                index.remove(&path);
                report.deleted += 1;
                debug!(path = %path, "Deleted remotely");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Push failed, will retry");
                index.mark_dirty(path);
                report.failed += 1;
            }
        }
    }
    Ok(forked)
}

/// Worker: read the local file and its current remote metadata.
async fn prepare(ctx: &SyncContext, path: VaultPath, remote_id: Option<String>) -> Result<Prepared> {
    let local = ctx.read_local(&path).await?;
    let by_id = match &remote_id {
        Some(id) => match ctx
            .retry
            .execute("metadata by id", || ctx.remote.get_metadata_by_id(id))
            .await
        {
            Ok(file) => Some(file),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        },
        None => None,
    };
    let remote = match by_id {
        Some(file) => Some(file),
        None => ctx.remote_metadata(&path).await?.filter(|f| !f.is_folder),
    };
    Ok(Prepared { path, local, remote })
}

enum Planned {
    Action(Action),
    Forked(VaultPath),
    Nothing,
}

/// Decide what to do with one path, resolving remote drift inline.
async fn plan(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    item: Prepared,
    report: &mut PushReport,
) -> Result<Planned> {
    let Prepared {
        path,
        local,
        mut remote,
    } = item;
    let entry = index.local(&path).cloned();

    let Some(data) = local else {
        return plan_delete(ctx, index, &path, entry.as_ref(), remote, report).await;
    };
    let hash = ContentHash::of(&data);

    let moved_from = entry
        .as_ref()
        .and_then(|e| e.pending_move.as_ref())
        .map(|m| m.from_path.clone());
    if let Some(from) = &moved_from {
        if let Some(current) = remote.take() {
            remote = Some(if current.path != path {
                debug!(from = %from, to = %path, "Replaying local rename");
                let moved = move_remote(ctx, &current.id, &path).await?;
                report.moved += 1;
                moved
            } else {
                current
            });
        }
        if let Some(e) = index.local_mut(&path) {
            e.pending_move = None;
        }
    }

    let unchanged = entry
        .as_ref()
        .filter(|e| e.effective_hash() == &hash && !e.force_push)
        .filter(|_| moved_from.is_none() || remote.is_some());
    if let Some(e) = unchanged {
        let refreshed = FileEntry {
            pending_move: None,
            ..e.clone()
        };
        let refreshed = with_local_stat(ctx, &path, refreshed).await?;
        index.set_local(path.clone(), refreshed);
        index.clear_dirty(&path);
        return Ok(Planned::Nothing);
    }

    let Some(current) = remote else {
        return Ok(Planned::Action(Action::Upload {
            path,
            data,
            hash,
            existing_id: None,
        }));
    };

    let current_hash = remote_hash(&current, None);
    if current_hash.as_ref() == Some(&hash) {
        let confirmed = FileEntry::confirmed(&current, hash);
        let local_entry = with_local_stat(ctx, &path, confirmed.clone()).await?;
        index.set_shared(path.clone(), confirmed);
        index.set_local(path.clone(), local_entry);
        index.clear_dirty(&path);
        report.adopted += 1;
        debug!(path = %path, "Adopted identical remote file");
        return Ok(Planned::Nothing);
    }

    let expected = index.shared(&path).map(|e| e.effective_hash().clone());
    let drifted = current_hash.is_some() && current_hash != expected;
    if !drifted {
        return Ok(Planned::Action(Action::Upload {
            path,
            data,
            hash,
            existing_id: Some(current.id),
        }));
    }

    debug!(path = %path, "Remote changed since last sync, reconciling before upload");
    match pull_file_safely(ctx, index, &path, &current).await? {
        Resolution::Merged {
            equals_remote: false,
        } => {
            report.merged += 1;
            let Some(merged) = ctx.read_local(&path).await? else {
                return Ok(Planned::Nothing);
            };
            let hash = ContentHash::of(&merged);
            Ok(Planned::Action(Action::Upload {
                path,
                data: merged,
                hash,
                existing_id: Some(current.id),
            }))
        }
        Resolution::Merged { equals_remote: true } => {
            report.merged += 1;
            Ok(Planned::Nothing)
        }
        Resolution::Forked { conflict_path } => {
            report.forked += 1;
            Ok(Planned::Forked(conflict_path))
        }
        Resolution::Deferred { .. } => {
            report.deferred += 1;
            Ok(Planned::Nothing)
        }
        _ => Ok(Planned::Nothing),
    }
}

/// A tracked file vanished locally: delete it remotely unless the remote
/// changed in the meantime, in which case the remote copy is restored.
async fn plan_delete(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    path: &VaultPath,
    entry: Option<&FileEntry>,
    remote: Option<RemoteFile>,
    report: &mut PushReport,
) -> Result<Planned> {
    let (Some(entry), Some(current)) = (entry, remote) else {
        index.remove(path);
        return Ok(Planned::Nothing);
    };
    if entry.remote_id.is_none() {
        index.remove(path);
        return Ok(Planned::Nothing);
    }

    let expected = index.shared(path).map(|e| e.effective_hash().clone());
    let current_hash = remote_hash(&current, None);
    if current_hash.is_some() && current_hash != expected {
        info!(path = %path, "Deleted locally but modified remotely, restoring");
        let resolution = pull_file_safely(ctx, index, path, &current).await?;
        if matches!(resolution, Resolution::Deferred { .. }) {
            report.deferred += 1;
        }
        return Ok(Planned::Nothing);
    }

    Ok(Planned::Action(Action::Delete {
        path: path.clone(),
        id: current.id,
    }))
}

async fn move_remote(ctx: &SyncContext, id: &str, to: &VaultPath) -> Result<RemoteFile> {
    let parent = to.parent().unwrap_or_else(VaultPath::root);
    let name = to
        .name()
        .ok_or_else(|| Error::InvalidInput(format!("Cannot move to {}", to)))?;
    if !parent.is_root() {
        ctx.ensure_folders(std::slice::from_ref(&parent)).await?;
    }
    ctx.retry
        .execute("move", || ctx.remote.move_file(id, name, &parent))
        .await
}

/// Worker: perform one remote write.
async fn execute(ctx: &SyncContext, action: Action) -> (VaultPath, Result<Done>) {
    match action {
        Action::Upload {
            path,
            data,
            hash,
            existing_id,
        } => {
            let modified = match ctx.local.stat(&path).await {
                Ok(Some(stat)) => stat.modified,
                _ => chrono::Utc::now(),
            };
            let result = ctx
                .upload_file(&path, &data, modified, existing_id.as_deref())
                .await
                .map(|remote| Done::Uploaded { remote, hash });
            (path, result)
        }
        Action::Delete { path, id } => {
            let result = ctx.delete_remote(&id).await.map(|_| Done::Deleted);
            (path, result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::state::{LastAction, PendingMove};
    use std::sync::Arc;
    use vaultsync_common::DeviceId;
    use vaultsync_storage::{LocalFs, RemoteStore};

    async fn track(f: &Fixture, index: &mut SyncIndex, p: &str, data: &[u8]) -> FileEntry {
        let p = path(p);
        let meta = f.remote.put_file(&p, data);
        f.local.put(&p, data);
        let stat = f.local.stat(&p).await.unwrap().unwrap();
        let entry = FileEntry::confirmed(&meta, ContentHash::of(data)).with_stat(stat.size, stat.modified);
        index.set_both(p, entry.clone());
        entry
    }

    fn new_index(f: &Fixture) -> SyncIndex {
        SyncIndex::new(f.ctx.device_id.clone())
    }

    #[tokio::test]
    async fn test_new_file_uploaded_and_index_published() {
        let f = fixture();
        let mut index = new_index(&f);
        f.local.put(&path("notes/new.md"), b"hello");

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.remote.read_file(&path("notes/new.md")).unwrap(), b"hello");

        let entry = index.local(&path("notes/new.md")).unwrap();
        assert_eq!(entry.last_action, LastAction::Push);
        assert_eq!(entry.ancestor_hash, None);
        assert!(index.dirty_set().is_empty());
        assert!(f.remote.read_file(&path(".vaultsync/sync-index.json")).is_some());
        assert!(f.remote.read_file(&path(".vaultsync/sync-index-raw.json")).is_some());
        assert!(!index.shared_changed());
    }

    #[tokio::test]
    async fn test_untouched_paths_are_left_alone() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"same").await;
        f.local.put(&path("b.md"), b"new");
        f.remote.clear_operations();

        run(&f.ctx, &mut index).await.unwrap();
        let ops = f.remote.operations();
        assert!(ops.contains(&"upload:b.md".to_string()));
        assert!(!ops.iter().any(|op| op.ends_with(":a.md")));
        assert!(!ops.iter().any(|op| op.starts_with("download:")));
    }

    #[tokio::test]
    async fn test_push_keeps_ancestor() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"v1\n").await;
        f.local.put(&path("a.md"), b"v2\n");

        run(&f.ctx, &mut index).await.unwrap();
        let entry = index.local(&path("a.md")).unwrap();
        assert_eq!(entry.content_hash, ContentHash::of(b"v2\n"));
        assert_eq!(entry.last_action, LastAction::Push);
        assert_eq!(entry.ancestor_hash, Some(ContentHash::of(b"v1\n")));
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"v2\n");
    }

    #[tokio::test]
    async fn test_racily_clean_edit_is_detected() {
        let f = fixture();
        let mut index = new_index(&f);
        let p = path("a.md");
        let meta = f.remote.put_file(&p, b"v1\n");
        f.local.put(&p, b"v1\n");
        f.local.put(&p, b"v2\n");

        // Baseline records v1 with the stat of the same-size v2 write,
        // taken within the same millisecond.
        let stat = f.local.stat(&p).await.unwrap().unwrap();
        let mut entry = FileEntry::confirmed(&meta, ContentHash::of(b"v1\n"))
            .with_stat(stat.size, stat.modified);
        entry.stat_at = Some(stat.modified.timestamp_millis());
        index.set_both(p.clone(), entry.clone());
        assert!(entry.stat_matches(stat.size, stat.modified));
        assert!(entry.is_racily_clean());

        let dirty = collect_dirty(&f.ctx, &index).await.unwrap();
        assert!(dirty.contains(&p));

        // A stat taken after the mtime is trusted without reading content.
        entry.stat_at = Some(stat.modified.timestamp_millis() + 1);
        index.set_both(p.clone(), entry);
        assert!(!collect_dirty(&f.ctx, &index).await.unwrap().contains(&p));
    }

    #[tokio::test]
    async fn test_same_size_edit_after_sync_is_pushed() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"v1\n").await;
        f.local.put(&path("a.md"), b"v2\n");

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"v2\n");
    }

    #[tokio::test]
    async fn test_stat_failure_after_upload_does_not_abort_batch() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"a1").await;
        track(&f, &mut index, "b.md", b"b1").await;
        f.local.put(&path("a.md"), b"a2");
        f.local.put(&path("b.md"), b"b2");
        f.local.fail_stats_for(&path("a.md"));

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"a2");
        assert_eq!(f.remote.read_file(&path("b.md")).unwrap(), b"b2");
        assert!(index.is_dirty(&path("a.md")));
        assert!(!index.is_dirty(&path("b.md")));
        assert_eq!(
            index.shared(&path("a.md")).unwrap().content_hash,
            ContentHash::of(b"a2")
        );
        assert!(f.remote.read_file(&path(".vaultsync/sync-index.json")).is_some());

        // Next pass only refreshes the stat; nothing is uploaded again.
        f.local.clear_failures();
        f.remote.clear_operations();
        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert!(!index.is_dirty(&path("a.md")));
        assert!(!f.remote.operations().contains(&"upload:a.md".to_string()));
    }

    #[tokio::test]
    async fn test_identical_remote_file_is_adopted() {
        let f = fixture();
        let mut index = new_index(&f);
        f.remote.put_file(&path("a.md"), b"twin");
        f.local.put(&path("a.md"), b"twin");
        f.remote.clear_operations();

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.uploaded, 0);
        assert!(!f.remote.operations().contains(&"upload:a.md".to_string()));
        assert_eq!(index.local(&path("a.md")).unwrap().last_action, LastAction::Pull);
    }

    #[tokio::test]
    async fn test_local_delete_removes_remote() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "gone.md", b"bye").await;
        f.local.remove(&path("gone.md"));

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(f.remote.read_file(&path("gone.md")).is_none());
        assert!(index.local(&path("gone.md")).is_none());
    }

    #[tokio::test]
    async fn test_delete_of_remotely_modified_file_restores_it() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"v1").await;
        f.remote.put_file(&path("a.md"), b"v2 from elsewhere");
        f.local.remove(&path("a.md"));

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(f.local.get(&path("a.md")).unwrap(), b"v2 from elsewhere");
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"v2 from elsewhere");
    }

    #[tokio::test]
    async fn test_remote_drift_is_merged_before_upload() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"A\nB\nC\n").await;
        f.remote.put_file(&path("a.md"), b"A\nB\nC\nD\n");
        f.local.put(&path("a.md"), b"A\nB2\nC\n");

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"A\nB2\nC\nD\n");
        assert_eq!(f.local.get(&path("a.md")).unwrap(), b"A\nB2\nC\nD\n");

        let entry = index.local(&path("a.md")).unwrap();
        assert_eq!(entry.last_action, LastAction::Push);
        assert_eq!(entry.ancestor_hash, Some(ContentHash::of(b"A\nB\nC\n")));
        assert!(!entry.force_push);
    }

    #[tokio::test]
    async fn test_drifted_binary_forks_and_pushes_copy() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "img.png", b"one").await;
        f.remote.put_file(&path("img.png"), b"two");
        f.local.put(&path("img.png"), b"three");

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.forked, 1);
        assert_eq!(f.local.get(&path("img.png")).unwrap(), b"two");
        let copies: Vec<_> = f
            .remote
            .file_paths()
            .into_iter()
            .filter(|p| p.to_string_path().contains("Conflict"))
            .collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(f.remote.read_file(&copies[0]).unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_locked_path_stays_dirty() {
        let f = fixture();
        let mut index = new_index(&f);
        track(&f, &mut index, "a.md", b"v1").await;
        f.local.put(&path("a.md"), b"v2");
        index.mark_dirty(path("a.md"));

        let other = crate::lock::LockManager::new(
            f.remote.clone() as Arc<dyn RemoteStore>,
            DeviceId::new("device-b").unwrap(),
            &fast_config(),
        )
        .unwrap();
        other.acquire(&path("a.md")).await.unwrap();

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.skipped_locked, 1);
        assert!(index.is_dirty(&path("a.md")));
        assert_eq!(f.remote.read_file(&path("a.md")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_pending_move_replayed() {
        let f = fixture();
        let mut index = new_index(&f);
        let entry = track(&f, &mut index, "old.md", b"body").await;
        f.local.rename(&path("old.md"), &path("dir/new.md")).await.unwrap();
        index.rename(&path("old.md"), &path("dir/new.md"));
        index.local_mut(&path("dir/new.md")).unwrap().pending_move = Some(PendingMove {
            from_path: path("old.md"),
        });
        f.remote.clear_operations();

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.moved, 1);
        assert!(f.remote.operations().contains(&"move:old.md->dir/new.md".to_string()));
        assert!(f.remote.read_file(&path("old.md")).is_none());
        assert_eq!(f.remote.read_file(&path("dir/new.md")).unwrap(), b"body");
        let moved = index.local(&path("dir/new.md")).unwrap();
        assert!(moved.pending_move.is_none());
        assert_eq!(moved.remote_id, entry.remote_id);
    }

    #[tokio::test]
    async fn test_failed_upload_stays_dirty() {
        let f = fixture();
        let mut index = new_index(&f);
        f.local.put(&path("bad.md"), b"x");
        f.local.put(&path("good.md"), b"y");
        f.remote.fail_uploads_for(&path("bad.md"));

        let report = run(&f.ctx, &mut index).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 1);
        assert!(index.is_dirty(&path("bad.md")));
        assert!(index.local(&path("bad.md")).is_none());
    }
}
