//! Remote to local: change feed when the store has one, index diff otherwise.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use vaultsync_common::{ContentHash, Error, Result, VaultPath};
use vaultsync_storage::{RemoteChange, RemoteFile};

use crate::config::SyncConfig;
use crate::conflict::{handle_remote_removal, pull_file_safely, with_local_stat, Resolution};
use crate::context::{remote_hash, SyncContext};
use crate::lock::LockSnapshot;
use crate::notify::NotifyEvent;
use crate::state::{FileEntry, SyncIndex};
use crate::store::{self, RemoteIndex};

/// What a pull did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub downloaded: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub merged: usize,
    pub forked: usize,
    pub deferred: usize,
    pub confirmed: usize,
    pub failed: usize,
}

impl PullReport {
    /// Whether the local vault changed.
    pub fn did_work(&self) -> bool {
        self.downloaded + self.deleted + self.renamed + self.merged + self.forked > 0
    }

    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::AlreadySynced => self.confirmed += 1,
            Resolution::RemoteAccepted | Resolution::Restored => self.downloaded += 1,
            Resolution::Merged { .. } => self.merged += 1,
            Resolution::Forked { .. } => self.forked += 1,
            Resolution::Deferred { .. } => self.deferred += 1,
            Resolution::Removed => self.deleted += 1,
            Resolution::KeptLocal => {}
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} downloaded, {} deleted, {} renamed, {} merged, {} forked",
            self.downloaded, self.deleted, self.renamed, self.merged, self.forked
        )
    }
}

/// Run one pull, choosing the strategy from the remote's capabilities.
pub async fn run(ctx: &SyncContext, index: &mut SyncIndex) -> Result<PullReport> {
    let mut report = if ctx.remote.capabilities().supports_changes_api {
        match index.start_page_token.clone() {
            Some(token) => incremental(ctx, index, token).await?,
            None => {
                let token = ctx
                    .retry
                    .execute("start page token", || ctx.remote.start_page_token())
                    .await?;
                let report = full_diff(ctx, index).await?;
                index.start_page_token = Some(token);
                report
            }
        }
    } else {
        full_diff(ctx, index).await?
    };

    confirm_awaiting(ctx, index, &mut report).await?;
    retry_pending_conflicts(ctx, index, &mut report).await?;

    if report.did_work() {
        info!(report = %report.summary(), "Pull complete");
        ctx.notify(NotifyEvent::PullComplete, Some(&report.summary()));
    }
    Ok(report)
}

/// Refuse to treat an empty remote index as "everything was deleted".
pub fn check_index_safety(config: &SyncConfig, remote: &RemoteIndex, tracked: usize) -> Result<()> {
    if !remote.document.index.is_empty() {
        return Ok(());
    }
    if remote.raw_size > config.empty_index_max_bytes {
        return Err(Error::SafetyHalt(format!(
            "remote index has no entries but is {} bytes",
            remote.raw_size
        )));
    }
    if tracked > config.local_file_safety_threshold {
        return Err(Error::SafetyHalt(format!(
            "remote index is empty while {} files are tracked locally",
            tracked
        )));
    }
    Ok(())
}

async fn incremental(ctx: &SyncContext, index: &mut SyncIndex, token: String) -> Result<PullReport> {
    let mut changes = Vec::new();
    let mut page_token = token;
    let next_start = loop {
        let page = ctx
            .retry
            .execute("changes page", || ctx.remote.changes_page(&page_token))
            .await?;
        changes.extend(page.changes);
        match (page.next_page_token, page.new_start_page_token) {
            (Some(next), _) => page_token = next,
            (None, Some(start)) => break start,
            (None, None) => break page_token,
        }
    };

    let changes = latest_per_file(changes);
    debug!(changes = changes.len(), "Draining change feed");

    let locks = ctx.locks.snapshot().await?;
    let mut report = PullReport::default();
    let mut upserts = Vec::new();

    for change in changes {
        if change.removed {
            let Some(path) = index.path_for_remote_id(&change.file_id) else {
                continue;
            };
            if locks.is_locked_by_other(&path) {
                index.set_pending_conflict(&path, true);
                report.deferred += 1;
                continue;
            }
            match handle_remote_removal(ctx, index, &path).await {
                Ok(resolution) => report.record(&resolution),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to apply remote removal");
                    report.failed += 1;
                }
            }
            continue;
        }

        let Some(file) = change.file else { continue };
        if file.is_folder {
            continue;
        }

        if let Some(old) = index.path_for_remote_id(&file.id) {
            if old != file.path {
                match follow_rename(ctx, index, &old, &file.path).await {
                    Ok(true) => report.renamed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(from = %old, to = %file.path, error = %e, "Failed to apply remote rename");
                        report.failed += 1;
                        continue;
                    }
                }
            }
        }

        if ctx.is_synced_path(&file.path) {
            upserts.push(file);
        }
    }

    apply_upserts(ctx, index, upserts, &locks, &mut report).await?;
    index.start_page_token = Some(next_start);
    Ok(report)
}

/// Keep only the newest change per object, in feed order.
fn latest_per_file(changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    let mut seen = HashSet::new();
    let mut latest: Vec<RemoteChange> = changes
        .into_iter()
        .rev()
        .filter(|c| seen.insert(c.file_id.clone()))
        .collect();
    latest.reverse();
    latest
}

/// Mirror a remote rename locally. Returns whether a local rename happened.
///
/// If the old path has unpushed edits it is left in place and detached
/// from the remote object so it uploads as a new file.
async fn follow_rename(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    old: &VaultPath,
    new: &VaultPath,
) -> Result<bool> {
    if !ctx.is_synced_path(new) {
        handle_remote_removal(ctx, index, old).await?;
        return Ok(false);
    }

    if index.is_dirty(old) {
        debug!(from = %old, to = %new, "Renamed remotely but edited locally, detaching");
        index.remove_shared(old);
        if let Some(entry) = index.local_mut(old) {
            entry.remote_id = None;
            entry.force_push = true;
        }
        return Ok(false);
    }

    if !ctx.local.exists(old).await? || ctx.local.exists(new).await? {
        return Ok(false);
    }

    ctx.local.rename(old, new).await?;
    index.rename(old, new);
    debug!(from = %old, to = %new, "Followed remote rename");
    Ok(true)
}

async fn full_diff(ctx: &SyncContext, index: &mut SyncIndex) -> Result<PullReport> {
    let mut report = PullReport::default();
    let meta = store::shared_index_metadata(ctx).await?;
    let meta_hash = meta.as_ref().and_then(|m| remote_hash(m, None));

    if meta_hash.is_some() && meta_hash == index.shared_doc_hash {
        debug!("Shared index unchanged, skipping diff");
        return Ok(report);
    }

    let remote_index = store::load_shared(ctx, meta).await?;
    check_index_safety(&ctx.config, &remote_index, index.tracked_count())?;

    let entries: BTreeMap<VaultPath, FileEntry> = remote_index
        .document
        .index
        .into_iter()
        .filter(|(path, _)| ctx.is_synced_path(path))
        .collect();
    let locks = ctx.locks.snapshot().await?;

    let mut changed = Vec::new();
    for (path, entry) in &entries {
        let in_sync = index
            .local(path)
            .is_some_and(|local| local.effective_hash() == entry.effective_hash());
        if in_sync {
            index.confirm(path, entry.effective_hash());
            if index.shared(path) != Some(entry) {
                index.set_shared(path.clone(), entry.clone());
            }
        } else if let Some(id) = &entry.remote_id {
            changed.push((path.clone(), id.clone()));
        }
    }

    let vanished: Vec<VaultPath> = index
        .local_entries()
        .iter()
        .filter(|(path, entry)| {
            !entries.contains_key(*path) && entry.remote_id.is_some() && ctx.is_synced_path(path)
        })
        .map(|(path, _)| path.clone())
        .collect();

    let concurrency = ctx.config.concurrency.max(1);
    let resolved: Vec<(VaultPath, Result<Option<RemoteFile>>)> = stream::iter(changed)
        .map(|(path, id)| async move {
            let meta = current_metadata(ctx, &path, Some(&id)).await;
            (path, meta)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut upserts = Vec::new();
    for (path, meta) in resolved {
        match meta {
            Ok(Some(file)) if !file.is_folder => upserts.push(file),
            Ok(_) => debug!(path = %path, "Indexed file no longer on remote"),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read remote metadata");
                report.failed += 1;
            }
        }
    }

    for path in vanished {
        if locks.is_locked_by_other(&path) {
            index.set_pending_conflict(&path, true);
            report.deferred += 1;
            continue;
        }
        // The index may have lost a concurrent update; trust the store.
        match current_metadata(ctx, &path, None).await {
            Ok(Some(file)) if !file.is_folder => upserts.push(file),
            Ok(_) => match handle_remote_removal(ctx, index, &path).await {
                Ok(resolution) => report.record(&resolution),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to apply remote removal");
                    report.failed += 1;
                }
            },
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read remote metadata");
                report.failed += 1;
            }
        }
    }

    apply_upserts(ctx, index, upserts, &locks, &mut report).await?;

    let stale: Vec<VaultPath> = index
        .shared_entries()
        .keys()
        .filter(|p| !entries.contains_key(*p) && index.local(p).is_none())
        .cloned()
        .collect();
    for path in stale {
        index.remove_shared(&path);
    }

    index.shared_doc_hash = remote_index.doc_hash;
    index.shared_doc_id = remote_index.doc_id;
    Ok(report)
}

async fn current_metadata(
    ctx: &SyncContext,
    path: &VaultPath,
    id: Option<&str>,
) -> Result<Option<RemoteFile>> {
    if let Some(id) = id {
        match ctx
            .retry
            .execute("metadata by id", || ctx.remote.get_metadata_by_id(id))
            .await
        {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    ctx.remote_metadata(path).await
}

/// Confirm our own uploads that the remote now reports back.
///
/// Covers stores without a change feed, where the index document this
/// device just published short-circuits the diff.
async fn confirm_awaiting(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    report: &mut PullReport,
) -> Result<()> {
    let awaiting: Vec<(VaultPath, String)> = index
        .local_entries()
        .iter()
        .filter(|(_, e)| e.awaiting_confirmation() && !e.force_push)
        .filter_map(|(p, e)| e.remote_id.clone().map(|id| (p.clone(), id)))
        .collect();
    if awaiting.is_empty() {
        return Ok(());
    }

    let concurrency = ctx.config.concurrency.max(1);
    let found: Vec<(VaultPath, Result<Option<RemoteFile>>)> = stream::iter(awaiting)
        .map(|(path, id)| async move {
            let meta = match ctx
                .retry
                .execute("metadata by id", || ctx.remote.get_metadata_by_id(&id))
                .await
            {
                Ok(file) => Ok(Some(file)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            };
            (path, meta)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (path, meta) in found {
        if let Some(hash) = meta?.and_then(|file| remote_hash(&file, None)) {
            if index.confirm(&path, &hash) {
                report.confirmed += 1;
            }
        }
    }
    Ok(())
}

/// Re-examine paths whose merge was deferred by another device's lock.
async fn retry_pending_conflicts(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    report: &mut PullReport,
) -> Result<()> {
    let pending: Vec<VaultPath> = index
        .local_entries()
        .iter()
        .filter(|(_, e)| e.pending_conflict)
        .map(|(p, _)| p.clone())
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let locks = ctx.locks.snapshot().await?;
    let mut upserts = Vec::new();
    for path in pending {
        if locks.is_locked_by_other(&path) {
            continue;
        }
        if let Some(file) = ctx.remote_metadata(&path).await? {
            if file.is_folder {
                index.set_pending_conflict(&path, false);
            } else {
                upserts.push(file);
            }
            continue;
        }

        // Nothing at the path any more: the deferred change was a move or a removal.
        let Some(id) = index.local(&path).and_then(|e| e.remote_id.clone()) else {
            index.set_pending_conflict(&path, false);
            continue;
        };
        match current_metadata(ctx, &path, Some(&id)).await? {
            Some(file) if !file.is_folder => match follow_rename(ctx, index, &path, &file.path).await {
                Ok(_) => {
                    index.set_pending_conflict(&path, false);
                    if ctx.is_synced_path(&file.path) {
                        upserts.push(file);
                    }
                }
                Err(e) => {
                    warn!(from = %path, to = %file.path, error = %e, "Failed to apply remote rename");
                    report.failed += 1;
                }
            },
            Some(_) => index.set_pending_conflict(&path, false),
            None => match handle_remote_removal(ctx, index, &path).await {
                Ok(resolution) => report.record(&resolution),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to apply remote removal");
                    report.failed += 1;
                }
            },
        }
    }
    apply_upserts(ctx, index, upserts, &locks, report).await
}

struct Candidate {
    remote: RemoteFile,
    baseline: Option<ContentHash>,
    force_push: bool,
}

enum Fetched {
    Written {
        shared: FileEntry,
        local: FileEntry,
        downloaded: bool,
    },
    NeedsResolution,
}

/// Bring a set of remote upserts down: confirmations and plain downloads
/// run on the worker pool; conflicts are resolved one at a time.
async fn apply_upserts(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    upserts: Vec<RemoteFile>,
    locks: &LockSnapshot,
    report: &mut PullReport,
) -> Result<()> {
    let mut candidates = Vec::new();

    for file in upserts {
        let path = file.path.clone();
        if locks.is_locked_by_other(&path) {
            debug!(path = %path, "Locked by another device, deferring");
            index.set_pending_conflict(&path, true);
            report.deferred += 1;
            continue;
        }

        if let Some(hash) = remote_hash(&file, None) {
            let known = index
                .shared(&path)
                .is_some_and(|e| e.effective_hash() == &hash)
                || index.local(&path).is_some_and(|e| e.effective_hash() == &hash);
            if known {
                if index.confirm(&path, &hash) {
                    report.confirmed += 1;
                }
                let stale_shared = index
                    .shared(&path)
                    .map_or(true, |e| {
                        e.effective_hash() != &hash || e.remote_id.as_deref() != Some(file.id.as_str())
                    });
                if stale_shared {
                    let entry = match index.local(&path) {
                        Some(local) if local.effective_hash() == &hash => FileEntry {
                            remote_id: Some(file.id.clone()),
                            stat_at: None,
                            ..local.clone()
                        },
                        _ => FileEntry::confirmed(&file, hash),
                    };
                    index.set_shared(path.clone(), entry);
                }
                index.set_pending_conflict(&path, false);
                continue;
            }
        }

        let baseline = index.local(&path);
        candidates.push(Candidate {
            baseline: baseline.map(|e| e.effective_hash().clone()),
            force_push: baseline.is_some_and(|e| e.force_push),
            remote: file,
        });
    }

    let concurrency = ctx.config.concurrency.max(1);
    let fetched: Vec<(RemoteFile, Result<Fetched>)> = stream::iter(candidates)
        .map(|candidate| async move {
            let result = fetch_one(ctx, &candidate).await;
            (candidate.remote, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (remote, result) in fetched {
        let path = remote.path.clone();
        match result {
            Ok(Fetched::Written {
                shared,
                local,
                downloaded,
            }) => {
                index.set_shared(path.clone(), shared);
                index.set_local(path.clone(), local);
                index.clear_dirty(&path);
                if downloaded {
                    report.downloaded += 1;
                } else {
                    report.confirmed += 1;
                }
            }
            Ok(Fetched::NeedsResolution) => {
                match pull_file_safely(ctx, index, &path, &remote).await {
                    Ok(resolution) => report.record(&resolution),
                    Err(e @ Error::SafetyHalt(_)) => return Err(e),
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to reconcile file");
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to pull file");
                report.failed += 1;
            }
        }
    }
    Ok(())
}

/// Worker: write remote content if the local side is unchanged or absent.
async fn fetch_one(ctx: &SyncContext, candidate: &Candidate) -> Result<Fetched> {
    let remote = &candidate.remote;
    let path = &remote.path;
    let local = ctx.read_local(path).await?;

    let mut data = None;
    let remote_h = match remote_hash(remote, None) {
        Some(hash) => hash,
        None => {
            let bytes = ctx.download(&remote.id).await?;
            let hash = ContentHash::of(&bytes);
            data = Some(bytes);
            hash
        }
    };

    let downloaded = match &local {
        Some(bytes) => {
            let local_h = ContentHash::of(bytes);
            if local_h == remote_h {
                false
            } else if candidate.baseline.as_ref() == Some(&local_h) && !candidate.force_push {
                true
            } else {
                return Ok(Fetched::NeedsResolution);
            }
        }
        None => true,
    };

    if downloaded {
        let bytes = match data {
            Some(bytes) => bytes,
            None => ctx.download(&remote.id).await?,
        };
        ctx.local.write_binary(path, &bytes).await?;
        debug!(path = %path, size = bytes.len(), "Downloaded");
    }

    let shared = FileEntry::confirmed(remote, remote_h);
    let local = with_local_stat(ctx, path, shared.clone()).await?;
    Ok(Fetched::Written {
        shared,
        local,
        downloaded,
    })
}
