//! Reconciling a path that changed remotely, possibly also locally.
//!
//! Per conflicted path the flow is lock, resolve base, merge, validate and
//! commit. Any failure along the way falls back to a fork: the local copy
//! is renamed to a conflict file and the remote content takes the primary
//! path. Divergent content is never silently overwritten.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vaultsync_common::{ContentHash, DeviceId, Result, VaultPath};
use vaultsync_storage::RemoteFile;

use crate::ancestor::{resolve_base, BaseHints};
use crate::context::{remote_hash, SyncContext};
use crate::lock::LockOutcome;
use crate::merge::three_way_merge;
use crate::notify::NotifyEvent;
use crate::state::{FileEntry, LastAction, SyncIndex};

/// How a path was reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local and remote content were already identical.
    AlreadySynced,
    /// Local was unchanged (or missing and untracked); remote content written.
    RemoteAccepted,
    /// Local had been deleted; remote modification restored it.
    Restored,
    /// Three-way merge applied.
    Merged { equals_remote: bool },
    /// Another device holds the merge lock; retried next cycle.
    Deferred { holder: Option<DeviceId> },
    /// Local copy moved aside; remote content at the primary path.
    Forked { conflict_path: VaultPath },
    /// Remote deleted the file but the local copy was modified; kept for re-upload.
    KeptLocal,
    /// Remote deletion applied locally.
    Removed,
}

/// Bring a remotely changed file down without losing local work.
///
/// Callers check the lock snapshot first; a path locked by another device
/// should be flagged as a pending conflict instead of calling this.
pub async fn pull_file_safely(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    path: &VaultPath,
    remote: &RemoteFile,
) -> Result<Resolution> {
    let mut remote_bytes = None;
    let remote_h = match remote_hash(remote, None) {
        Some(hash) => hash,
        None => {
            let bytes = ctx.download(&remote.id).await?;
            let hash = ContentHash::of(&bytes);
            remote_bytes = Some(bytes);
            hash
        }
    };

    let Some(local) = ctx.read_local(path).await? else {
        let tracked = index.local(path).is_some();
        let bytes = fetch_remote(ctx, remote, remote_bytes).await?;
        accept_remote(ctx, index, path, remote, &remote_h, &bytes).await?;
        return Ok(if tracked {
            info!(path = %path, "Restored locally deleted file modified remotely");
            Resolution::Restored
        } else {
            Resolution::RemoteAccepted
        });
    };

    let local_h = ContentHash::of(&local);
    if local_h == remote_h {
        let shared = FileEntry::confirmed(remote, remote_h.clone());
        let local_entry = with_local_stat(ctx, path, shared.clone()).await?;
        index.set_shared(path.clone(), shared);
        index.set_local(path.clone(), local_entry);
        index.clear_dirty(path);
        return Ok(Resolution::AlreadySynced);
    }

    let unchanged_locally = index
        .local(path)
        .is_some_and(|e| e.effective_hash() == &local_h && !e.force_push);
    if unchanged_locally {
        let bytes = fetch_remote(ctx, remote, remote_bytes).await?;
        accept_remote(ctx, index, path, remote, &remote_h, &bytes).await?;
        return Ok(Resolution::RemoteAccepted);
    }

    let remote_bytes = fetch_remote(ctx, remote, remote_bytes).await?;
    let conflict = Conflict {
        path,
        remote,
        remote_h: &remote_h,
        remote_bytes: &remote_bytes,
        local: &local,
        local_h: &local_h,
    };

    if !ctx.config.is_text(path) {
        debug!(path = %path, "Binary conflict, forking");
        return fork(ctx, index, &conflict).await;
    }

    match ctx.locks.acquire_with_retry(path).await? {
        LockOutcome::Acquired => {}
        outcome => {
            let holder = match outcome {
                LockOutcome::Held { holder, .. } => Some(holder),
                _ => None,
            };
            defer(ctx, index, path, holder.as_ref());
            return Ok(Resolution::Deferred { holder });
        }
    }

    let resolution = merge_locked(ctx, index, &conflict).await;
    if let Err(e) = ctx.locks.release(path).await {
        warn!(path = %path, error = %e, "Failed to release merge lock; it will expire");
    }
    resolution
}

/// Apply a remote deletion, keeping locally modified content.
pub async fn handle_remote_removal(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    path: &VaultPath,
) -> Result<Resolution> {
    let Some(local) = ctx.read_local(path).await? else {
        index.remove(path);
        return Ok(Resolution::Removed);
    };

    let Some(baseline) = index.local(path) else {
        debug!(path = %path, "Untracked local file at removed path, keeping");
        return Ok(Resolution::KeptLocal);
    };

    if baseline.effective_hash() == &ContentHash::of(&local) && !baseline.force_push {
        ctx.local.trash(path).await?;
        index.remove(path);
        debug!(path = %path, "Trashed file deleted remotely");
        return Ok(Resolution::Removed);
    }

    info!(path = %path, "Remote deleted a locally modified file, keeping local copy");
    index.remove_shared(path);
    if let Some(entry) = index.local_mut(path) {
        entry.remote_id = None;
        entry.force_push = true;
        entry.pending_conflict = false;
    }
    index.mark_dirty(path.clone());
    Ok(Resolution::KeptLocal)
}

/// Conflict file name: `name (Conflict 2024-01-15 123456).ext`.
pub fn conflict_path(path: &VaultPath, at: DateTime<Utc>, attempt: u32) -> Result<VaultPath> {
    let name = path.name().unwrap_or("file");
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    };
    let stamp = at.format("%Y-%m-%d %H%M%S");
    let renamed = if attempt == 0 {
        format!("{} (Conflict {}){}", stem, stamp, ext)
    } else {
        format!("{} (Conflict {} {}){}", stem, stamp, attempt + 1, ext)
    };
    path.with_name(&renamed)
}

struct Conflict<'a> {
    path: &'a VaultPath,
    remote: &'a RemoteFile,
    remote_h: &'a ContentHash,
    remote_bytes: &'a [u8],
    local: &'a [u8],
    local_h: &'a ContentHash,
}

async fn merge_locked(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    conflict: &Conflict<'_>,
) -> Result<Resolution> {
    let path = conflict.path;
    let baseline = index.local(path).cloned();
    let known_remote = index.shared(path).map(|e| e.effective_hash().clone());

    let base = resolve_base(
        ctx,
        path,
        BaseHints {
            ancestor: baseline.as_ref().and_then(|e| e.ancestor_hash.as_ref()),
            local: conflict.local_h,
            remote: conflict.remote_h,
            local_baseline: baseline.as_ref().map(|e| e.effective_hash()),
            remote_known: known_remote.as_ref(),
        },
    )
    .await?;
    let Some(base) = base else {
        debug!(path = %path, "No merge base, forking");
        return fork(ctx, index, conflict).await;
    };

    let texts = (
        std::str::from_utf8(&base.content),
        std::str::from_utf8(conflict.local),
        std::str::from_utf8(conflict.remote_bytes),
    );
    let (Ok(base_text), Ok(local_text), Ok(remote_text)) = texts else {
        debug!(path = %path, "Content is not UTF-8, forking");
        return fork(ctx, index, conflict).await;
    };

    let Some(merged) = three_way_merge(base_text, local_text, remote_text, &ctx.config.merge_margins)
    else {
        debug!(path = %path, "Merge rejected at every margin, forking");
        return fork(ctx, index, conflict).await;
    };

    if merged.text == remote_text {
        accept_remote(ctx, index, path, conflict.remote, conflict.remote_h, conflict.remote_bytes)
            .await?;
        ctx.notify(NotifyEvent::MergeApplied, Some(&path.to_string()));
        return Ok(Resolution::Merged {
            equals_remote: true,
        });
    }

    let merged_bytes = merged.text.into_bytes();
    ctx.local.write_binary(path, &merged_bytes).await?;

    let mut shared = FileEntry::confirmed(conflict.remote, conflict.remote_h.clone());
    shared.ancestor_hash = Some(base.hash.clone());

    let local_entry = FileEntry {
        content_hash: ContentHash::of(&merged_bytes),
        plaintext_hash: None,
        last_action: LastAction::Merge,
        ancestor_hash: Some(base.hash),
        force_push: true,
        ..shared.clone()
    };
    let local_entry = with_local_stat(ctx, path, local_entry).await?;

    index.set_shared(path.clone(), shared);
    index.set_local(path.clone(), local_entry);
    index.mark_dirty(path.clone());

    info!(path = %path, strategy = ?merged.strategy, "Merged concurrent edits");
    ctx.notify(NotifyEvent::MergeApplied, Some(&path.to_string()));
    Ok(Resolution::Merged {
        equals_remote: false,
    })
}

async fn fork(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    conflict: &Conflict<'_>,
) -> Result<Resolution> {
    let path = conflict.path;
    let now = Utc::now();
    let mut attempt = 0;
    let conflict_path = loop {
        let candidate = conflict_path(path, now, attempt)?;
        if !ctx.local.exists(&candidate).await? {
            break candidate;
        }
        attempt += 1;
    };

    ctx.local.rename(path, &conflict_path).await?;
    ctx.local.write_binary(path, conflict.remote_bytes).await?;

    let shared = FileEntry::confirmed(conflict.remote, conflict.remote_h.clone());
    let local_entry = with_local_stat(ctx, path, shared.clone()).await?;
    index.set_shared(path.clone(), shared);
    index.set_local(path.clone(), local_entry);
    index.clear_dirty(path);
    index.mark_dirty(conflict_path.clone());

    warn!(
        path = %path,
        conflict = %conflict_path,
        local_hash = %conflict.local_h,
        "Forked conflicting local copy"
    );
    ctx.notify(NotifyEvent::ConflictForked, Some(&conflict_path.to_string()));
    Ok(Resolution::Forked { conflict_path })
}

fn defer(ctx: &SyncContext, index: &mut SyncIndex, path: &VaultPath, holder: Option<&DeviceId>) {
    index.set_pending_conflict(path, true);
    index.mark_dirty(path.clone());
    let detail = match holder {
        Some(holder) => format!("{} (locked by {})", path, holder),
        None => path.to_string(),
    };
    debug!(path = %path, "Merge deferred, lock unavailable");
    ctx.notify(NotifyEvent::LockDeferred, Some(&detail));
}

/// Write remote content locally and record it as confirmed on both sides.
pub async fn accept_remote(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    path: &VaultPath,
    remote: &RemoteFile,
    remote_h: &ContentHash,
    bytes: &[u8],
) -> Result<()> {
    ctx.local.write_binary(path, bytes).await?;
    let shared = FileEntry::confirmed(remote, remote_h.clone());
    let local_entry = with_local_stat(ctx, path, shared.clone()).await?;
    index.set_shared(path.clone(), shared);
    index.set_local(path.clone(), local_entry);
    index.clear_dirty(path);
    Ok(())
}

/// Take the local file's size and mtime into an entry.
pub async fn with_local_stat(
    ctx: &SyncContext,
    path: &VaultPath,
    entry: FileEntry,
) -> Result<FileEntry> {
    Ok(match ctx.local.stat(path).await? {
        Some(stat) => entry.with_stat(stat.size, stat.modified),
        None => entry,
    })
}

async fn fetch_remote(
    ctx: &SyncContext,
    remote: &RemoteFile,
    cached: Option<Vec<u8>>,
) -> Result<Vec<u8>> {
    match cached {
        Some(bytes) => Ok(bytes),
        None => ctx.download(&remote.id).await,
    }
}
