//! Background full-vault scan.
//!
//! Lists both sides once, then walks the remote listing in chunks looking
//! for files to adopt and tracked files missing locally. The walk yields
//! between chunks and stops early when asked, keeping its cursor so a later
//! run can pick up where it left off.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use vaultsync_common::{ContentHash, Result, VaultPath};
use vaultsync_storage::{LocalStat, RemoteFile};

use crate::conflict::with_local_stat;
use crate::context::{remote_hash, SyncContext};
use crate::notify::NotifyEvent;
use crate::state::{FileEntry, SyncIndex};

/// Resumable cursor of a full scan.
#[derive(Debug, Clone)]
pub struct FullScanProgress {
    /// Position in `cached_remote` of the next file to examine.
    pub current_index: usize,
    pub total_files: usize,
    pub cached_local: BTreeMap<VaultPath, LocalStat>,
    pub cached_remote: Vec<RemoteFile>,
    pub started_at: DateTime<Utc>,
    /// Running totals carried across pauses.
    pub report: ScanReport,
}

impl FullScanProgress {
    /// Whether the cached listings are too old to trust.
    pub fn is_stale(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let age = now.signed_duration_since(self.started_at);
        age.to_std().map(|age| age > window).unwrap_or(false)
    }
}

/// Findings of a full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub examined: usize,
    pub adopted: usize,
    /// Paths flagged for the next push: missing locally, diverged, or new.
    pub flagged: usize,
}

/// How a scan run ended.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanReport),
    Paused(FullScanProgress),
}

/// Start or resume a full scan.
///
/// `interrupt` is checked between chunks; when set, the scan returns
/// [`ScanOutcome::Paused`] with its cursor.
pub async fn run(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    resume: Option<FullScanProgress>,
    interrupt: &AtomicBool,
) -> Result<ScanOutcome> {
    let now = Utc::now();
    let mut progress = match resume {
        Some(progress) if !progress.is_stale(now, ctx.config.scan_staleness) => {
            debug!(
                at = progress.current_index,
                total = progress.total_files,
                "Resuming full scan"
            );
            progress
        }
        Some(_) => {
            debug!("Saved scan progress is stale, listing again");
            start(ctx, now).await?
        }
        None => start(ctx, now).await?,
    };

    let chunk_size = ctx.config.scan_chunk_size.max(1);
    while progress.current_index < progress.total_files {
        if interrupt.load(Ordering::SeqCst) {
            info!(
                at = progress.current_index,
                total = progress.total_files,
                "Full scan paused"
            );
            ctx.notify(
                NotifyEvent::ScanPaused,
                Some(&format!("{}/{}", progress.current_index, progress.total_files)),
            );
            return Ok(ScanOutcome::Paused(progress));
        }

        let end = (progress.current_index + chunk_size).min(progress.total_files);
        let chunk = progress.cached_remote[progress.current_index..end].to_vec();
        scan_chunk(ctx, index, &progress.cached_local, chunk, &mut progress.report).await;
        progress.current_index = end;
        tokio::task::yield_now().await;
    }

    let remote_paths: HashSet<&VaultPath> =
        progress.cached_remote.iter().map(|f| &f.path).collect();
    for path in progress.cached_local.keys() {
        if !remote_paths.contains(path) && index.local(path).is_none() && !index.is_dirty(path) {
            index.mark_dirty(path.clone());
            progress.report.flagged += 1;
        }
    }

    let report = progress.report;
    info!(
        examined = report.examined,
        adopted = report.adopted,
        flagged = report.flagged,
        "Full scan complete"
    );
    ctx.notify(
        NotifyEvent::ScanComplete,
        Some(&format!(
            "{} examined, {} adopted, {} flagged",
            report.examined, report.adopted, report.flagged
        )),
    );
    Ok(ScanOutcome::Completed(report))
}

async fn start(ctx: &SyncContext, now: DateTime<Utc>) -> Result<FullScanProgress> {
    let cached_local: BTreeMap<VaultPath, LocalStat> = ctx
        .local
        .list()
        .await?
        .into_iter()
        .filter(|s| !s.is_dir && ctx.is_synced_path(&s.path))
        .map(|s| (s.path.clone(), s))
        .collect();
    let cached_remote: Vec<RemoteFile> = ctx
        .retry
        .execute("list remote", || ctx.remote.list_all())
        .await?
        .into_iter()
        .filter(|f| !f.is_folder && ctx.is_synced_path(&f.path))
        .collect();

    debug!(
        local = cached_local.len(),
        remote = cached_remote.len(),
        "Full scan listed both sides"
    );
    Ok(FullScanProgress {
        current_index: 0,
        total_files: cached_remote.len(),
        cached_local,
        cached_remote,
        started_at: now,
        report: ScanReport::default(),
    })
}

enum Finding {
    Adopt { remote: RemoteFile, hash: ContentHash },
    Flag(VaultPath),
    Fine,
}

async fn scan_chunk(
    ctx: &SyncContext,
    index: &mut SyncIndex,
    local: &BTreeMap<VaultPath, LocalStat>,
    chunk: Vec<RemoteFile>,
    report: &mut ScanReport,
) {
    let mut to_hash = Vec::new();
    for remote in chunk {
        report.examined += 1;
        let tracked = index.local(&remote.path).cloned();
        let present = local.contains_key(&remote.path);
        match (tracked, present) {
            (Some(_), false) => flag(index, &remote.path, report),
            (Some(entry), true) => {
                let known = remote_hash(&remote, None);
                let shared = index.shared(&remote.path).map(|e| e.effective_hash().clone());
                if known.is_some() && known != shared && known.as_ref() != Some(entry.effective_hash()) {
                    flag(index, &remote.path, report);
                }
            }
            (None, true) => to_hash.push(remote),
            (None, false) => {}
        }
    }

    let concurrency = ctx.config.concurrency.max(1);
    let findings: Vec<Result<Finding>> = stream::iter(to_hash)
        .map(|remote| async move { examine_untracked(ctx, remote).await })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for finding in findings {
        match finding {
            Ok(Finding::Adopt { remote, hash }) => {
                let entry = FileEntry::confirmed(&remote, hash);
                match with_local_stat(ctx, &remote.path, entry.clone()).await {
                    Ok(local_entry) => {
                        index.set_shared(remote.path.clone(), entry);
                        index.set_local(remote.path.clone(), local_entry);
                        index.clear_dirty(&remote.path);
                        report.adopted += 1;
                    }
                    Err(e) => warn!(path = %remote.path, error = %e, "Failed to stat adopted file"),
                }
            }
            Ok(Finding::Flag(path)) => flag(index, &path, report),
            Ok(Finding::Fine) => {}
            Err(e) => warn!(error = %e, "Failed to examine file during scan"),
        }
    }
}

fn flag(index: &mut SyncIndex, path: &VaultPath, report: &mut ScanReport) {
    if !index.is_dirty(path) {
        index.mark_dirty(path.clone());
        report.flagged += 1;
    }
}

/// Worker: hash an untracked local file against its remote counterpart.
async fn examine_untracked(ctx: &SyncContext, remote: RemoteFile) -> Result<Finding> {
    let Some(data) = ctx.read_local(&remote.path).await? else {
        return Ok(Finding::Fine);
    };
    let hash = ContentHash::of(&data);
    let remote_h = match remote_hash(&remote, None) {
        Some(h) => h,
        None => ContentHash::of(&ctx.download(&remote.id).await?),
    };
    if hash == remote_h {
        Ok(Finding::Adopt { remote, hash })
    } else {
        Ok(Finding::Flag(remote.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::notify::NotifyEvent;
    use vaultsync_storage::LocalFs;

    fn small_chunks(f: &Fixture) -> SyncContext {
        let mut config = (*f.ctx.config).clone();
        config.scan_chunk_size = 2;
        let mut ctx = f.ctx.clone();
        ctx.config = std::sync::Arc::new(config);
        ctx
    }

    #[tokio::test]
    async fn test_scan_adopts_and_flags() {
        let f = fixture();
        let mut index = SyncIndex::new(f.ctx.device_id.clone());

        f.remote.put_file(&path("same.md"), b"same");
        f.local.put(&path("same.md"), b"same");

        f.remote.put_file(&path("differs.md"), b"remote");
        f.local.put(&path("differs.md"), b"local");

        let gone = f.remote.put_file(&path("gone.md"), b"x");
        index.set_both(path("gone.md"), FileEntry::confirmed(&gone, ContentHash::of(b"x")));

        f.local.put(&path("local-only.md"), b"new");

        let outcome = run(&f.ctx, &mut index, None, &AtomicBool::new(false))
            .await
            .unwrap();
        let ScanOutcome::Completed(report) = outcome else {
            panic!("scan should complete");
        };

        assert_eq!(report.examined, 3);
        assert_eq!(report.adopted, 1);
        assert_eq!(report.flagged, 3);
        assert!(index.local(&path("same.md")).is_some());
        assert!(!index.is_dirty(&path("same.md")));
        assert!(index.is_dirty(&path("differs.md")));
        assert!(index.is_dirty(&path("gone.md")));
        assert!(index.is_dirty(&path("local-only.md")));
        assert!(f.notifier.events().contains(&NotifyEvent::ScanComplete));
    }

    #[tokio::test]
    async fn test_scan_pauses_and_resumes() {
        let f = fixture();
        let ctx = small_chunks(&f);
        let mut index = SyncIndex::new(f.ctx.device_id.clone());
        for i in 0..5 {
            let p = path(&format!("n{}.md", i));
            f.remote.put_file(&p, b"same");
            f.local.put(&p, b"same");
        }

        let interrupt = AtomicBool::new(true);
        let ScanOutcome::Paused(progress) = run(&ctx, &mut index, None, &interrupt).await.unwrap() else {
            panic!("scan should pause");
        };
        assert_eq!(progress.current_index, 0);
        assert_eq!(progress.total_files, 5);

        // Resumed scans reuse the cached listing.
        f.remote.put_file(&path("late.md"), b"late");
        interrupt.store(false, Ordering::SeqCst);
        let ScanOutcome::Completed(report) = run(&ctx, &mut index, Some(progress), &interrupt)
            .await
            .unwrap()
        else {
            panic!("scan should complete");
        };
        assert_eq!(report.examined, 5);
        assert_eq!(report.adopted, 5);
        assert!(f.notifier.events().contains(&NotifyEvent::ScanPaused));
    }

    #[tokio::test]
    async fn test_stale_progress_is_discarded() {
        let f = fixture();
        let mut index = SyncIndex::new(f.ctx.device_id.clone());
        f.remote.put_file(&path("a.md"), b"a");
        f.local.put(&path("a.md"), b"a");

        let stale = FullScanProgress {
            current_index: 0,
            total_files: 0,
            cached_local: BTreeMap::new(),
            cached_remote: Vec::new(),
            started_at: Utc::now() - chrono::Duration::hours(2),
            report: ScanReport::default(),
        };
        assert!(stale.is_stale(Utc::now(), f.ctx.config.scan_staleness));

        let ScanOutcome::Completed(report) =
            run(&f.ctx, &mut index, Some(stale), &AtomicBool::new(false))
                .await
                .unwrap()
        else {
            panic!("scan should complete");
        };
        assert_eq!(report.adopted, 1);
        assert!(f.local.exists(&path("a.md")).await.unwrap());
    }
}
