//! Discovery of the common base for a three-way merge.

use tracing::debug;

use vaultsync_common::{ContentHash, Error, Result, VaultPath};
use vaultsync_storage::Revision;

use crate::context::SyncContext;

/// Where a merge base came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// The recorded ancestor hash.
    Ancestor,
    /// The older of the two history positions last shared with each side.
    History {
        local_index: usize,
        remote_index: usize,
    },
}

/// Content both sides diverged from.
#[derive(Debug, Clone)]
pub struct MergeBase {
    pub hash: ContentHash,
    pub content: Vec<u8>,
    pub source: BaseSource,
}

/// Hashes known about a conflicted path.
#[derive(Debug, Clone, Copy)]
pub struct BaseHints<'a> {
    /// Last content confirmed identical on both sides.
    pub ancestor: Option<&'a ContentHash>,
    /// Current local content.
    pub local: &'a ContentHash,
    /// Current remote content.
    pub remote: &'a ContentHash,
    /// This device's last-synced baseline.
    pub local_baseline: Option<&'a ContentHash>,
    /// Remote content as this device last observed it.
    pub remote_known: Option<&'a ContentHash>,
}

/// Find the merge base for `path`, or None if there is no usable one.
///
/// The recorded ancestor is preferred. When it is missing, equals both
/// endpoints, or its content is no longer in history, revision history is
/// searched for the last occurrence of each side's known hash and the
/// older of the two positions is taken.
pub async fn resolve_base(
    ctx: &SyncContext,
    path: &VaultPath,
    hints: BaseHints<'_>,
) -> Result<Option<MergeBase>> {
    if !ctx.remote.capabilities().supports_history {
        debug!(path = %path, "Remote keeps no history, no merge base");
        return Ok(None);
    }

    let revisions = match ctx
        .retry
        .execute("list revisions", || ctx.remote.list_revisions(path))
        .await
    {
        Ok(revisions) => revisions,
        Err(Error::NotPermitted(_)) => return Ok(None),
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };

    if let Some(ancestor) = hints.ancestor {
        let deeper_divergence = ancestor == hints.local && ancestor == hints.remote;
        if !deeper_divergence {
            if let Some(pos) = revisions.iter().rposition(|r| &r.content_hash == ancestor) {
                let content = fetch(ctx, path, &revisions[pos]).await?;
                return Ok(Some(MergeBase {
                    hash: ancestor.clone(),
                    content,
                    source: BaseSource::Ancestor,
                }));
            }
            debug!(path = %path, "Ancestor content not in history, searching");
        }
    }

    let Some((local_index, remote_index)) =
        history_positions(&revisions, hints.local_baseline, hints.remote_known)
    else {
        debug!(path = %path, "No shared history position for both sides");
        return Ok(None);
    };

    let chosen = &revisions[local_index.min(remote_index)];
    let content = fetch(ctx, path, chosen).await?;
    Ok(Some(MergeBase {
        hash: chosen.content_hash.clone(),
        content,
        source: BaseSource::History {
            local_index,
            remote_index,
        },
    }))
}

/// Last positions (oldest-first history) of each side's known hash.
///
/// Both must be present.
pub fn history_positions(
    revisions: &[Revision],
    local_baseline: Option<&ContentHash>,
    remote_known: Option<&ContentHash>,
) -> Option<(usize, usize)> {
    let find = |hash: Option<&ContentHash>| {
        hash.and_then(|h| revisions.iter().rposition(|r| &r.content_hash == h))
    };
    Some((find(local_baseline)?, find(remote_known)?))
}

async fn fetch(ctx: &SyncContext, path: &VaultPath, revision: &Revision) -> Result<Vec<u8>> {
    ctx.retry
        .execute("revision content", || {
            ctx.remote.revision_content(path, &revision.id)
        })
        .await
}
