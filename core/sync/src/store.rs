//! Persistence of the shared and local index documents.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use tracing::{debug, error, info, warn};

use vaultsync_common::{ContentHash, DeviceId, Result, VaultPath};
use vaultsync_storage::{LocalFs, RemoteFile};

use crate::context::{remote_hash, SyncContext};
use crate::notify::NotifyEvent;
use crate::state::{FileEntry, SyncIndex};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Index document published to the remote for every device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedIndexDocument {
    #[serde(default)]
    pub index: BTreeMap<VaultPath, FileEntry>,
    #[serde(default)]
    pub start_page_token: Option<String>,
}

/// Index document kept only on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIndexDocument {
    #[serde(default)]
    pub index: BTreeMap<VaultPath, FileEntry>,
    pub device_id: DeviceId,
    /// Last known shared view, so a restart can short-circuit unchanged remotes.
    #[serde(default)]
    pub shared_index: BTreeMap<VaultPath, FileEntry>,
    #[serde(default)]
    pub start_page_token: Option<String>,
    #[serde(default)]
    pub shared_doc_hash: Option<ContentHash>,
    #[serde(default)]
    pub shared_doc_id: Option<String>,
    #[serde(default)]
    pub dirty_paths: BTreeSet<VaultPath>,
}

impl LocalIndexDocument {
    pub fn from_index(index: &SyncIndex) -> Self {
        Self {
            index: index.local_entries().clone(),
            device_id: index.device_id.clone(),
            shared_index: index.shared_entries().clone(),
            start_page_token: index.start_page_token.clone(),
            shared_doc_hash: index.shared_doc_hash.clone(),
            shared_doc_id: index.shared_doc_id.clone(),
            dirty_paths: index.dirty_set().clone(),
        }
    }

    /// Rebuild the in-memory index, optionally under a different identity.
    pub fn into_index(self, device_id: DeviceId) -> SyncIndex {
        let mut index =
            SyncIndex::from_parts(device_id, self.shared_index, self.index, self.dirty_paths);
        index.start_page_token = self.start_page_token;
        index.shared_doc_hash = self.shared_doc_hash;
        index.shared_doc_id = self.shared_doc_id;
        index
    }
}

/// Serialize the shared document, gzipped when `compress` is set.
pub fn encode_shared(doc: &SharedIndexDocument, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(doc)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Parse a shared document, transparently inflating gzip payloads.
pub fn decode_shared(bytes: &[u8]) -> Result<SharedIndexDocument> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The shared index as fetched from the remote.
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    pub document: SharedIndexDocument,
    /// Size of the primary document as stored, even if it failed to parse.
    pub raw_size: usize,
    pub doc_hash: Option<ContentHash>,
    pub doc_id: Option<String>,
    /// The primary document was unreadable and a fallback was used.
    pub recovered: bool,
}

/// Metadata of the shared index document, if it exists.
pub async fn shared_index_metadata(ctx: &SyncContext) -> Result<Option<RemoteFile>> {
    ctx.remote_metadata(&ctx.config.shared_index_path()?).await
}

/// Download and parse the shared index.
///
/// An unreadable primary document falls back to the raw backup, then to an
/// empty index. `raw_size` always reflects the primary document so the
/// corruption guard still sees a non-trivial payload.
pub async fn load_shared(ctx: &SyncContext, meta: Option<RemoteFile>) -> Result<RemoteIndex> {
    let Some(meta) = meta else {
        debug!("No shared index on remote yet");
        return Ok(RemoteIndex::default());
    };

    let bytes = ctx.download(&meta.id).await?;
    let doc_hash = remote_hash(&meta, Some(&bytes));
    match decode_shared(&bytes) {
        Ok(document) => Ok(RemoteIndex {
            document,
            raw_size: bytes.len(),
            doc_hash,
            doc_id: Some(meta.id),
            recovered: false,
        }),
        Err(e) => {
            error!(error = %e, "Shared index unreadable, trying raw backup");
            let document = match load_backup(ctx).await {
                Ok(Some(doc)) => {
                    info!(entries = doc.index.len(), "Recovered shared index from raw backup");
                    doc
                }
                Ok(None) => {
                    error!("No usable raw backup, starting from an empty shared index");
                    SharedIndexDocument::default()
                }
                Err(e) => {
                    error!(error = %e, "Raw backup unreadable, starting from an empty shared index");
                    SharedIndexDocument::default()
                }
            };
            ctx.notify(NotifyEvent::IndexRecovered, Some(&e.to_string()));
            Ok(RemoteIndex {
                document,
                raw_size: bytes.len(),
                doc_hash,
                doc_id: Some(meta.id),
                recovered: true,
            })
        }
    }
}

async fn load_backup(ctx: &SyncContext) -> Result<Option<SharedIndexDocument>> {
    let Some(meta) = ctx
        .remote_metadata(&ctx.config.shared_index_backup_path()?)
        .await?
    else {
        return Ok(None);
    };
    let bytes = ctx.download(&meta.id).await?;
    decode_shared(&bytes).map(Some)
}

/// Publish the shared view of `index` plus its raw backup.
///
/// Records the new document hash and id on the index.
pub async fn save_shared(ctx: &SyncContext, index: &mut SyncIndex) -> Result<()> {
    let doc = SharedIndexDocument {
        index: index.shared_entries().clone(),
        start_page_token: index.start_page_token.clone(),
    };
    let bytes = encode_shared(&doc, ctx.config.compress_index)?;
    let meta = ctx
        .upload(
            &ctx.config.shared_index_path()?,
            &bytes,
            chrono::Utc::now(),
            index.shared_doc_id.as_deref(),
        )
        .await?;
    index.shared_doc_hash = remote_hash(&meta, Some(&bytes));
    index.shared_doc_id = Some(meta.id);
    index.mark_shared_published();

    let raw = serde_json::to_vec(&doc)?;
    if let Err(e) = ctx
        .upload(
            &ctx.config.shared_index_backup_path()?,
            &raw,
            chrono::Utc::now(),
            None,
        )
        .await
    {
        warn!(error = %e, "Failed to upload raw index backup");
    }

    debug!(entries = doc.index.len(), "Published shared index");
    Ok(())
}

/// Read this device's private index document, if present and readable.
pub async fn load_local(local: &dyn LocalFs, path: &VaultPath) -> Result<Option<LocalIndexDocument>> {
    let bytes = match local.read_binary(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice(&bytes) {
        Ok(doc) => Ok(Some(doc)),
        Err(e) => {
            error!(error = %e, path = %path, "Local index unreadable, starting fresh");
            Ok(None)
        }
    }
}

/// Persist this device's private index document.
pub async fn save_local(ctx: &SyncContext, index: &SyncIndex) -> Result<()> {
    let doc = LocalIndexDocument::from_index(index);
    let json = serde_json::to_vec_pretty(&doc)?;
    ctx.local
        .write_binary(&ctx.config.local_index_path()?, &json)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::state::LastAction;

    fn entry(data: &[u8]) -> FileEntry {
        FileEntry {
            remote_id: Some("id".into()),
            mtime: 0,
            size: data.len() as u64,
            content_hash: ContentHash::of(data),
            plaintext_hash: None,
            last_action: LastAction::Pull,
            ancestor_hash: Some(ContentHash::of(data)),
            pending_conflict: false,
            force_push: false,
            pending_move: None,
            stat_at: None,
        }
    }

    fn sample_doc() -> SharedIndexDocument {
        SharedIndexDocument {
            index: BTreeMap::from([(path("a.md"), entry(b"a")), (path("d/b.md"), entry(b"b"))]),
            start_page_token: Some("12".into()),
        }
    }

    #[test]
    fn test_gzip_detected_by_magic_bytes() {
        let doc = sample_doc();
        let compressed = encode_shared(&doc, true).unwrap();
        assert_eq!(&compressed[..2], &GZIP_MAGIC);
        assert_eq!(decode_shared(&compressed).unwrap(), doc);

        let plain = encode_shared(&doc, false).unwrap();
        assert_eq!(plain[0], b'{');
        assert_eq!(decode_shared(&plain).unwrap(), doc);
    }

    #[test]
    fn test_shared_wire_format() {
        let json: serde_json::Value =
            serde_json::from_slice(&encode_shared(&sample_doc(), false).unwrap()).unwrap();
        assert_eq!(json["startPageToken"], "12");
        assert!(json["index"]["d/b.md"]["contentHash"].is_string());
    }

    #[tokio::test]
    async fn test_save_and_load_shared() {
        let f = fixture();
        let mut index = SyncIndex::new(f.ctx.device_id.clone());
        index.set_both(path("a.md"), entry(b"a"));

        save_shared(&f.ctx, &mut index).await.unwrap();
        assert!(!index.shared_changed());
        assert!(f.remote.read_file(&path(".vaultsync/sync-index-raw.json")).is_some());

        let meta = shared_index_metadata(&f.ctx).await.unwrap();
        let loaded = load_shared(&f.ctx, meta).await.unwrap();
        assert!(!loaded.recovered);
        assert_eq!(loaded.doc_hash, index.shared_doc_hash);
        assert_eq!(loaded.document.index.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_primary_falls_back_to_backup() {
        let f = fixture();
        f.remote.put_file(&path(".vaultsync/sync-index.json"), b"\x1f\x8bgarbage-garbage");
        f.remote.put_file(
            &path(".vaultsync/sync-index-raw.json"),
            &serde_json::to_vec(&sample_doc()).unwrap(),
        );

        let meta = shared_index_metadata(&f.ctx).await.unwrap();
        let loaded = load_shared(&f.ctx, meta).await.unwrap();
        assert!(loaded.recovered);
        assert_eq!(loaded.document.index.len(), 2);
        assert!(f.notifier.events().contains(&NotifyEvent::IndexRecovered));
    }

    #[tokio::test]
    async fn test_corrupt_without_backup_is_empty_but_sized() {
        let f = fixture();
        let junk = vec![b'x'; 500];
        f.remote.put_file(&path(".vaultsync/sync-index.json"), &junk);

        let meta = shared_index_metadata(&f.ctx).await.unwrap();
        let loaded = load_shared(&f.ctx, meta).await.unwrap();
        assert!(loaded.document.index.is_empty());
        assert_eq!(loaded.raw_size, 500);
    }

    #[tokio::test]
    async fn test_local_document_round_trip() {
        let f = fixture();
        let mut index = SyncIndex::new(f.ctx.device_id.clone());
        index.set_both(path("a.md"), entry(b"a"));
        index.mark_dirty(path("b.md"));
        index.start_page_token = Some("3".into());

        save_local(&f.ctx, &index).await.unwrap();
        let doc = load_local(f.local.as_ref(), &f.ctx.config.local_index_path().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.device_id, f.ctx.device_id);

        let restored = doc.into_index(f.ctx.device_id.clone());
        assert!(restored.local(&path("a.md")).is_some());
        assert!(restored.is_dirty(&path("b.md")));
        assert_eq!(restored.start_page_token.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_unreadable_local_index_starts_fresh() {
        let f = fixture();
        let at = f.ctx.config.local_index_path().unwrap();
        f.local.put(&at, b"not json");
        assert!(load_local(f.local.as_ref(), &at).await.unwrap().is_none());
    }
}
