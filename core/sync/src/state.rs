//! Index of known file states and dirty-path tracking.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use vaultsync_common::{ContentHash, DeviceId, VaultPath};
use vaultsync_storage::RemoteFile;

/// What this device last did with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastAction {
    /// Uploaded local content; not yet seen back from the remote.
    Push,
    /// Content confirmed identical on both sides.
    Pull,
    /// Local content is a merge result; not yet seen back from the remote.
    Merge,
}

/// A local rename that has not yet been replayed on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMove {
    pub from_path: VaultPath,
}

/// Tracked state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Remote object id; None once detached from a remotely deleted object.
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Modification time in milliseconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub content_hash: ContentHash,
    /// Hash before end-to-end encryption, when the remote reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext_hash: Option<ContentHash>,
    pub last_action: LastAction,
    /// Hash of the last content known to be identical locally and remotely.
    #[serde(default)]
    pub ancestor_hash: Option<ContentHash>,
    #[serde(default)]
    pub pending_conflict: bool,
    #[serde(default)]
    pub force_push: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_move: Option<PendingMove>,
    /// Wall-clock milliseconds at which `size` and `mtime` were read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_at: Option<i64>,
}

impl FileEntry {
    /// Entry for content confirmed byte-identical on both sides.
    ///
    /// This is one of the two places the ancestor hash moves.
    pub fn confirmed(remote: &RemoteFile, hash: ContentHash) -> Self {
        Self {
            remote_id: Some(remote.id.clone()),
            mtime: remote.modified.timestamp_millis(),
            size: remote.size,
            content_hash: hash.clone(),
            plaintext_hash: remote.plaintext_hash.clone(),
            last_action: LastAction::Pull,
            ancestor_hash: Some(hash),
            pending_conflict: false,
            force_push: false,
            pending_move: None,
            stat_at: None,
        }
    }

    /// Entry after uploading local content.
    ///
    /// The ancestor is carried over from `previous`: a successful upload
    /// alone proves nothing about what the other devices hold.
    pub fn pushed(remote: &RemoteFile, hash: ContentHash, previous: Option<&FileEntry>) -> Self {
        Self {
            remote_id: Some(remote.id.clone()),
            mtime: remote.modified.timestamp_millis(),
            size: remote.size,
            content_hash: hash,
            plaintext_hash: remote.plaintext_hash.clone(),
            last_action: LastAction::Push,
            ancestor_hash: previous.and_then(|p| p.ancestor_hash.clone()),
            pending_conflict: false,
            force_push: false,
            pending_move: None,
            stat_at: None,
        }
    }

    /// Hash to compare against local content.
    pub fn effective_hash(&self) -> &ContentHash {
        self.plaintext_hash.as_ref().unwrap_or(&self.content_hash)
    }

    /// Whether the entry waits for the remote to echo our own write.
    pub fn awaiting_confirmation(&self) -> bool {
        matches!(self.last_action, LastAction::Push | LastAction::Merge)
    }

    /// Record that the remote now holds exactly this entry's content.
    pub fn mark_confirmed(&mut self) {
        self.last_action = LastAction::Pull;
        self.ancestor_hash = Some(self.content_hash.clone());
    }

    /// Refresh the local stat fields.
    pub fn with_stat(mut self, size: u64, modified: DateTime<Utc>) -> Self {
        self.size = size;
        self.mtime = modified.timestamp_millis();
        self.stat_at = Some(Utc::now().timestamp_millis());
        self
    }

    /// Whether a local stat matches the recorded size and mtime.
    pub fn stat_matches(&self, size: u64, modified: DateTime<Utc>) -> bool {
        self.size == size && self.mtime == modified.timestamp_millis()
    }

    /// Whether a matching stat can still hide an edit.
    ///
    /// A write landing in the same millisecond the stat was taken leaves
    /// size and mtime unchanged; such entries must be compared by content.
    pub fn is_racily_clean(&self) -> bool {
        self.stat_at.is_some_and(|at| self.mtime >= at)
    }

    /// Modification time as a timestamp.
    pub fn modified(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.mtime)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// In-memory view of both indices plus the dirty set.
///
/// `shared` is this device's belief about the canonical remote state and is
/// published to the remote; `local` is this device's own last-synced
/// baseline. They differ only for merge results awaiting upload.
#[derive(Debug, Clone)]
pub struct SyncIndex {
    pub device_id: DeviceId,
    shared: BTreeMap<VaultPath, FileEntry>,
    local: BTreeMap<VaultPath, FileEntry>,
    dirty: BTreeSet<VaultPath>,
    /// Change-feed cursor.
    pub start_page_token: Option<String>,
    /// Hash of the shared index document as last downloaded or uploaded.
    pub shared_doc_hash: Option<ContentHash>,
    /// Remote id of the shared index document.
    pub shared_doc_id: Option<String>,
    shared_changed: bool,
}

impl SyncIndex {
    /// Create an empty index.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            shared: BTreeMap::new(),
            local: BTreeMap::new(),
            dirty: BTreeSet::new(),
            start_page_token: None,
            shared_doc_hash: None,
            shared_doc_id: None,
            shared_changed: false,
        }
    }

    /// Rebuild from persisted maps.
    pub fn from_parts(
        device_id: DeviceId,
        shared: BTreeMap<VaultPath, FileEntry>,
        local: BTreeMap<VaultPath, FileEntry>,
        dirty: BTreeSet<VaultPath>,
    ) -> Self {
        Self {
            shared,
            local,
            dirty,
            ..Self::new(device_id)
        }
    }

    pub fn shared(&self, path: &VaultPath) -> Option<&FileEntry> {
        self.shared.get(path)
    }

    pub fn local(&self, path: &VaultPath) -> Option<&FileEntry> {
        self.local.get(path)
    }

    pub fn local_mut(&mut self, path: &VaultPath) -> Option<&mut FileEntry> {
        self.local.get_mut(path)
    }

    pub fn shared_entries(&self) -> &BTreeMap<VaultPath, FileEntry> {
        &self.shared
    }

    pub fn local_entries(&self) -> &BTreeMap<VaultPath, FileEntry> {
        &self.local
    }

    /// Replace the shared view wholesale (after downloading the remote index).
    pub fn replace_shared(&mut self, shared: BTreeMap<VaultPath, FileEntry>) {
        self.shared = shared;
    }

    pub fn set_shared(&mut self, path: VaultPath, entry: FileEntry) {
        self.shared.insert(path, entry);
        self.shared_changed = true;
    }

    pub fn set_local(&mut self, path: VaultPath, entry: FileEntry) {
        self.local.insert(path, entry);
    }

    /// Record the same entry in both indices.
    pub fn set_both(&mut self, path: VaultPath, entry: FileEntry) {
        self.set_shared(path.clone(), entry.clone());
        self.set_local(path, entry);
    }

    /// Forget a path entirely.
    pub fn remove(&mut self, path: &VaultPath) {
        if self.shared.remove(path).is_some() {
            self.shared_changed = true;
        }
        self.local.remove(path);
        self.dirty.remove(path);
    }

    /// Forget the shared belief about a path, keeping the local baseline.
    pub fn remove_shared(&mut self, path: &VaultPath) {
        if self.shared.remove(path).is_some() {
            self.shared_changed = true;
        }
    }

    /// Move both entries (and dirtiness) to a new path.
    pub fn rename(&mut self, from: &VaultPath, to: &VaultPath) {
        if let Some(entry) = self.shared.remove(from) {
            self.shared.insert(to.clone(), entry);
            self.shared_changed = true;
        }
        if let Some(entry) = self.local.remove(from) {
            self.local.insert(to.clone(), entry);
        }
        if self.dirty.remove(from) {
            self.dirty.insert(to.clone());
        }
    }

    /// Number of files this device has synchronized.
    pub fn tracked_count(&self) -> usize {
        self.local.len()
    }

    /// Path currently associated with a remote id.
    pub fn path_for_remote_id(&self, remote_id: &str) -> Option<VaultPath> {
        self.local
            .iter()
            .chain(self.shared.iter())
            .find(|(_, e)| e.remote_id.as_deref() == Some(remote_id))
            .map(|(p, _)| p.clone())
    }

    pub fn mark_dirty(&mut self, path: VaultPath) {
        self.dirty.insert(path);
    }

    pub fn clear_dirty(&mut self, path: &VaultPath) {
        self.dirty.remove(path);
    }

    pub fn is_dirty(&self, path: &VaultPath) -> bool {
        self.dirty.contains(path)
    }

    pub fn dirty_paths(&self) -> Vec<VaultPath> {
        self.dirty.iter().cloned().collect()
    }

    pub fn dirty_set(&self) -> &BTreeSet<VaultPath> {
        &self.dirty
    }

    /// Flag or clear a deferred conflict on both indices.
    pub fn set_pending_conflict(&mut self, path: &VaultPath, pending: bool) {
        if let Some(entry) = self.local.get_mut(path) {
            entry.pending_conflict = pending;
        }
        if let Some(entry) = self.shared.get_mut(path) {
            if entry.pending_conflict != pending {
                entry.pending_conflict = pending;
                self.shared_changed = true;
            }
        }
    }

    /// Promote our own pushed or merged write to confirmed once the remote
    /// reports the same hash back.
    ///
    /// Returns whether anything changed.
    pub fn confirm(&mut self, path: &VaultPath, remote_hash: &ContentHash) -> bool {
        let mut changed = false;
        if let Some(entry) = self.shared.get_mut(path) {
            if entry.awaiting_confirmation() && entry.effective_hash() == remote_hash {
                entry.mark_confirmed();
                self.shared_changed = true;
                changed = true;
            }
        }
        if let Some(entry) = self.local.get_mut(path) {
            if entry.awaiting_confirmation() && entry.effective_hash() == remote_hash {
                entry.mark_confirmed();
                changed = true;
            }
        }
        changed
    }

    /// Whether the shared view changed since the last publish.
    pub fn shared_changed(&self) -> bool {
        self.shared_changed
    }

    /// Mark the shared view as published.
    pub fn mark_shared_published(&mut self) {
        self.shared_changed = false;
    }

    /// Number of entries waiting for the remote to echo our write.
    pub fn awaiting_confirmation_count(&self) -> usize {
        self.local.values().filter(|e| e.awaiting_confirmation()).count()
    }

    /// Number of entries with a deferred conflict.
    pub fn pending_conflict_count(&self) -> usize {
        self.local.values().filter(|e| e.pending_conflict).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> VaultPath {
        VaultPath::parse(s).unwrap()
    }

    fn remote(id: &str, p: &str, data: &[u8]) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            path: path(p),
            size: data.len() as u64,
            modified: Utc::now(),
            content_hash: Some(ContentHash::of(data)),
            plaintext_hash: None,
            is_folder: false,
        }
    }

    #[test]
    fn test_push_keeps_previous_ancestor() {
        let r1 = remote("1", "a.md", b"v1");
        let confirmed = FileEntry::confirmed(&r1, ContentHash::of(b"v1"));
        assert_eq!(confirmed.ancestor_hash, Some(ContentHash::of(b"v1")));

        let r2 = remote("1", "a.md", b"v2");
        let pushed = FileEntry::pushed(&r2, ContentHash::of(b"v2"), Some(&confirmed));
        assert_eq!(pushed.last_action, LastAction::Push);
        assert_eq!(pushed.ancestor_hash, Some(ContentHash::of(b"v1")));

        let fresh = FileEntry::pushed(&r2, ContentHash::of(b"v2"), None);
        assert_eq!(fresh.ancestor_hash, None);
    }

    #[test]
    fn test_confirm_moves_ancestor_only_on_match() {
        let mut index = SyncIndex::new(DeviceId::generate());
        let r = remote("1", "a.md", b"v2");
        index.set_both(path("a.md"), FileEntry::pushed(&r, ContentHash::of(b"v2"), None));

        assert!(!index.confirm(&path("a.md"), &ContentHash::of(b"other")));
        assert_eq!(index.local(&path("a.md")).unwrap().ancestor_hash, None);

        assert!(index.confirm(&path("a.md"), &ContentHash::of(b"v2")));
        let entry = index.local(&path("a.md")).unwrap();
        assert_eq!(entry.last_action, LastAction::Pull);
        assert_eq!(entry.ancestor_hash, Some(ContentHash::of(b"v2")));

        // Already confirmed: nothing left to do.
        assert!(!index.confirm(&path("a.md"), &ContentHash::of(b"v2")));
    }

    #[test]
    fn test_rename_moves_entries_and_dirtiness() {
        let mut index = SyncIndex::new(DeviceId::generate());
        let r = remote("id-9", "a.md", b"x");
        index.set_both(path("a.md"), FileEntry::confirmed(&r, ContentHash::of(b"x")));
        index.mark_dirty(path("a.md"));

        index.rename(&path("a.md"), &path("dir/b.md"));

        assert!(index.local(&path("a.md")).is_none());
        assert!(index.shared(&path("dir/b.md")).is_some());
        assert!(index.is_dirty(&path("dir/b.md")));
        assert_eq!(index.path_for_remote_id("id-9"), Some(path("dir/b.md")));
    }

    #[test]
    fn test_pending_conflict_flag() {
        let mut index = SyncIndex::new(DeviceId::generate());
        let r = remote("1", "a.md", b"x");
        index.set_both(path("a.md"), FileEntry::confirmed(&r, ContentHash::of(b"x")));
        index.mark_shared_published();

        index.set_pending_conflict(&path("a.md"), true);
        assert!(index.shared_changed());
        assert_eq!(index.pending_conflict_count(), 1);
    }

    #[test]
    fn test_entry_wire_format() {
        let r = remote("abc", "a.md", b"x");
        let entry = FileEntry::confirmed(&r, ContentHash::of(b"x"));
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["remoteId"], "abc");
        assert_eq!(json["lastAction"], "pull");
        assert_eq!(json["pendingConflict"], false);
        assert!(json.get("pendingMove").is_none());
    }
}
