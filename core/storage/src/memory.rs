//! In-memory remote store and local vault for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::local::{LocalFs, LocalStat};
use crate::remote::{ChangesPage, RemoteCapabilities, RemoteChange, RemoteFile, RemoteStore, Revision};
use vaultsync_common::{ContentHash, Error, Result, VaultPath};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredFile {
    meta: RemoteFile,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredRevision {
    revision: Revision,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct RemoteState {
    files: BTreeMap<String, StoredFile>,
    folders: BTreeMap<VaultPath, String>,
    revisions: HashMap<String, Vec<StoredRevision>>,
    changes: Vec<RemoteChange>,
    failing_uploads: HashSet<VaultPath>,
    pending_overwrite: Option<(VaultPath, Vec<u8>)>,
    operations: Vec<String>,
}

impl RemoteState {
    fn id_for_path(&self, path: &VaultPath) -> Option<String> {
        self.files
            .iter()
            .find(|(_, f)| &f.meta.path == path)
            .map(|(id, _)| id.clone())
    }

    fn ensure_folder(&mut self, path: &VaultPath) {
        if path.is_root() {
            return;
        }
        for folder in path.ancestors().into_iter().chain(std::iter::once(path.clone())) {
            self.folders
                .entry(folder)
                .or_insert_with(|| Uuid::new_v4().to_string());
        }
    }

    fn write(
        &mut self,
        path: &VaultPath,
        data: Vec<u8>,
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile> {
        if let Some(parent) = path.parent() {
            if !parent.is_root() && !self.folders.contains_key(&parent) {
                return Err(Error::NotFound(format!(
                    "Parent folder not found: {}",
                    parent
                )));
            }
        }

        let id = existing_id
            .filter(|id| self.files.contains_key(*id))
            .map(String::from)
            .or_else(|| self.id_for_path(path))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let hash = ContentHash::of(&data);
        let meta = RemoteFile {
            id: id.clone(),
            path: path.clone(),
            size: data.len() as u64,
            modified,
            content_hash: Some(hash.clone()),
            plaintext_hash: None,
            is_folder: false,
        };

        self.revisions.entry(id.clone()).or_default().push(StoredRevision {
            revision: Revision {
                id: Uuid::new_v4().to_string(),
                content_hash: hash,
                modified,
            },
            data: data.clone(),
        });
        self.files.insert(
            id.clone(),
            StoredFile {
                meta: meta.clone(),
                data,
            },
        );
        self.changes.push(RemoteChange {
            file_id: id,
            removed: false,
            file: Some(meta.clone()),
        });
        self.operations.push(format!("upload:{}", path));

        Ok(meta)
    }
}

/// In-memory remote store.
///
/// Keeps a full change feed and per-file revision history. All data is lost
/// on drop. Test hooks allow injecting upload failures and a competing
/// write that lands right after a device's own upload.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    capabilities: RemoteCapabilities,
    page_size: usize,
}

impl MemoryRemote {
    /// Create an empty store supporting the change feed and history.
    pub fn new() -> Self {
        Self::with_capabilities(RemoteCapabilities {
            supports_changes_api: true,
            supports_history: true,
        })
    }

    /// Create an empty store with the given capabilities.
    pub fn with_capabilities(capabilities: RemoteCapabilities) -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            capabilities,
            page_size: 100,
        }
    }

    /// Set the number of changes returned per feed page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Write a file directly, creating parent folders.
    pub fn put_file(&self, path: &VaultPath, data: &[u8]) -> RemoteFile {
        let mut state = lock(&self.state);
        if let Some(parent) = path.parent() {
            state.ensure_folder(&parent);
        }
        match state.write(path, data.to_vec(), Utc::now(), None) {
            Ok(meta) => meta,
            Err(e) => panic!("put_file on {} failed: {}", path, e),
        }
    }

    /// Read the current content at a path.
    pub fn read_file(&self, path: &VaultPath) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        state
            .files
            .values()
            .find(|f| &f.meta.path == path)
            .map(|f| f.data.clone())
    }

    /// Paths of every stored file.
    pub fn file_paths(&self) -> Vec<VaultPath> {
        let state = lock(&self.state);
        let mut paths: Vec<VaultPath> = state.files.values().map(|f| f.meta.path.clone()).collect();
        paths.sort();
        paths
    }

    /// Make every upload to `path` fail with a network error.
    pub fn fail_uploads_for(&self, path: &VaultPath) {
        lock(&self.state).failing_uploads.insert(path.clone());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        lock(&self.state).failing_uploads.clear();
    }

    /// After the next successful upload to `path`, immediately store `data`
    /// there as well, as if another device had written in between.
    pub fn overwrite_after_next_upload(&self, path: &VaultPath, data: Vec<u8>) {
        lock(&self.state).pending_overwrite = Some((path.clone(), data));
    }

    /// Log of mutating and download operations, e.g. `upload:notes/a.md`.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.state).operations.clone()
    }

    /// Clear the operation log.
    pub fn clear_operations(&self) {
        lock(&self.state).operations.clear();
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> RemoteCapabilities {
        self.capabilities
    }

    async fn get_metadata(&self, path: &VaultPath) -> Result<RemoteFile> {
        let state = lock(&self.state);
        if let Some(file) = state.files.values().find(|f| &f.meta.path == path) {
            return Ok(file.meta.clone());
        }
        if let Some(id) = state.folders.get(path) {
            return Ok(RemoteFile {
                id: id.clone(),
                path: path.clone(),
                size: 0,
                modified: Utc::now(),
                content_hash: None,
                plaintext_hash: None,
                is_folder: true,
            });
        }
        Err(Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn get_metadata_by_id(&self, id: &str) -> Result<RemoteFile> {
        let state = lock(&self.state);
        state
            .files
            .get(id)
            .map(|f| f.meta.clone())
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        let file = state
            .files
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))?;
        state.operations.push(format!("download:{}", file.meta.path));
        Ok(file.data)
    }

    async fn upload(
        &self,
        path: &VaultPath,
        data: Vec<u8>,
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile> {
        let mut state = lock(&self.state);
        if state.failing_uploads.contains(path) {
            return Err(Error::Network(format!("Injected upload failure: {}", path)));
        }

        let meta = state.write(path, data, modified, existing_id)?;

        let overwrite_due =
            matches!(&state.pending_overwrite, Some((target, _)) if target == path);
        if overwrite_due {
            if let Some((target, competing)) = state.pending_overwrite.take() {
                state.write(&target, competing, Utc::now(), Some(&meta.id))?;
            }
        }

        Ok(meta)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let file = state
            .files
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))?;
        state.changes.push(RemoteChange {
            file_id: id.to_string(),
            removed: true,
            file: None,
        });
        state.operations.push(format!("delete:{}", file.meta.path));
        Ok(())
    }

    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: &VaultPath,
    ) -> Result<RemoteFile> {
        let mut state = lock(&self.state);
        let target = new_parent.join(new_name)?;

        if !new_parent.is_root() && !state.folders.contains_key(new_parent) {
            return Err(Error::NotFound(format!(
                "Parent folder not found: {}",
                new_parent
            )));
        }
        if state.id_for_path(&target).is_some_and(|other| other != id) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                target
            )));
        }

        let file = state
            .files
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))?;
        let from = file.meta.path.clone();
        file.meta.path = target.clone();
        let meta = file.meta.clone();

        state.changes.push(RemoteChange {
            file_id: id.to_string(),
            removed: false,
            file: Some(meta.clone()),
        });
        state.operations.push(format!("move:{}->{}", from, target));
        Ok(meta)
    }

    async fn list_all(&self) -> Result<Vec<RemoteFile>> {
        let state = lock(&self.state);
        let mut files: Vec<RemoteFile> = state.files.values().map(|f| f.meta.clone()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn start_page_token(&self) -> Result<String> {
        if !self.capabilities.supports_changes_api {
            return Err(Error::NotPermitted("Change feed disabled".to_string()));
        }
        Ok(lock(&self.state).changes.len().to_string())
    }

    async fn changes_page(&self, token: &str) -> Result<ChangesPage> {
        if !self.capabilities.supports_changes_api {
            return Err(Error::NotPermitted("Change feed disabled".to_string()));
        }
        let start: usize = token
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Bad page token: {}", token)))?;

        let state = lock(&self.state);
        let total = state.changes.len();
        let start = start.min(total);
        let end = (start + self.page_size).min(total);

        let page = ChangesPage {
            changes: state.changes[start..end].to_vec(),
            next_page_token: (end < total).then(|| end.to_string()),
            new_start_page_token: (end >= total).then(|| total.to_string()),
        };
        Ok(page)
    }

    async fn list_revisions(&self, path: &VaultPath) -> Result<Vec<Revision>> {
        if !self.capabilities.supports_history {
            return Err(Error::NotPermitted("History disabled".to_string()));
        }
        let state = lock(&self.state);
        let id = state
            .id_for_path(path)
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))?;
        Ok(state
            .revisions
            .get(&id)
            .map(|revs| revs.iter().map(|r| r.revision.clone()).collect())
            .unwrap_or_default())
    }

    async fn revision_content(&self, path: &VaultPath, revision_id: &str) -> Result<Vec<u8>> {
        if !self.capabilities.supports_history {
            return Err(Error::NotPermitted("History disabled".to_string()));
        }
        let state = lock(&self.state);
        let id = state
            .id_for_path(path)
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))?;
        state
            .revisions
            .get(&id)
            .and_then(|revs| revs.iter().find(|r| r.revision.id == revision_id))
            .map(|r| r.data.clone())
            .ok_or_else(|| Error::NotFound(format!("Revision not found: {}", revision_id)))
    }

    async fn ensure_folders_exist(&self, paths: &[VaultPath]) -> Result<()> {
        let mut state = lock(&self.state);
        for path in paths {
            state.ensure_folder(path);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FsState {
    files: BTreeMap<VaultPath, (Vec<u8>, DateTime<Utc>)>,
    dirs: BTreeSet<VaultPath>,
    trash: Vec<(VaultPath, Vec<u8>)>,
    clock: Option<DateTime<Utc>>,
    failing_stats: HashSet<VaultPath>,
}

impl FsState {
    /// Strictly increasing modification times at millisecond precision,
    /// so back-to-back writes never share a recorded mtime.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(3);
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn add_parents(&mut self, path: &VaultPath) {
        for dir in path.ancestors() {
            self.dirs.insert(dir);
        }
    }
}

/// In-memory local vault.
#[derive(Default)]
pub struct MemoryFs {
    state: Mutex<FsState>,
}

impl MemoryFs {
    /// Create an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file directly.
    pub fn put(&self, path: &VaultPath, data: &[u8]) {
        let mut state = lock(&self.state);
        let modified = state.tick();
        state.add_parents(path);
        state.files.insert(path.clone(), (data.to_vec(), modified));
    }

    /// Make every stat of `path` fail with an io error.
    pub fn fail_stats_for(&self, path: &VaultPath) {
        lock(&self.state).failing_stats.insert(path.clone());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        lock(&self.state).failing_stats.clear();
    }

    /// Current content of a file.
    pub fn get(&self, path: &VaultPath) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).map(|(d, _)| d.clone())
    }

    /// Remove a file without going through the trash.
    pub fn remove(&self, path: &VaultPath) {
        lock(&self.state).files.remove(path);
    }

    /// Remove a folder entry (files beneath it must already be gone).
    pub fn remove_dir(&self, path: &VaultPath) {
        lock(&self.state).dirs.remove(path);
    }

    /// Paths of every file.
    pub fn file_paths(&self) -> Vec<VaultPath> {
        lock(&self.state).files.keys().cloned().collect()
    }

    /// Paths moved to the trash, in order.
    pub fn trashed(&self) -> Vec<VaultPath> {
        lock(&self.state).trash.iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl LocalFs for MemoryFs {
    async fn exists(&self, path: &VaultPath) -> Result<bool> {
        let state = lock(&self.state);
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn read_binary(&self, path: &VaultPath) -> Result<Vec<u8>> {
        self.get(path)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    async fn write_binary(&self, path: &VaultPath, data: &[u8]) -> Result<()> {
        self.put(path, data);
        Ok(())
    }

    async fn stat(&self, path: &VaultPath) -> Result<Option<LocalStat>> {
        let state = lock(&self.state);
        if state.failing_stats.contains(path) {
            return Err(Error::Storage(format!("Injected stat failure: {}", path)));
        }
        if let Some((data, modified)) = state.files.get(path) {
            return Ok(Some(LocalStat {
                path: path.clone(),
                size: data.len() as u64,
                modified: *modified,
                is_dir: false,
            }));
        }
        Ok(state.dirs.contains(path).then(|| LocalStat {
            path: path.clone(),
            size: 0,
            modified: Utc::now(),
            is_dir: true,
        }))
    }

    async fn rename(&self, from: &VaultPath, to: &VaultPath) -> Result<()> {
        let mut state = lock(&self.state);
        if state.files.contains_key(to) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }
        let entry = state
            .files
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", from)))?;
        state.add_parents(to);
        state.files.insert(to.clone(), entry);
        Ok(())
    }

    async fn trash(&self, path: &VaultPath) -> Result<()> {
        let mut state = lock(&self.state);
        let (data, _) = state
            .files
            .remove(path)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?;
        state.trash.push((path.clone(), data));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<LocalStat>> {
        let state = lock(&self.state);
        Ok(state
            .files
            .iter()
            .map(|(path, (data, modified))| LocalStat {
                path: path.clone(),
                size: data.len() as u64,
                modified: *modified,
                is_dir: false,
            })
            .collect())
    }

    async fn mkdir(&self, path: &VaultPath) -> Result<()> {
        let mut state = lock(&self.state);
        state.add_parents(path);
        state.dirs.insert(path.clone());
        Ok(())
    }
}
