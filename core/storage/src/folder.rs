//! Directory-backed remote store.
//!
//! Lets several machines share one vault through a synced or network
//! folder. Object ids are kept stable across renames by a JSON manifest
//! stored next to the data. There is no change feed and no history, so
//! the engine falls back to full index diffs against this store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::remote::{RemoteCapabilities, RemoteFile, RemoteStore};
use vaultsync_common::{ContentHash, Error, Result, VaultPath};

const MANIFEST_FILE: &str = ".remote-manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    path: VaultPath,
    modified: DateTime<Utc>,
    size: u64,
    content_hash: ContentHash,
}

impl ManifestEntry {
    fn to_remote(&self, id: &str) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            path: self.path.clone(),
            size: self.size,
            modified: self.modified,
            content_hash: Some(self.content_hash.clone()),
            plaintext_hash: None,
            is_folder: false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    fn id_for_path(&self, path: &VaultPath) -> Option<String> {
        self.files
            .iter()
            .find(|(_, e)| &e.path == path)
            .map(|(id, _)| id.clone())
    }
}

/// Remote store kept in a plain directory.
pub struct FolderRemote {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl FolderRemote {
    /// Open (and create if needed) a folder store.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            manifest_lock: Mutex::new(()),
        })
    }

    fn to_fs_path(&self, path: &VaultPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    async fn load_manifest(&self) -> Result<Manifest> {
        match fs::read(self.root.join(MANIFEST_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let tmp = self.root.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.root.join(MANIFEST_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FolderRemote {
    fn name(&self) -> &str {
        "folder"
    }

    fn capabilities(&self) -> RemoteCapabilities {
        RemoteCapabilities::default()
    }

    async fn get_metadata(&self, path: &VaultPath) -> Result<RemoteFile> {
        let manifest = self.load_manifest().await?;
        if let Some(id) = manifest.id_for_path(path) {
            return Ok(manifest.files[&id].to_remote(&id));
        }

        let fs_path = self.to_fs_path(path);
        match fs::metadata(&fs_path).await {
            Ok(meta) if meta.is_dir() => Ok(RemoteFile {
                id: format!("folder:{}", path),
                path: path.clone(),
                size: 0,
                modified: meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now()),
                content_hash: None,
                plaintext_hash: None,
                is_folder: true,
            }),
            _ => Err(Error::NotFound(format!("Path not found: {}", path))),
        }
    }

    async fn get_metadata_by_id(&self, id: &str) -> Result<RemoteFile> {
        let manifest = self.load_manifest().await?;
        manifest
            .files
            .get(id)
            .map(|e| e.to_remote(id))
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let entry = self.get_metadata_by_id(id).await?;
        match fs::read(self.to_fs_path(&entry.path)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Object missing for {}", entry.path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        path: &VaultPath,
        data: Vec<u8>,
        modified: DateTime<Utc>,
        existing_id: Option<&str>,
    ) -> Result<RemoteFile> {
        let _guard = self.manifest_lock.lock().await;
        let fs_path = self.to_fs_path(path);

        if let Some(parent) = fs_path.parent() {
            if !fs::try_exists(parent).await? {
                return Err(Error::NotFound(format!(
                    "Parent folder not found for {}",
                    path
                )));
            }
        }

        let mut manifest = self.load_manifest().await?;
        let id = existing_id
            .filter(|id| manifest.files.contains_key(*id))
            .map(String::from)
            .or_else(|| manifest.id_for_path(path))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(previous) = manifest.files.get(&id) {
            if &previous.path != path {
                if let Err(e) = fs::remove_file(self.to_fs_path(&previous.path)).await {
                    warn!(path = %previous.path, error = %e, "Failed to remove previous file location");
                }
            }
        }

        let entry = ManifestEntry {
            path: path.clone(),
            modified,
            size: data.len() as u64,
            content_hash: ContentHash::of(&data),
        };
        fs::write(&fs_path, &data).await?;
        manifest.files.insert(id.clone(), entry.clone());
        self.save_manifest(&manifest).await?;

        debug!(path = %path, id = %id, "Stored object in folder remote");
        Ok(entry.to_remote(&id))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await?;
        let entry = manifest
            .files
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))?;

        match fs::remove_file(self.to_fs_path(&entry.path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.save_manifest(&manifest).await
    }

    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: &VaultPath,
    ) -> Result<RemoteFile> {
        let _guard = self.manifest_lock.lock().await;
        let target = new_parent.join(new_name)?;
        let mut manifest = self.load_manifest().await?;

        if manifest.id_for_path(&target).is_some_and(|other| other != id) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                target
            )));
        }

        let entry = manifest
            .files
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Id not found: {}", id)))?;

        let to_path = self.to_fs_path(&target);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.to_fs_path(&entry.path), &to_path).await?;
        entry.path = target;
        let moved = entry.to_remote(id);

        self.save_manifest(&manifest).await?;
        Ok(moved)
    }

    async fn list_all(&self) -> Result<Vec<RemoteFile>> {
        let manifest = self.load_manifest().await?;
        let mut files: Vec<RemoteFile> = manifest
            .files
            .iter()
            .map(|(id, e)| e.to_remote(id))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn ensure_folders_exist(&self, paths: &[VaultPath]) -> Result<()> {
        for path in paths {
            fs::create_dir_all(self.to_fs_path(path)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(s: &str) -> VaultPath {
        VaultPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_folder_upload_download() {
        let temp = TempDir::new().unwrap();
        let remote = FolderRemote::new(temp.path()).unwrap();

        remote.ensure_folders_exist(&[path("notes")]).await.unwrap();
        let meta = remote
            .upload(&path("notes/a.md"), b"hello".to_vec(), Utc::now(), None)
            .await
            .unwrap();

        assert_eq!(remote.download(&meta.id).await.unwrap(), b"hello");
        assert_eq!(
            remote.get_metadata(&path("notes/a.md")).await.unwrap().id,
            meta.id
        );
        assert!(remote.get_metadata(&path("notes")).await.unwrap().is_folder);
    }

    #[tokio::test]
    async fn test_folder_upload_to_new_path_tolerates_missing_old_file() {
        let temp = TempDir::new().unwrap();
        let remote = FolderRemote::new(temp.path()).unwrap();
        let meta = remote
            .upload(&path("a.md"), b"x".to_vec(), Utc::now(), None)
            .await
            .unwrap();
        std::fs::remove_file(temp.path().join("a.md")).unwrap();

        let moved = remote
            .upload(&path("b.md"), b"y".to_vec(), Utc::now(), Some(&meta.id))
            .await
            .unwrap();
        assert_eq!(moved.id, meta.id);
        assert_eq!(remote.download(&meta.id).await.unwrap(), b"y");
        assert!(remote.get_metadata(&path("a.md")).await.is_err());
    }

    #[tokio::test]
    async fn test_folder_ids_survive_reopen_and_move() {
        let temp = TempDir::new().unwrap();
        let id = {
            let remote = FolderRemote::new(temp.path()).unwrap();
            remote
                .upload(&path("a.md"), b"x".to_vec(), Utc::now(), None)
                .await
                .unwrap()
                .id
        };

        let remote = FolderRemote::new(temp.path()).unwrap();
        let moved = remote.move_file(&id, "b.md", &path("dir")).await.unwrap();
        assert_eq!(moved.id, id);
        assert_eq!(moved.path, path("dir/b.md"));
        assert!(temp.path().join("dir/b.md").exists());

        let listed = remote.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_folder_has_no_change_feed() {
        let temp = TempDir::new().unwrap();
        let remote = FolderRemote::new(temp.path()).unwrap();
        assert!(!remote.capabilities().supports_changes_api);
        assert!(matches!(
            remote.start_page_token().await,
            Err(Error::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn test_folder_delete() {
        let temp = TempDir::new().unwrap();
        let remote = FolderRemote::new(temp.path()).unwrap();
        let meta = remote
            .upload(&path("a.md"), b"x".to_vec(), Utc::now(), None)
            .await
            .unwrap();

        remote.delete(&meta.id).await.unwrap();
        assert!(remote.get_metadata(&path("a.md")).await.unwrap_err().is_not_found());
        assert!(!temp.path().join("a.md").exists());
    }
}
