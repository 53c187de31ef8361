//! Local vault file system seam and its disk-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use vaultsync_common::{Error, Result, VaultPath};

/// Folder (relative to the vault root) that receives trashed files.
pub const TRASH_DIR: &str = ".trash";

/// Size and modification time of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStat {
    pub path: VaultPath,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// The host vault as seen by the sync engine.
#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Check if a file or folder exists.
    async fn exists(&self, path: &VaultPath) -> Result<bool>;

    /// Read the full content of a file.
    async fn read_binary(&self, path: &VaultPath) -> Result<Vec<u8>>;

    /// Write a file, creating parent folders as needed.
    async fn write_binary(&self, path: &VaultPath, data: &[u8]) -> Result<()>;

    /// Stat a path; None if it does not exist.
    async fn stat(&self, path: &VaultPath) -> Result<Option<LocalStat>>;

    /// Rename a file, creating the destination's parent folders.
    ///
    /// # Errors
    /// - Source missing
    /// - Destination already exists
    async fn rename(&self, from: &VaultPath, to: &VaultPath) -> Result<()>;

    /// Move a file to the vault trash.
    async fn trash(&self, path: &VaultPath) -> Result<()>;

    /// List every file in the vault recursively (folders excluded).
    async fn list(&self) -> Result<Vec<LocalStat>>;

    /// Create a folder and its parents.
    async fn mkdir(&self, path: &VaultPath) -> Result<()>;
}

/// Disk-backed vault rooted at a directory.
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    /// Create a new disk vault with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the vault.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a VaultPath to a filesystem path.
    fn to_fs_path(&self, path: &VaultPath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn to_stat(path: VaultPath, meta: &std::fs::Metadata) -> LocalStat {
        let modified: DateTime<Utc> = meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        LocalStat {
            path,
            size: if meta.is_file() { meta.len() } else { 0 },
            modified,
            is_dir: meta.is_dir(),
        }
    }

    async fn ensure_parent(&self, fs_path: &Path) -> Result<()> {
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LocalFs for DiskFs {
    async fn exists(&self, path: &VaultPath) -> Result<bool> {
        Ok(fs::try_exists(self.to_fs_path(path)).await?)
    }

    async fn read_binary(&self, path: &VaultPath) -> Result<Vec<u8>> {
        let fs_path = self.to_fs_path(path);
        match fs::read(&fs_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("File not found: {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_binary(&self, path: &VaultPath, data: &[u8]) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        self.ensure_parent(&fs_path).await?;
        fs::write(&fs_path, data).await?;
        Ok(())
    }

    async fn stat(&self, path: &VaultPath) -> Result<Option<LocalStat>> {
        match fs::metadata(self.to_fs_path(path)).await {
            Ok(meta) => Ok(Some(Self::to_stat(path.clone(), &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: &VaultPath, to: &VaultPath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !fs::try_exists(&from_path).await? {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if fs::try_exists(&to_path).await? {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        self.ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn trash(&self, path: &VaultPath) -> Result<()> {
        let from_path = self.to_fs_path(path);
        if !fs::try_exists(&from_path).await? {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        let mut target = self.root.join(TRASH_DIR);
        for component in path.components() {
            target.push(component);
        }
        if fs::try_exists(&target).await? {
            let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            let name = format!("{}.{}", path.name().unwrap_or("file"), stamp);
            target.set_file_name(name);
        }

        self.ensure_parent(&target).await?;
        fs::rename(&from_path, &target).await?;
        debug!(path = %path, "Moved file to trash");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<LocalStat>> {
        let mut results = Vec::new();
        let mut pending = vec![(self.root.clone(), VaultPath::root())];

        while let Some((dir, vault_dir)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                if vault_dir.is_root() && name == TRASH_DIR {
                    continue;
                }

                let child = vault_dir.join(&name)?;
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push((entry.path(), child));
                } else if meta.is_file() {
                    results.push(Self::to_stat(child, &meta));
                }
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    async fn mkdir(&self, path: &VaultPath) -> Result<()> {
        fs::create_dir_all(self.to_fs_path(path)).await?;
        Ok(())
    }
}
