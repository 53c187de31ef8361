//! Advisory merge locks over the shared coordination document.
//!
//! The remote only offers read-modify-write on whole documents, so a lock
//! is a lease entry written into `communication.json` and then re-read to
//! verify ownership. Two devices writing within the same round trip can
//! both pass their own write; the verification read catches the loser as
//! long as the winner's write lands before it. A write that lands after
//! both verifications is the residual race this scheme does not close.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use vaultsync_common::{DeviceId, Result, VaultPath};
use vaultsync_storage::RemoteStore;

use crate::config::SyncConfig;
use crate::retry::{jitter_between, RetryExecutor};

/// A lease on one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeLockEntry {
    pub holder: DeviceId,
    /// Lease expiry in milliseconds since the epoch.
    pub expires_at: i64,
}

impl MergeLockEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    /// Time left on the lease.
    pub fn remaining(&self, now_ms: i64) -> Duration {
        Duration::from_millis((self.expires_at - now_ms).max(0) as u64)
    }
}

/// Shared document through which devices coordinate merges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationDocument {
    #[serde(default)]
    pub merge_locks: BTreeMap<VaultPath, MergeLockEntry>,
    #[serde(default)]
    pub last_updated: i64,
}

impl CommunicationDocument {
    /// Drop expired leases. Returns whether any were removed.
    pub fn purge_expired(&mut self, now_ms: i64) -> bool {
        let before = self.merge_locks.len();
        self.merge_locks.retain(|_, entry| !entry.is_expired(now_ms));
        self.merge_locks.len() != before
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another device holds a live lease.
    Held {
        holder: DeviceId,
        expires_in: Duration,
    },
    /// Our write was overwritten before it could be verified.
    Lost,
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

/// Live leases as read once, for checking many paths without a round trip each.
#[derive(Debug, Clone, Default)]
pub struct LockSnapshot {
    own: Option<DeviceId>,
    locks: BTreeMap<VaultPath, MergeLockEntry>,
}

impl LockSnapshot {
    /// Whether a device other than this one holds `path`.
    pub fn is_locked_by_other(&self, path: &VaultPath) -> bool {
        self.locks
            .get(path)
            .is_some_and(|entry| Some(&entry.holder) != self.own.as_ref())
    }

    /// Every live lease.
    pub fn entries(&self) -> &BTreeMap<VaultPath, MergeLockEntry> {
        &self.locks
    }
}

/// Lease-based lock manager for one device.
#[derive(Clone)]
pub struct LockManager {
    remote: Arc<dyn RemoteStore>,
    retry: RetryExecutor,
    device_id: DeviceId,
    document: VaultPath,
    ttl: Duration,
    attempts: u32,
    jitter: (Duration, Duration),
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        device_id: DeviceId,
        config: &SyncConfig,
    ) -> Result<Self> {
        Ok(Self {
            remote,
            retry: RetryExecutor::new(config.retry_config()),
            device_id,
            document: config.communication_path()?,
            ttl: config.lock_ttl,
            attempts: config.lock_attempts.max(1),
            jitter: (config.lock_jitter_min, config.lock_jitter_max),
        })
    }

    /// Identity written into leases.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Read the coordination document with expired leases purged.
    ///
    /// Also returns the document's remote id, if it exists.
    pub async fn read(&self) -> Result<(CommunicationDocument, Option<String>)> {
        let meta = match self
            .retry
            .execute("read lock document metadata", || {
                self.remote.get_metadata(&self.document)
            })
            .await
        {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok((CommunicationDocument::default(), None)),
            Err(e) => return Err(e),
        };

        let bytes = self
            .retry
            .execute("download lock document", || self.remote.download(&meta.id))
            .await?;

        let mut doc = match serde_json::from_slice::<CommunicationDocument>(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "Coordination document unreadable, treating as empty");
                CommunicationDocument::default()
            }
        };
        doc.purge_expired(Utc::now().timestamp_millis());
        Ok((doc, Some(meta.id)))
    }

    async fn write(&self, doc: &CommunicationDocument, existing_id: Option<&str>) -> Result<()> {
        let data = serde_json::to_vec_pretty(doc)?;
        if let Some(parent) = self.document.parent() {
            if !parent.is_root() {
                self.retry
                    .execute("ensure lock folder", || {
                        self.remote.ensure_folders_exist(std::slice::from_ref(&parent))
                    })
                    .await?;
            }
        }
        self.retry
            .execute("write lock document", || {
                self.remote
                    .upload(&self.document, data.clone(), Utc::now(), existing_id)
            })
            .await?;
        Ok(())
    }

    /// Try once to take the lease on `path`.
    ///
    /// Reads the document, refuses if another device holds a live lease,
    /// writes our lease, then re-reads to verify it survived.
    pub async fn acquire(&self, path: &VaultPath) -> Result<LockOutcome> {
        let now = Utc::now().timestamp_millis();
        let (mut doc, id) = self.read().await?;

        if let Some(entry) = doc.merge_locks.get(path) {
            if entry.holder != self.device_id {
                return Ok(LockOutcome::Held {
                    holder: entry.holder.clone(),
                    expires_in: entry.remaining(now),
                });
            }
        }

        doc.merge_locks.insert(
            path.clone(),
            MergeLockEntry {
                holder: self.device_id.clone(),
                expires_at: now + self.ttl.as_millis() as i64,
            },
        );
        doc.last_updated = now;
        self.write(&doc, id.as_deref()).await?;

        let (verify, _) = self.read().await?;
        let outcome = match verify.merge_locks.get(path) {
            Some(entry) if entry.holder == self.device_id => LockOutcome::Acquired,
            Some(entry) => LockOutcome::Held {
                holder: entry.holder.clone(),
                expires_in: entry.remaining(Utc::now().timestamp_millis()),
            },
            None => LockOutcome::Lost,
        };
        debug!(path = %path, outcome = ?outcome, "Lock acquire attempt");
        Ok(outcome)
    }

    /// Acquire with a few jittered retries, returning the last outcome.
    pub async fn acquire_with_retry(&self, path: &VaultPath) -> Result<LockOutcome> {
        let mut attempt = 1;
        loop {
            let outcome = self.acquire(path).await?;
            if outcome.is_acquired() || attempt >= self.attempts {
                return Ok(outcome);
            }
            attempt += 1;
            tokio::time::sleep(jitter_between(self.jitter.0, self.jitter.1)).await;
        }
    }

    /// Release our lease on `path`, if we still hold it.
    pub async fn release(&self, path: &VaultPath) -> Result<()> {
        let (mut doc, id) = self.read().await?;
        let owned = doc
            .merge_locks
            .get(path)
            .is_some_and(|entry| entry.holder == self.device_id);
        if !owned {
            return Ok(());
        }

        doc.merge_locks.remove(path);
        doc.last_updated = Utc::now().timestamp_millis();
        self.write(&doc, id.as_deref()).await?;
        debug!(path = %path, "Released merge lock");
        Ok(())
    }

    /// Live lease on `path` held by another device, if any.
    pub async fn check(&self, path: &VaultPath) -> Result<Option<MergeLockEntry>> {
        let (doc, _) = self.read().await?;
        Ok(doc
            .merge_locks
            .get(path)
            .filter(|entry| entry.holder != self.device_id)
            .cloned())
    }

    /// Read every live lease once.
    pub async fn snapshot(&self) -> Result<LockSnapshot> {
        let (doc, _) = self.read().await?;
        Ok(LockSnapshot {
            own: Some(self.device_id.clone()),
            locks: doc.merge_locks,
        })
    }
}
