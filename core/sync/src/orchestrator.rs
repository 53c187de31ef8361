//! Sync state machine: at most one pass, scan or rebuild per process.
//!
//! Requests arriving during a pass are folded into a single follow-up pass
//! and their callers get the result of the pass already running. A request
//! arriving during a full scan pauses the scan at its next chunk boundary.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vaultsync_common::{Error, Result};

use crate::engine::{PassReport, PassRequest, RebuildReport, SyncEngine};
use crate::notify::SyncTrigger;
use crate::scan::{FullScanProgress, ScanOutcome};

/// What the device is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Idle,
    SmartSyncing,
    FullScanning,
    /// A full scan was interrupted and can be resumed.
    Paused,
    /// The index is being rebuilt.
    Migrating,
}

impl SyncState {
    fn is_busy(self) -> bool {
        matches!(
            self,
            SyncState::SmartSyncing | SyncState::FullScanning | SyncState::Migrating
        )
    }
}

type Waiter = oneshot::Sender<Result<PassReport>>;

struct Inner {
    state: SyncState,
    /// Merged parameters of requests that arrived while busy.
    pending: Option<PassRequest>,
    /// Callers waiting for the pass that is running now.
    waiters: Vec<Waiter>,
    scan_progress: Option<FullScanProgress>,
}

/// Serializes passes, scans and rebuilds for one engine.
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    inner: Mutex<Inner>,
    interrupt: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                pending: None,
                waiters: Vec::new(),
                scan_progress: None,
            }),
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn state(&self) -> SyncState {
        self.inner.lock().await.state
    }

    /// Request a sync pass.
    ///
    /// If a pass is already running the request is merged into the next
    /// pass and this call resolves with the running pass's result.
    pub async fn request_sync(&self, request: PassRequest) -> Result<PassReport> {
        let waiting = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_busy() {
                if inner.state == SyncState::FullScanning {
                    debug!("Interrupting full scan for sync request");
                    self.interrupt.store(true, Ordering::SeqCst);
                }
                inner.pending = Some(match inner.pending {
                    Some(pending) => pending.merge(request),
                    None => request,
                });
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                Some(rx)
            } else {
                inner.state = SyncState::SmartSyncing;
                None
            }
        };

        if let Some(rx) = waiting {
            debug!(trigger = %request.trigger, "Sync request coalesced");
            return rx.await.map_err(|_| Error::Interrupted)?;
        }

        let result = self.engine.run_pass(request).await;
        let next = self.finish_pass(&result).await;
        self.drain(next).await;
        result
    }

    /// Start a background full scan, resuming a paused one.
    ///
    /// Only allowed while idle or paused.
    pub async fn request_full_scan(&self, trigger: SyncTrigger) -> Result<ScanOutcome> {
        let resume = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_busy() {
                return Err(Error::Conflict(format!(
                    "cannot start a full scan while {:?}",
                    inner.state
                )));
            }
            inner.state = SyncState::FullScanning;
            self.interrupt.store(false, Ordering::SeqCst);
            inner.scan_progress.take()
        };

        let outcome = self.engine.run_scan(trigger, resume, &self.interrupt).await;

        let next = {
            let mut inner = self.inner.lock().await;
            self.interrupt.store(false, Ordering::SeqCst);
            inner.scan_progress = match &outcome {
                Ok(ScanOutcome::Paused(progress)) => Some(progress.clone()),
                _ => None,
            };
            self.settle(&mut inner)
        };
        self.drain(next).await;
        outcome
    }

    /// Rebuild the index from the remote listing.
    ///
    /// Only allowed while idle or paused; discards paused scan progress.
    pub async fn rebuild_index(&self, trigger: SyncTrigger) -> Result<RebuildReport> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_busy() {
                return Err(Error::Conflict(format!(
                    "cannot rebuild the index while {:?}",
                    inner.state
                )));
            }
            inner.state = SyncState::Migrating;
            inner.scan_progress = None;
        }

        let report = self.engine.rebuild_index(trigger).await;

        let next = {
            let mut inner = self.inner.lock().await;
            self.settle(&mut inner)
        };
        self.drain(next).await;
        report
    }

    /// Issue interval-triggered passes until `shutdown` resolves.
    ///
    /// A paused full scan is resumed after each pass.
    pub async fn run_periodic(&self, period: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(period = ?period, "Periodic sync started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.request_sync(PassRequest::new(SyncTrigger::Interval)).await {
                        warn!(error = %e, "Periodic sync failed");
                    }
                    if self.state().await == SyncState::Paused {
                        if let Err(e) = self.request_full_scan(SyncTrigger::Interval).await {
                            warn!(error = %e, "Resuming full scan failed");
                        }
                    }
                }
            }
        }
        info!("Periodic sync stopped");
    }

    /// Hand a finished pass's result to every waiter and decide what runs next.
    async fn finish_pass(&self, result: &Result<PassReport>) -> Option<PassRequest> {
        let mut inner = self.inner.lock().await;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        self.settle(&mut inner)
    }

    /// Leave the busy state, or claim the pending pass if there is one.
    fn settle(&self, inner: &mut Inner) -> Option<PassRequest> {
        match inner.pending.take() {
            Some(next) => {
                inner.state = SyncState::SmartSyncing;
                Some(next)
            }
            None => {
                inner.state = if inner.scan_progress.is_some() {
                    SyncState::Paused
                } else {
                    SyncState::Idle
                };
                None
            }
        }
    }

    /// Run follow-up passes until no request is pending.
    async fn drain(&self, mut next: Option<PassRequest>) {
        while let Some(request) = next {
            debug!(trigger = %request.trigger, "Running coalesced pass");
            let result = self.engine.run_pass(request).await;
            if let Err(e) = &result {
                warn!(error = %e, "Coalesced pass failed");
            }
            next = self.finish_pass(&result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::testing::{fast_config, path};
    use crate::notify::{NotifyEvent, RecordingNotifier};
    use crate::pull::PullReport;
    use crate::push::PushReport;
    use vaultsync_storage::{MemoryFs, MemoryRemote};

    struct Setup {
        orchestrator: SyncOrchestrator,
        local: Arc<MemoryFs>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn setup(config: SyncConfig) -> Setup {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(MemoryFs::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = SyncEngine::open(
            SyncConfig {
                device_id: Some("device-a".to_string()),
                ..config
            },
            remote,
            local.clone(),
            notifier.clone(),
        )
        .await
        .unwrap();
        Setup {
            orchestrator: SyncOrchestrator::new(Arc::new(engine)),
            local,
            notifier,
        }
    }

    fn fake_report(trigger: SyncTrigger) -> PassReport {
        PassReport {
            trigger,
            pull: PullReport::default(),
            push: PushReport::default(),
            confirmation_pulls: 0,
            scan: None,
            duration: Duration::ZERO,
        }
    }

    async fn wait_for_waiters(orchestrator: &SyncOrchestrator, count: usize) {
        while orchestrator.inner.lock().await.waiters.len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_single_request_runs_and_returns_to_idle() {
        let s = setup(fast_config()).await;
        s.local.put(&path("a.md"), b"a");
        let report = s
            .orchestrator
            .request_sync(PassRequest::new(SyncTrigger::Manual))
            .await
            .unwrap();
        assert_eq!(report.push.uploaded, 1);
        assert_eq!(s.orchestrator.state().await, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_requests_during_pass_are_coalesced() {
        let s = setup(fast_config()).await;
        let o = &s.orchestrator;
        o.inner.lock().await.state = SyncState::SmartSyncing;

        let (first, second, ()) = tokio::join!(
            o.request_sync(PassRequest::new(SyncTrigger::FileChange)),
            o.request_sync(PassRequest::new(SyncTrigger::Manual).with_full_scan()),
            async {
                wait_for_waiters(o, 2).await;
                let pending = o.inner.lock().await.pending.unwrap();
                assert_eq!(pending.trigger, SyncTrigger::Manual);
                assert!(pending.full_vault_scan);

                // Finish the "running" pass; the waiters get its result and
                // one follow-up pass runs with the merged parameters.
                let next = o.finish_pass(&Ok(fake_report(SyncTrigger::Startup))).await;
                o.drain(next).await;
            }
        );

        assert_eq!(first.unwrap().trigger, SyncTrigger::Startup);
        assert_eq!(second.unwrap().trigger, SyncTrigger::Startup);
        assert_eq!(
            s.notifier.triggers(NotifyEvent::SyncStarted),
            vec![SyncTrigger::Manual]
        );
        assert!(s.notifier.events().contains(&NotifyEvent::ScanComplete));
        assert_eq!(o.state().await, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_sync_request_pauses_full_scan() {
        let s = setup(SyncConfig {
            scan_chunk_size: 1,
            ..fast_config()
        })
        .await;
        let o = &s.orchestrator;
        for i in 0..4 {
            s.local.put(&path(&format!("n{}.md", i)), b"x");
        }
        o.request_sync(PassRequest::new(SyncTrigger::Startup))
            .await
            .unwrap();

        let (outcome, report) = tokio::join!(o.request_full_scan(SyncTrigger::Interval), async {
            while o.state().await != SyncState::FullScanning {
                tokio::task::yield_now().await;
            }
            o.request_sync(PassRequest::new(SyncTrigger::Manual)).await
        });

        assert_eq!(report.unwrap().trigger, SyncTrigger::Manual);
        assert!(matches!(outcome.unwrap(), ScanOutcome::Paused(_)));
        assert_eq!(o.state().await, SyncState::Paused);
        assert!(s.notifier.events().contains(&NotifyEvent::ScanPaused));

        let resumed = o.request_full_scan(SyncTrigger::Manual).await.unwrap();
        assert!(matches!(resumed, ScanOutcome::Completed(_)));
        assert_eq!(o.state().await, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_scan_and_rebuild_only_from_idle() {
        let s = setup(fast_config()).await;
        s.orchestrator.inner.lock().await.state = SyncState::SmartSyncing;
        assert!(matches!(
            s.orchestrator.request_full_scan(SyncTrigger::Manual).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            s.orchestrator.rebuild_index(SyncTrigger::Manual).await,
            Err(Error::Conflict(_))
        ));

        s.orchestrator.inner.lock().await.state = SyncState::Idle;
        s.orchestrator
            .rebuild_index(SyncTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(s.orchestrator.state().await, SyncState::Idle);
        assert!(s.notifier.events().contains(&NotifyEvent::IndexRebuilt));
    }

    #[tokio::test]
    async fn test_periodic_issues_interval_passes() {
        let s = setup(fast_config()).await;
        s.orchestrator
            .run_periodic(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(35)),
            )
            .await;

        let triggers = s.notifier.triggers(NotifyEvent::SyncStarted);
        assert!(!triggers.is_empty());
        assert!(triggers.iter().all(|t| *t == SyncTrigger::Interval));
        assert_eq!(s.orchestrator.state().await, SyncState::Idle);
    }
}
