//! A dedicated thread that runs the integrity guard off the request path.
//!
//! Runs are requested over a bounded channel and, optionally, fired on a fixed
//! interval. Dropping the worker closes the channel and joins the thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::RepairWorkerConfig;
use crate::error::{IdentityError, IdentityResult};

use super::{IntegrityGuard, RepairReport};

enum Job {
    Run {
        reply: Sender<IdentityResult<RepairReport>>,
    },
}

/// Handle returned by [`RepairWorker::trigger`].
pub struct RepairHandle {
    rx: Receiver<IdentityResult<RepairReport>>,
}

impl RepairHandle {
    /// Waits for the run to complete.
    pub fn join(self) -> IdentityResult<RepairReport> {
        self.rx.recv().map_err(|_| IdentityError::Disconnected)?
    }

    /// Waits for the run to complete with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> IdentityResult<RepairReport> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            crossbeam_channel::RecvTimeoutError::Timeout => IdentityError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            crossbeam_channel::RecvTimeoutError::Disconnected => IdentityError::Disconnected,
        })?
    }
}

/// Background integrity runner.
pub struct RepairWorker {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    queue_capacity: usize,
    completed: Arc<AtomicU64>,
}

impl RepairWorker {
    /// Spawns the worker thread.
    ///
    /// # Errors
    /// Returns `Internal` if the thread cannot be spawned.
    pub fn start(guard: Arc<IntegrityGuard>, config: RepairWorkerConfig) -> IdentityResult<Self> {
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);
        let completed = Arc::new(AtomicU64::new(0));
        let ticker = config.interval.map_or_else(never, tick);

        let runs = Arc::clone(&completed);
        let handle = thread::Builder::new()
            .name("kyro-identity-repair".to_string())
            .spawn(move || loop {
                select! {
                    recv(rx) -> msg => match msg {
                        Ok(Job::Run { reply }) => {
                            let result = guard.repair();
                            runs.fetch_add(1, Ordering::SeqCst);
                            let _ = reply.send(result);
                        }
                        Err(_) => break,
                    },
                    recv(ticker) -> _ => {
                        match guard.repair() {
                            Ok(report) => debug!(repaired = report.actions.len(), "scheduled integrity pass"),
                            Err(e) => warn!(error = %e, "scheduled integrity pass failed"),
                        }
                        runs.fetch_add(1, Ordering::SeqCst);
                    },
                }
            })
            .map_err(|e| IdentityError::internal(format!("failed to spawn repair worker: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            queue_capacity,
            completed,
        })
    }

    /// Queues an on-demand run.
    ///
    /// # Errors
    /// - `QueueFull`: too many runs already queued
    /// - `Disconnected`: the worker has stopped
    pub fn trigger(&self) -> IdentityResult<RepairHandle> {
        let tx = self.tx.as_ref().ok_or(IdentityError::Disconnected)?;
        let (reply, rx) = bounded(1);
        match tx.try_send(Job::Run { reply }) {
            Ok(()) => Ok(RepairHandle { rx }),
            Err(TrySendError::Full(_)) => Err(IdentityError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(IdentityError::Disconnected),
        }
    }

    /// Runs a pass and waits for its report.
    pub fn run_now(&self) -> IdentityResult<RepairReport> {
        self.trigger()?.join()
    }

    /// Runs completed so far, scheduled and on-demand.
    #[must_use]
    pub fn completed_runs(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stops the worker after queued runs drain.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("repair worker panicked");
            }
        }
    }
}

impl Drop for RepairWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
