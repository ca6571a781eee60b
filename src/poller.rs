//! Per-job status polling.
//!
//! Each tracked job gets its own task, registered under the job's persisted
//! id. The registry owns a cancellation guard for every task, so removing an
//! entry cancels the task and no poller outlives the registry's root token.

use crate::history::Update;
use crate::job::JobId;
use crate::manager::{Notice, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::*;

struct PollHandle {
    seq: u64,
    _cancel: DropGuard,
    task: JoinHandle<()>,
}

pub(crate) struct Pollers {
    root: CancellationToken,
    slots: Mutex<HashMap<String, PollHandle>>,
    next_seq: AtomicU64,
}

impl Pollers {
    pub(crate) fn new() -> Self {
        Pollers {
            root: CancellationToken::new(),
            slots: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Spawn `run` as the poller for `id` unless one is already active.
    pub(crate) fn start<F, Fut>(&self, id: &str, run: F) -> bool
    where
        F: FnOnce(CancellationToken, u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return false;
        }
        let mut slots = self.slots.lock();
        if slots.contains_key(id) {
            return false;
        }

        let token = self.root.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run(token.clone(), seq).instrument(info_span!("poller", job_id = %id)));
        slots.insert(
            id.to_string(),
            PollHandle {
                seq,
                _cancel: token.drop_guard(),
                task,
            },
        );
        true
    }

    /// Cancel the poller for `id`. Stopping an unknown or finished poller
    /// does nothing.
    pub(crate) fn stop(&self, id: &str) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    /// Called by a poller task on its way out. Returns false if the slot was
    /// already taken away by a stop.
    fn finished(&self, id: &str, seq: u64) -> bool {
        let mut slots = self.slots.lock();
        if slots.get(id).is_some_and(|h| h.seq == seq) {
            slots.remove(id);
            return true;
        }
        false
    }

    pub(crate) fn is_active(&self, id: &str) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub(crate) fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every poller and refuse new ones. Returns the tasks so the
    /// caller can wait for them to wind down.
    pub(crate) fn shutdown(&self) -> Vec<JoinHandle<()>> {
        self.root.cancel();
        self.slots
            .lock()
            .drain()
            .map(|(_, PollHandle { task, .. })| task)
            .collect()
    }
}

/// Poll one job until it turns terminal, leaves the history, fails to fetch,
/// or is cancelled.
pub(crate) async fn run(shared: Arc<Shared>, job_id: String, token: CancellationToken, seq: u64) {
    let period = shared.config.poll_interval;
    let mut ticks = time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let target = JobId::persisted(job_id.clone());
    let mut finished = None;
    debug!("Poller started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Poller cancelled");
                break;
            },
            _ = ticks.tick() => {}
        }

        let fetched = tokio::select! {
            _ = token.cancelled() => {
                debug!("Poller cancelled during fetch");
                break;
            },
            fetched = shared.gateway.fetch(&job_id) => fetched,
        };

        let job = match fetched {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, transient = err.is_transient(), "Status fetch failed, polling stopped");
                shared.notify(Notice::PollInterrupted {
                    id: job_id.clone(),
                    error: err.to_string(),
                });
                break;
            }
        };

        if job.id != target {
            warn!(answered = %job.id, "Gateway answered for another job, polling stopped");
            shared.notify(Notice::PollInterrupted {
                id: job_id.clone(),
                error: format!("status response carried id {}", job.id),
            });
            break;
        }

        let current = {
            let mut history = shared.history.lock();
            match history.update(&target, job) {
                Update::Stale { current, offered } => {
                    debug!(%current, %offered, "Discarded stale status")
                }
                Update::Missing => debug!("Job left the history"),
                Update::Applied | Update::Replaced => {}
            }
            history.get(&target).cloned()
        };

        let Some(current) = current else {
            break;
        };
        trace!(status = %current.status, progress = ?current.progress, "Status polled");
        if current.is_terminal() {
            finished = Some(current);
            break;
        }
    }

    // The terminal notice belongs to whoever releases the slot.
    if shared.pollers.finished(&job_id, seq) {
        if let Some(job) = finished {
            info!(status = %job.status, "Job finished");
            shared.notify(Notice::terminal(&job));
        }
    }
}
