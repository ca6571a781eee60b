use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, ListQuery};
use crate::history::{History, PageCursor, Update};
use crate::job::{Job, JobId, Kind, LocalId, Status};
use crate::poller::{self, Pollers};
use crate::request::GenerationRequest;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

/// Non-fatal events published while the manager works.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Submitted { id: String },
    Completed { id: String },
    Failed { id: String, message: Option<String> },
    /// Polling stopped because the status could not be fetched. The job keeps
    /// its last known state.
    PollInterrupted { id: String, error: String },
    Deleted { ids: Vec<String> },
}

impl Notice {
    pub(crate) fn terminal(job: &Job) -> Self {
        let id = job.id.to_string();
        match job.status {
            Status::Failed => Notice::Failed {
                id,
                message: job.error_message.clone(),
            },
            _ => Notice::Completed { id },
        }
    }
}

pub(crate) struct Shared {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) history: Mutex<History>,
    pub(crate) pollers: Pollers,
    pub(crate) config: ManagerConfig,
    loading: tokio::sync::Mutex<()>,
    notices: UnboundedSender<Notice>,
}

impl Shared {
    pub(crate) fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            trace!("No notice subscriber");
        }
    }
}

/// Removes a provisional entry unless disarmed, so an abandoned or failed
/// submission never leaves it behind.
struct Rollback<'a> {
    history: &'a Mutex<History>,
    id: Option<JobId>,
}

impl<'a> Rollback<'a> {
    fn new(history: &'a Mutex<History>, id: JobId) -> Self {
        Rollback { history, id: Some(id) }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.history.lock().remove(&id).is_some() {
                debug!(%id, "Provisional entry rolled back");
            }
        }
    }
}

/// Owns the job history and every poller attached to it.
///
/// Dropping the manager cancels all pollers; [`JobManager::shutdown`] does the
/// same and waits for them to finish.
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        config: ManagerConfig,
        notices: UnboundedSender<Notice>,
    ) -> Self {
        let history = History::new(config.page_size);
        JobManager {
            shared: Arc::new(Shared {
                gateway,
                history: Mutex::new(history),
                pollers: Pollers::new(),
                config,
                loading: tokio::sync::Mutex::new(()),
                notices,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.pollers.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Submit a generation.
    ///
    /// A provisional entry is put at the head of the history before the
    /// gateway is called and replaced in place by the persisted job once it
    /// answers. If the gateway fails, the entry is removed again.
    #[instrument(skip_all, fields(kind = %request.kind()))]
    pub async fn submit(&self, request: GenerationRequest) -> Result<Job> {
        self.ensure_running()?;
        let input = request.validate(self.shared.config.max_prompt_len)?;

        let local_id = LocalId::new();
        let provisional = JobId::provisional(local_id);
        self.shared
            .history
            .lock()
            .prepend(Job::provisional(local_id, input.prompt(), input.params().clone()));
        let rollback = Rollback::new(&self.shared.history, provisional.clone());
        debug!(%provisional, "Optimistic entry inserted");

        let persisted = match self.shared.gateway.submit(&input).await {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "Submission failed");
                return Err(err);
            }
        };
        let Some(id) = persisted.id.as_persisted().map(str::to_string) else {
            return Err(Error::Decode("submitted job carries no persisted id".into()));
        };

        let current = {
            let mut history = self.shared.history.lock();
            if self.shared.pollers.is_shut_down() {
                None
            } else {
                match history.update(&provisional, persisted.clone()) {
                    Update::Missing => {
                        history.prepend(persisted.clone());
                    }
                    outcome => debug!(?outcome, "Provisional entry reconciled"),
                }
                Some(history.get(&persisted.id).cloned().unwrap_or(persisted))
            }
        };
        let Some(current) = current else {
            warn!(job_id = %id, "Manager shut down while submitting");
            return Err(Error::ShutDown);
        };
        rollback.disarm();

        info!(job_id = %id, status = %current.status, "Generation submitted");
        self.shared.notify(Notice::Submitted { id: id.clone() });
        if current.is_terminal() {
            self.shared.notify(Notice::terminal(&current));
        } else {
            self.track(&id);
        }
        Ok(current)
    }

    /// Replace the history with page `page`, resetting the cursor.
    ///
    /// Queues behind any load already in flight.
    #[instrument(skip(self))]
    pub async fn load(&self, page: u32, page_size: u32, kind: Option<Kind>) -> Result<()> {
        self.ensure_running()?;
        let _loading = self.shared.loading.lock().await;
        self.load_locked(page.max(1), page_size, kind).await
    }

    /// Reload page 1 with the current page size and filter.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_running()?;
        let _loading = self.shared.loading.lock().await;
        let (cursor, filter) = {
            let history = self.shared.history.lock();
            (history.cursor(), history.filter())
        };
        self.load_locked(1, cursor.page_size, filter).await
    }

    async fn load_locked(&self, page: u32, page_size: u32, kind: Option<Kind>) -> Result<()> {
        let fetched = self
            .shared
            .gateway
            .list(ListQuery {
                page,
                limit: page_size,
                kind,
            })
            .await?;
        let records = fetched.records.len();

        let left = {
            let mut history = self.shared.history.lock();
            if self.shared.pollers.is_shut_down() {
                return Err(Error::ShutDown);
            }
            history.reset(fetched, page_size, kind)
        };
        for id in &left {
            self.shared.pollers.stop(id);
        }
        debug!(records, dropped = left.len(), "History reloaded");
        self.settle_finished();
        self.resume_polling();
        Ok(())
    }

    /// Stop the pollers of tracked jobs a reload has shown to be terminal.
    fn settle_finished(&self) {
        let tracked = self.shared.pollers.active();
        let finished: Vec<Job> = {
            let history = self.shared.history.lock();
            tracked
                .iter()
                .filter_map(|id| history.get(&JobId::persisted(id.as_str())))
                .filter(|job| job.is_terminal())
                .cloned()
                .collect()
        };
        for job in finished {
            let Some(id) = job.id.as_persisted() else {
                continue;
            };
            if self.shared.pollers.stop(id) {
                info!(job_id = %id, status = %job.status, "Job finished");
                self.shared.notify(Notice::terminal(&job));
            }
        }
    }

    /// Append the next page. Does nothing while another load is in flight or
    /// when the last page has been reached.
    #[instrument(skip(self))]
    pub async fn load_more(&self) -> Result<()> {
        self.ensure_running()?;
        let Ok(_loading) = self.shared.loading.try_lock() else {
            debug!("Load already in flight");
            return Ok(());
        };
        let (cursor, filter) = {
            let history = self.shared.history.lock();
            (history.cursor(), history.filter())
        };
        if !cursor.has_next {
            debug!(page = cursor.page, "No further pages");
            return Ok(());
        }

        let fetched = self
            .shared
            .gateway
            .list(ListQuery {
                page: cursor.page + 1,
                limit: cursor.page_size,
                kind: filter,
            })
            .await?;
        let offered = fetched.records.len();
        let added = {
            let mut history = self.shared.history.lock();
            if self.shared.pollers.is_shut_down() {
                return Err(Error::ShutDown);
            }
            history.append(fetched)
        };
        debug!(offered, added = added.len(), "Page appended");
        self.resume_polling();
        Ok(())
    }

    fn resume_polling(&self) {
        if !self.shared.config.resume_polling_on_load {
            return;
        }
        let pending = self.shared.history.lock().in_progress();
        for id in pending {
            self.track(&id);
        }
    }

    /// Delete one job. The history only changes once the gateway confirms.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        self.shared.gateway.delete(id).await?;
        self.forget(&[id.to_string()]);
        Ok(())
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    pub async fn batch_delete(&self, ids: &[String]) -> Result<()> {
        self.ensure_running()?;
        if ids.is_empty() {
            return Ok(());
        }
        self.shared.gateway.batch_delete(ids).await?;
        self.forget(ids);
        Ok(())
    }

    /// Delete every persisted job currently in the history.
    pub async fn clear(&self) -> Result<()> {
        let ids: Vec<String> = self
            .shared
            .history
            .lock()
            .jobs()
            .iter()
            .filter_map(|j| j.id.as_persisted().map(str::to_string))
            .collect();
        self.batch_delete(&ids).await
    }

    fn forget(&self, ids: &[String]) {
        let removed = self.shared.history.lock().remove_persisted(ids);
        for id in ids {
            self.shared.pollers.stop(id);
        }
        info!(requested = ids.len(), removed = removed.len(), "Jobs deleted");
        self.shared.notify(Notice::Deleted { ids: ids.to_vec() });
    }

    /// Most recent jobs straight from the gateway; the history is untouched.
    pub async fn recent(&self, limit: u32) -> Result<Vec<Job>> {
        self.ensure_running()?;
        self.shared.gateway.recent(limit).await
    }

    /// Start polling a persisted job that is in the history and not yet
    /// terminal. Returns false if it is not eligible or already polled.
    pub fn track(&self, id: &str) -> bool {
        let eligible = self
            .shared
            .history
            .lock()
            .get(&JobId::persisted(id))
            .is_some_and(|job| !job.is_terminal());
        if !eligible {
            return false;
        }

        let shared = Arc::clone(&self.shared);
        let job_id = id.to_string();
        self.shared
            .pollers
            .start(id, move |token, seq| poller::run(shared, job_id, token, seq))
    }

    /// Stop polling `id`. Safe to call for unknown or already stopped jobs.
    pub fn untrack(&self, id: &str) -> bool {
        self.shared.pollers.stop(id)
    }

    pub fn is_tracking(&self, id: &str) -> bool {
        self.shared.pollers.is_active(id)
    }

    /// Ids of every job with an active poller, sorted.
    pub fn tracked(&self) -> Vec<String> {
        self.shared.pollers.active()
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.shared.history.lock().jobs().to_vec()
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.shared.history.lock().get(id).cloned()
    }

    pub fn cursor(&self) -> PageCursor {
        self.shared.history.lock().cursor()
    }

    pub fn len(&self) -> usize {
        self.shared.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.history.lock().is_empty()
    }

    /// Cancel every poller, wait for them to exit and drop the history.
    ///
    /// Submissions and loads still waiting on the gateway finish with
    /// [`Error::ShutDown`] and leave the history empty.
    pub async fn shutdown(&self) {
        let tasks = self.shared.pollers.shutdown();
        let count = tasks.len();
        for joined in futures::future::join_all(tasks).await {
            if let Err(err) = joined {
                error!(error = ?err, "Poller task failed");
            }
        }
        self.shared.history.lock().clear();
        info!(pollers = count, "Job manager stopped.");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shared.pollers.shutdown();
    }
}
