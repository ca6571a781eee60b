use async_trait::async_trait;
use genq::{
    Error, Gateway, GenerationRequest, ImageParams, Job, JobId, JobManager, JobResult, ListQuery, LocalId,
    ManagerConfig, Notice, Page, Params, Result, Status, ValidatedGenerationInput,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

#[derive(Debug, Clone)]
enum Fault {
    Network,
    Server,
}

impl Fault {
    fn into_error(self) -> Error {
        match self {
            Fault::Network => Error::network("connection reset"),
            Fault::Server => Error::Api {
                code: "500".into(),
                message: "generation backend unavailable".into(),
            },
        }
    }
}

type Reply<T> = std::result::Result<T, Fault>;

/// In-memory gateway answering from scripted replies and logging every call.
#[derive(Default)]
struct ScriptedGateway {
    submits: Mutex<VecDeque<Reply<Job>>>,
    fetches: Mutex<HashMap<String, VecDeque<Reply<Job>>>>,
    pages: Mutex<HashMap<u32, Page>>,
    delete_fault: Mutex<Option<Fault>>,
    submit_gate: Mutex<Option<Arc<Notify>>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn on_submit(&self, reply: Reply<Job>) {
        self.submits.lock().unwrap().push_back(reply);
    }

    fn on_fetch(&self, id: &str, reply: Reply<Job>) {
        self.fetches
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(reply);
    }

    fn on_page(&self, page: Page) {
        self.pages.lock().unwrap().insert(page.current, page);
    }

    fn fail_deletes(&self, fault: Option<Fault>) {
        *self.delete_fault.lock().unwrap() = fault;
    }

    fn gate_submits(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.submit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn gate_lists(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn submit(&self, input: &ValidatedGenerationInput) -> Result<Job> {
        self.record(format!("submit:{}", input.prompt()));
        let gate = self.submit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let reply = self.submits.lock().unwrap().pop_front();
        reply
            .unwrap_or(Err(Fault::Server))
            .map_err(Fault::into_error)
    }

    async fn fetch(&self, id: &str) -> Result<Job> {
        self.record(format!("fetch:{id}"));
        let mut fetches = self.fetches.lock().unwrap();
        let queue = fetches.entry(id.to_string()).or_default();
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.unwrap_or(Err(Fault::Server)).map_err(Fault::into_error)
    }

    async fn list(&self, query: ListQuery) -> Result<Page> {
        self.record(format!("list:{}", query.page));
        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let page = self.pages.lock().unwrap().get(&query.page).cloned();
        page.ok_or_else(|| Fault::Server.into_error())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.record(format!("delete:{id}"));
        match self.delete_fault.lock().unwrap().clone() {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }

    async fn batch_delete(&self, ids: &[String]) -> Result<()> {
        self.record(format!("batch_delete:{}", ids.join(",")));
        match self.delete_fault.lock().unwrap().clone() {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }

    async fn recent(&self, limit: u32) -> Result<Vec<Job>> {
        self.record(format!("recent:{limit}"));
        Ok(Vec::new())
    }
}

fn image_params() -> Params {
    Params::Image(ImageParams {
        size: Some("1024x1024".into()),
        quality: Some("standard".into()),
        ..Default::default()
    })
}

fn fox() -> GenerationRequest {
    GenerationRequest::new("a red fox", image_params())
}

fn job(id: &str, status: Status) -> Job {
    let mut job = Job::provisional(LocalId::new(), "a red fox", image_params());
    job.id = JobId::persisted(id);
    job.status = status;
    job
}

fn completed(id: &str, url: &str) -> Job {
    let mut job = job(id, Status::Completed);
    job.result = Some(JobResult {
        urls: vec![url.to_string()],
        thumbnails: vec![],
    });
    job
}

fn page(ids: impl IntoIterator<Item = String>, current: u32, has_next: bool) -> Page {
    let records: Vec<Job> = ids.into_iter().map(|id| job(&id, Status::Completed)).collect();
    Page {
        size: records.len() as u32,
        records,
        total: 40,
        current,
        pages: 2,
        has_next,
        has_previous: current > 1,
    }
}

fn ids(manager: &JobManager) -> Vec<String> {
    manager.snapshot().iter().map(|j| j.id.to_string()).collect()
}

fn setup(config: ManagerConfig) -> (Arc<ScriptedGateway>, Arc<JobManager>, mpsc::UnboundedReceiver<Notice>) {
    let gateway = Arc::new(ScriptedGateway::default());
    let (send_to_client, recv_from_manager) = mpsc::unbounded_channel();
    let manager = JobManager::new(gateway.clone(), config, send_to_client);
    (gateway, Arc::new(manager), recv_from_manager)
}

fn quiet_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_secs(2),
        resume_polling_on_load: false,
        ..ManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn submission_is_polled_until_completed() {
    let (gateway, manager, mut notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(completed("p1", "u1")));

    let submitted = manager.submit(fox()).await.unwrap();
    assert_eq!(submitted.id, JobId::persisted("p1"));
    assert_eq!(ids(&manager), vec!["p1"]);
    assert_eq!(manager.snapshot()[0].status, Status::Processing);
    assert_eq!(manager.tracked(), vec!["p1".to_string()]);

    sleep(Duration::from_secs(3)).await;

    let entry = manager.get(&JobId::persisted("p1")).unwrap();
    assert_eq!(entry.status, Status::Completed);
    assert_eq!(entry.result.unwrap().urls, vec!["u1".to_string()]);
    assert!(manager.tracked().is_empty());

    sleep(Duration::from_secs(20)).await;
    assert_eq!(gateway.count("fetch:p1"), 1);

    assert_eq!(notices.recv().await, Some(Notice::Submitted { id: "p1".into() }));
    assert_eq!(notices.recv().await, Some(Notice::Completed { id: "p1".into() }));
}

#[tokio::test(start_paused = true)]
async fn empty_prompt_never_reaches_the_gateway() {
    let (gateway, manager, _notices) = setup(quiet_config());

    let err = manager
        .submit(GenerationRequest::new("", image_params()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(gateway.total_calls(), 0);
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_submission_rolls_back() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..3).map(|i| format!("h{i}")), 1, false));
    manager.load(1, 20, None).await.unwrap();
    let before = manager.snapshot();

    gateway.on_submit(Err(Fault::Network));
    let err = manager.submit(fox()).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(manager.snapshot(), before);
    assert!(manager.snapshot().iter().all(|j| !j.id.is_provisional()));
    assert!(manager.tracked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn provisional_entry_is_replaced_in_place() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page(["h1".to_string()], 1, false));
    manager.load(1, 20, None).await.unwrap();

    let gate = gateway.gate_submits();
    gateway.on_submit(Ok(job("p1", Status::Pending)));
    gateway.on_fetch("p1", Ok(job("p1", Status::Processing)));

    let submitting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(fox()).await })
    };
    while gateway.count("submit:") == 0 {
        tokio::task::yield_now().await;
    }

    let during = manager.snapshot();
    assert_eq!(during.len(), 2);
    assert!(during[0].id.is_provisional());
    assert_eq!(during[0].status, Status::Pending);

    gate.notify_one();
    submitting.await.unwrap().unwrap();

    assert_eq!(ids(&manager), vec!["p1", "h1"]);
    assert!(manager.get(&during[0].id).is_none());
}

#[tokio::test(start_paused = true)]
async fn abandoned_submission_leaves_no_provisional_entry() {
    let (gateway, manager, _notices) = setup(quiet_config());
    let _gate = gateway.gate_submits();
    gateway.on_submit(Ok(job("p1", Status::Processing)));

    let submitting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(fox()).await })
    };
    while manager.is_empty() {
        tokio::task::yield_now().await;
    }

    submitting.abort();
    let _ = submitting.await;

    assert!(manager.is_empty());
    assert!(manager.tracked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_failure_keeps_last_known_status() {
    let (gateway, manager, mut notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p2", Status::Processing)));
    gateway.on_fetch("p2", Err(Fault::Network));

    manager.submit(fox()).await.unwrap();
    sleep(Duration::from_secs(3)).await;

    let entry = manager.get(&JobId::persisted("p2")).unwrap();
    assert_eq!(entry.status, Status::Processing);
    assert!(!manager.is_tracking("p2"));

    sleep(Duration::from_secs(20)).await;
    assert_eq!(gateway.count("fetch:p2"), 1);

    assert_eq!(notices.recv().await, Some(Notice::Submitted { id: "p2".into() }));
    assert!(matches!(
        notices.recv().await,
        Some(Notice::PollInterrupted { id, .. }) if id == "p2"
    ));
}

#[tokio::test(start_paused = true)]
async fn server_reported_failure_is_terminal() {
    let (gateway, manager, mut notices) = setup(quiet_config());
    let mut failed = job("p4", Status::Failed);
    failed.error_message = Some("content rejected".into());
    gateway.on_submit(Ok(job("p4", Status::Pending)));
    gateway.on_fetch("p4", Ok(job("p4", Status::Processing)));
    gateway.on_fetch("p4", Ok(failed));

    manager.submit(fox()).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    let entry = manager.get(&JobId::persisted("p4")).unwrap();
    assert_eq!(entry.status, Status::Failed);
    assert_eq!(entry.error_message.as_deref(), Some("content rejected"));
    assert!(manager.tracked().is_empty());
    assert_eq!(gateway.count("fetch:p4"), 2);

    notices.recv().await;
    assert_eq!(
        notices.recv().await,
        Some(Notice::Failed {
            id: "p4".into(),
            message: Some("content rejected".into())
        })
    );
}

#[tokio::test(start_paused = true)]
async fn terminal_submission_starts_no_poller() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(completed("p9", "u9")));

    manager.submit(fox()).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert!(manager.tracked().is_empty());
    assert_eq!(gateway.count("fetch:"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_submissions_are_polled_independently() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("a", Status::Processing)));
    gateway.on_submit(Ok(job("b", Status::Processing)));
    gateway.on_fetch("a", Ok(completed("a", "ua")));
    gateway.on_fetch("b", Ok(job("b", Status::Processing)));
    gateway.on_fetch("b", Ok(job("b", Status::Processing)));
    gateway.on_fetch("b", Ok(completed("b", "ub")));

    manager.submit(fox()).await.unwrap();
    manager.submit(fox()).await.unwrap();
    assert_eq!(ids(&manager), vec!["b", "a"]);
    assert_eq!(manager.tracked(), vec!["a".to_string(), "b".to_string()]);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.tracked(), vec!["b".to_string()]);

    sleep(Duration::from_secs(10)).await;
    assert!(manager.tracked().is_empty());
    assert_eq!(gateway.count("fetch:a"), 1);
    assert_eq!(gateway.count("fetch:b"), 3);
    assert!(manager.snapshot().iter().all(|j| j.status == Status::Completed));
}

#[tokio::test(start_paused = true)]
async fn batch_delete_removes_only_after_confirmation() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page(["p1", "p2", "p3"].map(String::from), 1, false));
    manager.load(1, 20, None).await.unwrap();

    manager
        .batch_delete(&["p1".to_string(), "p3".to_string()])
        .await
        .unwrap();
    assert_eq!(ids(&manager), vec!["p2"]);

    gateway.fail_deletes(Some(Fault::Server));
    let err = manager.batch_delete(&["p2".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    assert_eq!(ids(&manager), vec!["p2"]);

    let err = manager.delete("p2").await.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(ids(&manager), vec!["p2"]);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_job_stops_its_poller() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(job("p1", Status::Processing)));

    manager.submit(fox()).await.unwrap();
    assert!(manager.is_tracking("p1"));

    manager.delete("p1").await.unwrap();
    assert!(!manager.is_tracking("p1"));
    assert!(manager.is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.count("fetch:p1"), 0);
}

#[tokio::test(start_paused = true)]
async fn stopping_is_idempotent() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(job("p1", Status::Processing)));
    manager.submit(fox()).await.unwrap();

    assert!(!manager.untrack("nope"));
    assert!(manager.untrack("p1"));
    assert!(!manager.untrack("p1"));
    assert_eq!(ids(&manager), vec!["p1"]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.count("fetch:p1"), 0);

    assert!(manager.track("p1"));
    assert!(!manager.track("p1"));
    assert_eq!(manager.tracked(), vec!["p1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn load_more_never_duplicates() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..20).map(|i| format!("j{i}")), 1, true));
    gateway.on_page(page((19..39).map(|i| format!("j{i}")), 2, false));

    manager.load(1, 20, None).await.unwrap();
    manager.load_more().await.unwrap();
    manager.load_more().await.unwrap();

    let ids = ids(&manager);
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), 39);
    assert_eq!(unique.len(), 39);
    assert_eq!(gateway.count("list:2"), 1);
    assert!(!manager.cursor().has_next);

    manager.refresh().await.unwrap();
    assert_eq!(manager.len(), 20);
    assert_eq!(manager.cursor().page, 1);
}

#[tokio::test(start_paused = true)]
async fn load_more_is_skipped_while_a_load_is_in_flight() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..20).map(|i| format!("j{i}")), 1, true));
    gateway.on_page(page((20..40).map(|i| format!("j{i}")), 2, false));
    let gate = gateway.gate_lists();

    let loading = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(1, 20, None).await })
    };
    while gateway.count("list:") == 0 {
        tokio::task::yield_now().await;
    }

    manager.load_more().await.unwrap();
    assert_eq!(gateway.count("list:"), 1);

    gate.notify_one();
    loading.await.unwrap().unwrap();
    assert_eq!(manager.len(), 20);
}

#[tokio::test(start_paused = true)]
async fn failed_load_leaves_history_untouched() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..20).map(|i| format!("j{i}")), 1, true));
    manager.load(1, 20, None).await.unwrap();
    let before = manager.snapshot();

    let err = manager.load_more().await.unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    assert_eq!(manager.snapshot(), before);
    assert_eq!(manager.cursor().page, 1);
}

#[tokio::test(start_paused = true)]
async fn loaded_jobs_in_progress_resume_polling() {
    let config = ManagerConfig {
        resume_polling_on_load: true,
        ..quiet_config()
    };
    let (gateway, manager, _notices) = setup(config);
    let mut first = page(["done".to_string()], 1, false);
    first.records.push(job("running", Status::Processing));
    gateway.on_page(first);
    gateway.on_fetch("running", Ok(completed("running", "u")));

    manager.load(1, 20, None).await.unwrap();
    assert_eq!(manager.tracked(), vec!["running".to_string()]);

    sleep(Duration::from_secs(3)).await;
    assert!(manager.tracked().is_empty());
    assert_eq!(gateway.count("fetch:done"), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_poller() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("a", Status::Processing)));
    gateway.on_submit(Ok(job("b", Status::Processing)));
    gateway.on_fetch("a", Ok(job("a", Status::Processing)));
    gateway.on_fetch("b", Ok(job("b", Status::Processing)));
    manager.submit(fox()).await.unwrap();
    manager.submit(fox()).await.unwrap();

    manager.shutdown().await;
    assert!(manager.tracked().is_empty());
    assert!(manager.is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.count("fetch:"), 0);

    let err = manager.submit(fox()).await.unwrap_err();
    assert!(matches!(err, Error::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_manager_stops_polling() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(job("p1", Status::Processing)));
    manager.submit(fox()).await.unwrap();

    drop(manager);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.count("fetch:"), 0);
}

#[tokio::test(start_paused = true)]
async fn refresh_that_finishes_a_job_stops_its_poller() {
    let (gateway, manager, mut notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(job("p1", Status::Processing)));
    manager.submit(fox()).await.unwrap();
    assert_eq!(manager.tracked(), vec!["p1".to_string()]);

    let mut first = page(Vec::<String>::new(), 1, false);
    first.records.push(completed("p1", "u1"));
    gateway.on_page(first);
    manager.refresh().await.unwrap();

    assert!(manager.tracked().is_empty());
    let entry = manager.get(&JobId::persisted("p1")).unwrap();
    assert_eq!(entry.status, Status::Completed);
    assert_eq!(entry.result.unwrap().urls, vec!["u1".to_string()]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.count("fetch:p1"), 0);

    assert_eq!(notices.recv().await, Some(Notice::Submitted { id: "p1".into() }));
    assert_eq!(notices.recv().await, Some(Notice::Completed { id: "p1".into() }));
    assert!(notices.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn out_of_order_poll_answers_never_regress_status() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p5", Status::Processing)));
    gateway.on_fetch("p5", Ok(job("p5", Status::Pending)));
    gateway.on_fetch("p5", Ok(completed("p5", "u5")));

    manager.submit(fox()).await.unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(gateway.count("fetch:p5"), 1);
    assert_eq!(manager.get(&JobId::persisted("p5")).unwrap().status, Status::Processing);
    assert!(manager.is_tracking("p5"));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(manager.get(&JobId::persisted("p5")).unwrap().status, Status::Completed);
    assert!(manager.tracked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn answer_for_another_job_is_rejected() {
    let (gateway, manager, mut notices) = setup(quiet_config());
    gateway.on_submit(Ok(job("p1", Status::Processing)));
    gateway.on_fetch("p1", Ok(completed("other", "u")));

    manager.submit(fox()).await.unwrap();
    sleep(Duration::from_secs(3)).await;

    assert_eq!(ids(&manager), vec!["p1"]);
    assert_eq!(manager.get(&JobId::persisted("p1")).unwrap().status, Status::Processing);
    assert!(manager.tracked().is_empty());

    notices.recv().await;
    assert!(matches!(
        notices.recv().await,
        Some(Notice::PollInterrupted { id, .. }) if id == "p1"
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_loads_run_one_after_another() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..20).map(|i| format!("a{i}")), 1, true));
    gateway.on_page(page((0..20).map(|i| format!("b{i}")), 2, false));
    let gate = gateway.gate_lists();

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(1, 20, None).await })
    };
    while gateway.count("list:") == 0 {
        tokio::task::yield_now().await;
    }
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(2, 20, None).await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(gateway.count("list:"), 1);

    gate.notify_one();
    first.await.unwrap().unwrap();
    while gateway.count("list:") < 2 {
        tokio::task::yield_now().await;
    }
    assert_eq!(ids(&manager)[0], "a0");

    gate.notify_one();
    second.await.unwrap().unwrap();

    let expected: Vec<String> = (0..20).map(|i| format!("b{i}")).collect();
    assert_eq!(ids(&manager), expected);
    assert_eq!(manager.cursor().page, 2);
}

#[tokio::test(start_paused = true)]
async fn submission_in_flight_at_shutdown_leaves_nothing_behind() {
    let (gateway, manager, _notices) = setup(quiet_config());
    let gate = gateway.gate_submits();
    gateway.on_submit(Ok(job("p1", Status::Processing)));

    let submitting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(fox()).await })
    };
    while gateway.count("submit:") == 0 {
        tokio::task::yield_now().await;
    }

    manager.shutdown().await;
    gate.notify_one();

    let err = submitting.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ShutDown));
    assert!(manager.is_empty());
    assert!(manager.tracked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn load_in_flight_at_shutdown_leaves_nothing_behind() {
    let (gateway, manager, _notices) = setup(quiet_config());
    gateway.on_page(page((0..20).map(|i| format!("j{i}")), 1, true));
    let gate = gateway.gate_lists();

    let loading = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(1, 20, None).await })
    };
    while gateway.count("list:") == 0 {
        tokio::task::yield_now().await;
    }

    manager.shutdown().await;
    gate.notify_one();

    let err = loading.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ShutDown));
    assert!(manager.is_empty());
}
