use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::modules::common::periodic::spawn_periodic;
use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::scheduler::model::TaskMeta;
use crate::modules::scheduler::nativedb::meta::NativeDbTaskStore;
use crate::modules::scheduler::task::{Task, TaskFuture};
use crate::{raise_error, utc_now};

/// How often the engine looks for newly due jobs.
const CLAIM_INTERVAL: Duration = Duration::from_millis(250);
/// Heartbeat cadence while a job is dispatched; must stay well under the
/// store's stall interval or live jobs would be reclaimed.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

type TaskHandler = Arc<dyn Fn(String, u64) -> TaskFuture + Send + Sync>;

/// Runs the durable sync queues. Job types register a deserializing
/// handler keyed by `TASK_KEY`; each named queue gets a bounded worker
/// pool. One claim loop feeds every pool, so queue priorities hold across
/// the whole backlog, and a full pool only parks its own jobs — their
/// heartbeats keep beating while they wait, which is what keeps the stall
/// sweep honest.
pub struct QueueEngine {
    store: NativeDbTaskStore,
    handlers: AHashMap<String, TaskHandler>,
    workers: AHashMap<String, usize>,
}

impl QueueEngine {
    pub fn new(store: NativeDbTaskStore) -> Self {
        Self {
            store,
            handlers: AHashMap::new(),
            workers: AHashMap::new(),
        }
    }

    /// Registers a job type. Its queue starts at a single worker until
    /// `queue_workers` widens it.
    pub fn register<T: Task>(mut self) -> Self {
        self.handlers.insert(
            T::TASK_KEY.to_owned(),
            Arc::new(|params, task_id| {
                Box::pin(async move {
                    let task = serde_json::from_str::<T>(&params).map_err(|e| {
                        raise_error!(
                            format!("Undeserializable job payload: {:#?}", e),
                            ErrorCode::InternalError
                        )
                    })?;
                    task.run(task_id).await
                })
            }),
        );
        self.workers.entry(T::TASK_QUEUE.to_owned()).or_insert(1);
        self
    }

    pub fn queue_workers(mut self, queue: &str, count: usize) -> Self {
        self.workers.insert(queue.to_owned(), count.max(1));
        self
    }

    /// Starts the claim loop and the retention sweep, handing back the
    /// shared engine for submissions.
    pub fn start(self) -> Arc<Self> {
        let engine = Arc::new(self);

        let store = engine.store.clone();
        spawn_periodic(
            "sync-queue-retention",
            RETENTION_SWEEP_INTERVAL,
            false,
            move || {
                let store = store.clone();
                async move { store.cleanup().await }
            },
        );

        tokio::spawn(engine.clone().claim_loop());
        engine
    }

    pub async fn submit<T: Task>(&self, task: T, delay_seconds: Option<u32>) -> MailSiftResult<()> {
        self.store.save(due_meta(&task, delay_seconds)).await
    }

    pub async fn submit_all<T: Task>(
        &self,
        tasks: &[T],
        delay_seconds: Option<u32>,
    ) -> MailSiftResult<()> {
        let metas = tasks
            .iter()
            .map(|task| due_meta(task, delay_seconds))
            .collect();
        self.store.save_all(metas).await
    }

    pub async fn stop(&self, task_id: u64, reason: Option<String>) -> MailSiftResult<()> {
        self.store.mark_stopped(task_id, reason).await
    }

    pub fn store(&self) -> &NativeDbTaskStore {
        &self.store
    }

    async fn claim_loop(self: Arc<Self>) {
        let pools: AHashMap<String, Arc<Semaphore>> = self
            .workers
            .iter()
            .map(|(queue, count)| (queue.clone(), Arc::new(Semaphore::new(*count))))
            .collect();
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let mut timer = tokio::time::interval(CLAIM_INTERVAL);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.store.claim_due().await {
                        Ok(batch) => {
                            for meta in batch {
                                let Some(pool) = pools.get(&meta.queue_name).cloned() else {
                                    error!(
                                        "No worker pool for queue '{}'; was the job type registered?",
                                        meta.queue_name
                                    );
                                    let store = self.store.clone();
                                    let id = meta.id;
                                    tokio::spawn(async move {
                                        let _ = store
                                            .mark_stopped(id, Some("no worker pool for this queue".into()))
                                            .await;
                                    });
                                    continue;
                                };
                                let engine = self.clone();
                                in_flight.spawn(async move { engine.run_claimed(meta, pool).await });
                            }
                        }
                        Err(e) => error!("Failed to claim due sync jobs: {:?}", e),
                    }
                    while in_flight.try_join_next().is_some() {}
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Sync queue draining {} active job(s)", in_flight.len());
        while in_flight.join_next().await.is_some() {}
        info!("Sync queue stopped");
    }

    /// Drives one claimed job to a terminal status write. The heartbeat
    /// covers the wait for a pool slot as well as the execution itself.
    /// A panicking job never reports; the stall sweep reclaims it.
    async fn run_claimed(&self, meta: TaskMeta, pool: Arc<Semaphore>) {
        let work = async {
            let _permit = pool.acquire_owned().await.ok();
            self.execute(&meta).await
        };
        let mut work = pin!(work);
        let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = beat.tick() => {
                    if let Err(e) = self.store.heartbeat(meta.id).await {
                        warn!("Heartbeat for job {} failed: {}", meta.id, e);
                    }
                }
            }
        }
    }

    async fn execute(&self, meta: &TaskMeta) {
        let started = Instant::now();
        let outcome = match self.handlers.get(&meta.task_key) {
            None => Err(raise_error!(
                format!("No handler registered for job type '{}'", meta.task_key),
                ErrorCode::InternalError
            )),
            Some(handler) => {
                let future = (handler)(meta.task_params.clone(), meta.id);
                match meta.timeout_seconds {
                    Some(secs) => {
                        match tokio::time::timeout(Duration::from_secs(secs), future).await {
                            Ok(result) => result,
                            Err(_) => Err(raise_error!(
                                format!("Job exceeded its {}s execution budget", secs),
                                ErrorCode::InternalError
                            )),
                        }
                    }
                    None => future.await,
                }
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                info!(
                    "Job '{}'-{} in queue '{}' finished in {:?}",
                    meta.task_key, meta.id, meta.queue_name, elapsed
                );
                if let Err(e) = self
                    .store
                    .mark_succeeded(meta.id, elapsed.as_millis() as usize)
                    .await
                {
                    error!("Failed to record success for job {}: {:?}", meta.id, e);
                }
            }
            Err(e) => {
                let attempt = meta.retry_count.unwrap_or(0) + 1;
                let policy = meta.retry_policy();
                let exhausted = policy
                    .max_retries
                    .is_some_and(|max| attempt >= max as usize);
                let next_run = (!exhausted)
                    .then(|| utc_now!() + (policy.wait_time(attempt as u32) * 1000) as i64);
                if exhausted {
                    warn!(
                        "Job '{}'-{} failed permanently after {} attempt(s): {}",
                        meta.task_key, meta.id, attempt, e
                    );
                } else {
                    warn!(
                        "Job '{}'-{} failed (attempt {}), retrying: {}",
                        meta.task_key, meta.id, attempt, e
                    );
                }
                if let Err(store_err) = self
                    .store
                    .mark_failed(
                        meta.id,
                        e.to_string(),
                        elapsed.as_millis() as usize,
                        attempt,
                        next_run,
                    )
                    .await
                {
                    error!(
                        "Failed to record failure for job {}: {:?}",
                        meta.id, store_err
                    );
                }
            }
        }
    }
}

fn due_meta<T: Task>(task: &T, delay_seconds: Option<u32>) -> TaskMeta {
    let mut meta = task.new_meta();
    let delay_ms = delay_seconds.unwrap_or(meta.delay_seconds) as i64 * 1000;
    meta.next_run = utc_now!() + delay_ms;
    meta
}
