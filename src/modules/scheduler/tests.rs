use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use native_db::Builder;
use serde::{Deserialize, Serialize};

use crate::{
    modules::database::update_impl,
    modules::scheduler::{
        engine::QueueEngine,
        model::{TaskMeta, TaskPriority, TaskStatus},
        nativedb::{meta::NativeDbTaskStore, TaskMetaEntity, TaskMetaEntityKey, TASK_MODELS},
    },
    raise_error, utc_now,
};

use super::task::{Task, TaskFuture};

static COUNTER_EXECUTIONS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CountingTask;

impl Task for CountingTask {
    const TASK_KEY: &'static str = "counting_task";
    const TASK_QUEUE: &'static str = "counting_queue";

    fn delay_seconds(&self) -> u32 {
        0
    }

    fn run(self, _task_id: u64) -> TaskFuture {
        Box::pin(async move {
            COUNTER_EXECUTIONS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn memory_store() -> NativeDbTaskStore {
    let db = Builder::new().create_in_memory(&TASK_MODELS).unwrap();
    NativeDbTaskStore::init(Arc::new(db))
}

fn due_meta(priority: TaskPriority) -> TaskMeta {
    let mut meta = CountingTask.new_meta();
    meta.priority = priority;
    meta.next_run = utc_now!() - 1_000;
    meta
}

#[tokio::test]
async fn claims_in_priority_order_and_marks_running() {
    let store = memory_store();

    let low = due_meta(TaskPriority::Low);
    let urgent = due_meta(TaskPriority::Urgent);
    let normal = due_meta(TaskPriority::Normal);
    store
        .save_all(vec![low.clone(), urgent.clone(), normal.clone()])
        .await
        .unwrap();

    let claimed = store.claim_due().await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert_eq!(claimed[0].id, urgent.id);
    assert_eq!(claimed[1].id, normal.id);
    assert_eq!(claimed[2].id, low.id);

    for task in &claimed {
        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }

    // Nothing left to claim on the next tick.
    assert!(store.claim_due().await.unwrap().is_empty());
}

#[tokio::test]
async fn future_tasks_are_not_claimed() {
    let store = memory_store();

    let mut meta = CountingTask.new_meta();
    meta.next_run = utc_now!() + 60_000;
    store.save(meta).await.unwrap();

    assert!(store.claim_due().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_job_with_next_run_is_rescheduled() {
    let store = memory_store();

    let meta = due_meta(TaskPriority::Normal);
    let task_id = meta.id;
    store.save(meta).await.unwrap();
    store.claim_due().await.unwrap();

    store
        .mark_failed(task_id, "transient".into(), 12, 1, Some(utc_now!() - 1))
        .await
        .unwrap();

    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.retry_count, Some(1));
    assert_eq!(stored.last_error.as_deref(), Some("transient"));

    // And the retry is claimable again.
    let reclaimed = store.claim_due().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn failed_job_without_next_run_is_terminal() {
    let store = memory_store();

    let meta = due_meta(TaskPriority::Normal);
    let task_id = meta.id;
    store.save(meta).await.unwrap();
    store.claim_due().await.unwrap();

    store
        .mark_failed(task_id, "dead".into(), 5, 3, None)
        .await
        .unwrap();

    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test]
async fn stalled_running_job_is_reclaimed() {
    let store = memory_store();

    let meta = due_meta(TaskPriority::Normal);
    let task_id = meta.id;
    store.save(meta).await.unwrap();
    assert_eq!(store.claim_due().await.unwrap().len(), 1);

    // Backdate the claim so the row looks like a worker died mid-run.
    let silent_since = utc_now!() - 5 * 60 * 1_000;
    update_impl(
        store.database(),
        move |rw| {
            rw.get()
                .secondary::<TaskMetaEntity>(TaskMetaEntityKey::id, task_id)
                .map_err(|e| {
                    raise_error!(
                        format!("{:#?}", e),
                        crate::modules::error::code::ErrorCode::StorageFailure
                    )
                })?
                .ok_or_else(|| {
                    raise_error!(
                        "row vanished".into(),
                        crate::modules::error::code::ErrorCode::ResourceNotFound
                    )
                })
        },
        move |current| {
            let mut updated = current.clone();
            updated.heartbeat_at = silent_since;
            updated.updated_at = silent_since;
            Ok(updated)
        },
    )
    .await
    .unwrap();

    let reclaimed = store.claim_due().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task_id);
}

#[tokio::test]
async fn restore_reschedules_interrupted_jobs() {
    let store = memory_store();

    let meta = due_meta(TaskPriority::Normal);
    let task_id = meta.id;
    store.save(meta).await.unwrap();
    store.claim_due().await.unwrap();

    // Simulate a crash: the row is left Running with no heartbeat coming.
    store.restore().await.unwrap();
    let stored = store.get(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
}

#[tokio::test]
async fn end_to_end_execution_through_the_engine() {
    let engine = QueueEngine::new(memory_store())
        .register::<CountingTask>()
        .queue_workers(CountingTask::TASK_QUEUE, 1)
        .start();

    let before = COUNTER_EXECUTIONS.load(Ordering::SeqCst);
    engine.submit(CountingTask, Some(0)).await.unwrap();

    for _ in 0..50 {
        if COUNTER_EXECUTIONS.load(Ordering::SeqCst) > before {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("job was never executed by the engine");
}
