use crate::modules::context::Initialize;
use crate::modules::error::MailSiftResult;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge_vec, Histogram,
    IntCounterVec, IntGaugeVec,
};
use std::sync::LazyLock;

pub const SUCCESS: &str = "success";
pub const FAILURE: &str = "failure";

pub static MAILSIFT_MESSAGES_INGESTED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "mailsift_messages_ingested_total",
        "Messages handed to the write path, labeled by outcome (indexed/skipped)",
        &["outcome"]
    )
    .unwrap()
});

pub static MAILSIFT_TASK_QUEUE_LENGTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "mailsift_task_queue_length",
        "Pending sync jobs per queue",
        &["queue"]
    )
    .unwrap()
});

pub static MAILSIFT_TASK_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "mailsift_task_fetch_duration_seconds",
        "Time spent claiming pending tasks from the queue store"
    )
    .unwrap()
});

pub static MAILSIFT_CLASSIFICATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "mailsift_classifications_total",
        "Classification outcomes per category (parse errors use the 'error' label)",
        &["category"]
    )
    .unwrap()
});

pub static MAILSIFT_NOTIFICATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "mailsift_notifications_total",
        "Webhook deliveries per sink and status",
        &["sink", "status"]
    )
    .unwrap()
});

pub static MAILSIFT_RECONCILED_MESSAGES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "mailsift_reconciled_messages_total",
        "Messages re-enqueued by the reconciler, labeled by account",
        &["account"]
    )
    .unwrap()
});

pub struct MetricsService;

impl Initialize for MetricsService {
    async fn initialize() -> MailSiftResult<()> {
        // Touch each collector so registration panics surface at boot, not
        // on the first request.
        let _ = &*MAILSIFT_MESSAGES_INGESTED_TOTAL;
        let _ = &*MAILSIFT_TASK_QUEUE_LENGTH;
        let _ = &*MAILSIFT_TASK_FETCH_DURATION;
        let _ = &*MAILSIFT_CLASSIFICATIONS_TOTAL;
        let _ = &*MAILSIFT_NOTIFICATIONS_TOTAL;
        let _ = &*MAILSIFT_RECONCILED_MESSAGES_TOTAL;
        Ok(())
    }
}
