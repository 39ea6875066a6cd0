use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailSiftResult;
use crate::modules::scheduler::model::{TaskMeta, TaskPriority};
use crate::modules::scheduler::retry::{RetryPolicy, RetryStrategy};
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type TaskFuture = Pin<Box<dyn Future<Output = MailSiftResult<()>> + Send>>;

/// A durable job type. The serialized value is the job payload; `TASK_KEY`
/// identifies the handler and `TASK_QUEUE` the worker pool it runs on.
pub trait Task: Serialize + DeserializeOwned + 'static {
    const TASK_KEY: &'static str;

    const TASK_QUEUE: &'static str;

    /// Default: exponential backoff from the configured retry delay, capped
    /// at the configured attempt budget.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: RetryStrategy::Exponential {
                base: (SETTINGS.mailsift_queue_retry_delay_ms / 1000).max(2) as u32,
            },
            max_retries: Some(SETTINGS.mailsift_queue_max_retries),
        }
    }

    /// Delay in seconds before a freshly submitted job becomes runnable.
    fn delay_seconds(&self) -> u32 {
        3
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Normal
    }

    /// Wall-clock budget for one execution; None means unbounded.
    fn timeout_seconds(&self) -> Option<u64> {
        None
    }

    fn run(self, task_id: u64) -> TaskFuture;

    fn validate(&self) -> MailSiftResult<()> {
        if Self::TASK_QUEUE.is_empty() {
            return Err(raise_error!(
                "TASK_QUEUE must not be empty.".into(),
                ErrorCode::InternalError
            ));
        }
        Ok(())
    }

    fn new_meta(&self) -> TaskMeta {
        self.validate().unwrap_or_else(|err| {
            panic!(
                "Validation failed for task '{}': {}. This indicates a programming error.",
                Self::TASK_KEY,
                err
            )
        });

        TaskMeta::new(
            Self::TASK_KEY.to_owned(),
            serde_json::to_string(&self).expect(
                "Serialization failed: this should never happen if all fields are serializable",
            ),
            Self::TASK_QUEUE.to_owned(),
            self.retry_policy(),
            self.delay_seconds(),
            self.priority(),
            self.timeout_seconds(),
        )
    }
}
