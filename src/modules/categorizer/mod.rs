use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::modules::categorizer::client::LlmClient;
use crate::modules::categorizer::prompt::{
    build_prompt, parse_response, ClassificationInput, ClassificationOutcome,
};
use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::ingest::rate_limit_backoff;
use crate::modules::message::entity::EmailMessage;
use crate::modules::metrics::MAILSIFT_CLASSIFICATIONS_TOTAL;
use crate::modules::notify::Notifier;
use crate::modules::pipeline::EmailService;
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;

pub mod client;
pub mod prompt;

pub static CATEGORIZER: LazyLock<Categorizer> = LazyLock::new(Categorizer::new);

/// Ids pulled per run; a bigger backlog drains over successive triggers.
const RUN_FETCH_LIMIT: usize = 1000;
/// Retries for one chunk when the provider rate-limits.
const RATE_LIMIT_RETRIES: u32 = 5;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub processed: usize,
    pub classified: usize,
    pub errors: usize,
    pub notified: usize,
    pub cancelled: bool,
}

struct Trigger {
    respond: oneshot::Sender<MailSiftResult<RunSummary>>,
}

/// The classification runner. One long-lived task owns the whole run
/// lifecycle: callers submit triggers over a channel, a trigger arriving
/// while a run is active is rejected, and cancellation is cooperative,
/// checked between chunks.
pub struct Categorizer {
    trigger: mpsc::Sender<Trigger>,
    cancel: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl Categorizer {
    fn new() -> Self {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(false));

        tokio::spawn({
            let running = running.clone();
            async move {
                while let Some(trigger) = trigger_rx.recv().await {
                    running.store(true, Ordering::SeqCst);
                    let result = Self::run_batch(cancel_rx.clone()).await;
                    running.store(false, Ordering::SeqCst);
                    if trigger.respond.send(result).is_err() {
                        warn!("Categorizer trigger caller went away before the run finished");
                    }
                }
            }
        });

        Categorizer {
            trigger: trigger_tx,
            cancel: cancel_tx,
            running,
        }
    }

    /// Starts a run and waits for its summary. Fails fast with
    /// `AlreadyExists` when a run is in flight.
    pub async fn trigger(&self) -> MailSiftResult<RunSummary> {
        if self.running.load(Ordering::SeqCst) {
            return Err(raise_error!(
                "A classification run is already in progress".into(),
                ErrorCode::AlreadyExists
            ));
        }
        let _ = self.cancel.send(false);
        let (respond, receive) = oneshot::channel();
        self.trigger
            .try_send(Trigger { respond })
            .map_err(|_| {
                raise_error!(
                    "A classification run is already in progress".into(),
                    ErrorCode::AlreadyExists
                )
            })?;
        receive.await.map_err(|_| {
            raise_error!(
                "The classification runner went away".into(),
                ErrorCode::InternalError
            )
        })?
    }

    /// Asks the active run to stop at the next chunk boundary.
    pub fn request_stop(&self) {
        let _ = self.cancel.send(true);
    }

    async fn run_batch(cancel: watch::Receiver<bool>) -> MailSiftResult<RunSummary> {
        let client = LlmClient::new()?;
        let limiter = RateLimiter::direct(Quota::per_minute(
            NonZeroU32::new(SETTINGS.mailsift_llm_requests_per_minute.max(1)).unwrap(),
        ));
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let batch_size = SETTINGS.mailsift_categorizer_batch_size.max(1) as usize;
        let batch_delay = Duration::from_millis(SETTINGS.mailsift_categorizer_batch_delay_ms);

        let ids = EmailMessage::uncategorized_ids(RUN_FETCH_LIMIT).await?;
        let mut summary = RunSummary::default();
        if ids.is_empty() {
            return Ok(summary);
        }
        info!("Classification run starting over {} message(s)", ids.len());

        for chunk in ids.chunks(batch_size) {
            if *cancel.borrow() {
                info!("Classification run cancelled between chunks");
                summary.cancelled = true;
                break;
            }
            if shutdown.try_recv().is_ok() {
                summary.cancelled = true;
                break;
            }

            limiter.until_ready().await;
            let outcomes = Self::classify_chunk(&client, chunk.to_vec()).await?;
            Self::apply_outcomes(outcomes, &mut summary).await?;

            if !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }
        }

        info!(
            "Classification run finished: {} processed, {} classified, {} errors, {} notified",
            summary.processed, summary.classified, summary.errors, summary.notified
        );
        Ok(summary)
    }

    /// One prompt per chunk. A provider rate limit backs off with jitter
    /// and retries; a timeout fails only this chunk's ids.
    async fn classify_chunk(
        client: &LlmClient,
        chunk_ids: Vec<String>,
    ) -> MailSiftResult<Vec<ClassificationOutcome>> {
        let messages = EmailMessage::load_many(chunk_ids.clone()).await?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<ClassificationInput> = messages.iter().map(Into::into).collect();
        let expected: Vec<String> = inputs.iter().map(|i| i.id.clone()).collect();
        let prompt = build_prompt(&inputs);

        let mut attempt = 0u32;
        let raw = loop {
            match client.complete(&prompt).await {
                Ok(raw) => break raw,
                Err(e) if e.code() == ErrorCode::TooManyRequest && attempt < RATE_LIMIT_RETRIES => {
                    let delay = rate_limit_backoff(attempt);
                    warn!("Rate limited by the model provider; waiting {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.code() == ErrorCode::ConnectionTimeout => {
                    // Deadline hit: fail this chunk's ids, keep the run going.
                    return Ok(expected
                        .iter()
                        .map(|id| (id.clone(), Err("classification deadline exceeded".into())))
                        .collect());
                }
                Err(e) => return Err(e),
            }
        };
        Ok(parse_response(&raw, &expected))
    }

    async fn apply_outcomes(
        outcomes: Vec<ClassificationOutcome>,
        summary: &mut RunSummary,
    ) -> MailSiftResult<()> {
        let mut updates = Vec::new();
        for (id, outcome) in outcomes {
            summary.processed += 1;
            match outcome {
                Ok(scored) => {
                    MAILSIFT_CLASSIFICATIONS_TOTAL
                        .with_label_values(&[scored.category.label()])
                        .inc();
                    updates.push((id, scored.category));
                }
                Err(reason) => {
                    MAILSIFT_CLASSIFICATIONS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!("Classification error for {}: {}", id, reason);
                    summary.errors += 1;
                }
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        let transitions = EmailService::update_categories(updates).await?;
        summary.classified += transitions.len();
        for transition in transitions {
            // Re-assigning Interested to an already-Interested message is
            // suppressed; everything else newly Interested fans out.
            if !transition.newly_interested() {
                continue;
            }
            summary.notified += 1;
            let message_id = transition.message_id.clone();
            tokio::spawn(async move {
                match EmailMessage::find(message_id.clone()).await {
                    Ok(Some(message)) => Notifier::notify_interested(&message).await,
                    Ok(None) => {}
                    Err(e) => error!("Failed to load {} for notification: {}", message_id, e),
                }
            });
        }
        Ok(())
    }

    /// Single-message path: same prompt shape with one element, bypassing
    /// the runner.
    pub async fn categorize_by_id(message_id: String) -> MailSiftResult<Option<RunSummary>> {
        let Some(message) = EmailMessage::find(message_id.clone()).await? else {
            return Ok(None);
        };
        let client = LlmClient::new()?;
        let input = ClassificationInput::from(&message);
        let expected = vec![input.id.clone()];
        let prompt = build_prompt(&[input]);
        let raw = client.complete(&prompt).await?;
        let outcomes = parse_response(&raw, &expected);
        let mut summary = RunSummary::default();
        Categorizer::apply_outcomes(outcomes, &mut summary).await?;
        Ok(Some(summary))
    }
}
