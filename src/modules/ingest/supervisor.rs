use std::sync::LazyLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::modules::account::entity::{AccountAuthType, MailAccount, SyncStatus};
use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::context::Initialize;
use crate::modules::error::MailSiftResult;
use crate::modules::ingest::restart_backoff;
use crate::modules::ingest::{gmail::GmailIngestor, imap::ImapIngestor};

pub static INGEST_SUPERVISOR: LazyLock<IngestSupervisor> = LazyLock::new(IngestSupervisor::new);

/// A worker ran this long without failing before its backoff counter
/// resets.
const STABLE_RESET: Duration = Duration::from_secs(60);

struct WorkerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns one ingest worker per active account: an IMAP IDLE session or a
/// Gmail poller depending on the account's auth type. Start requests flow
/// through a channel so account CRUD paths never block on worker setup.
pub struct IngestSupervisor {
    workers: DashMap<u64, WorkerHandle>,
    channel: mpsc::Sender<u64>,
}

impl IngestSupervisor {
    fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<u64>(100);

        tokio::spawn(async move {
            while let Some(account_id) = rx.recv().await {
                if let Err(e) = INGEST_SUPERVISOR.start_worker(account_id).await {
                    error!(
                        "Failed to start the ingest worker for account {}: {:#?}",
                        account_id, e
                    );
                }
            }
        });

        IngestSupervisor {
            workers: DashMap::new(),
            channel: tx,
        }
    }

    /// Queues a worker start for the account.
    pub async fn trigger_start(&self, account_id: u64) {
        if let Err(e) = self.channel.send(account_id).await {
            error!("Failed to send worker start trigger: {:?}", e);
        }
    }

    /// Signals the worker to stop and awaits its exit.
    pub async fn trigger_stop(&self, account_id: u64) {
        if let Some((_, handle)) = self.workers.remove(&account_id) {
            let _ = handle.stop.send(true);
            if tokio::time::timeout(Duration::from_secs(10), handle.join)
                .await
                .is_err()
            {
                warn!(
                    "Ingest worker for account {} did not acknowledge stop in time",
                    account_id
                );
            } else {
                info!("Ingest worker for account {} stopped", account_id);
            }
        }
    }

    async fn start_worker(&self, account_id: u64) -> MailSiftResult<()> {
        if self.workers.contains_key(&account_id) {
            return Ok(());
        }
        let account = MailAccount::check_account_active(account_id).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(Self::supervise(account, stop_rx));
        self.workers.insert(
            account_id,
            WorkerHandle {
                stop: stop_tx,
                join,
            },
        );
        Ok(())
    }

    /// Restart loop: a retriable failure backs off exponentially (1 s
    /// doubling to 60 s, reset after a minute of stable running); a
    /// non-retriable failure parks the account in Error until the user
    /// reconnects.
    async fn supervise(account: MailAccount, mut stop: watch::Receiver<bool>) {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let mut attempt: u32 = 0;
        info!(
            "Ingest worker starting for account {} ({})",
            account.id, account.email
        );

        loop {
            let started = Instant::now();
            let run = async {
                match account.auth_type {
                    AccountAuthType::Imap => ImapIngestor::run(account.clone()).await,
                    AccountAuthType::OAuth => GmailIngestor::run(account.clone()).await,
                }
            };

            let result = tokio::select! {
                result = run => Some(result),
                _ = stop.changed() => None,
                _ = shutdown.recv() => None,
            };

            match result {
                None | Some(Ok(())) => {
                    info!("Ingest worker for {} exited", account.email);
                    return;
                }
                Some(Err(e)) if e.is_retriable() => {
                    if started.elapsed() >= STABLE_RESET {
                        attempt = 0;
                    }
                    let delay = restart_backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Ingest worker for {} failed ({}); restarting in {:?}",
                        account.email, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => return,
                        _ = shutdown.recv() => return,
                    }
                }
                Some(Err(e)) => {
                    error!(
                        "Ingest worker for {} hit a non-retriable error: {}",
                        account.email, e
                    );
                    if let Err(status_err) =
                        MailAccount::set_sync_status(account.id, SyncStatus::Error).await
                    {
                        error!(
                            "Failed to mark account {} errored: {:#?}",
                            account.id, status_err
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Boot: one worker per enabled, connected account.
    pub async fn start_all(&self) -> MailSiftResult<()> {
        let accounts = MailAccount::list_startable().await?;
        info!("Starting ingest workers for {} account(s)", accounts.len());
        for account in accounts {
            self.trigger_start(account.id).await;
        }
        Ok(())
    }
}

impl Initialize for IngestSupervisor {
    async fn initialize() -> MailSiftResult<()> {
        INGEST_SUPERVISOR.start_all().await
    }
}
