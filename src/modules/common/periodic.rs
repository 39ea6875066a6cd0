use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::modules::{common::signal::SIGNAL_MANAGER, error::MailSiftResult};

/// Runs `tick` every `interval` on a background task until the shutdown
/// signal fires. A failing tick is logged and the loop keeps going; the
/// next interval gets a fresh attempt.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    run_immediately: bool,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = MailSiftResult<()>> + Send + 'static,
{
    info!("Background loop '{}' started", name);
    tokio::spawn(async move {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let mut timer = tokio::time::interval(interval);
        if !run_immediately {
            // interval() fires immediately; swallow that first tick.
            timer.tick().await;
        }
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = tick().await {
                        warn!("Background loop '{}' failed: {:?}", name, e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Background loop '{}' stopped", name);
                    break;
                }
            }
        }
    })
}
