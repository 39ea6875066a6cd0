use mimalloc::MiMalloc;
use modules::{
    common::signal::{SignalManager, SIGNAL_MANAGER},
    context::Initialize,
    database::manager::DatabaseManager,
    error::MailSiftResult,
    ingest::supervisor::IngestSupervisor,
    logger,
    metrics::MetricsService,
    search::SearchStore,
    settings::dir::DataDirManager,
    tasks::{queue::MailSiftTaskQueue, PeriodicTasks},
    utils::encrypt::validate_encryption_key,
};
use tracing::info;

mod modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static LOGO: &str = r#"
                  _ _     _  __ _
  _ __ ___   __ _(_) |___(_)/ _| |_
 | '_ ` _ \ / _` | | / __| | |_| __|
 | | | | | | (_| | | \__ \ |  _| |_
 |_| |_| |_|\__,_|_|_|___/_|_|  \__|

"#;

#[tokio::main]
async fn main() -> MailSiftResult<()> {
    logger::initialize_logging();
    info!("{}", LOGO);
    info!("Starting mailsift");
    info!("Version:  {}", mailsift_version!());

    if let Err(error) = initialize().await {
        eprintln!("{:?}", error);
        return Err(error);
    }

    // Everything is event-driven from here; park until the signal fires.
    let mut shutdown = SIGNAL_MANAGER.subscribe();
    let _ = shutdown.recv().await;
    info!("Shutdown signal received; draining workers");
    Ok(())
}

/// Ordered boot: configuration sanity, signals, storage, stores, queue,
/// then the per-account ingest workers and background loops.
async fn initialize() -> MailSiftResult<()> {
    validate_encryption_key()?;
    SignalManager::initialize().await?;
    DataDirManager::initialize().await?;
    MetricsService::initialize().await?;
    DatabaseManager::initialize().await?;
    SearchStore::initialize().await?;
    MailSiftTaskQueue::initialize().await?;
    IngestSupervisor::initialize().await?;
    PeriodicTasks::start_background_tasks();
    Ok(())
}
