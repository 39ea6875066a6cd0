use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use tracing::Level;
use tracing_appender::rolling::Rotation;

pub fn setup_file_logger() -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
    let level = SETTINGS
        .mailsift_log_level
        .parse::<Level>()
        .unwrap_or(Level::INFO);

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("mailsift")
        .filename_suffix("log")
        .max_log_files(SETTINGS.mailsift_max_server_log_files)
        .build(&DATA_DIR_MANAGER.log_dir)
        .expect("Failed to create the rolling log appender");

    if SETTINGS.mailsift_json_logs {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(appender)
            .json()
            .finish();
        return tracing::subscriber::set_global_default(subscriber);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(appender)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}
