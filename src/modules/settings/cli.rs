use clap::{builder::ValueParser, Parser};
use std::sync::LazyLock;
use url::Url;

#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::parse);

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::new_for_test);

#[derive(Debug, Parser)]
#[clap(
    name = "mailsift",
    about = "A multi-tenant email aggregation backend: ingests IMAP and Gmail accounts,
    mirrors messages into a search index, classifies them with an LLM, and fans out
    webhook notifications for high-value categories.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// mailsift log level (default: "info")
    #[clap(
        long,
        default_value = "info",
        env,
        help = "Set the log level for mailsift"
    )]
    pub mailsift_log_level: String,

    /// Enable ANSI formatted logs
    #[clap(long, default_value = "true", env, help = "Enable ANSI formatted logs")]
    pub mailsift_ansi_logs: bool,

    /// Enable log file output (otherwise logs go to stdout)
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable log file output (otherwise logs go to stdout)"
    )]
    pub mailsift_log_to_file: bool,

    /// Enable JSON formatted logs
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable JSON formatted logs"
    )]
    pub mailsift_json_logs: bool,

    /// Maximum number of log files (default: 5)
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the maximum number of server log files"
    )]
    pub mailsift_max_server_log_files: usize,

    #[clap(
        long,
        env,
        default_value = "/var/lib/mailsift",
        help = "Set the data directory for the mailsift databases"
    )]
    pub mailsift_root_dir: String,

    /// Secret key for encrypting IMAP passwords and OAuth tokens at rest.
    /// Must be 64 hex characters (a 32-byte AES-256 key).
    #[clap(
        long,
        default_value = "0000000000000000000000000000000000000000000000000000000000000000",
        env,
        help = "64-hex AES-256 key for secrets at rest. ⚠️ Change this default in production!"
    )]
    pub mailsift_encryption_key: String,

    #[clap(
        long,
        default_value = "http://localhost:9200",
        env,
        help = "Base URL of the search store (Elasticsearch-compatible REST API)",
        value_parser = ValueParser::new(|s: &str| -> Result<String, String> {
            Url::parse(s).map_err(|_| format!("Invalid URL for the search store: {}", s))?;
            Ok(s.trim_end_matches('/').to_string())
        })
    )]
    pub mailsift_search_store_url: String,

    #[clap(
        long,
        default_value = "5",
        env,
        help = "Worker concurrency for the single-message sync queue"
    )]
    pub mailsift_sync_one_workers: usize,

    #[clap(
        long,
        default_value = "1",
        env,
        help = "Worker concurrency for the bulk sync queue"
    )]
    pub mailsift_bulk_sync_workers: usize,

    #[clap(
        long,
        default_value = "1",
        env,
        help = "Worker concurrency for the reconciliation queue"
    )]
    pub mailsift_reconcile_workers: usize,

    #[clap(
        long,
        default_value = "3",
        env,
        help = "Maximum attempts per sync job before it is left failed"
    )]
    pub mailsift_queue_max_retries: u32,

    #[clap(
        long,
        default_value = "2000",
        env,
        help = "Base delay in milliseconds for sync job retry backoff"
    )]
    pub mailsift_queue_retry_delay_ms: u64,

    #[clap(
        long,
        default_value = "100",
        env,
        help = "Chunk size used when bulk-replicating messages into the search store",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub mailsift_bulk_sync_batch_size: u32,

    #[clap(
        long,
        default_value = "300",
        env,
        help = "Interval in seconds between reconciliation ticks",
        value_parser = clap::value_parser!(u64).range(10..)
    )]
    pub mailsift_reconciliation_interval_secs: u64,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Start the reconciliation loop automatically at boot"
    )]
    pub mailsift_auto_start_reconciliation: bool,

    #[clap(
        long,
        default_value = "10",
        env,
        help = "Number of messages classified per LLM request",
        value_parser = clap::value_parser!(u32).range(1..=50)
    )]
    pub mailsift_categorizer_batch_size: u32,

    #[clap(
        long,
        default_value = "0",
        env,
        help = "Delay in milliseconds between classification chunks"
    )]
    pub mailsift_categorizer_batch_delay_ms: u64,

    #[clap(
        long,
        default_value = "60",
        env,
        help = "Maximum LLM requests per minute",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub mailsift_llm_requests_per_minute: u32,

    #[clap(long, env, help = "API key for the LLM classification provider")]
    pub mailsift_llm_api_key: Option<String>,

    #[clap(
        long,
        default_value = "https://api.openai.com/v1",
        env,
        help = "Base URL of the LLM chat-completions endpoint"
    )]
    pub mailsift_llm_base_url: String,

    #[clap(
        long,
        default_value = "gpt-4o-mini",
        env,
        help = "Model used for message classification"
    )]
    pub mailsift_llm_model: String,

    #[clap(long, env, help = "OAuth2 client id for Gmail accounts")]
    pub mailsift_oauth_client_id: Option<String>,

    #[clap(long, env, help = "OAuth2 client secret for Gmail accounts")]
    pub mailsift_oauth_client_secret: Option<String>,

    #[clap(
        long,
        env,
        help = "OAuth2 redirect URI registered with the provider",
        value_parser = ValueParser::new(|s: &str| -> Result<String, String> {
            Url::parse(s).map_err(|_| format!("Invalid URL for the OAuth redirect: {}", s))?;
            Ok(s.to_string())
        })
    )]
    pub mailsift_oauth_redirect_uri: Option<String>,

    #[clap(
        long,
        env,
        help = "Slack incoming-webhook URL notified on Interested messages"
    )]
    pub mailsift_slack_webhook_url: Option<String>,

    #[clap(
        long,
        env,
        help = "Generic webhook URL receiving the full message record on Interested"
    )]
    pub mailsift_generic_webhook_url: Option<String>,

    #[clap(
        long,
        default_value = "30",
        env,
        help = "How many days back the initial account sync reaches",
        value_parser = clap::value_parser!(u32).range(1..=365)
    )]
    pub mailsift_initial_sync_days: u32,

    #[clap(
        long,
        env,
        default_value = "134217728",
        help = "Cache size for the metadata database in bytes"
    )]
    pub mailsift_metadata_cache_size: Option<usize>,

    #[clap(
        long,
        env,
        default_value = "67108864",
        help = "Cache size for the task queue database in bytes"
    )]
    pub mailsift_task_queue_cache_size: Option<usize>,

    #[clap(
        long,
        env,
        default_value = "268435456",
        help = "Cache size for the message database in bytes"
    )]
    pub mailsift_message_cache_size: Option<usize>,

    #[clap(
        long,
        default_value = "72",
        env,
        help = "Age in hours after which terminal sync jobs become eligible for cleanup",
        value_parser = clap::value_parser!(u64).range(1..=720)
    )]
    pub mailsift_cleanup_interval_hours: u64,

    #[clap(
        long,
        env,
        default_value = "false",
        help = "Keep all databases in memory (used by the test suite)"
    )]
    pub mailsift_memory_mode_enabled: bool,
}

impl Settings {
    #[cfg(test)]
    fn new_for_test() -> Self {
        Self {
            mailsift_log_level: "info".into(),
            mailsift_ansi_logs: false,
            mailsift_log_to_file: false,
            mailsift_json_logs: false,
            mailsift_max_server_log_files: 5,
            mailsift_root_dir: std::env::temp_dir()
                .join("mailsift_test_data")
                .to_string_lossy()
                .into_owned(),
            mailsift_encryption_key:
                "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".into(),
            mailsift_search_store_url: "http://localhost:9200".into(),
            mailsift_sync_one_workers: 5,
            mailsift_bulk_sync_workers: 1,
            mailsift_reconcile_workers: 1,
            mailsift_queue_max_retries: 3,
            mailsift_queue_retry_delay_ms: 2000,
            mailsift_bulk_sync_batch_size: 100,
            mailsift_reconciliation_interval_secs: 300,
            mailsift_auto_start_reconciliation: false,
            mailsift_categorizer_batch_size: 10,
            mailsift_categorizer_batch_delay_ms: 0,
            mailsift_llm_requests_per_minute: 60,
            mailsift_llm_api_key: None,
            mailsift_llm_base_url: "https://api.openai.com/v1".into(),
            mailsift_llm_model: "gpt-4o-mini".into(),
            mailsift_oauth_client_id: None,
            mailsift_oauth_client_secret: None,
            mailsift_oauth_redirect_uri: None,
            mailsift_slack_webhook_url: None,
            mailsift_generic_webhook_url: None,
            mailsift_initial_sync_days: 30,
            mailsift_metadata_cache_size: None,
            mailsift_task_queue_cache_size: None,
            mailsift_message_cache_size: None,
            mailsift_cleanup_interval_hours: 72,
            mailsift_memory_mode_enabled: true,
        }
    }
}
