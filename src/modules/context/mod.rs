use crate::modules::error::MailSiftResult;

/// One-time startup hook run in order from `main`.
pub trait Initialize {
    async fn initialize() -> MailSiftResult<()>;
}

/// A fire-and-forget background loop started after initialization.
pub trait BackgroundTask {
    fn start();
}
