use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MailSiftError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type MailSiftResult<T, E = MailSiftError> = std::result::Result<T, E>;

impl MailSiftError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailSiftError::Generic { code, .. } => *code,
        }
    }

    /// Whether a supervised worker may be restarted after this error.
    /// Permanently denied auth requires a user-driven reconnect instead.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self.code(),
            ErrorCode::AuthPermanent
                | ErrorCode::AccountDisabled
                | ErrorCode::MissingRefreshToken
                | ErrorCode::InsufficientScope
        )
    }

    pub fn status(&self) -> http::StatusCode {
        self.code().status()
    }
}
