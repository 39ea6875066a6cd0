use http::StatusCode;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorCode {
    // Client-side errors (10000–10999)
    InvalidParameter = 10000,
    MissingConfiguration = 10010,
    ExceedsLimitation = 10020,

    // Authentication and authorization errors (20000–20999)
    PermissionDenied = 20000,
    AccountDisabled = 20010,
    MissingRefreshToken = 20020,
    AuthExpired = 20030,
    AuthPermanent = 20040,
    InsufficientScope = 20050,

    // Resource errors (30000–30999)
    ResourceNotFound = 30000,
    AlreadyExists = 30010,
    TooManyRequest = 30020,

    // Network connection errors (40000–40999)
    NetworkError = 40000,
    ConnectionTimeout = 40010,
    HttpResponseError = 40020,

    // Mail provider errors (50000–50999)
    ImapCommandFailed = 50000,
    ImapAuthenticationFailed = 50010,
    ImapUnexpectedResult = 50020,
    GmailApiCallFailed = 50030,

    // Storage errors (60000–60999)
    StorageFailure = 60000,
    SearchStoreFailed = 60010,
    QueueUnavailable = 60020,

    // Pipeline errors (70000–70999)
    ClassificationParseError = 70000,
    NotificationFailure = 70010,

    // Internal system errors (80000–80999)
    InternalError = 80000,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidParameter
            | ErrorCode::MissingConfiguration
            | ErrorCode::ExceedsLimitation => StatusCode::BAD_REQUEST,
            ErrorCode::PermissionDenied | ErrorCode::AuthExpired => StatusCode::UNAUTHORIZED,
            ErrorCode::AccountDisabled
            | ErrorCode::MissingRefreshToken
            | ErrorCode::AuthPermanent
            | ErrorCode::InsufficientScope => StatusCode::FORBIDDEN,
            ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::TooManyRequest => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NetworkError
            | ErrorCode::ConnectionTimeout
            | ErrorCode::HttpResponseError
            | ErrorCode::ImapCommandFailed
            | ErrorCode::ImapAuthenticationFailed
            | ErrorCode::ImapUnexpectedResult
            | ErrorCode::GmailApiCallFailed
            | ErrorCode::StorageFailure
            | ErrorCode::SearchStoreFailed
            | ErrorCode::QueueUnavailable
            | ErrorCode::ClassificationParseError
            | ErrorCode::NotificationFailure
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
