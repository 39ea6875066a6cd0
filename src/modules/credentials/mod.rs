use std::sync::LazyLock;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::modules::account::entity::{MailAccount, SyncStatus};
use crate::modules::common::periodic::spawn_periodic;
use crate::modules::context::BackgroundTask;
use crate::modules::credentials::cache::{TokenCache, REFRESH_BUFFER_MS};
use crate::modules::credentials::entity::{OAuthTokens, TokenSet, TokenUpdate};
use crate::modules::credentials::flow::{OAuthFlow, GOOGLE_USERINFO_URL};
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::{mailsift_version, raise_error, utc_now};

pub mod cache;
pub mod entity;
pub mod flow;

static TOKEN_CACHE: LazyLock<TokenCache> = LazyLock::new(TokenCache::new);

const REFRESH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCheck {
    pub has_full_access: bool,
    pub scope: Vec<String>,
}

pub struct CredentialStore;

impl CredentialStore {
    /// Returns an access token with at least five minutes of remaining
    /// lifetime, refreshing transparently when the stored expiry falls
    /// inside the refresh window. Refreshes for one email are serialized.
    pub async fn get_valid_access_token(email: &str) -> MailSiftResult<String> {
        let email = email.to_lowercase();
        if let Some(token) = TOKEN_CACHE.get_fresh(&email) {
            return Ok(token);
        }

        let lock = TOKEN_CACHE.writer_lock(&email);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        if let Some(token) = TOKEN_CACHE.get_fresh(&email) {
            return Ok(token);
        }

        let tokens = OAuthTokens::find(&email).await?.ok_or_else(|| {
            raise_error!(
                format!("No token set stored for '{}'", email),
                ErrorCode::ResourceNotFound
            )
        })?;

        if tokens.token_expiry > utc_now!() + REFRESH_BUFFER_MS {
            TOKEN_CACHE.put(&email, tokens.access_token.clone(), tokens.token_expiry);
            return Ok(tokens.access_token);
        }

        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            raise_error!(
                format!(
                    "Token for '{}' is expiring and no refresh token is stored",
                    email
                ),
                ErrorCode::MissingRefreshToken
            )
        })?;

        let refreshed = match OAuthFlow::refresh_access_token(&refresh_token).await {
            Ok(set) => set,
            Err(e) => {
                TOKEN_CACHE.invalidate(&email);
                return Err(e);
            }
        };
        Self::persist_refresh(&email, &refreshed).await?;
        TOKEN_CACHE.put(&email, refreshed.access_token.clone(), refreshed.token_expiry);
        info!("Refreshed access token for {}", email);
        Ok(refreshed.access_token)
    }

    /// Drops any cached token and refreshes immediately, regardless of the
    /// stored expiry. Used after a provider 401 on a token that still
    /// looked valid (revoked server-side).
    pub async fn force_refresh(email: &str) -> MailSiftResult<String> {
        let email = email.to_lowercase();
        let lock = TOKEN_CACHE.writer_lock(&email);
        let _guard = lock.lock().await;
        TOKEN_CACHE.invalidate(&email);

        let tokens = OAuthTokens::find(&email).await?.ok_or_else(|| {
            raise_error!(
                format!("No token set stored for '{}'", email),
                ErrorCode::ResourceNotFound
            )
        })?;
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            raise_error!(
                format!("No refresh token stored for '{}'", email),
                ErrorCode::MissingRefreshToken
            )
        })?;
        let refreshed = OAuthFlow::refresh_access_token(&refresh_token).await?;
        Self::persist_refresh(&email, &refreshed).await?;
        TOKEN_CACHE.put(&email, refreshed.access_token.clone(), refreshed.token_expiry);
        Ok(refreshed.access_token)
    }

    pub async fn store_tokens(email: &str, set: TokenSet) -> MailSiftResult<()> {
        TOKEN_CACHE.invalidate(&email.to_lowercase());
        OAuthTokens::store(email, set).await
    }

    pub async fn update_tokens(email: &str, update: TokenUpdate) -> MailSiftResult<()> {
        TOKEN_CACHE.invalidate(&email.to_lowercase());
        OAuthTokens::update(email, update).await
    }

    pub async fn delete_tokens(email: &str) -> MailSiftResult<()> {
        TOKEN_CACHE.invalidate(&email.to_lowercase());
        OAuthTokens::try_delete(email).await
    }

    /// Whether the stored token is already inside the refresh window.
    pub async fn is_expired(email: &str) -> MailSiftResult<bool> {
        let tokens = OAuthTokens::find(email).await?;
        Ok(match tokens {
            Some(tokens) => tokens.token_expiry <= utc_now!() + REFRESH_BUFFER_MS,
            None => true,
        })
    }

    pub async fn check_scopes(email: &str) -> MailSiftResult<ScopeCheck> {
        let tokens = OAuthTokens::find(email).await?.ok_or_else(|| {
            raise_error!(
                format!("No token set stored for '{}'", email),
                ErrorCode::ResourceNotFound
            )
        })?;
        let has_full_access = tokens.scope.iter().any(|s| {
            s == "https://www.googleapis.com/auth/gmail.readonly"
                || s == "https://mail.google.com/"
        });
        Ok(ScopeCheck {
            has_full_access,
            scope: tokens.scope,
        })
    }

    /// Probes the provider's userinfo endpoint with the stored token. A 401
    /// self-heals: the dead token set is deleted and every account bound to
    /// the email is marked disconnected.
    pub async fn validate_tokens(email: &str) -> MailSiftResult<bool> {
        let token = match Self::get_valid_access_token(email).await {
            Ok(token) => token,
            Err(e) if e.code() == ErrorCode::ResourceNotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let client = reqwest::Client::builder()
            .user_agent(format!("MailSift/{}", mailsift_version!()))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        let response = client
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!(
                "Userinfo probe for {} returned 401; deleting tokens and disconnecting",
                email
            );
            Self::delete_tokens(email).await?;
            Self::disconnect_accounts(email).await?;
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("Userinfo probe failed with status {}", response.status()),
                ErrorCode::HttpResponseError
            ));
        }
        Ok(true)
    }

    async fn disconnect_accounts(email: &str) -> MailSiftResult<()> {
        let email = email.to_lowercase();
        let accounts = MailAccount::list_startable().await?;
        for account in accounts.into_iter().filter(|a| a.email == email) {
            MailAccount::set_sync_status(account.id, SyncStatus::Disconnected).await?;
        }
        Ok(())
    }

    async fn persist_refresh(email: &str, set: &TokenSet) -> MailSiftResult<()> {
        OAuthTokens::update(
            email,
            TokenUpdate {
                access_token: Some(set.access_token.clone()),
                refresh_token: set.refresh_token.clone(),
                token_expiry: Some(set.token_expiry),
                scope: None,
            },
        )
        .await
    }
}

/// Background sweep refreshing any stored token close to expiry, so the
/// long-lived IMAP sessions can re-authenticate without stalling on a
/// synchronous refresh.
pub struct TokenRefreshTask;

impl BackgroundTask for TokenRefreshTask {
    fn start() {
        spawn_periodic("oauth-token-refresh", REFRESH_SWEEP_INTERVAL, false, || async {
            let all_tokens = OAuthTokens::list_all().await?;
            for tokens in all_tokens {
                if tokens.token_expiry > utc_now!() + REFRESH_BUFFER_MS {
                    continue;
                }
                debug!("Token for {} is close to expiry; refreshing", tokens.email);
                let email = tokens.email.clone();
                tokio::spawn(async move {
                    if let Err(e) = CredentialStore::get_valid_access_token(&email).await {
                        error!("Background refresh failed for {}: {}", email, e);
                    }
                });
            }
            Ok(())
        });
    }
}
