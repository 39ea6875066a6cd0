use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{async_find_impl, delete_impl, list_all_impl, update_impl, upsert_impl};
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::{decrypt, encrypt, raise_error, utc_now};

/// OAuth token set for one remote mailbox, keyed solely by the account
/// email so no account↔token reference cycle can form. Token secrets are
/// encrypted at rest and never replicated into the search store.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[native_model(id = 6, version = 1)]
#[native_db]
pub struct OAuthTokens {
    #[primary_key]
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch milliseconds at which the access token stops being usable
    pub token_expiry: i64,
    pub scope: Vec<String>,
    pub created_at: i64,
    pub last_used: i64,
}

/// Plaintext token material exchanged with the provider.
#[derive(Clone, Debug, Default)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expiry: i64,
    pub scope: Vec<String>,
}

/// Partial update applied after a refresh; unspecified fields keep their
/// stored value.
#[derive(Clone, Debug, Default)]
pub struct TokenUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<i64>,
    pub scope: Option<Vec<String>>,
}

impl OAuthTokens {
    pub async fn store(email: &str, set: TokenSet) -> MailSiftResult<()> {
        let now = utc_now!();
        let entity = OAuthTokens {
            email: email.to_lowercase(),
            access_token: encrypt!(&set.access_token)?,
            refresh_token: set
                .refresh_token
                .as_ref()
                .map(|t| encrypt!(t))
                .transpose()?,
            token_expiry: set.token_expiry,
            scope: set.scope,
            created_at: now,
            last_used: now,
        };
        upsert_impl(DB_MANAGER.meta_db(), entity).await
    }

    /// Returns the decrypted token set, or `Ok(None)` when absent.
    pub async fn find(email: &str) -> MailSiftResult<Option<OAuthTokens>> {
        async_find_impl::<OAuthTokens>(DB_MANAGER.meta_db(), email.to_lowercase())
            .await?
            .map(|mut tokens| {
                tokens.access_token = decrypt!(&tokens.access_token)?;
                tokens.refresh_token = tokens
                    .refresh_token
                    .map(|t| decrypt!(&t))
                    .transpose()?;
                Ok(tokens)
            })
            .transpose()
    }

    pub async fn list_all() -> MailSiftResult<Vec<OAuthTokens>> {
        list_all_impl::<OAuthTokens>(DB_MANAGER.meta_db())
            .await?
            .into_iter()
            .map(|mut tokens| {
                tokens.access_token = decrypt!(&tokens.access_token)?;
                tokens.refresh_token = tokens
                    .refresh_token
                    .map(|t| decrypt!(&t))
                    .transpose()?;
                Ok(tokens)
            })
            .collect()
    }

    pub async fn update(email: &str, update: TokenUpdate) -> MailSiftResult<()> {
        let email = email.to_lowercase();
        let access_token = update
            .access_token
            .as_ref()
            .map(|t| encrypt!(t))
            .transpose()?;
        let refresh_token = update
            .refresh_token
            .as_ref()
            .map(|t| encrypt!(t))
            .transpose()?;
        update_impl(
            DB_MANAGER.meta_db(),
            {
                let email = email.clone();
                move |rw| {
                    rw.get()
                        .primary::<OAuthTokens>(email.clone())
                        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                        .ok_or_else(|| {
                            raise_error!(
                                format!("No token set stored for '{}'", email),
                                ErrorCode::ResourceNotFound
                            )
                        })
                }
            },
            move |current| {
                let mut updated = current.clone();
                if let Some(token) = access_token {
                    updated.access_token = token;
                }
                if let Some(token) = refresh_token {
                    updated.refresh_token = Some(token);
                }
                if let Some(expiry) = update.token_expiry {
                    updated.token_expiry = expiry;
                }
                if let Some(scope) = update.scope {
                    updated.scope = scope;
                }
                updated.last_used = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Ok(())
    }

    pub async fn try_delete(email: &str) -> MailSiftResult<()> {
        let email = email.to_lowercase();
        if async_find_impl::<OAuthTokens>(DB_MANAGER.meta_db(), email.clone())
            .await?
            .is_none()
        {
            return Ok(());
        }
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<OAuthTokens>(email.clone())
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .ok_or_else(|| {
                    raise_error!(
                        "Token set disappeared mid-delete".into(),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_round_trip_through_encryption() {
        let set = TokenSet {
            access_token: "ya29.secret".into(),
            refresh_token: Some("1//refresh".into()),
            token_expiry: utc_now!() + 3_600_000,
            scope: vec!["https://www.googleapis.com/auth/gmail.readonly".into()],
        };
        OAuthTokens::store("Tokens@Example.com", set).await.unwrap();

        let loaded = OAuthTokens::find("tokens@example.com").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "ya29.secret");
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//refresh"));

        // The row itself must not hold plaintext.
        let raw = crate::modules::database::async_find_impl::<OAuthTokens>(
            DB_MANAGER.meta_db(),
            "tokens@example.com".to_string(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_ne!(raw.access_token, "ya29.secret");
        assert!(raw.access_token.contains(':'));
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let set = TokenSet {
            access_token: "old-token".into(),
            refresh_token: Some("keep-me".into()),
            token_expiry: 1000,
            scope: vec!["a".into()],
        };
        OAuthTokens::store("partial@example.com", set).await.unwrap();
        OAuthTokens::update(
            "partial@example.com",
            TokenUpdate {
                access_token: Some("new-token".into()),
                token_expiry: Some(2000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let loaded = OAuthTokens::find("partial@example.com").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "new-token");
        assert_eq!(loaded.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(loaded.token_expiry, 2000);
        assert_eq!(loaded.scope, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn try_delete_tolerates_absence() {
        assert!(OAuthTokens::try_delete("ghost@example.com").await.is_ok());
    }
}
