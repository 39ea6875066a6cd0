use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::modules::credentials::entity::OAuthTokens;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    delete_impl, filter_by_secondary_key_impl, insert_impl, list_all_impl, secondary_find_impl,
    update_impl,
};
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::message::entity::EmailMessage;
use crate::{encrypt, id, raise_error, utc_now, validate_email};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccountAuthType {
    #[default]
    Imap,
    OAuth,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Disconnected,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, STARTTLS-less plain connection otherwise
    pub secure: bool,
    /// AES-256-CBC ciphertext in `ivHex:ciphertextHex` form
    pub encrypted_password: String,
}

/// One remote mailbox owned by a user.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 5, version = 1)]
#[native_db(
    primary_key(pk -> String),
    secondary_key(user_email -> String, unique)
)]
pub struct MailAccount {
    #[secondary_key(unique)]
    pub id: u64,
    #[secondary_key]
    pub user_id: u64,
    /// Lowercase address of the remote mailbox
    pub email: String,
    pub auth_type: AccountAuthType,
    /// Exactly one account per user carries this flag while any exist
    pub is_primary: bool,
    pub enabled: bool,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<i64>,
    /// Present when `auth_type` is Imap
    pub imap: Option<ImapConfig>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct AccountCreateRequest {
    pub user_id: u64,
    pub email: String,
    pub auth_type: AccountAuthType,
    pub is_primary: bool,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub imap_secure: bool,
    pub imap_password: Option<String>,
}

impl MailAccount {
    fn pk(&self) -> String {
        format!("{}_{}", self.created_at, self.id)
    }

    fn user_email(&self) -> String {
        format!("{}_{}", self.user_id, self.email)
    }

    /// Validates the request, encrypts the IMAP password, and enforces the
    /// invariants: `(user_id, email)` unique, IMAP config present for IMAP
    /// auth, a token record present for OAuth auth, and one primary account
    /// per user.
    pub async fn create(request: AccountCreateRequest) -> MailSiftResult<MailAccount> {
        let email = request.email.trim().to_lowercase();
        validate_email!(&email)?;

        let imap = match request.auth_type {
            AccountAuthType::Imap => {
                let (host, port, password) = match (
                    request.imap_host,
                    request.imap_port,
                    request.imap_password,
                ) {
                    (Some(host), Some(port), Some(password)) => (host, port, password),
                    _ => {
                        return Err(raise_error!(
                            "IMAP accounts require host, port, and password".into(),
                            ErrorCode::InvalidParameter
                        ))
                    }
                };
                Some(ImapConfig {
                    host,
                    port,
                    secure: request.imap_secure,
                    encrypted_password: encrypt!(&password)?,
                })
            }
            AccountAuthType::OAuth => {
                if OAuthTokens::find(&email).await?.is_none() {
                    return Err(raise_error!(
                        format!(
                            "OAuth account '{}' has no stored token set; complete the consent flow first",
                            email
                        ),
                        ErrorCode::MissingConfiguration
                    ));
                }
                None
            }
        };

        let existing = Self::list_for_user(request.user_id).await?;
        if existing.iter().any(|a| a.email == email) {
            return Err(raise_error!(
                format!("Account '{}' already exists for this user", email),
                ErrorCode::AlreadyExists
            ));
        }
        let is_primary = existing.is_empty() || request.is_primary;
        if request.is_primary {
            for account in existing.iter().filter(|a| a.is_primary) {
                Self::set_primary_flag(account.id, false).await?;
            }
        }

        let entity = MailAccount {
            id: id!(64),
            user_id: request.user_id,
            email,
            auth_type: request.auth_type,
            is_primary,
            enabled: true,
            sync_status: SyncStatus::Idle,
            last_sync_at: None,
            imap,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        };
        insert_impl(DB_MANAGER.meta_db(), entity.clone()).await?;
        Ok(entity)
    }

    pub async fn find(account_id: u64) -> MailSiftResult<Option<MailAccount>> {
        secondary_find_impl::<MailAccount>(DB_MANAGER.meta_db(), MailAccountKey::id, account_id)
            .await
    }

    pub async fn get(account_id: u64) -> MailSiftResult<MailAccount> {
        Self::find(account_id).await?.ok_or_else(|| {
            raise_error!(
                format!("Account with id '{account_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn check_account_active(account_id: u64) -> MailSiftResult<MailAccount> {
        match Self::find(account_id).await? {
            Some(entity) if entity.enabled => Ok(entity),
            Some(_) => Err(raise_error!(
                format!("Account id='{account_id}' is disabled"),
                ErrorCode::AccountDisabled
            )),
            None => Err(raise_error!(
                format!("Account id='{account_id}' not found"),
                ErrorCode::ResourceNotFound
            )),
        }
    }

    pub async fn list_for_user(user_id: u64) -> MailSiftResult<Vec<MailAccount>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), MailAccountKey::user_id, user_id).await
    }

    /// Accounts the supervisor starts workers for at boot.
    pub async fn list_startable() -> MailSiftResult<Vec<MailAccount>> {
        let all: Vec<MailAccount> = list_all_impl(DB_MANAGER.meta_db()).await?;
        Ok(all
            .into_iter()
            .filter(|a| a.enabled && a.sync_status != SyncStatus::Disconnected)
            .collect())
    }

    pub async fn set_sync_status(account_id: u64, status: SyncStatus) -> MailSiftResult<()> {
        Self::update_row(account_id, move |account| {
            account.sync_status = status;
        })
        .await
    }

    pub async fn touch_last_sync(account_id: u64) -> MailSiftResult<()> {
        let now = utc_now!();
        Self::update_row(account_id, move |account| {
            account.last_sync_at = Some(now);
            account.sync_status = SyncStatus::Idle;
        })
        .await
    }

    pub async fn set_enabled(account_id: u64, enabled: bool) -> MailSiftResult<()> {
        Self::update_row(account_id, move |account| {
            account.enabled = enabled;
        })
        .await
    }

    async fn set_primary_flag(account_id: u64, is_primary: bool) -> MailSiftResult<()> {
        Self::update_row(account_id, move |account| {
            account.is_primary = is_primary;
        })
        .await
    }

    async fn update_row(
        account_id: u64,
        mutate: impl FnOnce(&mut MailAccount) + Send + 'static,
    ) -> MailSiftResult<()> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .secondary::<MailAccount>(MailAccountKey::id, account_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("The account with id={account_id} was not found."),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                mutate(&mut updated);
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Ok(())
    }

    /// Disables the account, stops its worker, and cleans owned resources in
    /// the background: tokens, message rows, search documents, and finally
    /// the account row itself. If the deleted account was primary, a
    /// surviving sibling is promoted.
    pub async fn delete(account_id: u64) -> MailSiftResult<()> {
        let account = Self::get(account_id).await?;
        Self::set_enabled(account_id, false).await?;
        crate::modules::ingest::supervisor::INGEST_SUPERVISOR
            .trigger_stop(account_id)
            .await;
        tokio::spawn(async move {
            if let Err(e) = Self::cleanup_account_resources(account).await {
                error!("Account cleanup failed for {}: {:?}", account_id, e);
            }
        });
        Ok(())
    }

    async fn cleanup_account_resources(account: MailAccount) -> MailSiftResult<()> {
        OAuthTokens::try_delete(&account.email).await?;
        let removed = EmailMessage::delete_account_messages(account.id).await?;
        if let Err(e) = crate::modules::search::SearchStore::get()
            .delete_by_account(account.id)
            .await
        {
            // The reconciler cannot repair this direction; surface loudly.
            error!(
                "Failed to delete search documents for account {}: {:?}",
                account.id, e
            );
        }
        Self::delete_row(account.id).await?;
        if account.is_primary {
            if let Some(successor) = Self::list_for_user(account.user_id)
                .await?
                .into_iter()
                .next()
            {
                Self::set_primary_flag(successor.id, true).await?;
            }
        }
        info!(
            "Cleanup completed for account {} ({} messages removed)",
            account.id, removed
        );
        Ok(())
    }

    async fn delete_row(account_id: u64) -> MailSiftResult<()> {
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .secondary::<MailAccount>(MailAccountKey::id, account_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("The account with id={account_id} was not found."),
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
    use crate::modules::account::user::{AuthMethod, User};

    async fn make_user(email: &str) -> User {
        User::new(email, None, AuthMethod::Password)
            .unwrap()
            .create()
            .await
            .unwrap()
    }

    fn imap_request(user_id: u64, email: &str) -> AccountCreateRequest {
        AccountCreateRequest {
            user_id,
            email: email.into(),
            auth_type: AccountAuthType::Imap,
            is_primary: false,
            imap_host: Some("imap.example.com".into()),
            imap_port: Some(993),
            imap_secure: true,
            imap_password: Some("hunter2".into()),
        }
    }

    #[tokio::test]
    async fn first_account_becomes_primary() {
        let user = make_user("owner1@example.com").await;
        let first = MailAccount::create(imap_request(user.id, "Box1@Example.com"))
            .await
            .unwrap();
        assert!(first.is_primary);
        assert_eq!(first.email, "box1@example.com");

        let second = MailAccount::create(imap_request(user.id, "box2@example.com"))
            .await
            .unwrap();
        assert!(!second.is_primary);

        let primaries: Vec<_> = MailAccount::list_for_user(user.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.is_primary)
            .collect();
        assert_eq!(primaries.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_account_email_is_rejected() {
        let user = make_user("owner2@example.com").await;
        MailAccount::create(imap_request(user.id, "box@example.com"))
            .await
            .unwrap();
        let duplicate = MailAccount::create(imap_request(user.id, "box@example.com")).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn imap_account_requires_config() {
        let user = make_user("owner3@example.com").await;
        let request = AccountCreateRequest {
            user_id: user.id,
            email: "nopass@example.com".into(),
            auth_type: AccountAuthType::Imap,
            ..Default::default()
        };
        assert!(MailAccount::create(request).await.is_err());
    }

    #[tokio::test]
    async fn oauth_account_requires_tokens() {
        let user = make_user("owner4@example.com").await;
        let request = AccountCreateRequest {
            user_id: user.id,
            email: "oauthless@example.com".into(),
            auth_type: AccountAuthType::OAuth,
            ..Default::default()
        };
        let err = MailAccount::create(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }

    #[tokio::test]
    async fn imap_password_is_stored_encrypted() {
        let user = make_user("owner5@example.com").await;
        let account = MailAccount::create(imap_request(user.id, "cipher@example.com"))
            .await
            .unwrap();
        let config = account.imap.unwrap();
        assert_ne!(config.encrypted_password, "hunter2");
        assert!(config.encrypted_password.contains(':'));
        let plain = crate::decrypt!(&config.encrypted_password).unwrap();
        assert_eq!(plain, "hunter2");
    }
}
