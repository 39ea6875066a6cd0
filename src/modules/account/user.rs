use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::modules::account::entity::MailAccount;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{delete_impl, insert_impl, secondary_find_impl};
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::{id, raise_error, utc_now, validate_email};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[default]
    Password,
    OAuth,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

/// A registered tenant. Created on registration or first OAuth login and
/// never silently re-created; deletion cascades to owned accounts.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 4, version = 1)]
#[native_db(primary_key(pk -> String))]
pub struct User {
    #[secondary_key(unique)]
    pub id: u64,
    /// Lowercase, unique across tenants
    #[secondary_key(unique)]
    pub email: String,
    /// bcrypt hash produced by the authentication layer; absent for
    /// pure-OAuth users
    pub password_hash: Option<String>,
    pub auth_method: AuthMethod,
    pub role: UserRole,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    fn pk(&self) -> String {
        format!("{}_{}", self.created_at, self.id)
    }

    pub fn new(
        email: &str,
        password_hash: Option<String>,
        auth_method: AuthMethod,
    ) -> MailSiftResult<Self> {
        let email = email.trim().to_lowercase();
        validate_email!(&email)?;
        Ok(User {
            id: id!(64),
            email,
            password_hash,
            auth_method,
            role: UserRole::User,
            enabled: true,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        })
    }

    pub async fn create(self) -> MailSiftResult<User> {
        if Self::find_by_email(&self.email).await?.is_some() {
            return Err(raise_error!(
                format!("A user with email '{}' already exists", self.email),
                ErrorCode::AlreadyExists
            ));
        }
        insert_impl(DB_MANAGER.meta_db(), self.clone()).await?;
        Ok(self)
    }

    pub async fn find(user_id: u64) -> MailSiftResult<Option<User>> {
        secondary_find_impl::<User>(DB_MANAGER.meta_db(), UserKey::id, user_id).await
    }

    pub async fn get(user_id: u64) -> MailSiftResult<User> {
        Self::find(user_id).await?.ok_or_else(|| {
            raise_error!(
                format!("User with id '{user_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find_by_email(email: &str) -> MailSiftResult<Option<User>> {
        secondary_find_impl::<User>(DB_MANAGER.meta_db(), UserKey::email, email.to_lowercase())
            .await
    }

    /// Removes the user and cascades to every owned account. Account
    /// cleanup runs sequentially so a failure leaves an observable trail
    /// rather than a half-deleted tenant.
    pub async fn delete(user_id: u64) -> MailSiftResult<()> {
        let user = Self::get(user_id).await?;
        let accounts = MailAccount::list_for_user(user_id).await?;
        tokio::spawn(async move {
            for account in accounts {
                if let Err(e) = MailAccount::delete(account.id).await {
                    error!(
                        "Account cleanup failed for {} while deleting user {}: {:?}",
                        account.id, user_id, e
                    );
                }
            }
            if let Err(e) = Self::delete_row(user_id).await {
                error!("Failed to delete user {}: {:?}", user_id, e);
            } else {
                info!("Deleted user {} ({})", user_id, user.email);
            }
        });
        Ok(())
    }

    async fn delete_row(user_id: u64) -> MailSiftResult<()> {
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .secondary::<User>(UserKey::id, user_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("The user with id={user_id} was not found."),
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
    async fn email_is_lowercased_and_unique() {
        let user = User::new("MixedCase@Example.com", None, AuthMethod::OAuth)
            .unwrap()
            .create()
            .await
            .unwrap();
        assert_eq!(user.email, "mixedcase@example.com");

        let duplicate = User::new("mixedcase@example.com", None, AuthMethod::OAuth)
            .unwrap()
            .create()
            .await;
        assert!(duplicate.is_err());
    }

    #[test]
    fn rejects_invalid_email() {
        assert!(User::new("not an email", None, AuthMethod::Password).is_err());
    }
}
