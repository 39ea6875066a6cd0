use crate::modules::context::Initialize;
use crate::modules::error::{code::ErrorCode, MailSiftError};
use crate::modules::message::MESSAGE_MODELS;
use crate::modules::scheduler::nativedb::TASK_MODELS;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::modules::{database::META_MODELS, error::MailSiftResult};
use crate::raise_error;
use native_db::{Builder, Database};
use std::sync::{Arc, LazyLock};
use tracing::info;

pub static DB_MANAGER: LazyLock<DatabaseManager> = LazyLock::new(DatabaseManager::new);

pub struct DatabaseManager {
    /// Users, accounts, and OAuth token records
    meta_db: Arc<Database<'static>>,
    /// Authoritative message and recipient rows
    message_db: Arc<Database<'static>>,
    /// Durable sync job queue
    tasks_db: Arc<Database<'static>>,
}

impl DatabaseManager {
    fn new() -> Self {
        let meta_db = Self::init_meta_database().expect("Failed to initialize metadata database");
        let message_db =
            Self::init_message_database().expect("Failed to initialize message database");
        let tasks_db =
            Self::init_task_queue_database().expect("Failed to initialize tasks database");
        DatabaseManager {
            meta_db,
            message_db,
            tasks_db,
        }
    }

    pub fn meta_db(&self) -> &Arc<Database<'static>> {
        &self.meta_db
    }

    pub fn message_db(&self) -> &Arc<Database<'static>> {
        &self.message_db
    }

    pub fn tasks_db(&self) -> &Arc<Database<'static>> {
        &self.tasks_db
    }

    fn init_meta_database() -> MailSiftResult<Arc<Database<'static>>> {
        if SETTINGS.mailsift_memory_mode_enabled {
            return Ok(Arc::new(
                Builder::new().create_in_memory(&META_MODELS).unwrap(),
            ));
        }
        let mut database = Builder::new()
            .set_cache_size(
                SETTINGS
                    .mailsift_metadata_cache_size
                    .unwrap_or(134217728)
                    .max(67108864),
            )
            .create(&META_MODELS, DATA_DIR_MANAGER.meta_db.clone())
            .map_err(Self::handle_database_error)?;
        database
            .compact()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
        Ok(Arc::new(database))
    }

    fn init_message_database() -> MailSiftResult<Arc<Database<'static>>> {
        if SETTINGS.mailsift_memory_mode_enabled {
            return Ok(Arc::new(
                Builder::new().create_in_memory(&MESSAGE_MODELS).unwrap(),
            ));
        }
        info!(
            "Initializing message database at: {:?}",
            &DATA_DIR_MANAGER.message_db
        );
        let mut database = Builder::new()
            .set_cache_size(
                SETTINGS
                    .mailsift_message_cache_size
                    .unwrap_or(268435456)
                    .max(67108864),
            )
            .create(&MESSAGE_MODELS, DATA_DIR_MANAGER.message_db.clone())
            .map_err(Self::handle_database_error)?;
        database
            .compact()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
        Ok(Arc::new(database))
    }

    fn init_task_queue_database() -> MailSiftResult<Arc<Database<'static>>> {
        if SETTINGS.mailsift_memory_mode_enabled {
            return Ok(Arc::new(
                Builder::new().create_in_memory(&TASK_MODELS).unwrap(),
            ));
        }
        let mut database = Builder::new()
            .set_cache_size(
                SETTINGS
                    .mailsift_task_queue_cache_size
                    .unwrap_or(67108864)
                    .max(67108864),
            )
            .create(&TASK_MODELS, DATA_DIR_MANAGER.task_db.clone())
            .map_err(Self::handle_database_error)?;
        database
            .compact()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageFailure))?;
        Ok(Arc::new(database))
    }

    fn handle_database_error(error: native_db::db_type::Error) -> MailSiftError {
        match error {
            native_db::db_type::Error::RedbDatabaseError(database_error) => match database_error {
                redb::DatabaseError::DatabaseAlreadyOpen => {
                    raise_error!(
                        "Database is already open by another instance".into(),
                        ErrorCode::StorageFailure
                    )
                }
                other => {
                    raise_error!(
                        format!("Database error: {:?}", other),
                        ErrorCode::StorageFailure
                    )
                }
            },
            other => {
                raise_error!(
                    format!("Failed to create database: {:?}", other),
                    ErrorCode::StorageFailure
                )
            }
        }
    }
}

impl Initialize for DatabaseManager {
    async fn initialize() -> MailSiftResult<()> {
        let _ = &*DB_MANAGER;
        Ok(())
    }
}
