use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag};
use async_imap::Session as ImapSession;
use futures::StreamExt;
use itertools::Itertools;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::days_ago_timestamp;
use crate::modules::account::entity::{AccountAuthType, ImapConfig, MailAccount, SyncStatus};
use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::credentials::CredentialStore;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::ingest::{as_datetime, message_from_rfc822, INGEST_BATCH_SIZE};
use crate::modules::message::entity::EmailMessage;
use crate::modules::pipeline::EmailService;
use crate::modules::settings::cli::SETTINGS;
use crate::{decrypt, raise_error};

/// RFC 2177 asks clients to re-issue IDLE at least every 29 minutes.
const IDLE_REFRESH: Duration = Duration::from_secs(29 * 60);
const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

pub trait SessionStream:
    AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug
{
}

impl SessionStream for Box<dyn SessionStream> {}
impl SessionStream for TcpStream {}
impl<T: SessionStream> SessionStream for tokio_rustls::client::TlsStream<T> {}
impl<T: SessionStream> SessionStream for BufWriter<T> {}

type Session = ImapSession<Box<dyn SessionStream>>;

#[derive(Debug)]
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// One long-lived IMAP session per account: initial windowed sync, then
/// IDLE, fetching the newest message on every push. Returns `Ok` only on
/// shutdown; socket errors bubble to the supervisor's restart policy.
pub struct ImapIngestor;

impl ImapIngestor {
    pub async fn run(account: MailAccount) -> MailSiftResult<()> {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        MailAccount::set_sync_status(account.id, SyncStatus::Syncing).await?;

        let mut session = Self::establish_session(&account).await?;

        // Read-only open: fetching must never flip \Seen on the server.
        session
            .examine("INBOX")
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;

        Self::initial_sync(&mut session, &account).await?;
        MailAccount::touch_last_sync(account.id).await?;
        info!("Initial sync finished for {}; entering IDLE", account.email);

        loop {
            let mut idle = session.idle();
            idle.init()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
            let (idle_wait, interrupt) = idle.wait_with_timeout(IDLE_REFRESH);

            let response = tokio::select! {
                result = idle_wait => result
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?,
                _ = shutdown.recv() => {
                    drop(interrupt);
                    IdleResponse::ManualInterrupt
                }
            };

            session = idle
                .done()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;

            match response {
                IdleResponse::ManualInterrupt => {
                    info!("Shutting down IMAP session for {}", account.email);
                    let _ = session.logout().await;
                    return Ok(());
                }
                IdleResponse::Timeout => {
                    debug!("IDLE refresh for {}", account.email);
                }
                IdleResponse::NewData(_) => {
                    // A push always wins: even a message older than the sync
                    // window is indexed when the server announces it.
                    Self::fetch_newest(&mut session, &account).await?;
                    MailAccount::touch_last_sync(account.id).await?;
                }
            }
        }
    }

    /// Streams the initial window: every message whose internal date falls
    /// within the configured number of days, in observed order.
    async fn initial_sync(session: &mut Session, account: &MailAccount) -> MailSiftResult<()> {
        let cutoff = days_ago_timestamp!(SETTINGS.mailsift_initial_sync_days);
        let since = as_datetime(cutoff)
            .map(|d| d.format("%d-%b-%Y").to_string())
            .ok_or_else(|| {
                raise_error!("Sync window is out of range".into(), ErrorCode::InternalError)
            })?;

        let uids: HashSet<u32> = session
            .uid_search(format!("SINCE {}", since))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut ordered: Vec<u32> = uids.into_iter().collect();
        ordered.sort_unstable();
        info!(
            "Initial sync for {}: {} candidates since {}",
            account.email,
            ordered.len(),
            since
        );

        for chunk in ordered.chunks(INGEST_BATCH_SIZE) {
            let set = chunk.iter().map(|uid| uid.to_string()).join(",");
            let fetches = Self::collect_fetches(session, &set).await?;
            let mut batch = Vec::with_capacity(fetches.len());
            for fetch in &fetches {
                let internal_date = fetch.internal_date().map(|d| d.timestamp_millis());
                if internal_date.is_some_and(|d| d < cutoff) {
                    continue;
                }
                match Self::to_message(fetch, account) {
                    Ok(message) => batch.push(message),
                    Err(e) => warn!("Skipping unparseable message: {}", e),
                }
            }
            if !batch.is_empty() {
                EmailService::ingest(batch).await?;
            }
        }
        Ok(())
    }

    /// After an EXISTS push, fetch only the newest message in the mailbox.
    async fn fetch_newest(session: &mut Session, account: &MailAccount) -> MailSiftResult<()> {
        let fetches = Self::collect_fetches(session, "*").await?;
        let mut batch: Vec<EmailMessage> = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            match Self::to_message(fetch, account) {
                Ok(message) => batch.push(message),
                Err(e) => warn!("Skipping unparseable pushed message: {}", e),
            }
        }
        if !batch.is_empty() {
            debug!("IDLE push delivered {} message(s) for {}", batch.len(), account.email);
            EmailService::ingest(batch).await?;
        }
        Ok(())
    }

    async fn collect_fetches(session: &mut Session, set: &str) -> MailSiftResult<Vec<Fetch>> {
        let stream = session
            .uid_fetch(set, FETCH_ITEMS)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let results: Vec<_> = stream.collect().await;
        results
            .into_iter()
            .map(|r| r.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed)))
            .collect()
    }

    fn to_message(fetch: &Fetch, account: &MailAccount) -> MailSiftResult<EmailMessage> {
        let uid = fetch
            .uid
            .ok_or_else(|| raise_error!("No uid available".into(), ErrorCode::ImapUnexpectedResult))?;
        let raw = fetch.body().ok_or_else(|| {
            raise_error!("No body available".into(), ErrorCode::ImapUnexpectedResult)
        })?;
        let flags = fetch
            .flags()
            .filter(|f| !matches!(f, Flag::Recent))
            .map(flag_to_string)
            .collect();
        let internal_date = fetch.internal_date().map(|d| d.timestamp_millis());
        message_from_rfc822(
            account.id,
            &account.email,
            "INBOX",
            &uid.to_string(),
            raw,
            flags,
            internal_date,
        )
    }

    /// Connects and authenticates. For OAuth accounts an authentication
    /// failure triggers exactly one forced token refresh; a second failure
    /// disconnects the account and is not retriable.
    async fn establish_session(account: &MailAccount) -> MailSiftResult<Session> {
        match account.auth_type {
            AccountAuthType::Imap => {
                let config = account.imap.as_ref().ok_or_else(|| {
                    raise_error!(
                        format!("Account {} is missing its IMAP config", account.email),
                        ErrorCode::MissingConfiguration
                    )
                })?;
                let client = Self::connect(config).await?;
                let password = decrypt!(&config.encrypted_password)?;
                client
                    .login(&account.email, &password)
                    .await
                    .map_err(|(e, _)| {
                        raise_error!(format!("{:#?}", e), ErrorCode::ImapAuthenticationFailed)
                    })
            }
            AccountAuthType::OAuth => {
                // XOAUTH2 is offered to any host, not just Gmail.
                let config = ImapConfig {
                    host: "imap.gmail.com".into(),
                    port: 993,
                    secure: true,
                    encrypted_password: String::new(),
                };
                let config = account.imap.as_ref().unwrap_or(&config);
                for attempt in 0..2 {
                    let client = Self::connect(config).await?;
                    let token = CredentialStore::get_valid_access_token(&account.email).await?;
                    let authenticator = XOAuth2 {
                        user: account.email.clone(),
                        access_token: token,
                    };
                    match client.authenticate("XOAUTH2", authenticator).await {
                        Ok(session) => return Ok(session),
                        Err((e, _)) if attempt == 0 => {
                            warn!(
                                "XOAUTH2 rejected for {}; forcing one token refresh: {:#?}",
                                account.email, e
                            );
                            CredentialStore::force_refresh(&account.email).await?;
                        }
                        Err((e, _)) => {
                            MailAccount::set_sync_status(account.id, SyncStatus::Disconnected)
                                .await?;
                            return Err(raise_error!(
                                format!("{:#?}", e),
                                ErrorCode::AuthPermanent
                            ));
                        }
                    }
                }
                unreachable!("both XOAUTH2 attempts returned")
            }
        }
    }

    async fn connect(config: &ImapConfig) -> MailSiftResult<async_imap::Client<Box<dyn SessionStream>>> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;

        let stream: Box<dyn SessionStream> = if config.secure {
            let tls = establish_tls_stream(&config.host, tcp).await?;
            Box::new(BufWriter::new(tls))
        } else {
            Box::new(BufWriter::new(tcp))
        };

        let mut client = async_imap::Client::new(stream);
        let _greeting = client
            .read_response()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?
            .ok_or_else(|| {
                raise_error!("failed to read greeting".into(), ErrorCode::ImapCommandFailed)
            })?;
        Ok(client)
    }
}

async fn establish_tls_stream(
    host: &str,
    tcp: TcpStream,
) -> MailSiftResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InvalidParameter))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))
}

fn flag_to_string(flag: Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".into(),
        Flag::Answered => "\\Answered".into(),
        Flag::Flagged => "\\Flagged".into(),
        Flag::Deleted => "\\Deleted".into(),
        Flag::Draft => "\\Draft".into(),
        Flag::Recent => "\\Recent".into(),
        Flag::MayCreate => "\\*".into(),
        Flag::Custom(name) => name.into_owned(),
    }
}
