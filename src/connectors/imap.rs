//! IMAP connector implementation.
//!
//! This module provides an [`EmailConnector`] implementation speaking
//! IMAP4rev1 (RFC 3501) via `async-imap` over rustls TLS.
//!
//! # UID-based incremental sync
//!
//! Within one UIDVALIDITY epoch, UIDs are stable and strictly ascending, so
//! incremental sync reduces to `UID SEARCH UID <last+1>:*`. A changed
//! UIDVALIDITY invalidates every stored UID and mandates a full resync; the
//! engine surfaces the fresh value in [`FolderStatus`] and in each message's
//! `uid_validity` so the caller can detect the mismatch (see
//! [`crate::sync::SyncMode::decide`]).
//!
//! All content fetches use `BODY.PEEK[]`, never `RFC822`: an RFC822 fetch
//! implicitly sets `\Seen`, corrupting the user's read state as a side
//! effect of syncing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mail_parser::{Addr, Message as ParsedMessage, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{ConnectorError, ConnectorStatus, EmailConnector, EmailStream, Result};
use crate::config::{ImapCredentials, SyncSettings};
use crate::domain::{
    AccountId, EmailAddress, EmailAttachment, EmailMessage, FolderInfo, MessageFlags, ProviderType,
};
use crate::sync::{detect_gaps, SyncResult, SyncType};

/// Fetch items for full message retrieval. BODY.PEEK[] keeps `\Seen` intact.
const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])";

/// Type alias for the IMAP session with TLS (using the tokio-util compat layer).
type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Snapshot of a folder's sync-relevant counters.
///
/// Produced fresh on every [`ImapConnector::get_folder_status`] call; the
/// caller persists `uid_validity`/`uid_next` across runs to detect mailbox
/// resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStatus {
    /// Folder the snapshot covers.
    pub folder: String,
    /// UIDVALIDITY of the folder.
    pub uid_validity: Option<u32>,
    /// Next UID the server will assign.
    pub uid_next: Option<u32>,
    /// EXISTS count from SELECT.
    pub exists: u32,
    /// MESSAGES count from STATUS.
    pub messages: Option<u32>,
    /// RECENT count from STATUS.
    pub recent: Option<u32>,
    /// HIGHESTMODSEQ, when the server supports CONDSTORE. Absence is not
    /// an error.
    pub highest_mod_seq: Option<u64>,
}

/// Server capabilities relevant to sync strategy.
///
/// The engine never assumes a capability without checking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapCapabilities {
    /// CONDSTORE (RFC 7162): modseq-based change tracking.
    pub condstore: bool,
    /// QRESYNC (RFC 7162): quick mailbox resynchronization.
    pub qresync: bool,
    /// IDLE (RFC 2177): server push notifications.
    pub idle: bool,
    /// UIDPLUS (RFC 4315): UID EXPUNGE and APPENDUID.
    pub uidplus: bool,
    /// MOVE (RFC 6851): atomic message move.
    pub move_supported: bool,
    /// COMPRESS=DEFLATE (RFC 4978).
    pub compress_deflate: bool,
}

/// Quotes a mailbox name per RFC 3501's quoted-string grammar.
///
/// Names containing spaces or special characters are wrapped in double
/// quotes with internal `"` and `\` escaped. Already-quoted names pass
/// through unchanged so repeated application cannot double-quote.
pub fn quote_folder_name(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        return name.to_string();
    }

    let needs_quoting = name
        .chars()
        .any(|c| matches!(c, ' ' | '"' | '\\' | '(' | ')' | '{' | '%' | '*'));
    if !needs_quoting {
        return name.to_string();
    }

    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Formats a date for SEARCH criteria (RFC 3501 date syntax, e.g. `1-Jan-2024`).
fn format_imap_date(date: DateTime<Utc>) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Builds the SEARCH criteria for a sync run.
///
/// Full syncs search `ALL` regardless of date. Incremental syncs without a
/// timestamp fall back to the configured lookback window; a `None` lookback
/// means unlimited history (`ALL`), which is distinct from `Some(0)`
/// (`SINCE <today>`).
fn build_search_criteria(
    sync_type: SyncType,
    last_sync_time: Option<DateTime<Utc>>,
    sync_days_back: Option<i64>,
) -> String {
    match sync_type {
        SyncType::Full => "ALL".to_string(),
        SyncType::Incremental | SyncType::Manual => match last_sync_time {
            Some(since) => format!("SINCE {}", format_imap_date(since)),
            None => match sync_days_back {
                None => "ALL".to_string(),
                Some(days) => {
                    let since = Utc::now() - chrono::Duration::days(days);
                    format!("SINCE {}", format_imap_date(since))
                }
            },
        },
    }
}

/// Parses the parenthesized field list of an untagged STATUS response.
///
/// Input looks like
/// `* STATUS "INBOX" (MESSAGES 231 UIDNEXT 44292 UIDVALIDITY 857529045 RECENT 1)`;
/// the returned map holds each field name and its numeric value.
fn parse_status_fields(response: &str) -> HashMap<String, u64> {
    let mut fields = HashMap::new();

    for line in response.lines() {
        if !line.contains("STATUS") {
            continue;
        }
        let Some(open) = line.rfind('(') else {
            continue;
        };
        let Some(close) = line[open..].find(')') else {
            continue;
        };
        let inner = &line[open + 1..open + close];

        let mut tokens = inner.split_whitespace();
        while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
            if let Ok(n) = value.parse::<u64>() {
                fields.insert(key.to_ascii_uppercase(), n);
            }
        }
    }

    fields
}

/// Orders search results for bulk sync and applies the per-run cap.
///
/// UIDs are sorted ascending then reversed, so a cap keeps the newest
/// messages and drops the oldest.
fn plan_fetch_order(uids: impl IntoIterator<Item = u32>, limit: Option<usize>) -> Vec<u32> {
    let mut uid_list: Vec<u32> = uids.into_iter().collect();
    uid_list.sort_unstable();
    uid_list.reverse();
    if let Some(limit) = limit {
        uid_list.truncate(limit);
    }
    uid_list
}

/// Splits a connector message ID of the form `folder:uid`.
///
/// Folder names may themselves contain `:`, so the UID is taken from the
/// right.
fn parse_message_id(message_id: &str) -> Result<(&str, u32)> {
    let (folder, uid_str) = message_id
        .rsplit_once(':')
        .ok_or_else(|| ConnectorError::Sync(format!("invalid message id: {}", message_id)))?;
    let uid = uid_str
        .parse::<u32>()
        .map_err(|_| ConnectorError::Sync(format!("invalid UID in message id: {}", message_id)))?;
    Ok((folder, uid))
}

/// IMAP email connector.
///
/// One instance exclusively owns one IMAP session; callers serialize
/// operations per instance and run separate connectors for concurrency.
pub struct ImapConnector {
    /// Account this connector syncs.
    account_id: AccountId,
    /// Server coordinates and login credentials.
    credentials: ImapCredentials,
    /// Sync behavior configuration.
    settings: SyncSettings,
    /// IMAP session (present when connected).
    session: Option<Arc<Mutex<ImapSession>>>,
    /// Whether a session is established.
    connected: bool,
    /// Capabilities reported by the server at connect time.
    capabilities: Option<ImapCapabilities>,
    /// Result of the most recent sync run, written when its stream drains.
    last_result: Arc<Mutex<Option<SyncResult>>>,
}

impl ImapConnector {
    /// Creates a connector for the given account.
    ///
    /// No network activity happens until [`connect`](EmailConnector::connect).
    pub fn new(account_id: AccountId, credentials: ImapCredentials, settings: SyncSettings) -> Self {
        Self {
            account_id,
            credentials,
            settings,
            session: None,
            connected: false,
            capabilities: None,
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns whether a session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns capabilities detected at connect time, if connected.
    pub fn capabilities(&self) -> Option<ImapCapabilities> {
        self.capabilities
    }

    /// Establishes the TLS stream, wrapped for futures-io compatibility.
    async fn connect_tls(&self) -> Result<Compat<TlsStream<TcpStream>>> {
        let tcp_stream =
            TcpStream::connect((self.credentials.host.as_str(), self.credentials.port))
                .await
                .map_err(|e| ConnectorError::Connection(format!("TCP connect failed: {}", e)))?;

        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.credentials.host.clone())
            .map_err(|e| ConnectorError::Connection(format!("invalid server name: {}", e)))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ConnectorError::Connection(format!("TLS handshake failed: {}", e)))?;

        Ok(tls_stream.compat())
    }

    /// Returns the live session or an error when not connected.
    fn session(&self) -> Result<Arc<Mutex<ImapSession>>> {
        self.session
            .clone()
            .ok_or_else(|| ConnectorError::Connection("not connected".to_string()))
    }

    /// Consumes a response stream to completion, discarding items.
    async fn drain_stream<T, E>(
        stream: impl futures::Stream<Item = std::result::Result<T, E>>,
    ) -> std::result::Result<(), E> {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            item?;
        }
        Ok(())
    }

    /// Queries server capabilities and reports the sync-relevant subset.
    pub async fn check_capabilities(&mut self) -> Result<ImapCapabilities> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let caps = session
            .capabilities()
            .await
            .map_err(|e| ConnectorError::Sync(format!("CAPABILITY failed: {}", e)))?;

        let detected = ImapCapabilities {
            condstore: caps.has_str("CONDSTORE"),
            qresync: caps.has_str("QRESYNC"),
            idle: caps.has_str("IDLE"),
            uidplus: caps.has_str("UIDPLUS"),
            move_supported: caps.has_str("MOVE"),
            compress_deflate: caps.has_str("COMPRESS=DEFLATE"),
        };

        self.capabilities = Some(detected);
        Ok(detected)
    }

    /// Probes a folder's sync counters.
    ///
    /// SELECTs the folder (capturing EXISTS), issues `STATUS` for
    /// UIDVALIDITY/UIDNEXT/MESSAGES/RECENT, then opportunistically asks for
    /// HIGHESTMODSEQ; a server without CONDSTORE simply leaves it `None`.
    pub async fn get_folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);

        let mailbox = session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        let mut status = FolderStatus {
            folder: folder.to_string(),
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
            exists: mailbox.exists,
            messages: None,
            recent: None,
            highest_mod_seq: mailbox.highest_modseq,
        };

        let probed = session
            .status(&quoted, "(UIDVALIDITY UIDNEXT MESSAGES RECENT)")
            .await
            .map_err(|e| ConnectorError::Sync(format!("STATUS {} failed: {}", folder, e)))?;

        if let Some(v) = probed.uid_validity {
            status.uid_validity = Some(v);
        }
        if let Some(v) = probed.uid_next {
            status.uid_next = Some(v);
        }
        status.messages = Some(probed.exists);
        status.recent = Some(probed.recent);

        if status.highest_mod_seq.is_none() {
            // Optional probe: absence means no CONDSTORE, not an error.
            if let Ok(probed) = session.status(&quoted, "(HIGHESTMODSEQ)").await {
                status.highest_mod_seq = probed.highest_modseq;
            }
        }

        tracing::debug!(
            account_id = %self.account_id,
            folder = %folder,
            uid_validity = ?status.uid_validity,
            uid_next = ?status.uid_next,
            exists = status.exists,
            "folder status probed"
        );

        Ok(status)
    }

    /// Searches for UIDs above a checkpoint: `UID SEARCH UID <last+1>:*`.
    ///
    /// Returns an ascending list. RFC 3501 makes `n:*` match the last
    /// message even when `n` exceeds every UID, so results are filtered to
    /// `uid > last_uid` to avoid re-yielding the checkpoint message.
    pub async fn fetch_uids_in_range(&mut self, folder: &str, last_uid: u32) -> Result<Vec<u32>> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);
        session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        let query = format!("UID {}:*", last_uid.saturating_add(1));
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| ConnectorError::Sync(format!("UID SEARCH failed: {}", e)))?;

        let mut uid_list: Vec<u32> = uids.into_iter().filter(|&uid| uid > last_uid).collect();
        uid_list.sort_unstable();
        Ok(uid_list)
    }

    /// Searches for UIDs of messages received since a date.
    ///
    /// Used when no UID checkpoint exists. Returns an ascending list.
    pub async fn fetch_uids_since_date(
        &mut self,
        folder: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<u32>> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);
        session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        let query = format!("SINCE {}", format_imap_date(since));
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| ConnectorError::Sync(format!("UID SEARCH failed: {}", e)))?;

        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();
        Ok(uid_list)
    }

    /// Fetches a single message by UID with peek-only semantics.
    pub async fn fetch_email_by_uid(&mut self, folder: &str, uid: u32) -> Result<EmailMessage> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);
        let mailbox = session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        fetch_message(
            &mut session,
            &self.account_id,
            folder,
            uid,
            mailbox.uid_validity,
            &self.settings,
        )
        .await?
        .ok_or_else(|| ConnectorError::Sync(format!("message {}:{} not found", folder, uid)))
    }

    /// Parses a mail_parser address into the domain type.
    fn parse_address(addr: &Addr) -> EmailAddress {
        EmailAddress {
            email: addr.address().unwrap_or("").to_string(),
            name: addr.name().map(|s| s.to_string()),
        }
    }

    fn extract_addresses(
        list: Option<&mail_parser::Address<'_>>,
    ) -> Vec<EmailAddress> {
        list.and_then(|addr| addr.as_list())
            .map(|addrs| addrs.iter().map(Self::parse_address).collect())
            .unwrap_or_default()
    }
}

/// Parses a FETCH response's FLAGS into the five RFC 3501 flags.
///
/// Absence of a flag token means `false`, never unknown.
fn parse_flags(fetch: &Fetch) -> MessageFlags {
    let mut flags = MessageFlags::default();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => flags.seen = true,
            Flag::Flagged => flags.flagged = true,
            Flag::Deleted => flags.deleted = true,
            Flag::Draft => flags.draft = true,
            Flag::Answered => flags.answered = true,
            _ => {}
        }
    }
    flags
}

/// Catalogues attachment metadata from a parsed message.
///
/// Bytes are not materialized; `data` stays `None` until an explicit
/// download. Attachments above the configured size cap are skipped with a
/// warning.
fn catalogue_attachments(message: &ParsedMessage, settings: &SyncSettings) -> Vec<EmailAttachment> {
    if !settings.sync_attachments {
        return Vec::new();
    }

    let max_bytes = settings.max_attachment_size_mb as u64 * 1024 * 1024;
    let mut attachments = Vec::new();

    for (index, part) in message.attachments().enumerate() {
        let size = part.contents().len() as u64;
        let filename = part
            .attachment_name()
            .unwrap_or("unnamed")
            .to_string();

        if size > max_bytes {
            tracing::warn!(
                filename = %filename,
                size,
                max_bytes,
                "attachment exceeds configured size cap, skipping"
            );
            continue;
        }

        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let is_inline = part
            .content_disposition()
            .map(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
            .unwrap_or(false);

        attachments.push(EmailAttachment {
            id: index.to_string(),
            filename,
            content_type,
            size: Some(size),
            is_inline,
            data: None,
        });
    }

    attachments
}

/// Converts one FETCH response into an [`EmailMessage`].
///
/// Returns `None` when the response lacks a body or the body fails to
/// parse; per-message failures are skipped, never fatal.
fn parse_fetch(
    fetch: &Fetch,
    account_id: &AccountId,
    folder: &str,
    uid_validity: Option<u32>,
    settings: &SyncSettings,
) -> Option<EmailMessage> {
    let uid = fetch.uid?;
    let body_data = fetch.body()?;

    let message = MessageParser::default().parse(body_data)?;
    let flags = parse_flags(fetch);

    let from = ImapConnector::extract_addresses(message.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown"));
    let to = ImapConnector::extract_addresses(message.to());
    let cc = ImapConnector::extract_addresses(message.cc());
    let bcc = ImapConnector::extract_addresses(message.bcc());

    let subject = message.subject().map(|s| s.to_string());

    let sent_at = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
    let received_at = fetch.internal_date().map(|d| d.with_timezone(&Utc));

    let body_text = message.body_text(0).map(|s| s.to_string());
    let body_html = message.body_html(0).map(|s| s.to_string());

    let snippet: String = body_text
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(200)
        .collect();

    let attachments = catalogue_attachments(&message, settings);

    let mut provider_data = HashMap::new();
    if let Some(message_id) = message.message_id() {
        provider_data.insert(
            "message_id_header".to_string(),
            serde_json::Value::String(message_id.to_string()),
        );
    }

    Some(EmailMessage {
        id: format!("{}:{}", folder, uid),
        account_id: account_id.clone(),
        thread_id: None,
        subject,
        from,
        to,
        cc,
        bcc,
        body_text,
        body_html,
        snippet,
        sent_at,
        received_at,
        folder: folder.to_string(),
        labels: vec![folder.to_string()],
        attachments,
        flags,
        size: fetch.size,
        provider_data,
        imap_uid: Some(uid),
        uid_validity,
    })
}

/// Fetches and parses one UID from the currently selected folder.
///
/// `Err` means the FETCH round trip itself failed (connection-level);
/// `Ok(None)` means the response could not be parsed (skip the message).
async fn fetch_message(
    session: &mut ImapSession,
    account_id: &AccountId,
    folder: &str,
    uid: u32,
    uid_validity: Option<u32>,
    settings: &SyncSettings,
) -> Result<Option<EmailMessage>> {
    let fetches = session
        .uid_fetch(uid.to_string(), FETCH_ITEMS)
        .await
        .map_err(|e| ConnectorError::Sync(format!("UID FETCH {} failed: {}", uid, e)))?;

    futures::pin_mut!(fetches);
    while let Some(fetch_result) = fetches.next().await {
        let fetch = match fetch_result {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(folder = %folder, uid, error = %e, "fetch item error, skipping");
                continue;
            }
        };
        if let Some(message) = parse_fetch(&fetch, account_id, folder, uid_validity, settings) {
            return Ok(Some(message));
        }
    }

    Ok(None)
}

#[async_trait]
impl EmailConnector for ImapConnector {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Imap
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    async fn connect(&mut self) -> Result<()> {
        // A prior failed attempt may have left a half-open session; discard
        // it so connect stays idempotent-safe.
        if self.session.is_some() {
            self.disconnect().await;
        }

        let tls_stream = self.connect_tls().await?;
        let client = async_imap::Client::new(tls_stream);

        let session = client
            .login(&self.credentials.username, &self.credentials.password)
            .await
            .map_err(|e| {
                ConnectorError::Authentication(format!("IMAP login failed: {:?}", e.0))
            })?;

        self.session = Some(Arc::new(Mutex::new(session)));
        self.check_capabilities().await?;
        self.connected = true;

        tracing::info!(
            account_id = %self.account_id,
            host = %self.credentials.host,
            capabilities = ?self.capabilities,
            "IMAP connector authenticated"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let mut session = session.lock().await;
            if let Err(e) = session.logout().await {
                tracing::debug!(account_id = %self.account_id, error = %e, "LOGOUT failed, dropping session");
            }
        }
        self.connected = false;
        self.capabilities = None;
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let session = self.session()?;
        let mut session = session.lock().await;
        session
            .noop()
            .await
            .map_err(|e| ConnectorError::Connection(format!("NOOP failed: {}", e)))?;
        Ok(true)
    }

    async fn get_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let session = self.session()?;
        let mut session = session.lock().await;

        let names = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| ConnectorError::Sync(format!("LIST failed: {}", e)))?;

        futures::pin_mut!(names);
        let mut folders = Vec::new();
        while let Some(name_result) = names.next().await {
            let name = match name_result {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "LIST item error, skipping");
                    continue;
                }
            };
            let path = name.name().to_string();
            let is_system = matches!(
                path.to_uppercase().as_str(),
                "INBOX" | "SENT" | "DRAFTS" | "TRASH" | "SPAM" | "JUNK" | "ARCHIVE"
            );
            folders.push(FolderInfo {
                display_name: path.clone(),
                name: path,
                delimiter: name.delimiter().map(|d| d.to_string()),
                is_system,
            });
        }

        Ok(folders)
    }

    async fn sync_emails(
        &mut self,
        sync_type: SyncType,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<EmailStream> {
        let session = self.session()?;
        let settings = self.settings.clone();
        let account_id = self.account_id.clone();
        let last_result = Arc::clone(&self.last_result);

        let stream = async_stream::stream! {
            let mut result = SyncResult::start(sync_type);
            let mut remaining = settings.max_emails_limit;
            let mut session = session.lock().await;

            for (folder_idx, folder) in settings.folders_to_sync.iter().enumerate() {
                if remaining == Some(0) {
                    // The cap ran out with folders still configured; that is
                    // truncation too and must be visible in the warnings.
                    let skipped = &settings.folders_to_sync[folder_idx..];
                    result.record_skipped_folders(skipped);
                    tracing::warn!(
                        account_id = %account_id,
                        skipped = ?skipped,
                        "max_emails_limit exhausted, remaining folders skipped"
                    );
                    break;
                }

                let quoted = quote_folder_name(folder);
                let mailbox = match session.select(&quoted).await {
                    Ok(m) => m,
                    Err(e) => {
                        let err = ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e));
                        result.fail(err.to_string());
                        *last_result.lock().await = Some(result);
                        yield Err(err);
                        return;
                    }
                };
                result.validation.total_emails_in_mailbox += mailbox.exists as u64;
                let uid_validity = mailbox.uid_validity;

                let criteria =
                    build_search_criteria(sync_type, last_sync_time, settings.sync_days_back);
                let uids = match session.uid_search(&criteria).await {
                    Ok(u) => u,
                    Err(e) => {
                        let err = ConnectorError::Sync(format!(
                            "UID SEARCH {} failed in {}: {}",
                            criteria, folder, e
                        ));
                        result.fail(err.to_string());
                        *last_result.lock().await = Some(result);
                        yield Err(err);
                        return;
                    }
                };

                let found = uids.len();
                let uid_list = plan_fetch_order(uids, remaining);
                let to_process = uid_list.len();
                result.record_truncation(folder, found as u64, to_process as u64);
                if let Some(n) = remaining.as_mut() {
                    *n -= to_process;
                }

                tracing::info!(
                    account_id = %account_id,
                    folder = %folder,
                    criteria = %criteria,
                    found,
                    to_process,
                    "syncing folder"
                );

                let mut processed_uids: Vec<u32> = Vec::with_capacity(to_process);
                for chunk in uid_list.chunks(settings.max_emails_per_batch.max(1)) {
                    for &uid in chunk {
                        match fetch_message(
                            &mut session,
                            &account_id,
                            folder,
                            uid,
                            uid_validity,
                            &settings,
                        )
                        .await
                        {
                            Ok(Some(message)) => {
                                result.emails_processed += 1;
                                result.emails_added += 1;
                                result.attachments_catalogued +=
                                    message.attachments.len() as u64;
                                processed_uids.push(uid);
                                yield Ok(message);
                            }
                            Ok(None) => {
                                tracing::warn!(
                                    account_id = %account_id,
                                    folder = %folder,
                                    uid,
                                    "unparseable message, skipping"
                                );
                                result.emails_skipped += 1;
                            }
                            Err(e) => {
                                // Session-level failure: the remaining batch
                                // cannot be fetched. The caller resumes from
                                // its last successful checkpoint.
                                result.fail(e.to_string());
                                result.validation.detected_gaps
                                    .extend(detect_gaps(&processed_uids));
                                *last_result.lock().await = Some(result);
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    if settings.rate_limit_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(settings.rate_limit_delay_ms))
                            .await;
                    }
                }
                result.validation.detected_gaps.extend(detect_gaps(&processed_uids));
            }

            result.complete();
            tracing::info!(
                account_id = %account_id,
                processed = result.emails_processed,
                skipped = result.emails_skipped,
                missing = result.validation.emails_missing_due_to_limits,
                "sync run complete"
            );
            *last_result.lock().await = Some(result);
        };

        Ok(Box::pin(stream))
    }

    async fn get_email_by_id(&mut self, message_id: &str) -> Result<EmailMessage> {
        let (folder, uid) = parse_message_id(message_id)?;
        let folder = folder.to_string();
        self.fetch_email_by_uid(&folder, uid).await
    }

    async fn download_attachment(
        &mut self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<EmailAttachment> {
        let (folder, uid) = parse_message_id(message_id)?;
        let part_index: usize = attachment_id
            .parse()
            .map_err(|_| ConnectorError::Sync(format!("invalid attachment id: {}", attachment_id)))?;

        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);
        session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        let fetches = session
            .uid_fetch(uid.to_string(), FETCH_ITEMS)
            .await
            .map_err(|e| ConnectorError::Sync(format!("UID FETCH {} failed: {}", uid, e)))?;

        futures::pin_mut!(fetches);
        while let Some(fetch_result) = fetches.next().await {
            let fetch = fetch_result
                .map_err(|e| ConnectorError::Sync(format!("FETCH stream error: {}", e)))?;
            let Some(body) = fetch.body() else { continue };
            let Some(message) = MessageParser::default().parse(body) else {
                continue;
            };

            let part = message.attachments().nth(part_index).ok_or_else(|| {
                ConnectorError::Sync(format!(
                    "attachment {} not found on message {}",
                    attachment_id, message_id
                ))
            })?;

            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            return Ok(EmailAttachment {
                id: attachment_id.to_string(),
                filename: part.attachment_name().unwrap_or("unnamed").to_string(),
                content_type,
                size: Some(part.contents().len() as u64),
                is_inline: part
                    .content_disposition()
                    .map(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
                    .unwrap_or(false),
                data: Some(part.contents().to_vec()),
            });
        }

        Err(ConnectorError::Sync(format!(
            "message {} not found",
            message_id
        )))
    }

    async fn mark_as_read(&mut self, message_id: &str) -> Result<()> {
        let (folder, uid) = parse_message_id(message_id)?;

        let session = self.session()?;
        let mut session = session.lock().await;

        let quoted = quote_folder_name(folder);
        session
            .select(&quoted)
            .await
            .map_err(|e| ConnectorError::Sync(format!("SELECT {} failed: {}", folder, e)))?;

        let store_stream = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| ConnectorError::Sync(format!("STORE failed: {}", e)))?;
        Self::drain_stream(store_stream)
            .await
            .map_err(|e| ConnectorError::Sync(format!("STORE stream: {}", e)))?;

        tracing::debug!(account_id = %self.account_id, message_id = %message_id, "marked as read");
        Ok(())
    }

    async fn get_sync_status(&self) -> ConnectorStatus {
        ConnectorStatus {
            provider: ProviderType::Imap,
            account_id: self.account_id.clone(),
            connected: self.connected,
            last_sync: self.last_result.lock().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_credentials() -> ImapCredentials {
        ImapCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn quote_plain_name_unchanged() {
        assert_eq!(quote_folder_name("INBOX"), "INBOX");
        assert_eq!(quote_folder_name("Archive/2024"), "Archive/2024");
    }

    #[test]
    fn quote_name_with_space() {
        assert_eq!(quote_folder_name("Sent Items"), "\"Sent Items\"");
    }

    #[test]
    fn quote_name_with_quote_and_backslash() {
        assert_eq!(quote_folder_name("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_folder_name("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn quote_already_quoted_not_doubled() {
        assert_eq!(quote_folder_name("\"Sent Items\""), "\"Sent Items\"");
    }

    #[test]
    fn quote_wildcard_names() {
        assert_eq!(quote_folder_name("a*b"), "\"a*b\"");
        assert_eq!(quote_folder_name("a%b"), "\"a%b\"");
    }

    #[test]
    fn search_criteria_full_is_all() {
        // Full sync ignores both the timestamp and the lookback window.
        let criteria = build_search_criteria(SyncType::Full, Some(Utc::now()), Some(7));
        assert_eq!(criteria, "ALL");
    }

    #[test]
    fn search_criteria_incremental_uses_last_sync() {
        let since = DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let criteria = build_search_criteria(SyncType::Incremental, Some(since), Some(30));
        assert_eq!(criteria, "SINCE 5-Mar-2024");
    }

    #[test]
    fn search_criteria_none_lookback_means_unlimited() {
        let criteria = build_search_criteria(SyncType::Incremental, None, None);
        assert_eq!(criteria, "ALL");
    }

    #[test]
    fn search_criteria_zero_lookback_means_today() {
        let criteria = build_search_criteria(SyncType::Incremental, None, Some(0));
        let expected = format!("SINCE {}", format_imap_date(Utc::now()));
        assert_eq!(criteria, expected);
    }

    #[test]
    fn status_fields_parse_full_response() {
        let response =
            "* STATUS \"INBOX\" (MESSAGES 231 UIDNEXT 44292 UIDVALIDITY 857529045 RECENT 1)\r\nA2 OK STATUS completed\r\n";
        let fields = parse_status_fields(response);
        assert_eq!(fields.get("MESSAGES"), Some(&231));
        assert_eq!(fields.get("UIDNEXT"), Some(&44292));
        assert_eq!(fields.get("UIDVALIDITY"), Some(&857529045));
        assert_eq!(fields.get("RECENT"), Some(&1));
    }

    #[test]
    fn status_fields_parse_highestmodseq() {
        let response = "* STATUS \"Sent Items\" (HIGHESTMODSEQ 715162338)\r\n";
        let fields = parse_status_fields(response);
        assert_eq!(fields.get("HIGHESTMODSEQ"), Some(&715162338));
    }

    #[test]
    fn status_fields_empty_on_garbage() {
        assert!(parse_status_fields("A2 NO STATUS failed").is_empty());
        assert!(parse_status_fields("").is_empty());
    }

    #[test]
    fn fetch_order_newest_first_with_cap() {
        // A capped run keeps the newest messages and drops the oldest.
        assert_eq!(plan_fetch_order([1, 2, 3, 4, 5], Some(3)), vec![5, 4, 3]);
    }

    #[test]
    fn fetch_order_cap_larger_than_list() {
        assert_eq!(plan_fetch_order([2, 9, 4], Some(10)), vec![9, 4, 2]);
    }

    #[test]
    fn fetch_order_uncapped_reverses_everything() {
        assert_eq!(plan_fetch_order([3, 1, 2], None), vec![3, 2, 1]);
    }

    #[test]
    fn fetch_order_empty_input() {
        assert!(plan_fetch_order(Vec::new(), Some(3)).is_empty());
    }

    #[test]
    fn message_id_round_trip() {
        let (folder, uid) = parse_message_id("INBOX:42").unwrap();
        assert_eq!(folder, "INBOX");
        assert_eq!(uid, 42);
    }

    #[test]
    fn message_id_folder_with_colon() {
        let (folder, uid) = parse_message_id("Archive:2024:17").unwrap();
        assert_eq!(folder, "Archive:2024");
        assert_eq!(uid, 17);
    }

    #[test]
    fn message_id_rejects_malformed() {
        assert!(parse_message_id("no-uid").is_err());
        assert!(parse_message_id("INBOX:notanumber").is_err());
    }

    #[test]
    fn imap_date_format() {
        let date = DateTime::parse_from_rfc3339("2024-01-09T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_imap_date(date), "9-Jan-2024");
    }

    #[test]
    fn connector_starts_disconnected() {
        let connector = ImapConnector::new(
            AccountId::from("acct-1"),
            test_credentials(),
            SyncSettings::default(),
        );
        assert!(!connector.is_connected());
        assert!(connector.capabilities().is_none());
        assert_eq!(connector.provider_type(), ProviderType::Imap);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let mut connector = ImapConnector::new(
            AccountId::from("acct-1"),
            test_credentials(),
            SyncSettings::default(),
        );

        assert!(matches!(
            connector.get_folders().await,
            Err(ConnectorError::Connection(_))
        ));
        assert!(matches!(
            connector.sync_emails(SyncType::Full, None).await,
            Err(ConnectorError::Connection(_))
        ));
        assert!(matches!(
            connector.mark_as_read("INBOX:1").await,
            Err(ConnectorError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn failed_connect_leaves_disconnected() {
        // The hostname cannot resolve, so connect fails before any IMAP
        // exchange; the connector must not report itself connected.
        let mut connector = ImapConnector::new(
            AccountId::from("acct-1"),
            ImapCredentials {
                host: "not a valid hostname".to_string(),
                port: 993,
                username: "user@example.com".to_string(),
                password: "hunter2".to_string(),
            },
            SyncSettings::default(),
        );

        assert!(connector.connect().await.is_err());
        assert!(!connector.is_connected());
        assert!(connector.capabilities().is_none());
    }

    #[tokio::test]
    async fn status_reports_disconnected() {
        let connector = ImapConnector::new(
            AccountId::from("acct-1"),
            test_credentials(),
            SyncSettings::default(),
        );
        let status = connector.get_sync_status().await;
        assert!(!status.connected);
        assert!(status.last_sync.is_none());
        assert_eq!(status.provider, ProviderType::Imap);
    }
}
