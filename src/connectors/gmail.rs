//! Gmail connector implementation.
//!
//! This module provides an [`EmailConnector`] implementation using the Gmail
//! REST API v1 with OAuth 2.0 refresh-token authentication.
//!
//! # Token lifecycle
//!
//! Access tokens are refreshed proactively: a token within five minutes of
//! expiry is treated as already expired, so long-running sync streams never
//! race the expiry mid-request. The refreshed token is shared through an
//! `Arc<RwLock<_>>` so the sync stream and the connector see the same state.
//!
//! # API usage
//!
//! - `users.messages.list` with `q` search and `pageToken` paging
//! - `users.messages.get` (`format=full`) for message content
//! - `users.messages.attachments.get` for attachment bytes
//! - `users.messages.modify` for label changes
//! - `users.labels.list` for folders
//! - `users.getProfile` as the liveness probe

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::{ConnectorError, ConnectorStatus, EmailConnector, EmailStream, Result};
use crate::config::{OAuth2Credentials, SyncSettings};
use crate::domain::{
    AccountId, EmailAddress, EmailAttachment, EmailMessage, FolderInfo, MessageFlags, ProviderType,
};
use crate::sync::{SyncResult, SyncType};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// A token expiring within this margin is refreshed before use.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Backoff before the single retry of a 429 response.
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Gmail message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
    result_size_estimate: Option<u64>,
}

/// Minimal message reference from a list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    #[allow(dead_code)]
    thread_id: Option<String>,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<GmailPayload>,
    internal_date: Option<String>,
    size_estimate: Option<u32>,
    history_id: Option<String>,
}

/// Gmail message payload (headers and body parts).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPayload {
    headers: Option<Vec<GmailHeader>>,
    parts: Option<Vec<GmailPart>>,
    body: Option<GmailBody>,
    mime_type: Option<String>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message part (for multipart messages).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    size: Option<u64>,
    attachment_id: Option<String>,
}

/// Gmail API label.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

/// Gmail labels list response.
#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    labels: Option<Vec<GmailLabel>>,
}

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: Option<String>,
    messages_total: Option<u64>,
    #[allow(dead_code)]
    history_id: Option<String>,
}

/// Attachment bytes response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentResponse {
    size: Option<u64>,
    data: Option<String>,
}

/// Gmail modify request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    add_label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_label_ids: Vec<String>,
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// Shared access-token state.
///
/// Refreshed tokens must be visible to an in-flight sync stream, so this
/// lives behind `Arc<RwLock<_>>` rather than on the connector directly.
#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    /// Whether the token must be refreshed before use.
    ///
    /// `None` expiry means the lifetime is unknown and forces a refresh.
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                (expires_at - now).num_seconds() <= TOKEN_REFRESH_MARGIN_SECS
            }
            None => true,
        }
    }
}

/// Builds the Gmail search query for a sync run.
///
/// Spam and trash are excluded with `-in:` clauses unless the settings opt
/// in. Full syncs carry no date clause; incremental syncs anchor on the
/// last sync time, falling back to the configured lookback window. A `None`
/// window means unlimited history, `Some(0)` means "since today".
fn build_search_query(
    sync_type: SyncType,
    last_sync_time: Option<DateTime<Utc>>,
    settings: &SyncSettings,
) -> String {
    let mut clauses: Vec<String> = Vec::new();

    let date_clause = match sync_type {
        SyncType::Full => None,
        SyncType::Incremental | SyncType::Manual => match last_sync_time {
            Some(since) => Some(format!("after:{}", since.format("%Y/%m/%d"))),
            None => settings.sync_days_back.map(|days| {
                let since = Utc::now() - chrono::Duration::days(days);
                format!("after:{}", since.format("%Y/%m/%d"))
            }),
        },
    };
    if let Some(clause) = date_clause {
        clauses.push(clause);
    }

    if !settings.include_spam {
        clauses.push("-in:spam".to_string());
    }
    if !settings.include_trash {
        clauses.push("-in:trash".to_string());
    }

    clauses.join(" ")
}

/// Refreshes the access token when it is expired or within the margin.
///
/// Free function (not a method) so the sync stream can call it without
/// holding `&mut self`. Returns the token to use.
async fn ensure_fresh_token(
    client: &reqwest::Client,
    credentials: &OAuth2Credentials,
    token_state: &Arc<RwLock<TokenState>>,
) -> Result<String> {
    {
        let state = token_state.read().await;
        if !state.needs_refresh(Utc::now()) {
            return Ok(state.access_token.clone());
        }
    }

    let mut state = token_state.write().await;
    // Another task may have refreshed while we waited for the write lock.
    if !state.needs_refresh(Utc::now()) {
        return Ok(state.access_token.clone());
    }

    let params = [
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("refresh_token", credentials.refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];

    let response = client
        .post(GOOGLE_TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectorError::Authentication(format!(
            "token refresh failed ({}): {}",
            status, body
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| ConnectorError::Sync(format!("parse token response: {}", e)))?;

    state.access_token = token.access_token.clone();
    state.expires_at = Some(Utc::now() + chrono::Duration::seconds(token.expires_in));

    tracing::debug!(expires_in = token.expires_in, "access token refreshed");
    Ok(token.access_token)
}

/// Reconciles Gmail's `resultSizeEstimate` with the collected ID count.
///
/// The estimate is documented as approximate and can overstate. Once paging
/// ran to completion the collected count is exact; the estimate is trusted
/// only when the message cap stopped paging early, where the collected
/// count is a known undercount.
fn reconcile_found(estimate: u64, collected: usize, paging_stopped_early: bool) -> u64 {
    if paging_stopped_early {
        estimate.max(collected as u64)
    } else {
        collected as u64
    }
}

/// Maps an error response to the connector error taxonomy.
async fn handle_error(response: reqwest::Response) -> ConnectorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ConnectorError::Authentication(format!("gmail API rejected token ({}): {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            ConnectorError::Sync(format!("gmail API rate limited: {}", body))
        }
        _ => ConnectorError::Sync(format!("gmail API error ({}): {}", status, body)),
    }
}

/// Authenticated GET with a single retry on 429.
async fn api_get<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    credentials: &OAuth2Credentials,
    token_state: &Arc<RwLock<TokenState>>,
    url: &str,
) -> Result<T> {
    let mut retried = false;
    loop {
        let token = ensure_fresh_token(client, credentials, token_state).await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectorError::Config(format!("invalid token header: {}", e)))?,
        );

        let response = client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS && !retried {
            retried = true;
            tracing::warn!(url = %url, "gmail API rate limited, retrying once");
            tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
            continue;
        }
        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }
        return response
            .json()
            .await
            .map_err(|e| ConnectorError::Sync(format!("parse response: {}", e)));
    }
}

/// Authenticated POST with a JSON body, discarding the response body.
async fn api_post<B: Serialize>(
    client: &reqwest::Client,
    credentials: &OAuth2Credentials,
    token_state: &Arc<RwLock<TokenState>>,
    url: &str,
    body: &B,
) -> Result<()> {
    let token = ensure_fresh_token(client, credentials, token_state).await?;

    let response = client
        .post(url)
        .bearer_auth(token)
        .json(body)
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;

    if !response.status().is_success() {
        return Err(handle_error(response).await);
    }
    Ok(())
}

/// Parses an address from a header value like `Name <email@example.com>`.
fn parse_address(value: &str) -> EmailAddress {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        if let Some(end) = value.find('>') {
            let email = value[start + 1..end].trim().to_string();
            let name = value[..start].trim().trim_matches('"').to_string();
            return EmailAddress {
                email,
                name: if name.is_empty() { None } else { Some(name) },
            };
        }
    }
    EmailAddress::new(value)
}

/// Parses multiple addresses from a comma-separated header value.
fn parse_addresses(value: &str) -> Vec<EmailAddress> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_address(s.trim()))
        .collect()
}

/// Decodes a base64url body data field.
fn decode_body(data: &str) -> Option<String> {
    BASE64_URL_SAFE_NO_PAD
        .decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Recursively extracts text/html bodies from a part tree.
///
/// First match per content type wins; later alternatives are ignored.
fn extract_body_from_parts(
    parts: &[GmailPart],
    text: &mut Option<String>,
    html: &mut Option<String>,
) {
    for part in parts {
        let mime = part.mime_type.as_deref().unwrap_or("");

        if mime == "text/plain" && text.is_none() {
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
                *text = decode_body(data);
            }
        } else if mime == "text/html" && html.is_none() {
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
                *html = decode_body(data);
            }
        }

        if let Some(nested) = &part.parts {
            extract_body_from_parts(nested, text, html);
        }
    }
}

/// Extracts the text and HTML bodies from a message payload.
fn extract_body(payload: &GmailPayload) -> (Option<String>, Option<String>) {
    let mut text = None;
    let mut html = None;

    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        match payload.mime_type.as_deref() {
            Some("text/html") => html = decode_body(data),
            _ => text = decode_body(data),
        }
    }

    if let Some(parts) = &payload.parts {
        extract_body_from_parts(parts, &mut text, &mut html);
    }

    (text, html)
}

/// Recursively catalogues attachment metadata from a part tree.
///
/// A part with a non-empty filename is an attachment; bytes stay on the
/// server until an explicit download. Parts above the configured size cap
/// are skipped with a warning.
fn catalogue_attachments(
    parts: &[GmailPart],
    settings: &SyncSettings,
    out: &mut Vec<EmailAttachment>,
) {
    let max_bytes = settings.max_attachment_size_mb as u64 * 1024 * 1024;

    for part in parts {
        if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty()) {
            let size = part.body.as_ref().and_then(|b| b.size);
            if let Some(size) = size {
                if size > max_bytes {
                    tracing::warn!(
                        filename = %filename,
                        size,
                        max_bytes,
                        "attachment exceeds configured size cap, skipping"
                    );
                    continue;
                }
            }

            let is_inline = part
                .headers
                .as_ref()
                .and_then(|headers| {
                    headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("Content-Disposition"))
                })
                .map(|h| h.value.trim_start().to_ascii_lowercase().starts_with("inline"))
                .unwrap_or(false);

            if let Some(attachment_id) = part.body.as_ref().and_then(|b| b.attachment_id.clone()) {
                out.push(EmailAttachment {
                    id: attachment_id,
                    filename: filename.to_string(),
                    content_type: part
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size,
                    is_inline,
                    data: None,
                });
            }
        }

        if let Some(nested) = &part.parts {
            catalogue_attachments(nested, settings, out);
        }
    }
}

/// Converts label IDs to message flags.
///
/// Gmail has no reply tracking on the message resource, so `answered`
/// stays false.
fn flags_from_labels(label_ids: &[String]) -> MessageFlags {
    MessageFlags {
        seen: !label_ids.iter().any(|l| l == "UNREAD"),
        flagged: label_ids.iter().any(|l| l == "STARRED"),
        deleted: label_ids.iter().any(|l| l == "TRASH"),
        draft: label_ids.iter().any(|l| l == "DRAFT"),
        answered: false,
    }
}

/// Converts a full Gmail message resource to the domain type.
fn convert_message(
    msg: &GmailMessage,
    account_id: &AccountId,
    settings: &SyncSettings,
) -> EmailMessage {
    let payload = msg.payload.as_ref();
    let headers = payload.and_then(|p| p.headers.as_ref());

    let get_header = |name: &str| -> Option<String> {
        headers.and_then(|h| {
            h.iter()
                .find(|hdr| hdr.name.eq_ignore_ascii_case(name))
                .map(|hdr| hdr.value.clone())
        })
    };

    let from = get_header("From")
        .map(|v| parse_address(&v))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown"));
    let to = get_header("To").map(|v| parse_addresses(&v)).unwrap_or_default();
    let cc = get_header("Cc").map(|v| parse_addresses(&v)).unwrap_or_default();
    let bcc = get_header("Bcc").map(|v| parse_addresses(&v)).unwrap_or_default();
    let subject = get_header("Subject");

    let internal_date = msg
        .internal_date
        .as_ref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis);
    let sent_at = get_header("Date")
        .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
        .map(|d| d.with_timezone(&Utc))
        .or(internal_date);

    let label_ids = msg.label_ids.clone().unwrap_or_default();
    let flags = flags_from_labels(&label_ids);

    let folder = if label_ids.iter().any(|l| l == "INBOX") {
        "INBOX".to_string()
    } else {
        label_ids
            .iter()
            .find(|l| !l.starts_with("CATEGORY_"))
            .cloned()
            .unwrap_or_else(|| "ARCHIVE".to_string())
    };

    let (body_text, body_html) = payload.map(extract_body).unwrap_or((None, None));

    let mut attachments = Vec::new();
    if settings.sync_attachments {
        if let Some(parts) = payload.and_then(|p| p.parts.as_ref()) {
            catalogue_attachments(parts, settings, &mut attachments);
        }
    }

    let mut provider_data = HashMap::new();
    if let Some(history_id) = &msg.history_id {
        provider_data.insert(
            "history_id".to_string(),
            serde_json::Value::String(history_id.clone()),
        );
    }
    if let Some(message_id) = get_header("Message-ID") {
        provider_data.insert(
            "message_id_header".to_string(),
            serde_json::Value::String(message_id),
        );
    }

    EmailMessage {
        id: msg.id.clone(),
        account_id: account_id.clone(),
        thread_id: msg.thread_id.clone(),
        subject,
        from,
        to,
        cc,
        bcc,
        body_text,
        body_html,
        snippet: msg.snippet.clone().unwrap_or_default(),
        sent_at,
        received_at: internal_date,
        folder,
        labels: label_ids,
        attachments,
        flags,
        size: msg.size_estimate,
        provider_data,
        imap_uid: None,
        uid_validity: None,
    }
}

/// Gmail email connector.
pub struct GmailConnector {
    /// Account this connector syncs.
    account_id: AccountId,
    /// OAuth credentials.
    credentials: OAuth2Credentials,
    /// Sync behavior configuration.
    settings: SyncSettings,
    /// HTTP client for API requests.
    client: reqwest::Client,
    /// Shared access-token state.
    token_state: Arc<RwLock<TokenState>>,
    /// Whether the connector has verified its credentials.
    connected: bool,
    /// Result of the most recent sync run, written when its stream drains.
    last_result: Arc<Mutex<Option<SyncResult>>>,
}

impl GmailConnector {
    /// Creates a connector for the given account.
    ///
    /// No network activity happens until [`connect`](EmailConnector::connect).
    pub fn new(
        account_id: AccountId,
        credentials: OAuth2Credentials,
        settings: SyncSettings,
    ) -> Self {
        let token_state = TokenState {
            access_token: credentials.access_token.clone(),
            expires_at: credentials.token_expires_at,
        };
        Self {
            account_id,
            credentials,
            settings,
            client: reqwest::Client::new(),
            token_state: Arc::new(RwLock::new(token_state)),
            connected: false,
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns whether the connector has verified its credentials.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Fetches the account profile.
    async fn get_profile(&self) -> Result<ProfileResponse> {
        api_get(
            &self.client,
            &self.credentials,
            &self.token_state,
            &format!("{}/profile", GMAIL_API_BASE),
        )
        .await
    }
}

#[async_trait]
impl EmailConnector for GmailConnector {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gmail
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    async fn connect(&mut self) -> Result<()> {
        // ensure_fresh_token refreshes an expired or near-expiry token; the
        // profile call then proves the token actually works.
        ensure_fresh_token(&self.client, &self.credentials, &self.token_state).await?;
        let profile = self.get_profile().await?;
        self.connected = true;

        tracing::info!(
            account_id = %self.account_id,
            email = ?profile.email_address,
            "Gmail connector authenticated"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        // OAuth has no session to tear down; the token is simply no longer
        // used. Revocation is the account owner's operation, not sync's.
        self.connected = false;
    }

    async fn test_connection(&mut self) -> Result<bool> {
        self.get_profile().await?;
        Ok(true)
    }

    async fn get_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let response: LabelsListResponse = api_get(
            &self.client,
            &self.credentials,
            &self.token_state,
            &format!("{}/labels", GMAIL_API_BASE),
        )
        .await?;

        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| FolderInfo {
                is_system: label.label_type.as_deref() == Some("system"),
                name: label.id,
                display_name: label.name,
                delimiter: None,
            })
            .collect())
    }

    async fn sync_emails(
        &mut self,
        sync_type: SyncType,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<EmailStream> {
        if !self.connected {
            return Err(ConnectorError::Connection("not connected".to_string()));
        }

        let client = self.client.clone();
        let credentials = self.credentials.clone();
        let token_state = Arc::clone(&self.token_state);
        let settings = self.settings.clone();
        let account_id = self.account_id.clone();
        let last_result = Arc::clone(&self.last_result);

        let stream = async_stream::stream! {
            let mut result = SyncResult::start(sync_type);

            match api_get::<ProfileResponse>(
                &client,
                &credentials,
                &token_state,
                &format!("{}/profile", GMAIL_API_BASE),
            )
            .await
            {
                Ok(profile) => {
                    result.validation.total_emails_in_mailbox =
                        profile.messages_total.unwrap_or(0);
                }
                Err(e) => {
                    result.fail(e.to_string());
                    *last_result.lock().await = Some(result);
                    yield Err(e);
                    return;
                }
            }

            let query = build_search_query(sync_type, last_sync_time, &settings);
            let page_size = settings.max_emails_per_batch.clamp(1, 500);

            let mut ids: Vec<String> = Vec::new();
            let mut page_token: Option<String> = None;
            let mut found_estimate: u64 = 0;
            let mut stopped_by_limit = false;

            loop {
                let url = {
                    let mut pairs = url::form_urlencoded::Serializer::new(String::new());
                    pairs.append_pair("maxResults", &page_size.to_string());
                    if !query.is_empty() {
                        pairs.append_pair("q", &query);
                    }
                    if let Some(token) = &page_token {
                        pairs.append_pair("pageToken", token);
                    }
                    format!("{}/messages?{}", GMAIL_API_BASE, pairs.finish())
                };

                let page: MessageListResponse = match api_get(
                    &client,
                    &credentials,
                    &token_state,
                    &url,
                )
                .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        result.fail(e.to_string());
                        *last_result.lock().await = Some(result);
                        yield Err(e);
                        return;
                    }
                };

                if page_token.is_none() {
                    found_estimate = page.result_size_estimate.unwrap_or(0);
                }

                for msg_ref in page.messages.unwrap_or_default() {
                    ids.push(msg_ref.id);
                }

                let limit_hit = settings
                    .max_emails_limit
                    .is_some_and(|limit| ids.len() >= limit);
                page_token = page.next_page_token;
                if limit_hit && page_token.is_some() {
                    stopped_by_limit = true;
                }
                if page_token.is_none() || limit_hit {
                    break;
                }
            }

            let found = reconcile_found(found_estimate, ids.len(), stopped_by_limit);
            if let Some(limit) = settings.max_emails_limit {
                ids.truncate(limit);
            }
            result.record_truncation("gmail", found, ids.len() as u64);

            tracing::info!(
                account_id = %account_id,
                query = %query,
                found,
                to_process = ids.len(),
                "syncing gmail messages"
            );

            for chunk in ids.chunks(page_size) {
                for id in chunk {
                    let url = format!("{}/messages/{}?format=full", GMAIL_API_BASE, id);
                    match api_get::<GmailMessage>(&client, &credentials, &token_state, &url)
                        .await
                    {
                        Ok(msg) => {
                            let email = convert_message(&msg, &account_id, &settings);
                            result.emails_processed += 1;
                            result.emails_added += 1;
                            result.attachments_catalogued += email.attachments.len() as u64;
                            yield Ok(email);
                        }
                        Err(e @ ConnectorError::Authentication(_))
                        | Err(e @ ConnectorError::Connection(_)) => {
                            // Auth/transport failures will hit every later
                            // message too; end the run.
                            result.fail(e.to_string());
                            *last_result.lock().await = Some(result);
                            yield Err(e);
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(
                                account_id = %account_id,
                                message_id = %id,
                                error = %e,
                                "message fetch failed, skipping"
                            );
                            result.emails_skipped += 1;
                        }
                    }
                }
                if settings.rate_limit_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(settings.rate_limit_delay_ms))
                        .await;
                }
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
        let url = format!("{}/messages/{}?format=full", GMAIL_API_BASE, message_id);
        let msg: GmailMessage =
            api_get(&self.client, &self.credentials, &self.token_state, &url).await?;
        Ok(convert_message(&msg, &self.account_id, &self.settings))
    }

    async fn download_attachment(
        &mut self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<EmailAttachment> {
        // Filename and content type live on the message part, not the
        // attachment resource, so fetch the message first.
        let message = self.get_email_by_id(message_id).await?;
        let meta = message
            .attachments
            .into_iter()
            .find(|a| a.id == attachment_id)
            .ok_or_else(|| {
                ConnectorError::Sync(format!(
                    "attachment {} not found on message {}",
                    attachment_id, message_id
                ))
            })?;

        let url = format!(
            "{}/messages/{}/attachments/{}",
            GMAIL_API_BASE, message_id, attachment_id
        );
        let response: AttachmentResponse =
            api_get(&self.client, &self.credentials, &self.token_state, &url).await?;

        let data = response
            .data
            .as_deref()
            .map(|d| {
                BASE64_URL_SAFE_NO_PAD
                    .decode(d)
                    .map_err(|e| ConnectorError::Sync(format!("decode attachment data: {}", e)))
            })
            .transpose()?;

        Ok(EmailAttachment {
            size: response.size.or(meta.size),
            data,
            ..meta
        })
    }

    async fn mark_as_read(&mut self, message_id: &str) -> Result<()> {
        let url = format!("{}/messages/{}/modify", GMAIL_API_BASE, message_id);
        let body = ModifyRequest {
            add_label_ids: vec![],
            remove_label_ids: vec!["UNREAD".to_string()],
        };
        api_post(&self.client, &self.credentials, &self.token_state, &url, &body).await?;

        tracing::debug!(account_id = %self.account_id, message_id = %message_id, "marked as read");
        Ok(())
    }

    async fn get_sync_status(&self) -> ConnectorStatus {
        ConnectorStatus {
            provider: ProviderType::Gmail,
            account_id: self.account_id.clone(),
            connected: self.connected,
            last_sync: self.last_result.lock().await.clone(),
        }
    }
}
