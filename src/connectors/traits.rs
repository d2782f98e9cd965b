//! Connector trait definition.
//!
//! This module defines the [`EmailConnector`] trait which abstracts over
//! email backends (IMAP, Gmail REST API). The caller never branches on
//! provider type: the factory hands back a boxed connector and every
//! operation goes through this capability surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, EmailAttachment, EmailMessage, FolderInfo, ProviderType};
use crate::sync::{SyncResult, SyncType};

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Lazy sequence of synchronized messages.
///
/// Production is lazy (no pre-fetch of the whole mailbox), consumption is
/// forward-only, and dropping the stream early releases nothing the caller
/// must clean up; `disconnect` stays callable afterward.
pub type EmailStream = BoxStream<'static, Result<EmailMessage>>;

/// Errors that can occur during connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Bad or expired credentials. Fatal to the current connect attempt;
    /// never retried internally.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network/transport failure reaching the provider. The caller may
    /// retry the whole connect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol-level failure during an established session (malformed
    /// response, rate limit, folder access denied).
    #[error("sync error: {0}")]
    Sync(String),

    /// Malformed credentials/settings or an unknown provider, rejected
    /// before any network call.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Connection and sync state reported by [`EmailConnector::get_sync_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStatus {
    /// Provider this connector talks to.
    pub provider: ProviderType,
    /// Account the connector is bound to.
    pub account_id: AccountId,
    /// Whether a session is currently established.
    pub connected: bool,
    /// Result of the most recently completed sync run, if any.
    pub last_sync: Option<SyncResult>,
}

/// Trait for email connector implementations.
///
/// All operations take `&mut self`: a connector instance exclusively owns
/// its network session, and callers must serialize operations per instance
/// (run independent connectors for concurrency).
///
/// # Example
///
/// ```ignore
/// use futures::StreamExt;
/// use mailsync::connectors::{ConnectorFactory, EmailConnector};
/// use mailsync::sync::SyncType;
///
/// async fn drain(connector: &mut dyn EmailConnector) -> mailsync::connectors::Result<()> {
///     connector.connect().await?;
///     let mut stream = connector.sync_emails(SyncType::Incremental, None).await?;
///     while let Some(message) = stream.next().await {
///         match message {
///             Ok(email) => println!("{}", email.subject.unwrap_or_default()),
///             Err(e) => tracing::warn!(error = %e, "sync stream error"),
///         }
///     }
///     connector.disconnect().await;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait EmailConnector: Send + Sync {
    /// Returns the provider this connector talks to.
    fn provider_type(&self) -> ProviderType;

    /// Returns the account this connector is bound to.
    fn account_id(&self) -> &AccountId;

    /// Establishes a session with the provider.
    ///
    /// Safe to call again after a failed attempt; any half-open session from
    /// the previous attempt is discarded first.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Authentication`] for bad credentials,
    /// [`ConnectorError::Connection`] for transport failures.
    async fn connect(&mut self) -> Result<()>;

    /// Releases the session.
    ///
    /// Never fails: secondary errors (e.g., LOGOUT on a dead socket) are
    /// logged and swallowed so cleanup paths cannot themselves error.
    async fn disconnect(&mut self);

    /// Lightweight liveness probe, distinct from [`connect`](Self::connect).
    ///
    /// Has no side effects beyond the probe itself.
    async fn test_connection(&mut self) -> Result<bool>;

    /// Lists folders/labels available in the mailbox.
    async fn get_folders(&mut self) -> Result<Vec<FolderInfo>>;

    /// Synchronizes messages, yielding them lazily.
    ///
    /// Messages arrive newest-first for IMAP (reversed UID order) and in API
    /// page order for Gmail. Per-message fetch failures are logged and
    /// skipped; connection-level failures terminate the stream with an `Err`
    /// item. The aggregate [`SyncResult`] for the run is available from
    /// [`get_sync_status`](Self::get_sync_status) once the stream is drained.
    ///
    /// Restartable only by re-invoking with a new `last_sync_time`.
    async fn sync_emails(
        &mut self,
        sync_type: SyncType,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<EmailStream>;

    /// Fetches a single message by its provider ID.
    ///
    /// Read-only: fetching must not set the `\Seen` flag (IMAP uses
    /// `BODY.PEEK[]`, never `RFC822`).
    async fn get_email_by_id(&mut self, message_id: &str) -> Result<EmailMessage>;

    /// Downloads one attachment's bytes.
    async fn download_attachment(
        &mut self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<EmailAttachment>;

    /// Marks a message as read on the server.
    ///
    /// This mutates remote state; callers must treat it as a deliberate
    /// action, never a consequence of reading.
    async fn mark_as_read(&mut self, message_id: &str) -> Result<()>;

    /// Reports connection state and the last completed sync result.
    async fn get_sync_status(&self) -> ConnectorStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let auth = ConnectorError::Authentication("token expired".to_string());
        assert_eq!(auth.to_string(), "authentication failed: token expired");

        let conn = ConnectorError::Connection("TCP reset".to_string());
        assert!(conn.to_string().contains("connection error"));

        let sync = ConnectorError::Sync("malformed SEARCH response".to_string());
        assert!(sync.to_string().contains("sync error"));

        let config = ConnectorError::Config("unknown provider: exchange".to_string());
        assert!(config.to_string().contains("invalid configuration"));
    }

    #[test]
    fn status_serialization() {
        let status = ConnectorStatus {
            provider: ProviderType::Imap,
            account_id: AccountId::from("acct-1"),
            connected: true,
            last_sync: None,
        };

        let json = serde_json::to_string(&status).unwrap();
        let deserialized: ConnectorStatus = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.provider, ProviderType::Imap);
        assert!(deserialized.connected);
        assert!(deserialized.last_sync.is_none());
    }
}
