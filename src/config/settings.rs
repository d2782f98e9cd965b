//! Connector configuration types.
//!
//! Credentials and sync settings are immutable per-connector configuration,
//! supplied by the caller and validated before any network call. The optional
//! limits (`sync_days_back`, `max_emails_limit`) use `None` to mean
//! "unlimited", a distinct state from `Some(0)`.

use serde::{Deserialize, Serialize};

/// Authentication material for a connector, tagged by mechanism.
///
/// Each provider accepts exactly one variant: IMAP takes [`ImapCredentials`]
/// (password login), Gmail takes [`OAuth2Credentials`]. Validation happens in
/// the factory before a connector is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthCredentials {
    /// Username/password login (IMAP).
    Password(ImapCredentials),
    /// OAuth 2.0 refresh-token flow (Gmail).
    OAuth2(OAuth2Credentials),
}

/// IMAP server coordinates and login credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapCredentials {
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port (993 for TLS).
    pub port: u16,
    /// Username (usually the email address).
    pub username: String,
    /// Password or app-specific password.
    pub password: String,
}

impl ImapCredentials {
    /// Checks required fields without touching the network.
    ///
    /// Ports are validated against 1-65535; zero is the only value a `u16`
    /// can hold outside that range.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("imap credentials missing server host".to_string());
        }
        if self.port == 0 {
            return Err("imap port must be in range 1-65535".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("imap credentials missing username".to_string());
        }
        if self.password.is_empty() {
            return Err("imap credentials missing password".to_string());
        }
        Ok(())
    }
}

/// OAuth 2.0 credentials for the Gmail REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    /// Current access token.
    pub access_token: String,
    /// Refresh token used to mint new access tokens.
    pub refresh_token: String,
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// When the current access token expires; `None` forces a refresh
    /// before the first API call.
    pub token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl OAuth2Credentials {
    /// Checks required fields without touching the network.
    pub fn validate(&self) -> Result<(), String> {
        if self.access_token.is_empty() {
            return Err("oauth2 credentials missing access_token".to_string());
        }
        if self.refresh_token.is_empty() {
            return Err("oauth2 credentials missing refresh_token".to_string());
        }
        if self.client_id.is_empty() {
            return Err("oauth2 credentials missing client_id".to_string());
        }
        if self.client_secret.is_empty() {
            return Err("oauth2 credentials missing client_secret".to_string());
        }
        Ok(())
    }
}

/// Per-connector synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Folders to sync, in order. Each folder is fully drained before the
    /// next begins.
    pub folders_to_sync: Vec<String>,
    /// Whether to catalogue attachment metadata during sync.
    pub sync_attachments: bool,
    /// Skip attachments larger than this many megabytes.
    pub max_attachment_size_mb: u32,
    /// Include spam/junk folders in Gmail queries.
    pub include_spam: bool,
    /// Include trash in Gmail queries.
    pub include_trash: bool,
    /// Messages fetched per batch/page.
    pub max_emails_per_batch: usize,
    /// Delay between fetch batches, respecting provider quotas.
    pub rate_limit_delay_ms: u64,
    /// Lookback window in days for syncs without a checkpoint.
    /// `None` means unlimited history; `Some(0)` means "since today".
    pub sync_days_back: Option<i64>,
    /// Hard cap on messages yielded per sync run. `None` means unlimited.
    /// When the cap truncates a run, the connector records the loss in
    /// the sync result's validation metrics.
    pub max_emails_limit: Option<usize>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            folders_to_sync: vec!["INBOX".to_string()],
            sync_attachments: true,
            max_attachment_size_mb: 25,
            include_spam: false,
            include_trash: false,
            max_emails_per_batch: 50,
            rate_limit_delay_ms: 200,
            sync_days_back: Some(30),
            max_emails_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imap_creds() -> ImapCredentials {
        ImapCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn oauth_creds() -> OAuth2Credentials {
        OAuth2Credentials {
            access_token: "ya29.token".to_string(),
            refresh_token: "1//refresh".to_string(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            token_expires_at: None,
        }
    }

    #[test]
    fn imap_credentials_valid() {
        assert!(imap_creds().validate().is_ok());
    }

    #[test]
    fn imap_credentials_reject_zero_port() {
        let mut creds = imap_creds();
        creds.port = 0;
        let err = creds.validate().unwrap_err();
        assert!(err.contains("1-65535"));
    }

    #[test]
    fn imap_credentials_reject_blank_host() {
        let mut creds = imap_creds();
        creds.host = "   ".to_string();
        assert!(creds.validate().is_err());
    }

    #[test]
    fn oauth_credentials_valid() {
        assert!(oauth_creds().validate().is_ok());
    }

    #[test]
    fn oauth_credentials_reject_missing_refresh_token() {
        let mut creds = oauth_creds();
        creds.refresh_token = String::new();
        let err = creds.validate().unwrap_err();
        assert!(err.contains("refresh_token"));
    }

    #[test]
    fn auth_credentials_tagged_serialization() {
        let creds = AuthCredentials::Password(imap_creds());
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"auth_type\":\"password\""));

        let deserialized: AuthCredentials = serde_json::from_str(&json).unwrap();
        match deserialized {
            AuthCredentials::Password(c) => assert_eq!(c.host, "imap.example.com"),
            _ => panic!("expected password credentials"),
        }
    }

    #[test]
    fn sync_settings_default() {
        let settings = SyncSettings::default();
        assert_eq!(settings.folders_to_sync, vec!["INBOX".to_string()]);
        assert_eq!(settings.max_emails_per_batch, 50);
        assert_eq!(settings.sync_days_back, Some(30));
        assert!(settings.max_emails_limit.is_none());
    }

    #[test]
    fn sync_settings_none_limit_survives_round_trip() {
        // None means unlimited and must stay distinct from Some(0).
        let mut settings = SyncSettings::default();
        settings.sync_days_back = None;
        settings.max_emails_limit = Some(0);

        let json = serde_json::to_string(&settings).unwrap();
        let deserialized: SyncSettings = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.sync_days_back, None);
        assert_eq!(deserialized.max_emails_limit, Some(0));
    }
}
