//! Email domain types.
//!
//! These are the transient value types a connector hands to its caller during
//! a sync run. The connector constructs each [`EmailMessage`] once per fetched
//! message and keeps no reference afterward; persistence is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::AccountId;

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl EmailAddress {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// The five RFC 3501 message flags.
///
/// Absence of a flag token in a FETCH response means `false`, never unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// `\Seen` - the message has been read.
    pub seen: bool,
    /// `\Flagged` - the message is flagged/starred.
    pub flagged: bool,
    /// `\Deleted` - the message is marked for deletion.
    pub deleted: bool,
    /// `\Draft` - the message is an unsent draft.
    pub draft: bool,
    /// `\Answered` - the message has been replied to.
    pub answered: bool,
}

/// Attachment metadata, optionally carrying the raw bytes.
///
/// Connectors catalogue attachments (filename, content type, size) during
/// sync without materializing bytes; `data` is populated only by
/// `download_attachment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    /// Provider-assigned attachment identifier.
    pub id: String,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Size in bytes, when the provider reports it.
    pub size: Option<u64>,
    /// Whether this is an inline attachment (e.g., embedded image).
    pub is_inline: bool,
    /// Raw attachment bytes; `None` until explicitly downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// A single synchronized email message.
///
/// Produced by a connector's `sync_emails` stream, then owned by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider-assigned message identifier (`folder:uid` for IMAP,
    /// the message resource ID for Gmail).
    pub id: String,
    /// Account this message belongs to.
    pub account_id: AccountId,
    /// Provider-assigned thread/conversation identifier, when available.
    pub thread_id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Sender address.
    pub from: EmailAddress,
    /// Primary recipient addresses.
    pub to: Vec<EmailAddress>,
    /// Carbon copy recipient addresses.
    pub cc: Vec<EmailAddress>,
    /// Blind carbon copy recipient addresses.
    pub bcc: Vec<EmailAddress>,
    /// Plain text body content.
    pub body_text: Option<String>,
    /// HTML body content.
    pub body_html: Option<String>,
    /// Short preview of the message content.
    pub snippet: String,
    /// Date the message was sent, from its headers.
    pub sent_at: Option<DateTime<Utc>>,
    /// Date the message arrived at the mailbox, when the provider reports it.
    pub received_at: Option<DateTime<Utc>>,
    /// Folder path this message was fetched from.
    pub folder: String,
    /// Labels applied to this message (Gmail) or containing folder (IMAP).
    pub labels: Vec<String>,
    /// Attachment metadata (bytes not materialized).
    pub attachments: Vec<EmailAttachment>,
    /// RFC 3501 flags.
    pub flags: MessageFlags,
    /// Message size in bytes, when the provider reports it.
    pub size: Option<u32>,
    /// Provider-specific opaque values (e.g., Gmail `historyId`).
    pub provider_data: HashMap<String, serde_json::Value>,
    /// IMAP UID within the folder; `None` for non-IMAP providers.
    pub imap_uid: Option<u32>,
    /// UIDVALIDITY of the folder at fetch time; `None` for non-IMAP providers.
    pub uid_validity: Option<u32>,
}

/// A mailbox folder as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Full folder path (IMAP) or label ID (Gmail).
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Hierarchy delimiter, when the provider reports one.
    pub delimiter: Option<String>,
    /// Whether this is a well-known system folder (INBOX, Sent, ...).
    pub is_system: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_with_name() {
        let addr = EmailAddress::with_name("test@example.com", "Test User");
        assert_eq!(addr.display(), "Test User <test@example.com>");
    }

    #[test]
    fn address_display_without_name() {
        let addr = EmailAddress::new("test@example.com");
        assert_eq!(addr.display(), "test@example.com");
    }

    #[test]
    fn flags_default_to_false() {
        let flags = MessageFlags::default();
        assert!(!flags.seen);
        assert!(!flags.flagged);
        assert!(!flags.deleted);
        assert!(!flags.draft);
        assert!(!flags.answered);
    }

    #[test]
    fn attachment_serialization_skips_absent_data() {
        let attachment = EmailAttachment {
            id: "att-1".to_string(),
            filename: "document.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: Some(1024),
            is_inline: false,
            data: None,
        };

        let json = serde_json::to_string(&attachment).unwrap();
        assert!(!json.contains("\"data\""));

        let deserialized: EmailAttachment = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.filename, "document.pdf");
        assert_eq!(deserialized.size, Some(1024));
    }

    #[test]
    fn message_serialization_round_trip() {
        let message = EmailMessage {
            id: "INBOX:42".to_string(),
            account_id: AccountId::from("acct-1"),
            thread_id: None,
            subject: Some("Quarterly report".to_string()),
            from: EmailAddress::with_name("sender@example.com", "Sender"),
            to: vec![EmailAddress::new("recipient@example.com")],
            cc: vec![],
            bcc: vec![],
            body_text: Some("See attached.".to_string()),
            body_html: None,
            snippet: "See attached.".to_string(),
            sent_at: Some(Utc::now()),
            received_at: None,
            folder: "INBOX".to_string(),
            labels: vec!["INBOX".to_string()],
            attachments: vec![],
            flags: MessageFlags {
                seen: true,
                ..Default::default()
            },
            size: Some(2048),
            provider_data: HashMap::new(),
            imap_uid: Some(42),
            uid_validity: Some(857529045),
        };

        let json = serde_json::to_string(&message).unwrap();
        let deserialized: EmailMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.id, "INBOX:42");
        assert_eq!(deserialized.imap_uid, Some(42));
        assert_eq!(deserialized.uid_validity, Some(857529045));
        assert!(deserialized.flags.seen);
    }
}
