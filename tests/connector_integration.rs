//! Integration tests for the connector surface.
//!
//! These tests verify that the factory, trait objects, and sync types work
//! correctly across module boundaries. Each module contains its own unit
//! tests for detailed logic testing; network behavior against live servers
//! is out of scope here, so trait-level flows run against a mock connector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mockall::mock;
use mockall::predicate::eq;
use tokio_test::assert_ok;

use mailsync::config::{AuthCredentials, ImapCredentials, OAuth2Credentials, SyncSettings};
use mailsync::connectors::{
    quote_folder_name, ConnectorError, ConnectorFactory, ConnectorStatus, EmailConnector,
    EmailStream,
};
use mailsync::domain::{
    AccountId, EmailAddress, EmailAttachment, EmailMessage, FolderInfo, MessageFlags, ProviderType,
};
use mailsync::sync::{detect_gaps, FolderCheckpoint, SyncMode, SyncResult, SyncType};

/// Installs a test-writer subscriber so connector tracing lands in the
/// captured test output. Repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

mock! {
    Connector {}

    #[async_trait]
    impl EmailConnector for Connector {
        fn provider_type(&self) -> ProviderType;
        fn account_id(&self) -> &AccountId;
        async fn connect(&mut self) -> mailsync::connectors::Result<()>;
        async fn disconnect(&mut self);
        async fn test_connection(&mut self) -> mailsync::connectors::Result<bool>;
        async fn get_folders(&mut self) -> mailsync::connectors::Result<Vec<FolderInfo>>;
        async fn sync_emails(
            &mut self,
            sync_type: SyncType,
            last_sync_time: Option<DateTime<Utc>>,
        ) -> mailsync::connectors::Result<EmailStream>;
        async fn get_email_by_id(
            &mut self,
            message_id: &str,
        ) -> mailsync::connectors::Result<EmailMessage>;
        async fn download_attachment(
            &mut self,
            message_id: &str,
            attachment_id: &str,
        ) -> mailsync::connectors::Result<EmailAttachment>;
        async fn mark_as_read(&mut self, message_id: &str) -> mailsync::connectors::Result<()>;
        async fn get_sync_status(&self) -> ConnectorStatus;
    }
}

fn sample_message(uid: u32) -> EmailMessage {
    EmailMessage {
        id: format!("INBOX:{}", uid),
        account_id: AccountId::from("acct-1"),
        thread_id: None,
        subject: Some(format!("Message {}", uid)),
        from: EmailAddress::new("sender@example.com"),
        to: vec![EmailAddress::new("recipient@example.com")],
        cc: vec![],
        bcc: vec![],
        body_text: Some("body".to_string()),
        body_html: None,
        snippet: "body".to_string(),
        sent_at: Some(Utc::now()),
        received_at: Some(Utc::now()),
        folder: "INBOX".to_string(),
        labels: vec!["INBOX".to_string()],
        attachments: vec![],
        flags: MessageFlags::default(),
        size: Some(512),
        provider_data: Default::default(),
        imap_uid: Some(uid),
        uid_validity: Some(857529045),
    }
}

fn imap_credentials() -> AuthCredentials {
    AuthCredentials::Password(ImapCredentials {
        host: "imap.example.com".to_string(),
        port: 993,
        username: "user@example.com".to_string(),
        password: "hunter2".to_string(),
    })
}

fn oauth_credentials() -> AuthCredentials {
    AuthCredentials::OAuth2(OAuth2Credentials {
        access_token: "ya29.token".to_string(),
        refresh_token: "1//refresh".to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        token_expires_at: None,
    })
}

// ============================================================================
// Factory Tests
// ============================================================================

#[test]
fn factory_builds_both_providers_as_trait_objects() {
    let factory = ConnectorFactory::new();

    let imap = factory
        .create_connector(
            ProviderType::Imap,
            AccountId::from("acct-imap"),
            imap_credentials(),
            SyncSettings::default(),
        )
        .unwrap();
    assert_eq!(imap.provider_type(), ProviderType::Imap);

    let gmail = factory
        .create_connector(
            ProviderType::Gmail,
            AccountId::from("acct-gmail"),
            oauth_credentials(),
            SyncSettings::default(),
        )
        .unwrap();
    assert_eq!(gmail.provider_type(), ProviderType::Gmail);
}

#[test]
fn factory_rejects_credential_mechanism_mismatch() {
    let factory = ConnectorFactory::new();

    let err = factory
        .create_connector(
            ProviderType::Gmail,
            AccountId::from("acct-1"),
            imap_credentials(),
            SyncSettings::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, ConnectorError::Config(_)));
}

#[test]
fn factory_rejects_structurally_invalid_credentials() {
    let factory = ConnectorFactory::new();
    let creds = AuthCredentials::OAuth2(OAuth2Credentials {
        access_token: String::new(),
        refresh_token: "1//refresh".to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        token_expires_at: None,
    });

    let err = factory
        .validate_credentials(ProviderType::Gmail, &creds)
        .unwrap_err();
    assert!(err.to_string().contains("access_token"));
}

// ============================================================================
// Trait-Level Sync Flow (mocked connector)
// ============================================================================

#[tokio::test]
async fn sync_stream_drains_through_trait_object() {
    init_tracing();

    let mut mock = MockConnector::new();
    mock.expect_connect().times(1).returning(|| Ok(()));
    mock.expect_sync_emails()
        .with(eq(SyncType::Full), eq(None::<DateTime<Utc>>))
        .times(1)
        .returning(|_, _| {
            let messages = vec![Ok(sample_message(5)), Ok(sample_message(4)), Ok(sample_message(3))];
            Ok(futures::stream::iter(messages).boxed())
        });
    mock.expect_disconnect().times(1).return_const(());

    let connector: &mut dyn EmailConnector = &mut mock;
    assert_ok!(connector.connect().await);

    let mut stream = connector.sync_emails(SyncType::Full, None).await.unwrap();
    let mut uids = Vec::new();
    while let Some(item) = stream.next().await {
        uids.push(item.unwrap().imap_uid.unwrap());
    }
    drop(stream);

    // Newest-first delivery: a cap would drop the oldest messages.
    assert_eq!(uids, vec![5, 4, 3]);
    connector.disconnect().await;
}

#[tokio::test]
async fn sync_stream_error_item_terminates_run() {
    init_tracing();

    let mut mock = MockConnector::new();
    mock.expect_sync_emails().returning(|_, _| {
        let items: Vec<mailsync::connectors::Result<EmailMessage>> = vec![
            Ok(sample_message(9)),
            Err(ConnectorError::Sync("connection dropped mid-fetch".to_string())),
        ];
        Ok(futures::stream::iter(items).boxed())
    });

    let mut stream = mock.sync_emails(SyncType::Incremental, None).await.unwrap();

    assert!(stream.next().await.unwrap().is_ok());
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectorError::Sync(_)));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn early_stream_abandonment_leaves_connector_usable() {
    init_tracing();

    let mut mock = MockConnector::new();
    mock.expect_sync_emails().returning(|_, _| {
        let messages: Vec<mailsync::connectors::Result<EmailMessage>> =
            (1..=100).rev().map(|uid| Ok(sample_message(uid))).collect();
        Ok(futures::stream::iter(messages).boxed())
    });
    mock.expect_disconnect().times(1).return_const(());

    let mut stream = mock.sync_emails(SyncType::Full, None).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.imap_uid, Some(100));
    drop(stream);

    mock.disconnect().await;
}

// ============================================================================
// Checkpoint / Sync Mode Tests
// ============================================================================

#[test]
fn checkpoint_round_trip_drives_incremental_sync() {
    let checkpoint = FolderCheckpoint {
        folder: "INBOX".to_string(),
        uid_validity: 857529045,
        last_uid: 44291,
        synced_at: Utc::now(),
    };

    let json = serde_json::to_string(&checkpoint).unwrap();
    let restored: FolderCheckpoint = serde_json::from_str(&json).unwrap();

    assert_eq!(
        SyncMode::decide(Some(&restored), 857529045),
        SyncMode::Incremental { last_uid: 44291 }
    );
}

#[test]
fn uidvalidity_change_invalidates_checkpoint() {
    let checkpoint = FolderCheckpoint {
        folder: "INBOX".to_string(),
        uid_validity: 857529045,
        last_uid: 44291,
        synced_at: Utc::now(),
    };

    // Server rebuilt the mailbox; every stored UID now refers to nothing.
    assert_eq!(SyncMode::decide(Some(&checkpoint), 857529046), SyncMode::Full);
}

// ============================================================================
// Validation Metrics Tests
// ============================================================================

#[test]
fn truncation_invariant_holds_across_folders() {
    let mut result = SyncResult::start(SyncType::Full);
    result.record_truncation("INBOX", 120, 100);
    result.record_truncation("Archive", 40, 40);
    result.record_truncation("Sent Items", 10, 5);

    assert_eq!(result.validation.emails_within_date_range, 170);
    assert_eq!(result.validation.emails_missing_due_to_limits, 25);
    assert_eq!(result.validation.warnings.len(), 2);
    assert!(result.has_warnings());
}

#[test]
fn gap_detection_flags_expunged_ranges() {
    let processed = [44280, 44281, 44285, 44286, 44290];
    let gaps = detect_gaps(&processed);

    assert_eq!(gaps.len(), 2);
    assert_eq!((gaps[0].start, gaps[0].end), (44282, 44284));
    assert_eq!((gaps[1].start, gaps[1].end), (44287, 44289));
}

// ============================================================================
// Folder Name Quoting Tests
// ============================================================================

#[test]
fn folder_quoting_is_idempotent() {
    let once = quote_folder_name("Sent Items");
    let twice = quote_folder_name(&once);
    assert_eq!(once, twice);
    assert_eq!(once, "\"Sent Items\"");
}
