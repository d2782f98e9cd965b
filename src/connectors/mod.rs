//! Email connector implementations.
//!
//! This module contains the [`EmailConnector`] trait and implementations for
//! different email backends:
//!
//! - [`ImapConnector`] - IMAP4rev1 over TLS with UID-based incremental sync
//! - [`GmailConnector`] - Gmail REST API with OAuth 2.0
//!
//! # Architecture
//!
//! Connectors are constructed through the [`ConnectorFactory`], which
//! validates credentials against the provider's expected mechanism before
//! building. Callers drive every connector through the trait; nothing
//! downstream branches on provider type.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use mailsync::config::{AuthCredentials, ImapCredentials, SyncSettings};
//! use mailsync::connectors::ConnectorFactory;
//! use mailsync::domain::{AccountId, ProviderType};
//! use mailsync::sync::SyncType;
//!
//! let factory = ConnectorFactory::new();
//! let mut connector = factory.create_connector(
//!     ProviderType::Imap,
//!     AccountId::from("acct-1"),
//!     AuthCredentials::Password(credentials),
//!     SyncSettings::default(),
//! )?;
//!
//! connector.connect().await?;
//! let mut emails = connector.sync_emails(SyncType::Full, None).await?;
//! while let Some(email) = emails.next().await {
//!     println!("{:?}", email?.subject);
//! }
//! connector.disconnect().await;
//! ```

mod factory;
mod gmail;
mod imap;
mod traits;

pub use factory::{ConnectorBuilder, ConnectorFactory};
pub use gmail::GmailConnector;
pub use imap::{quote_folder_name, FolderStatus, ImapCapabilities, ImapConnector};
pub use traits::{ConnectorError, ConnectorStatus, EmailConnector, EmailStream, Result};
