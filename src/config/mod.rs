//! Connector configuration.

mod settings;

pub use settings::{AuthCredentials, ImapCredentials, OAuth2Credentials, SyncSettings};
