//! Connector factory.
//!
//! The factory is the single construction point for connectors: it validates
//! credentials against the provider's expected mechanism before any network
//! call, then hands back a boxed [`EmailConnector`]. Callers never name a
//! concrete connector type.
//!
//! Built-in providers are registered by [`ConnectorFactory::new`]; additional
//! providers can be registered at runtime, and re-registering a provider
//! replaces its builder.

use std::collections::HashMap;

use super::{ConnectorError, EmailConnector, GmailConnector, ImapConnector, Result};
use crate::config::{AuthCredentials, SyncSettings};
use crate::domain::{AccountId, ProviderType};

/// Builder closure producing a connector from validated inputs.
pub type ConnectorBuilder = Box<
    dyn Fn(AccountId, AuthCredentials, SyncSettings) -> Result<Box<dyn EmailConnector>>
        + Send
        + Sync,
>;

/// Registry of connector builders keyed by provider.
pub struct ConnectorFactory {
    builders: HashMap<ProviderType, ConnectorBuilder>,
}

impl ConnectorFactory {
    /// Creates a factory with the built-in IMAP and Gmail providers.
    pub fn new() -> Self {
        let mut factory = Self {
            builders: HashMap::new(),
        };

        factory.register(
            ProviderType::Imap,
            Box::new(|account_id, credentials, settings| match credentials {
                AuthCredentials::Password(creds) => {
                    Ok(Box::new(ImapConnector::new(account_id, creds, settings))
                        as Box<dyn EmailConnector>)
                }
                AuthCredentials::OAuth2(_) => Err(ConnectorError::Config(
                    "imap connector requires password credentials".to_string(),
                )),
            }),
        );

        factory.register(
            ProviderType::Gmail,
            Box::new(|account_id, credentials, settings| match credentials {
                AuthCredentials::OAuth2(creds) => {
                    Ok(Box::new(GmailConnector::new(account_id, creds, settings))
                        as Box<dyn EmailConnector>)
                }
                AuthCredentials::Password(_) => Err(ConnectorError::Config(
                    "gmail connector requires oauth2 credentials".to_string(),
                )),
            }),
        );

        factory
    }

    /// Registers (or replaces) a builder for a provider.
    pub fn register(&mut self, provider: ProviderType, builder: ConnectorBuilder) {
        self.builders.insert(provider, builder);
    }

    /// Returns the providers this factory can build.
    pub fn supported_providers(&self) -> Vec<ProviderType> {
        self.builders.keys().copied().collect()
    }

    /// Checks credentials against the provider's expected mechanism.
    ///
    /// Purely structural: no network call is made, so success here does not
    /// mean the credentials will authenticate.
    pub fn validate_credentials(
        &self,
        provider: ProviderType,
        credentials: &AuthCredentials,
    ) -> Result<()> {
        if !self.builders.contains_key(&provider) {
            return Err(ConnectorError::Config(format!(
                "unknown provider: {}",
                provider
            )));
        }

        match (provider, credentials) {
            (ProviderType::Imap, AuthCredentials::Password(creds)) => {
                creds.validate().map_err(ConnectorError::Config)
            }
            (ProviderType::Gmail, AuthCredentials::OAuth2(creds)) => {
                creds.validate().map_err(ConnectorError::Config)
            }
            (ProviderType::Imap, AuthCredentials::OAuth2(_)) => Err(ConnectorError::Config(
                "imap connector requires password credentials".to_string(),
            )),
            (ProviderType::Gmail, AuthCredentials::Password(_)) => Err(ConnectorError::Config(
                "gmail connector requires oauth2 credentials".to_string(),
            )),
        }
    }

    /// Validates credentials and builds a connector.
    ///
    /// The returned connector has performed no network activity; call
    /// [`connect`](EmailConnector::connect) before any operation.
    pub fn create_connector(
        &self,
        provider: ProviderType,
        account_id: AccountId,
        credentials: AuthCredentials,
        settings: SyncSettings,
    ) -> Result<Box<dyn EmailConnector>> {
        self.validate_credentials(provider, &credentials)?;

        let builder = self.builders.get(&provider).ok_or_else(|| {
            ConnectorError::Config(format!("unknown provider: {}", provider))
        })?;

        builder(account_id, credentials, settings)
    }
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}
