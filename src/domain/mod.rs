//! Domain types shared across connectors.

mod email;
mod types;

pub use email::{EmailAddress, EmailAttachment, EmailMessage, FolderInfo, MessageFlags};
pub use types::{AccountId, ProviderType};
