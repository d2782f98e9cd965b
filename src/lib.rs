//! Email synchronization connectors.
//!
//! `mailsync` provides a provider-agnostic contract for synchronizing email
//! accounts, with connectors for IMAP4rev1 (UID-based incremental sync) and
//! the Gmail REST API (OAuth 2.0).
//!
//! # Layout
//!
//! - [`domain`] - transient value types (messages, addresses, folders)
//! - [`config`] - credentials and sync settings
//! - [`connectors`] - the [`EmailConnector`](connectors::EmailConnector)
//!   trait, the IMAP and Gmail implementations, and the factory
//! - [`sync`] - sync run results, validation metrics, and the
//!   UIDVALIDITY-based full/incremental decision
//!
//! # Design
//!
//! Connectors yield messages lazily through a stream and never persist
//! anything themselves; checkpoints ([`sync::FolderCheckpoint`]) and message
//! storage belong to the caller. The aggregate [`sync::SyncResult`] records
//! mailbox-coverage metrics so a truncated or partial run is always
//! detectable.

pub mod config;
pub mod connectors;
pub mod domain;
pub mod sync;
