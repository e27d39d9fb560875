//! # mailvault-imap
//!
//! IMAP-facing command hooks for the MailVault mail store.
//!
//! This crate provides:
//! - SASL PLAIN token parsing
//! - The `onAuth` hook with TLS gating and failure throttling
//! - `onOpen`, `onCopy`, `onGetQuotaRoot`, `onUnsubscribe` hooks
//! - Mapping of store errors onto IMAP response sentinels
//!
//! The wire protocol itself (command parsing, literals, connection state)
//! is an external collaborator; these are the handlers it calls.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
mod error;
pub mod hooks;
pub mod sasl;

pub use auth::{AuthConfig, AuthRequest, AuthenticatedUser, Authenticator, SessionInfo};
pub use error::{Error, Result};
pub use hooks::{CommandHooks, CopyCommand, CopyUidResponse, OpenedMailbox, QuotaRoot};
pub use sasl::{parse_plain, PlainCredentials};
