//! Error types for the store.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The target mailbox does not exist; reported to IMAP as `TRYCREATE`.
    #[error("Mailbox is missing")]
    MailboxMissing,

    /// The source mailbox does not exist; reported to IMAP as `NONEXISTENT`.
    #[error("Mailbox not found")]
    MailboxNotFound,

    /// The write would push the user past their quota.
    #[error("Quota exceeded: {used} of {quota} bytes used")]
    QuotaExceeded {
        /// Bytes currently accounted to the user.
        used: u64,
        /// The user's quota in bytes.
        quota: u64,
    },

    /// An update request carried no recognized change keys.
    #[error("Nothing was changed")]
    NothingChanged,

    /// Underlying database failure, propagated verbatim.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Serialization of a stored document failed.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
