//! Error types for the IMAP-facing surface.

use thiserror::Error;

/// Errors surfaced to the IMAP wire layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials did not match a user.
    #[error("Authentication failed")]
    AuthFailed,

    /// The SASL token was malformed.
    #[error("Invalid SASL argument")]
    AuthBadArgument,

    /// The requested SASL mechanism is not supported.
    #[error("Authentication mechanism not implemented: {0}")]
    AuthNotImplemented(String),

    /// Authentication was attempted before TLS.
    #[error("TLS required before authentication")]
    AuthRequiresTls,

    /// The named mailbox does not exist.
    #[error("Mailbox does not exist")]
    Nonexistent,

    /// The target mailbox does not exist but could be created.
    #[error("Mailbox does not exist but may be created")]
    TryCreate,

    /// Underlying store failure.
    #[error("Store error: {0}")]
    Store(mailvault_store::Error),
}

impl Error {
    /// The response line the wire layer writes for this error, without the
    /// command tag.
    #[must_use]
    pub fn imap_line(&self) -> String {
        match self {
            Self::AuthFailed => "NO AUTHENTICATIONFAILED Invalid credentials".to_string(),
            Self::AuthBadArgument => "BAD Invalid SASL argument".to_string(),
            Self::AuthNotImplemented(mechanism) => {
                format!("NO Unsupported authentication mechanism: {mechanism}")
            }
            Self::AuthRequiresTls => "BAD Run STARTTLS first".to_string(),
            Self::Nonexistent => "NO [NONEXISTENT] Mailbox does not exist".to_string(),
            Self::TryCreate => "NO [TRYCREATE] Mailbox does not exist".to_string(),
            Self::Store(_) => "NO Internal error".to_string(),
        }
    }
}

impl From<mailvault_store::Error> for Error {
    fn from(error: mailvault_store::Error) -> Self {
        match error {
            mailvault_store::Error::MailboxNotFound => Self::Nonexistent,
            mailvault_store::Error::MailboxMissing => Self::TryCreate,
            other => Self::Store(other),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_sentinels() {
        let nonexistent: Error = mailvault_store::Error::MailboxNotFound.into();
        assert!(matches!(nonexistent, Error::Nonexistent));
        let try_create: Error = mailvault_store::Error::MailboxMissing.into();
        assert!(matches!(try_create, Error::TryCreate));
    }

    #[test]
    fn response_lines() {
        assert_eq!(
            Error::AuthFailed.imap_line(),
            "NO AUTHENTICATIONFAILED Invalid credentials"
        );
        assert_eq!(Error::AuthBadArgument.imap_line(), "BAD Invalid SASL argument");
        assert_eq!(Error::AuthRequiresTls.imap_line(), "BAD Run STARTTLS first");
        assert_eq!(
            Error::TryCreate.imap_line(),
            "NO [TRYCREATE] Mailbox does not exist"
        );
    }
}
