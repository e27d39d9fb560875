//! SASL PLAIN token parsing (RFC 4616).
//!
//! The token is `base64(authzid NUL authcid NUL password)`. Anything that
//! does not decode into exactly three NUL-separated parts with a non-empty
//! authcid and password is rejected as a bad argument.

use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, Engine, GeneralPurposeConfig};

use crate::{Error, Result};

/// Standard base64, tolerant of both padded and unpadded tokens.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Credentials carried by a PLAIN token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Authorization identity; usually empty.
    pub authzid: String,
    /// Authentication identity (the login name).
    pub username: String,
    /// Password.
    pub password: String,
}

/// Parses a PLAIN token.
///
/// # Errors
///
/// [`Error::AuthBadArgument`] on undecodable base64, wrong arity, invalid
/// UTF-8, or an empty username or password.
pub fn parse_plain(token: &str) -> Result<PlainCredentials> {
    let bytes = LENIENT
        .decode(token.trim())
        .map_err(|_| Error::AuthBadArgument)?;

    let parts: Vec<&[u8]> = bytes.split(|b| *b == 0).collect();
    let [authzid, username, password] = parts.as_slice() else {
        return Err(Error::AuthBadArgument);
    };

    let authzid = std::str::from_utf8(authzid).map_err(|_| Error::AuthBadArgument)?;
    let username = std::str::from_utf8(username).map_err(|_| Error::AuthBadArgument)?;
    let password = std::str::from_utf8(password).map_err(|_| Error::AuthBadArgument)?;
    if username.is_empty() || password.is_empty() {
        return Err(Error::AuthBadArgument);
    }

    Ok(PlainCredentials {
        authzid: authzid.to_string(),
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn parses_a_valid_token() {
        let token = STANDARD.encode("\0alice\0hunter2");
        let credentials = parse_plain(&token).unwrap();
        assert_eq!(credentials.authzid, "");
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "hunter2");
    }

    #[test]
    fn parses_with_authzid() {
        let token = STANDARD.encode("admin\0alice\0hunter2");
        let credentials = parse_plain(&token).unwrap();
        assert_eq!(credentials.authzid, "admin");
    }

    #[test]
    fn accepts_unpadded_tokens() {
        let token = STANDARD.encode("\0alice\0hunter2");
        let unpadded = token.trim_end_matches('=');
        assert!(parse_plain(unpadded).is_ok());
    }

    #[test]
    fn rejects_wrong_arity_and_empty_parts() {
        // "AAA" decodes to two NUL bytes: right arity, empty credentials.
        assert!(matches!(parse_plain("AAA"), Err(Error::AuthBadArgument)));
        let token = STANDARD.encode("no-nul-separators");
        assert!(matches!(parse_plain(&token), Err(Error::AuthBadArgument)));
        let token = STANDARD.encode("\0a\0b\0c");
        assert!(matches!(parse_plain(&token), Err(Error::AuthBadArgument)));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            parse_plain("!!not base64!!"),
            Err(Error::AuthBadArgument)
        ));
    }
}
