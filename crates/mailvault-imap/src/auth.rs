//! The `onAuth` command hook.
//!
//! Verifies SASL PLAIN credentials against the user store. Authentication
//! is refused before TLS unless explicitly disabled, and repeated failures
//! per login name are throttled through the store's TTL counters. Every
//! outcome is logged with the connection id, method, and username.

use std::sync::Arc;
use std::time::Duration;

use mailvault_store::user::normalize_login;
use mailvault_store::{CounterService, UserId, UserRepository};
use tracing::{info, warn};

use crate::sasl::parse_plain;
use crate::{Error, Result};

/// An authentication request as the wire layer hands it over.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// SASL mechanism name; only `PLAIN` is implemented.
    pub method: String,
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Connection metadata for an authentication attempt.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Connection id, for log correlation.
    pub id: String,
    /// Whether the connection is protected by TLS (implicit or STARTTLS).
    pub tls_active: bool,
}

/// The user a successful authentication resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User id.
    pub id: UserId,
    /// Login name as provisioned.
    pub username: String,
}

impl AuthenticatedUser {
    /// The untagged OK line the wire layer writes.
    #[must_use]
    pub fn ok_line(&self) -> String {
        format!("OK {} authenticated", self.username)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Refuse authentication on plaintext connections.
    pub require_tls: bool,
    /// Failed attempts per login name before throttling kicks in.
    pub failure_limit: u64,
    /// Window over which failures accumulate.
    pub failure_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_tls: true,
            failure_limit: 6,
            failure_window: Duration::from_secs(600),
        }
    }
}

/// The `onAuth` hook.
pub struct Authenticator {
    users: UserRepository,
    counters: Arc<CounterService>,
    config: AuthConfig,
}

impl Authenticator {
    /// Creates an authenticator over the user store and counter service.
    #[must_use]
    pub fn new(users: UserRepository, counters: Arc<CounterService>, config: AuthConfig) -> Self {
        Self {
            users,
            counters,
            config,
        }
    }

    /// Authenticates a parsed request.
    ///
    /// # Errors
    ///
    /// [`Error::AuthRequiresTls`] on a plaintext connection,
    /// [`Error::AuthNotImplemented`] for mechanisms other than PLAIN,
    /// [`Error::AuthFailed`] for wrong credentials or a throttled login.
    pub async fn on_auth(
        &self,
        request: &AuthRequest,
        session: &SessionInfo,
    ) -> Result<AuthenticatedUser> {
        if self.config.require_tls && !session.tls_active {
            warn!(
                connection = %session.id,
                method = %request.method,
                username = %request.username,
                outcome = "tls_required",
                "authentication refused"
            );
            return Err(Error::AuthRequiresTls);
        }
        if !request.method.eq_ignore_ascii_case("PLAIN") {
            return Err(Error::AuthNotImplemented(request.method.clone()));
        }

        let throttle_key = format!("auth:{}", normalize_login(&request.username));
        if self.counters.get(&throttle_key) >= self.config.failure_limit {
            warn!(
                connection = %session.id,
                method = %request.method,
                username = %request.username,
                outcome = "throttled",
                "authentication refused"
            );
            return Err(Error::AuthFailed);
        }

        let user = self.users.by_login(&request.username).await?;
        let verified = match &user {
            Some(user) => self.users.verify_password(user.id, &request.password).await?,
            None => false,
        };
        let Some(user) = user.filter(|_| verified) else {
            self.counters.bump(&throttle_key, self.config.failure_window);
            warn!(
                connection = %session.id,
                method = %request.method,
                username = %request.username,
                outcome = "invalid_credentials",
                "authentication failed"
            );
            return Err(Error::AuthFailed);
        };

        self.counters.clear(&throttle_key);
        info!(
            connection = %session.id,
            method = %request.method,
            username = %user.username,
            user = user.id.0,
            outcome = "success",
            "authenticated"
        );
        Ok(AuthenticatedUser {
            id: user.id,
            username: user.username,
        })
    }

    /// Parses a PLAIN token and authenticates it.
    ///
    /// # Errors
    ///
    /// [`Error::AuthBadArgument`] for a malformed token, plus everything
    /// [`Authenticator::on_auth`] returns.
    pub async fn authenticate_plain(
        &self,
        token: &str,
        session: &SessionInfo,
    ) -> Result<AuthenticatedUser> {
        let credentials = parse_plain(token)?;
        self.on_auth(
            &AuthRequest {
                method: "PLAIN".to_string(),
                username: credentials.username,
                password: credentials.password,
            },
            session,
        )
        .await
    }
}
