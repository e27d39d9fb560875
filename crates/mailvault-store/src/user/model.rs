//! User model types.

use crate::types::UserId;

/// A user account row.
///
/// Account provisioning lives outside the core; this is the surface the
/// message handler and the authentication hook need.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique identifier.
    pub id: UserId,
    /// Login name as provisioned.
    pub username: String,
    /// Normalized lookup key for the login name.
    pub unameview: String,
    /// Quota in bytes; 0 means unlimited.
    pub quota: u64,
    /// Bytes accounted to stored messages. May drift negative under
    /// concurrent rollbacks; clamp with [`User::storage_used`].
    pub storage_used_raw: i64,
    /// Subscriber public key for the optional encryption collaborator.
    pub pubkey: Option<String>,
}

impl User {
    /// Storage usage clamped at zero for presentation.
    #[must_use]
    pub fn storage_used(&self) -> u64 {
        u64::try_from(self.storage_used_raw).unwrap_or(0)
    }

    /// Whether storing `size` more bytes would exceed the quota.
    ///
    /// Always false for unlimited (zero-quota) accounts.
    #[must_use]
    pub fn would_exceed_quota(&self, size: u64) -> bool {
        self.quota > 0 && self.storage_used().saturating_add(size) > self.quota
    }
}

/// Parameters for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login name.
    pub username: String,
    /// Plaintext password, digested before storage.
    pub password: String,
    /// Quota in bytes; 0 means unlimited.
    pub quota: u64,
    /// Subscriber public key, if provisioned.
    pub pubkey: Option<String>,
}

/// Normalizes a login name into its lookup key.
///
/// Lower-cases, trims, and strips dots from the local part so that
/// `First.Last@example.com` and `firstlast@example.com` resolve to the
/// same account.
#[must_use]
pub fn normalize_login(username: &str) -> String {
    let trimmed = username.trim().to_lowercase();
    match trimmed.split_once('@') {
        Some((local, domain)) => format!("{}@{domain}", local.replace('.', "")),
        None => trimmed.replace('.', ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dots_in_local_part_only() {
        assert_eq!(
            normalize_login(" First.Last@Sub.Example.com "),
            "firstlast@sub.example.com"
        );
        assert_eq!(normalize_login("j.doe"), "jdoe");
    }

    #[test]
    fn storage_is_clamped_at_read() {
        let user = User {
            id: UserId::new(1),
            username: "alice".to_string(),
            unameview: "alice".to_string(),
            quota: 0,
            storage_used_raw: -42,
            pubkey: None,
        };
        assert_eq!(user.storage_used(), 0);
    }

    #[test]
    fn zero_quota_is_unlimited() {
        let user = User {
            id: UserId::new(1),
            username: "alice".to_string(),
            unameview: "alice".to_string(),
            quota: 0,
            storage_used_raw: i64::MAX,
            pubkey: None,
        };
        assert!(!user.would_exceed_quota(u64::MAX));
    }

    #[test]
    fn quota_check_counts_pending_size() {
        let user = User {
            id: UserId::new(1),
            username: "alice".to_string(),
            unameview: "alice".to_string(),
            quota: 100,
            storage_used_raw: 90,
            pubkey: None,
        };
        assert!(!user.would_exceed_quota(10));
        assert!(user.would_exceed_quota(11));
    }
}
