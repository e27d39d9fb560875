//! User storage repository.

use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::model::{normalize_login, NewUser, User};
use crate::types::UserId;
use crate::Result;

/// Repository for user rows and quota accounting.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Creates a repository over an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                unameview TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                quota INTEGER NOT NULL DEFAULT 0,
                storage_used INTEGER NOT NULL DEFAULT 0,
                pubkey TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Creates a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails, including unique
    /// violations on the login name.
    pub async fn create(&self, new: &NewUser) -> Result<User> {
        let unameview = normalize_login(&new.username);
        let digest = digest_password(&new.password);

        let row = sqlx::query(
            r"
            INSERT INTO users (username, unameview, password_digest, quota, pubkey)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, username, unameview, quota, storage_used, pubkey
            ",
        )
        .bind(&new.username)
        .bind(&unameview)
        .bind(&digest)
        .bind(i64::try_from(new.quota).unwrap_or(i64::MAX))
        .bind(&new.pubkey)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_user(&row))
    }

    /// Gets a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            r"
            SELECT id, username, unameview, quota, storage_used, pubkey
            FROM users WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_user))
    }

    /// Looks a user up by login name, via the normalized lookup key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn by_login(&self, login: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r"
            SELECT id, username, unameview, quota, storage_used, pubkey
            FROM users WHERE unameview = ?
            ",
        )
        .bind(normalize_login(login))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_user))
    }

    /// Checks a password against the stored digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn verify_password(&self, id: UserId, password: &str) -> Result<bool> {
        let row = sqlx::query(r"SELECT password_digest FROM users WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let stored: String = row.get("password_digest");
        Ok(verify_digest(&stored, password))
    }

    /// Checks whether storing `size` more bytes fits the user's quota.
    ///
    /// The core's delivery path does not refuse writes itself; outer
    /// collaborators (LMTP, APPEND) call this before handing a message
    /// over.
    ///
    /// # Errors
    ///
    /// [`crate::Error::QuotaExceeded`] when the write would not fit, or an
    /// error if the database query fails. An unknown user passes: quota is
    /// enforced only for provisioned accounts.
    pub async fn ensure_quota(&self, id: UserId, size: u64) -> Result<()> {
        let Some(user) = self.get(id).await? else {
            return Ok(());
        };
        if user.would_exceed_quota(size) {
            return Err(crate::Error::QuotaExceeded {
                used: user.storage_used(),
                quota: user.quota,
            });
        }
        Ok(())
    }

    /// Adjusts the user's storage accounting by `delta` bytes.
    ///
    /// The counter may transiently read negative under concurrent
    /// rollbacks; readers clamp. A missing user row is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn adjust_storage(&self, id: UserId, delta: i64) -> Result<()> {
        sqlx::query(r"UPDATE users SET storage_used = storage_used + ? WHERE id = ?")
            .bind(delta)
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Digests a password with a fresh random salt.
fn digest_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex(&salt);
    format!("{salt_hex}${}", hash_with_salt(&salt_hex, password))
}

fn verify_digest(stored: &str, password: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    hash_with_salt(salt, password) == digest
}

fn hash_with_salt(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: UserId::new(row.get("id")),
        username: row.get("username"),
        unameview: row.get("unameview"),
        quota: u64::try_from(row.get::<i64, _>("quota")).unwrap_or(0),
        storage_used_raw: row.get("storage_used"),
        pubkey: row.get("pubkey"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    async fn repo() -> UserRepository {
        let repo = UserRepository::new(test_pool().await);
        repo.initialize().await.unwrap();
        repo
    }

    fn alice() -> NewUser {
        NewUser {
            username: "Alice.Smith@example.com".to_string(),
            password: "hunter2".to_string(),
            quota: 0,
            pubkey: None,
        }
    }

    #[tokio::test]
    async fn create_and_lookup_by_login() {
        let repo = repo().await;
        let user = repo.create(&alice()).await.unwrap();
        assert_eq!(user.unameview, "alicesmith@example.com");

        let found = repo.by_login("alicesmith@EXAMPLE.com").await.unwrap();
        assert_eq!(found.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn password_verification() {
        let repo = repo().await;
        let user = repo.create(&alice()).await.unwrap();

        assert!(repo.verify_password(user.id, "hunter2").await.unwrap());
        assert!(!repo.verify_password(user.id, "wrong").await.unwrap());
        assert!(!repo
            .verify_password(UserId::new(999), "hunter2")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn quota_check_refuses_oversized_writes() {
        let repo = repo().await;
        let user = repo
            .create(&NewUser {
                quota: 1000,
                ..alice()
            })
            .await
            .unwrap();

        repo.ensure_quota(user.id, 1000).await.unwrap();
        repo.adjust_storage(user.id, 600).await.unwrap();
        let err = repo.ensure_quota(user.id, 500).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::QuotaExceeded { used: 600, quota: 1000 }
        ));
    }

    #[tokio::test]
    async fn storage_adjustments_accumulate_and_clamp() {
        let repo = repo().await;
        let user = repo.create(&alice()).await.unwrap();

        repo.adjust_storage(user.id, 1000).await.unwrap();
        repo.adjust_storage(user.id, -1500).await.unwrap();

        let user = repo.get(user.id).await.unwrap().unwrap();
        assert_eq!(user.storage_used_raw, -500);
        assert_eq!(user.storage_used(), 0);
    }
}
