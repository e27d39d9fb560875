//! Attachment blob repository.
//!
//! Records are keyed by `(hash, magic)`: the content hash plus the
//! per-delivery generation salt. The salt keeps independent deliveries from
//! sharing refcounts even when content hashes collide in practice, so a
//! record exists exactly while `ref_count > 0` for its own delivery
//! generation.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::Result;

/// An attachment body handed over by the MIME indexer.
#[derive(Debug, Clone)]
pub struct AttachmentPayload {
    /// Attachment id within the message's MIME tree (`attachment_map` key).
    pub id: String,
    /// Content hash, the storage key.
    pub hash: String,
    /// Decoded body bytes.
    pub data: Vec<u8>,
}

/// Repository for attachment records.
#[derive(Debug, Clone)]
pub struct AttachmentRepository {
    pool: SqlitePool,
}

impl AttachmentRepository {
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
            CREATE TABLE IF NOT EXISTS attachments (
                hash TEXT NOT NULL,
                magic TEXT NOT NULL,
                data BLOB NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (hash, magic)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores an attachment body, or raises the refcount of an existing
    /// record with the same `(hash, magic)` key. Returns the new refcount.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create(&self, hash: &str, magic: &str, data: &[u8]) -> Result<u64> {
        let row = sqlx::query(
            r"
            INSERT INTO attachments (hash, magic, data, ref_count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(hash, magic) DO UPDATE SET ref_count = ref_count + 1
            RETURNING ref_count
            ",
        )
        .bind(hash)
        .bind(magic)
        .bind(data)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(row.get::<i64, _>("ref_count")).unwrap_or(0))
    }

    /// Reads an attachment body.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, hash: &str, magic: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(r"SELECT data FROM attachments WHERE hash = ? AND magic = ?")
            .bind(hash)
            .bind(magic)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("data")))
    }

    /// Adjusts refcounts of many records by `delta`, for copy fan-out.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_many(&self, hashes: &[String], delta: i64, magic: &str) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }

        let query = format!(
            r"UPDATE attachments SET ref_count = ref_count + ? WHERE magic = ? AND hash IN ({})",
            placeholders(hashes.len())
        );
        let mut q = sqlx::query(&query).bind(delta).bind(magic);
        for hash in hashes {
            q = q.bind(hash);
        }
        q.execute(&self.pool).await?;

        Ok(())
    }

    /// Drops one reference from each record and deletes records whose
    /// refcount reaches zero.
    ///
    /// The delete is conditional on the stored refcount, not on a value
    /// read earlier, so a writer that re-referenced a record between the
    /// two statements keeps it alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_many(&self, hashes: &[String], magic: &str) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }

        self.update_many(hashes, -1, magic).await?;

        let query = format!(
            r"DELETE FROM attachments WHERE magic = ? AND ref_count <= 0 AND hash IN ({})",
            placeholders(hashes.len())
        );
        let mut q = sqlx::query(&query).bind(magic);
        for hash in hashes {
            q = q.bind(hash);
        }
        q.execute(&self.pool).await?;

        Ok(())
    }

    /// Returns the refcount under `(hash, magic)`, or 0 if no record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn ref_count(&self, hash: &str, magic: &str) -> Result<u64> {
        let row = sqlx::query(r"SELECT ref_count FROM attachments WHERE hash = ? AND magic = ?")
            .bind(hash)
            .bind(magic)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map_or(0, |row| {
            u64::try_from(row.get::<i64, _>("ref_count")).unwrap_or(0)
        }))
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    async fn repo() -> AttachmentRepository {
        let repo = AttachmentRepository::new(test_pool().await);
        repo.initialize().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn create_starts_at_one_and_increments() {
        let repo = repo().await;
        assert_eq!(repo.create("h1", "m1", b"body").await.unwrap(), 1);
        assert_eq!(repo.create("h1", "m1", b"body").await.unwrap(), 2);
        assert_eq!(repo.get("h1", "m1").await.unwrap().unwrap(), b"body");
    }

    #[tokio::test]
    async fn magic_scopes_refcounts() {
        let repo = repo().await;
        repo.create("h1", "m1", b"body").await.unwrap();
        repo.create("h1", "m2", b"body").await.unwrap();

        repo.delete_many(&["h1".to_string()], "m1").await.unwrap();
        assert_eq!(repo.ref_count("h1", "m1").await.unwrap(), 0);
        assert_eq!(repo.ref_count("h1", "m2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_many_removes_only_at_zero() {
        let repo = repo().await;
        repo.create("h1", "m1", b"a").await.unwrap();
        repo.create("h1", "m1", b"a").await.unwrap();
        repo.create("h2", "m1", b"b").await.unwrap();

        let hashes = vec!["h1".to_string(), "h2".to_string()];
        repo.delete_many(&hashes, "m1").await.unwrap();

        assert_eq!(repo.ref_count("h1", "m1").await.unwrap(), 1);
        assert_eq!(repo.ref_count("h2", "m1").await.unwrap(), 0);
        assert!(repo.get("h2", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_many_raises_for_copies() {
        let repo = repo().await;
        repo.create("h1", "m1", b"a").await.unwrap();
        repo.create("h2", "m1", b"b").await.unwrap();

        let hashes = vec!["h1".to_string(), "h2".to_string()];
        repo.update_many(&hashes, 1, "m1").await.unwrap();

        assert_eq!(repo.ref_count("h1", "m1").await.unwrap(), 2);
        assert_eq!(repo.ref_count("h2", "m1").await.unwrap(), 2);
    }
}
