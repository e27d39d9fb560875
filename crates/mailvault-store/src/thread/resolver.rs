//! Thread resolution.
//!
//! A conversation is keyed per user by the normalized subject plus a set of
//! hashed reference ids. A new message joins an existing thread when the
//! subjects match and at least one reference id overlaps; otherwise it
//! starts a fresh thread. Resolution is an upsert, so threads only ever
//! grow their reference sets.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha1::{Digest, Sha1};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::config::MAX_THREAD_REFS;
use crate::types::{ThreadId, UserId};
use crate::Result;

/// Repository and resolver for conversation threads.
#[derive(Debug, Clone)]
pub struct ThreadResolver {
    pool: SqlitePool,
}

impl ThreadResolver {
    /// Creates a resolver over an existing pool.
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
            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user INTEGER NOT NULL,
                subject TEXT NOT NULL,
                updated TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS thread_refs (
                thread INTEGER NOT NULL,
                ref_id TEXT NOT NULL,
                UNIQUE(thread, ref_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS idx_thread_refs_ref ON thread_refs(ref_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Resolves the thread for a message, inserting one if none matches.
    ///
    /// `subject` must already be normalized; `references` are the raw
    /// reference strings collected from the message headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn resolve(
        &self,
        user: UserId,
        subject: &str,
        references: &[String],
    ) -> Result<ThreadId> {
        let ids = reference_hashes(references);

        if let Some(found) = self.find(user, subject, &ids).await? {
            self.extend(found, &ids).await?;
            return Ok(found);
        }

        let row = sqlx::query(
            r"INSERT INTO threads (user, subject, updated) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(user.0)
        .bind(subject)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let id = ThreadId(row.get("id"));
        self.extend(id, &ids).await?;
        Ok(id)
    }

    async fn find(&self, user: UserId, subject: &str, ids: &[String]) -> Result<Option<ThreadId>> {
        if ids.is_empty() {
            return Ok(None);
        }

        let query = format!(
            r"
            SELECT t.id FROM threads t
            JOIN thread_refs r ON r.thread = t.id
            WHERE t.user = ? AND t.subject = ? AND r.ref_id IN ({})
            LIMIT 1
            ",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&query).bind(user.0).bind(subject);
        for id in ids {
            q = q.bind(id);
        }
        let row = q.fetch_optional(&self.pool).await?;

        Ok(row.map(|row| ThreadId(row.get("id"))))
    }

    async fn extend(&self, thread: ThreadId, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query(r"INSERT OR IGNORE INTO thread_refs (thread, ref_id) VALUES (?, ?)")
                .bind(thread.0)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(r"UPDATE threads SET updated = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(thread.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Hashes raw reference strings into the compact ids stored on a thread.
///
/// Each input is whitespace-split, angle-bracket-stripped, SHA-1-hashed and
/// base64-encoded without padding; the result is deduplicated and capped.
#[must_use]
pub fn reference_hashes(references: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for reference in references {
        for token in reference.split_whitespace() {
            let stripped = token.trim_matches(|c| c == '<' || c == '>');
            if stripped.is_empty() {
                continue;
            }
            let digest = Sha1::digest(stripped.as_bytes());
            let encoded = STANDARD_NO_PAD.encode(digest);
            if !out.contains(&encoded) {
                out.push(encoded);
            }
            if out.len() >= MAX_THREAD_REFS {
                return out;
            }
        }
    }
    out
}

/// Normalizes a subject for thread matching.
///
/// Strips leading `re:` / `fwd:` / `fw:` / `(fwd)` markers repeatedly and
/// collapses runs of whitespace into single spaces.
#[must_use]
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let Some(rest) = ["re:", "fwd:", "fw:", "(fwd)"]
            .iter()
            .find_map(|marker| strip_prefix_ci(s, marker))
        else {
            break;
        };
        s = rest.trim();
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// ASCII-case-insensitive prefix strip; the markers are all ASCII.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
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

    async fn resolver() -> ThreadResolver {
        let resolver = ThreadResolver::new(test_pool().await);
        resolver.initialize().await.unwrap();
        resolver
    }

    mod subject_tests {
        use super::*;

        #[test]
        fn strips_reply_and_forward_prefixes_repeatedly() {
            assert_eq!(normalize_subject("Re: RE: Fwd: hello"), "hello");
            assert_eq!(normalize_subject("(fwd) FW: meeting notes"), "meeting notes");
        }

        #[test]
        fn collapses_whitespace() {
            assert_eq!(normalize_subject("  hello \t there\n world "), "hello there world");
        }

        #[test]
        fn plain_subject_passes_through() {
            assert_eq!(normalize_subject("hello"), "hello");
        }
    }

    mod hash_tests {
        use super::*;

        #[test]
        fn strips_angle_brackets_and_dedups() {
            let hashes = reference_hashes(&["<a@x> <b@x>".to_string(), "<a@x>".to_string()]);
            assert_eq!(hashes.len(), 2);
            // No padding characters survive encoding.
            assert!(hashes.iter().all(|h| !h.contains('=')));
        }

        #[test]
        fn caps_the_set() {
            let refs: Vec<String> = (0..30).map(|i| format!("<{i}@x>")).collect();
            assert_eq!(reference_hashes(&refs).len(), MAX_THREAD_REFS);
        }

        #[test]
        fn same_id_hashes_identically() {
            let a = reference_hashes(&["<a@x>".to_string()]);
            let b = reference_hashes(&["a@x".to_string()]);
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn overlapping_refs_join_one_thread() {
        let resolver = resolver().await;
        let user = UserId::new(1);

        let first = resolver
            .resolve(user, "hello", &["<a@x>".to_string()])
            .await
            .unwrap();
        let second = resolver
            .resolve(user, "hello", &["<b@x>".to_string(), "<a@x>".to_string()])
            .await
            .unwrap();
        assert_eq!(first, second);

        // The thread's reference set grew, so <b@x> now matches too.
        let third = resolver
            .resolve(user, "hello", &["<b@x>".to_string()])
            .await
            .unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn different_subject_starts_a_new_thread() {
        let resolver = resolver().await;
        let user = UserId::new(1);

        let first = resolver
            .resolve(user, "hello", &["<a@x>".to_string()])
            .await
            .unwrap();
        let second = resolver
            .resolve(user, "goodbye", &["<a@x>".to_string()])
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn threads_are_scoped_per_user() {
        let resolver = resolver().await;

        let first = resolver
            .resolve(UserId::new(1), "hello", &["<a@x>".to_string()])
            .await
            .unwrap();
        let second = resolver
            .resolve(UserId::new(2), "hello", &["<a@x>".to_string()])
            .await
            .unwrap();
        assert_ne!(first, second);
    }
}
