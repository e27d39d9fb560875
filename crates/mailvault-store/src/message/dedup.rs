//! Duplicate delivery detection.
//!
//! A delivery is a duplicate when the target mailbox already holds a
//! message with the same `(hdate, msgid)` identity under a live UID. The
//! handler then either skips the delivery or replaces the UID in place,
//! keeping the document id and stored body.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::mailbox::Mailbox;
use crate::types::{MessageId, Uid};
use crate::Result;

/// The prior message a duplicate probe located.
#[derive(Debug, Clone)]
pub struct ExistingMessage {
    /// Document id, preserved across the replace.
    pub id: MessageId,
    /// The UID the prior delivery occupies.
    pub uid: Uid,
    /// Whether the prior message counts as unseen.
    pub unseen: bool,
}

/// Locates prior deliveries of the same message.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    pool: SqlitePool,
}

impl DuplicateDetector {
    /// Creates a detector over an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Probes the mailbox for a message with identical `(hdate, msgid)`
    /// under a UID in `(0, uid_next)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn probe(
        &self,
        mailbox: &Mailbox,
        hdate: DateTime<Utc>,
        msgid: &str,
    ) -> Result<Option<ExistingMessage>> {
        let row = sqlx::query(
            r"
            SELECT id, uid, unseen FROM messages
            WHERE mailbox = ? AND hdate = ? AND msgid = ? AND uid > 0 AND uid < ?
            LIMIT 1
            ",
        )
        .bind(mailbox.id.0)
        .bind(hdate.to_rfc3339())
        .bind(msgid)
        .bind(i64::from(mailbox.uid_next))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let id = MessageId::parse(&row.get::<String, _>("id"))?;
            Some(ExistingMessage {
                id,
                uid: Uid::new(u32::try_from(row.get::<i64, _>("uid")).unwrap_or(0)),
                unseen: row.get("unseen"),
            })
        }))
    }
}
