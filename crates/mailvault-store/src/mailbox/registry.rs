//! Mailbox storage and the slot-reservation primitive.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::model::{Mailbox, NewMailbox, ReservedSlot};
use crate::types::{MailboxId, ModSeq, SpecialUse, Uid, UidValidity, UserId};
use crate::{Error, Result};

const MAILBOX_COLUMNS: &str =
    "id, user, path, special_use, subscribed, uid_validity, uid_next, modify_index, retention";

/// Repository for mailbox rows.
///
/// Owns the two counters IMAP correctness hangs on: `uid_next` and
/// `modify_index`. Both are only ever advanced through single atomic
/// updates that return the post-image, so concurrent writers on separate
/// connections always observe distinct, strictly increasing values.
#[derive(Debug, Clone)]
pub struct MailboxRegistry {
    pool: SqlitePool,
}

impl MailboxRegistry {
    /// Creates a registry over an existing pool.
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
            CREATE TABLE IF NOT EXISTS mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user INTEGER NOT NULL,
                path TEXT NOT NULL,
                special_use TEXT,
                subscribed INTEGER NOT NULL DEFAULT 1,
                uid_validity INTEGER NOT NULL,
                uid_next INTEGER NOT NULL DEFAULT 1,
                modify_index INTEGER NOT NULL DEFAULT 0,
                retention INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user, path)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Creates a mailbox with a fresh UIDVALIDITY.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails, including unique
    /// violations on `(user, path)`.
    pub async fn create(&self, new: &NewMailbox) -> Result<Mailbox> {
        let uid_validity = generate_uid_validity();

        let row = sqlx::query(&format!(
            r"
            INSERT INTO mailboxes (user, path, special_use, uid_validity, retention)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {MAILBOX_COLUMNS}
            "
        ))
        .bind(new.user.0)
        .bind(&new.path)
        .bind(new.special_use.map(SpecialUse::as_str))
        .bind(i64::from(uid_validity.get()))
        .bind(i64::try_from(new.retention).unwrap_or(i64::MAX))
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_mailbox(&row))
    }

    /// Gets a mailbox by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            r"SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_mailbox))
    }

    /// Gets a mailbox by `(user, path)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn by_path(&self, user: UserId, path: &str) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            r"SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE user = ? AND path = ?"
        ))
        .bind(user.0)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_mailbox))
    }

    /// Gets the user's mailbox carrying the given special-use role.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn by_special_use(
        &self,
        user: UserId,
        special_use: SpecialUse,
    ) -> Result<Option<Mailbox>> {
        let row = sqlx::query(&format!(
            r"SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE user = ? AND special_use = ?"
        ))
        .bind(user.0)
        .bind(special_use.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_mailbox))
    }

    /// Atomically reserves the next UID and MODSEQ for a message insert.
    ///
    /// Both counters advance by one in a single update; the returned slot
    /// carries the assigned values and the mailbox post-image. Reservation
    /// and the message insert form one logical transaction: an insert
    /// failure abandons the UID, which IMAP permits (UIDs must be
    /// monotonic, not dense).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxMissing`] if the mailbox row is absent, or
    /// an error if the database query fails.
    pub async fn reserve_slot(&self, id: MailboxId) -> Result<ReservedSlot> {
        let row = sqlx::query(&format!(
            r"
            UPDATE mailboxes
            SET uid_next = uid_next + 1, modify_index = modify_index + 1
            WHERE id = ?
            RETURNING {MAILBOX_COLUMNS}
            "
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(Error::MailboxMissing);
        };
        let mailbox = row_to_mailbox(&row);
        let uid = Uid::new(mailbox.uid_next - 1);
        let modseq = mailbox.modify_index;
        Ok(ReservedSlot {
            uid,
            modseq,
            mailbox,
        })
    }

    /// Advances only the MODSEQ tip, for mutations that allocate no UID.
    ///
    /// Returns the mailbox post-image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxMissing`] if the mailbox row is absent, or
    /// an error if the database query fails.
    pub async fn bump(&self, id: MailboxId) -> Result<Mailbox> {
        let row = sqlx::query(&format!(
            r"
            UPDATE mailboxes
            SET modify_index = modify_index + 1
            WHERE id = ?
            RETURNING {MAILBOX_COLUMNS}
            "
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(row_to_mailbox)
            .ok_or(Error::MailboxMissing)
    }

    /// Sets the subscription bit on `(user, path)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MailboxNotFound`] if no such mailbox exists, or an
    /// error if the database query fails.
    pub async fn set_subscribed(&self, user: UserId, path: &str, subscribed: bool) -> Result<()> {
        let result = sqlx::query(r"UPDATE mailboxes SET subscribed = ? WHERE user = ? AND path = ?")
            .bind(subscribed)
            .bind(user.0)
            .bind(path)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MailboxNotFound);
        }
        Ok(())
    }

    /// Returns the mailbox's UIDs sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn uid_list(&self, id: MailboxId) -> Result<Vec<Uid>> {
        let rows = sqlx::query(r"SELECT uid FROM messages WHERE mailbox = ? ORDER BY uid ASC")
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Uid::new(u32::try_from(row.get::<i64, _>("uid")).unwrap_or(0)))
            .collect())
    }

    /// Returns `(total, unseen)` message counts for the mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn message_counts(&self, id: MailboxId) -> Result<(u64, u64)> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS total, COALESCE(SUM(unseen), 0) AS unseen
            FROM messages WHERE mailbox = ?
            ",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;

        let total = u64::try_from(row.get::<i64, _>("total")).unwrap_or(0);
        let unseen = u64::try_from(row.get::<i64, _>("unseen")).unwrap_or(0);
        Ok((total, unseen))
    }
}

/// UIDVALIDITY from the epoch-seconds clock, jittered so mailboxes created
/// within the same second still differ.
fn generate_uid_validity() -> UidValidity {
    let seconds = u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX);
    let jitter = u32::from(rand::random::<u8>() & 0x0f);
    UidValidity::new(seconds.wrapping_add(jitter).max(1))
}

fn row_to_mailbox(row: &sqlx::sqlite::SqliteRow) -> Mailbox {
    Mailbox {
        id: MailboxId::new(row.get("id")),
        user: UserId::new(row.get("user")),
        path: row.get("path"),
        special_use: row
            .get::<Option<String>, _>("special_use")
            .as_deref()
            .and_then(SpecialUse::parse),
        subscribed: row.get("subscribed"),
        uid_validity: UidValidity::new(u32::try_from(row.get::<i64, _>("uid_validity")).unwrap_or(1)),
        uid_next: u32::try_from(row.get::<i64, _>("uid_next")).unwrap_or(1),
        modify_index: ModSeq::new(u64::try_from(row.get::<i64, _>("modify_index")).unwrap_or(0)),
        retention: u64::try_from(row.get::<i64, _>("retention")).unwrap_or(0),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    async fn registry() -> MailboxRegistry {
        let pool = test_pool().await;
        let registry = MailboxRegistry::new(pool.clone());
        registry.initialize().await.unwrap();
        // uid_list / message_counts read the messages table.
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS messages (
                mailbox INTEGER, uid INTEGER, unseen INTEGER DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        registry
    }

    fn inbox(user: i64) -> NewMailbox {
        NewMailbox {
            user: UserId::new(user),
            path: "INBOX".to_string(),
            special_use: Some(SpecialUse::Inbox),
            retention: 0,
        }
    }

    #[tokio::test]
    async fn create_sets_uid_validity_once() {
        let registry = registry().await;
        let mailbox = registry.create(&inbox(1)).await.unwrap();
        assert!(mailbox.uid_validity.get() > 0);
        assert_eq!(mailbox.uid_next, 1);
        assert_eq!(mailbox.modify_index, ModSeq::new(0));

        let reloaded = registry.get(mailbox.id).await.unwrap().unwrap();
        assert_eq!(reloaded.uid_validity, mailbox.uid_validity);
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected() {
        let registry = registry().await;
        registry.create(&inbox(1)).await.unwrap();
        assert!(registry.create(&inbox(1)).await.is_err());
        // Same path for another user is fine.
        registry.create(&inbox(2)).await.unwrap();
    }

    #[tokio::test]
    async fn reserve_slot_advances_both_counters() {
        let registry = registry().await;
        let mailbox = registry.create(&inbox(1)).await.unwrap();

        let first = registry.reserve_slot(mailbox.id).await.unwrap();
        assert_eq!(first.uid, Uid::new(1));
        assert_eq!(first.modseq, ModSeq::new(1));
        assert_eq!(first.mailbox.uid_next, 2);

        let second = registry.reserve_slot(mailbox.id).await.unwrap();
        assert_eq!(second.uid, Uid::new(2));
        assert_eq!(second.modseq, ModSeq::new(2));
    }

    #[tokio::test]
    async fn reserved_uids_are_strictly_increasing() {
        let registry = registry().await;
        let mailbox = registry.create(&inbox(1)).await.unwrap();

        let mut last = 0;
        for _ in 0..50 {
            let slot = registry.reserve_slot(mailbox.id).await.unwrap();
            assert!(slot.uid.get() > last);
            assert!(slot.uid.get() < slot.mailbox.uid_next);
            last = slot.uid.get();
        }
    }

    #[tokio::test]
    async fn bump_advances_only_modify_index() {
        let registry = registry().await;
        let mailbox = registry.create(&inbox(1)).await.unwrap();

        let bumped = registry.bump(mailbox.id).await.unwrap();
        assert_eq!(bumped.modify_index, ModSeq::new(1));
        assert_eq!(bumped.uid_next, 1);
    }

    #[tokio::test]
    async fn missing_mailbox_is_reported() {
        let registry = registry().await;
        assert!(matches!(
            registry.reserve_slot(MailboxId::new(404)).await,
            Err(Error::MailboxMissing)
        ));
        assert!(matches!(
            registry.bump(MailboxId::new(404)).await,
            Err(Error::MailboxMissing)
        ));
    }

    #[tokio::test]
    async fn lookup_by_special_use() {
        let registry = registry().await;
        registry.create(&inbox(1)).await.unwrap();
        registry
            .create(&NewMailbox {
                user: UserId::new(1),
                path: "Junk".to_string(),
                special_use: Some(SpecialUse::Junk),
                retention: 0,
            })
            .await
            .unwrap();

        let junk = registry
            .by_special_use(UserId::new(1), SpecialUse::Junk)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(junk.path, "Junk");
        assert!(junk.is_junk());
    }

    #[tokio::test]
    async fn subscription_toggle() {
        let registry = registry().await;
        let mailbox = registry.create(&inbox(1)).await.unwrap();
        assert!(mailbox.subscribed);

        registry
            .set_subscribed(UserId::new(1), "INBOX", false)
            .await
            .unwrap();
        let reloaded = registry.get(mailbox.id).await.unwrap().unwrap();
        assert!(!reloaded.subscribed);

        assert!(matches!(
            registry.set_subscribed(UserId::new(1), "Nope", true).await,
            Err(Error::MailboxNotFound)
        ));
    }
}
