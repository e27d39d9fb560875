//! Live updates feed.
//!
//! Serves one user's journal as a sequence of server-sent-event frames.
//! A consumer resumes from its last seen journal id, receives every later
//! entry in ascending order, then per-mailbox `COUNTERS` refreshes for the
//! mailboxes the drained entries dirtied. Keep-alive comments flow on an
//! idle stream so intermediaries do not cut the connection; a stream idle
//! past the configured timeout is torn down.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::debug;

use super::model::{JournalCommand, JournalEntry, JournalScope, StoredEntry};
use super::notifier::PulseBus;
use crate::config::StoreConfig;
use crate::mailbox::MailboxRegistry;
use crate::types::{Flags, MailboxId, MessageId, ModSeq, Uid, UserId};
use crate::Result;

/// One server-sent-event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A data event; `id` carries the journal sequence for resumption.
    Event {
        /// Journal id emitted as the SSE `id:` line; absent on synthetic
        /// events such as `COUNTERS`.
        id: Option<i64>,
        /// JSON payload for the `data:` line.
        data: String,
    },
    /// A comment line, used as keep-alive.
    Comment(String),
}

impl SseFrame {
    /// Renders the frame in SSE wire format.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Event { id: Some(id), data } => format!("id: {id}\ndata: {data}\n\n"),
            Self::Event { id: None, data } => format!("data: {data}\n\n"),
            Self::Comment(text) => format!(": {text}\n\n"),
        }
    }
}

/// Drains one user's journal into SSE frames.
#[derive(Clone)]
pub struct UpdatesFeed {
    pool: SqlitePool,
    registry: MailboxRegistry,
    bus: Arc<dyn PulseBus>,
    config: StoreConfig,
}

impl UpdatesFeed {
    /// Creates a feed over an existing pool and bus.
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        registry: MailboxRegistry,
        bus: Arc<dyn PulseBus>,
        config: StoreConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            bus,
            config,
        }
    }

    /// Drains journal entries with id beyond `last_id`.
    ///
    /// Returns the frames in journal order, with one `COUNTERS` event per
    /// dirtied mailbox appended, plus the new resume id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn drain(&self, user: UserId, last_id: i64) -> Result<(Vec<SseFrame>, i64)> {
        let entries = self.fetch_entries(user, last_id).await?;

        let mut frames = Vec::with_capacity(entries.len());
        let mut dirty: BTreeSet<i64> = BTreeSet::new();
        let mut resume = last_id;
        for stored in &entries {
            resume = resume.max(stored.id);
            match stored.entry.command {
                JournalCommand::Exists | JournalCommand::Expunge => {
                    dirty.insert(stored.scope.mailbox.0);
                }
                JournalCommand::Fetch if stored.entry.unseen_change => {
                    dirty.insert(stored.scope.mailbox.0);
                }
                _ => {}
            }
            frames.push(SseFrame::Event {
                id: Some(stored.id),
                data: stored.frame_payload().to_string(),
            });
        }

        for mailbox in dirty {
            let (total, unseen) = self.registry.message_counts(MailboxId::new(mailbox)).await?;
            let data = json!({
                "command": JournalCommand::Counters.as_str(),
                "mailbox": mailbox,
                "total": total,
                "unseen": unseen,
            });
            frames.push(SseFrame::Event {
                id: None,
                data: data.to_string(),
            });
        }

        Ok((frames, resume))
    }

    /// Runs a live stream for `user`, resuming after `last_event_id`.
    ///
    /// Frames are pushed into `tx`; the loop wakes on bus pokes for the
    /// user, emits `idling N` comments on the keep-alive interval, and
    /// exits when the receiver is dropped or the stream has been idle for
    /// the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if a journal drain fails.
    pub async fn run(
        &self,
        user: UserId,
        last_event_id: i64,
        tx: mpsc::Sender<SseFrame>,
    ) -> Result<()> {
        let mut rx = self.bus.subscribe();
        let mut resume = last_event_id;
        let mut idle_ticks: u64 = 0;
        let mut last_activity = Instant::now();
        let mut keepalive = interval(self.config.idle_comment_interval);
        // The first tick of a tokio interval fires immediately.
        keepalive.tick().await;

        resume = self.flush(user, resume, &tx).await?;

        loop {
            if last_activity.elapsed() >= self.config.idle_timeout {
                debug!(user = user.0, "updates stream idle timeout");
                return Ok(());
            }

            tokio::select! {
                pulse = rx.recv() => {
                    match pulse {
                        Ok(pulse) if pulse.user == user => {
                            let before = resume;
                            resume = self.flush(user, resume, &tx).await?;
                            if resume != before {
                                idle_ticks = 0;
                                last_activity = Instant::now();
                            }
                        }
                        // Lagged receivers just drain; a closed bus ends the stream.
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = keepalive.tick() => {
                    idle_ticks += 1;
                    let comment = SseFrame::Comment(format!("idling {idle_ticks}"));
                    if tx.send(comment).await.is_err() {
                        // Client disconnected.
                        return Ok(());
                    }
                }
                () = tx.closed() => return Ok(()),
            }
        }
    }

    async fn flush(&self, user: UserId, resume: i64, tx: &mpsc::Sender<SseFrame>) -> Result<i64> {
        let (frames, resume) = self.drain(user, resume).await?;
        for frame in frames {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        Ok(resume)
    }

    async fn fetch_entries(&self, user: UserId, last_id: i64) -> Result<Vec<StoredEntry>> {
        let rows = sqlx::query(
            r"
            SELECT id, user, mailbox, path, command, uid, message, modseq,
                   unseen, unseen_change, flags, ignore_session, created
            FROM journal
            WHERE user = ? AND id > ?
            ORDER BY id ASC
            ",
        )
        .bind(user.0)
        .bind(last_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let flags: Option<String> = row.get("flags");
            let flags: Option<Flags> = flags
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            let created: String = row.get("created");
            entries.push(StoredEntry {
                id: row.get("id"),
                scope: JournalScope {
                    user: UserId::new(row.get("user")),
                    mailbox: MailboxId::new(row.get("mailbox")),
                    path: row.get("path"),
                },
                entry: JournalEntry {
                    command: JournalCommand::parse(row.get("command"))
                        .unwrap_or(JournalCommand::Fetch),
                    uid: row
                        .get::<Option<i64>, _>("uid")
                        .and_then(|u| u32::try_from(u).ok())
                        .map(Uid::new),
                    message: row
                        .get::<Option<String>, _>("message")
                        .as_deref()
                        .and_then(MessageId::parse),
                    modseq: row
                        .get::<Option<i64>, _>("modseq")
                        .and_then(|m| u64::try_from(m).ok())
                        .map(ModSeq::new),
                    unseen: row.get("unseen"),
                    unseen_change: row.get("unseen_change"),
                    flags,
                    ignore_session: row.get("ignore_session"),
                },
                created: chrono::DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::journal::{LocalBus, Notifier};
    use crate::mailbox::NewMailbox;
    use crate::store::test_pool;

    async fn setup() -> (Notifier, UpdatesFeed, Arc<LocalBus>, MailboxId) {
        let pool = test_pool().await;
        let registry = MailboxRegistry::new(pool.clone());
        registry.initialize().await.unwrap();
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS messages (
                id TEXT, mailbox INTEGER, uid INTEGER, modseq INTEGER DEFAULT 0, unseen INTEGER DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mailbox = registry
            .create(&NewMailbox {
                user: UserId::new(1),
                path: "INBOX".to_string(),
                special_use: None,
                retention: 0,
            })
            .await
            .unwrap();

        let bus = Arc::new(LocalBus::default());
        let notifier = Notifier::new(pool.clone(), registry.clone(), bus.clone());
        notifier.initialize().await.unwrap();
        let feed = UpdatesFeed::new(pool, registry, bus.clone(), StoreConfig::default());
        (notifier, feed, bus, mailbox.id)
    }

    fn scope(mailbox: MailboxId) -> JournalScope {
        JournalScope {
            user: UserId::new(1),
            mailbox,
            path: "INBOX".to_string(),
        }
    }

    #[tokio::test]
    async fn drain_replays_in_order_with_counters() {
        let (notifier, feed, _bus, mailbox) = setup().await;
        let message = MessageId::generate();

        let stored = notifier
            .add_entries(
                &scope(mailbox),
                vec![
                    JournalEntry::exists(Uid::new(1), message, Some(ModSeq::new(1)), true),
                    JournalEntry::exists(Uid::new(2), message, Some(ModSeq::new(2)), true),
                ],
            )
            .await
            .unwrap();

        let (frames, resume) = feed.drain(UserId::new(1), 0).await.unwrap();
        assert_eq!(resume, stored[1].id);
        // Two events plus one COUNTERS for the single dirty mailbox.
        assert_eq!(frames.len(), 3);
        let SseFrame::Event { id, data } = &frames[0] else {
            panic!("expected event frame");
        };
        assert_eq!(*id, Some(stored[0].id));
        assert!(data.contains("\"EXISTS\""));
        let SseFrame::Event { id: None, data } = &frames[2] else {
            panic!("expected synthetic counters frame");
        };
        assert!(data.contains("\"COUNTERS\""));
    }

    #[tokio::test]
    async fn drain_resumes_exactly_after_last_id() {
        let (notifier, feed, _bus, mailbox) = setup().await;
        let message = MessageId::generate();

        let stored = notifier
            .add_entries(
                &scope(mailbox),
                vec![
                    JournalEntry::exists(Uid::new(1), message, Some(ModSeq::new(1)), false),
                    JournalEntry::exists(Uid::new(2), message, Some(ModSeq::new(2)), false),
                ],
            )
            .await
            .unwrap();

        let (frames, _) = feed.drain(UserId::new(1), stored[0].id).await.unwrap();
        let event_ids: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                SseFrame::Event { id: Some(id), .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(event_ids, vec![stored[1].id]);
    }

    #[tokio::test]
    async fn fetch_without_unseen_change_emits_no_counters() {
        let (notifier, feed, _bus, mailbox) = setup().await;
        let message = MessageId::generate();

        notifier
            .add_entries(
                &scope(mailbox),
                vec![JournalEntry::fetch(
                    Uid::new(1),
                    message,
                    ModSeq::new(1),
                    Flags::new(),
                    false,
                )],
            )
            .await
            .unwrap();

        let (frames, _) = feed.drain(UserId::new(1), 0).await.unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn live_stream_emits_idle_comments() {
        let (_notifier, feed, _bus, _mailbox) = setup().await;
        let (tx, mut rx) = mpsc::channel(16);

        let handle = tokio::spawn({
            let feed = feed.clone();
            async move { feed.run(UserId::new(1), 0, tx).await }
        });

        tokio::time::sleep(std::time::Duration::from_secs(16)).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, SseFrame::Comment("idling 1".to_string()));

        tokio::time::sleep(std::time::Duration::from_secs(15)).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, SseFrame::Comment("idling 2".to_string()));

        drop(rx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_stream_times_out_when_idle() {
        let (_notifier, feed, _bus, _mailbox) = setup().await;
        let (tx, mut rx) = mpsc::channel(1024);

        let handle = tokio::spawn({
            let feed = feed.clone();
            async move { feed.run(UserId::new(1), 0, tx).await }
        });

        tokio::time::sleep(std::time::Duration::from_secs(31 * 60)).await;
        handle.await.unwrap().unwrap();
        // Only keep-alive comments flowed.
        while let Some(frame) = rx.recv().await {
            assert!(matches!(frame, SseFrame::Comment(_)));
        }
    }

    #[test]
    fn wire_format() {
        let event = SseFrame::Event {
            id: Some(7),
            data: "{}".to_string(),
        };
        assert_eq!(event.to_wire(), "id: 7\ndata: {}\n\n");
        assert_eq!(
            SseFrame::Comment("idling 1".to_string()).to_wire(),
            ": idling 1\n\n"
        );
    }
}
