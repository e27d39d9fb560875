//! Journal persistence and change fanout.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::model::{JournalEntry, JournalScope, StoredEntry};
use crate::mailbox::MailboxRegistry;
use crate::types::{MessageId, ModSeq, UserId};
use crate::Result;

/// A lightweight poke telling subscribers a user's journal grew.
#[derive(Debug, Clone)]
pub struct Pulse {
    /// The user whose journal changed.
    pub user: UserId,
    /// The mailbox path that changed.
    pub path: String,
}

/// Cross-process notification bus seam.
///
/// The store publishes pokes here after journal appends; live consumers
/// subscribe and tail the journal on each wake. [`LocalBus`] covers a
/// single process; a cross-process transport plugs in behind the same
/// trait.
pub trait PulseBus: Send + Sync {
    /// Publishes a poke.
    fn publish(&self, pulse: Pulse);

    /// Opens a subscription to all pokes.
    fn subscribe(&self) -> broadcast::Receiver<Pulse>;
}

/// In-process pulse bus over a broadcast channel.
#[derive(Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<Pulse>,
}

impl LocalBus {
    /// Creates a bus with the given subscriber buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PulseBus for LocalBus {
    fn publish(&self, pulse: Pulse) {
        // Nobody listening is fine.
        let _ = self.tx.send(pulse);
    }

    fn subscribe(&self) -> broadcast::Receiver<Pulse> {
        self.tx.subscribe()
    }
}

/// A session-scoped journal subscription.
pub trait JournalListener: Send + Sync {
    /// The subscribing session's id, matched against entry `ignore` tags.
    fn session_id(&self) -> &str;

    /// The user whose journal the session follows.
    fn user(&self) -> UserId;

    /// Called for each appended entry, in journal order.
    fn on_entry(&self, entry: &StoredEntry);
}

/// A listener that collects delivered entries for inspection.
#[derive(Debug)]
pub struct CollectingListener {
    session_id: String,
    user: UserId,
    entries: Mutex<Vec<StoredEntry>>,
}

impl CollectingListener {
    /// Creates a collecting listener.
    #[must_use]
    pub fn new(session_id: impl Into<String>, user: UserId) -> Self {
        Self {
            session_id: session_id.into(),
            user,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Takes all delivered entries, leaving the listener empty.
    pub fn take(&self) -> Vec<StoredEntry> {
        std::mem::take(&mut self.entries.lock().expect("entries lock"))
    }
}

impl JournalListener for CollectingListener {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn user(&self) -> UserId {
        self.user
    }

    fn on_entry(&self, entry: &StoredEntry) {
        self.entries.lock().expect("entries lock").push(entry.clone());
    }
}

/// Appends journal entries, stamps MODSEQs, and fans changes out.
#[derive(Clone)]
pub struct Notifier {
    pool: SqlitePool,
    registry: MailboxRegistry,
    bus: Arc<dyn PulseBus>,
    listeners: Arc<Mutex<Vec<Arc<dyn JournalListener>>>>,
}

impl Notifier {
    /// Creates a notifier over an existing pool and bus.
    #[must_use]
    pub fn new(pool: SqlitePool, registry: MailboxRegistry, bus: Arc<dyn PulseBus>) -> Self {
        Self {
            pool,
            registry,
            bus,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Initialize database schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user INTEGER NOT NULL,
                mailbox INTEGER NOT NULL,
                path TEXT NOT NULL,
                command TEXT NOT NULL,
                uid INTEGER,
                message TEXT,
                modseq INTEGER,
                unseen INTEGER,
                unseen_change INTEGER NOT NULL DEFAULT 0,
                flags TEXT,
                ignore_session TEXT,
                created TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS idx_journal_user ON journal(user, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Appends entries under a single scope.
    ///
    /// See [`Notifier::add_batch`] for the append semantics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn add_entries(
        &self,
        scope: &JournalScope,
        entries: Vec<JournalEntry>,
    ) -> Result<Vec<StoredEntry>> {
        self.add_batch(
            entries
                .into_iter()
                .map(|entry| (scope.clone(), entry))
                .collect(),
        )
        .await
    }

    /// Appends a batch of entries, each under its own scope, preserving
    /// the given order in the per-user journal.
    ///
    /// Entries that arrive without a MODSEQ (move clones) trigger one bump
    /// per distinct mailbox in the batch; the post-image stamps every such
    /// entry and restamps the touched message rows whose stored MODSEQ is
    /// lower. Mixed scopes let a move journal its `EXPUNGE` / `EXISTS`
    /// pairs adjacently while still paying one bump per mailbox per flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails. Callers on the hot
    /// path use [`Notifier::notify`] or [`Notifier::notify_batch`], which
    /// log instead: by the time the journal is written to, the state
    /// change already happened.
    pub async fn add_batch(
        &self,
        mut batch: Vec<(JournalScope, JournalEntry)>,
    ) -> Result<Vec<StoredEntry>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut assigned: std::collections::HashMap<i64, ModSeq> = std::collections::HashMap::new();
        for (scope, entry) in &batch {
            if entry.modseq.is_none() && !assigned.contains_key(&scope.mailbox.0) {
                let post = self.registry.bump(scope.mailbox).await?;
                assigned.insert(scope.mailbox.0, post.modify_index);
            }
        }
        for mailbox in assigned.keys().copied().collect::<Vec<_>>() {
            let modseq = assigned[&mailbox];
            let restamp: Vec<MessageId> = batch
                .iter()
                .filter(|(scope, entry)| scope.mailbox.0 == mailbox && entry.modseq.is_none())
                .filter_map(|(_, entry)| entry.message)
                .collect();
            let scope = batch
                .iter()
                .find(|(scope, _)| scope.mailbox.0 == mailbox)
                .map(|(scope, _)| scope.clone())
                .expect("mailbox came from this batch");
            self.restamp_messages(&scope, &restamp, modseq).await?;
        }
        for (scope, entry) in &mut batch {
            if entry.modseq.is_none() {
                entry.modseq = assigned.get(&scope.mailbox.0).copied();
            }
        }

        let created = Utc::now();
        let mut stored = Vec::with_capacity(batch.len());
        for (scope, entry) in batch {
            let row = sqlx::query(
                r"
                INSERT INTO journal
                    (user, mailbox, path, command, uid, message, modseq,
                     unseen, unseen_change, flags, ignore_session, created)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                ",
            )
            .bind(scope.user.0)
            .bind(scope.mailbox.0)
            .bind(&scope.path)
            .bind(entry.command.as_str())
            .bind(entry.uid.map(|u| i64::from(u.get())))
            .bind(entry.message.map(|m| m.to_string()))
            .bind(entry.modseq.map(|m| i64::try_from(m.get()).unwrap_or(i64::MAX)))
            .bind(entry.unseen)
            .bind(entry.unseen_change)
            .bind(
                entry
                    .flags
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(&entry.ignore_session)
            .bind(created.to_rfc3339())
            .fetch_one(&self.pool)
            .await?;

            stored.push(StoredEntry {
                id: row.get("id"),
                scope: scope.clone(),
                entry,
                created,
            });
        }

        self.fanout(&stored);
        Ok(stored)
    }

    /// Best-effort [`Notifier::add_entries`]: failures are logged, never
    /// bubbled, because the underlying state change already happened.
    pub async fn notify(&self, scope: &JournalScope, entries: Vec<JournalEntry>) {
        if let Err(error) = self.add_entries(scope, entries).await {
            warn!(user = scope.user.0, path = %scope.path, %error, "journal append failed");
        }
    }

    /// Best-effort [`Notifier::add_batch`].
    pub async fn notify_batch(&self, batch: Vec<(JournalScope, JournalEntry)>) {
        if let Err(error) = self.add_batch(batch).await {
            warn!(%error, "journal batch append failed");
        }
    }

    /// Publishes a poke for `(user, path)` on the bus.
    pub fn fire(&self, user: UserId, path: &str) {
        debug!(user = user.0, %path, "notifier fire");
        self.bus.publish(Pulse {
            user,
            path: path.to_string(),
        });
    }

    /// Registers a session-scoped listener.
    pub fn add_listener(&self, listener: Arc<dyn JournalListener>) {
        self.listeners.lock().expect("listeners lock").push(listener);
    }

    /// Removes all listeners registered under the session id.
    pub fn remove_listener(&self, session_id: &str) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .retain(|l| l.session_id() != session_id);
    }

    fn fanout(&self, stored: &[StoredEntry]) {
        let listeners = self.listeners.lock().expect("listeners lock").clone();
        for entry in stored {
            for listener in &listeners {
                if listener.user() != entry.scope.user {
                    continue;
                }
                // Origin suppression: the session that caused the change
                // already saw it on its own stream.
                if entry
                    .entry
                    .ignore_session
                    .as_deref()
                    .is_some_and(|ignored| ignored == listener.session_id())
                {
                    continue;
                }
                listener.on_entry(entry);
            }
        }
    }

    async fn restamp_messages(
        &self,
        scope: &JournalScope,
        messages: &[MessageId],
        modseq: ModSeq,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut placeholders = String::new();
        for i in 0..messages.len() {
            if i > 0 {
                placeholders.push(',');
            }
            placeholders.push('?');
        }
        let query = format!(
            r"UPDATE messages SET modseq = ? WHERE mailbox = ? AND modseq < ? AND id IN ({placeholders})"
        );
        let stamp = i64::try_from(modseq.get()).unwrap_or(i64::MAX);
        let mut q = sqlx::query(&query).bind(stamp).bind(scope.mailbox.0).bind(stamp);
        for message in messages {
            q = q.bind(message.to_string());
        }
        q.execute(&self.pool).await?;

        Ok(())
    }
}
