//! Message operations.
//!
//! Orchestrates `add`, `del`, `move`, `copy`, and bulk `update` against
//! the registry, attachment store, thread resolver, and notifier. Every
//! operation is a linear async function; multi-step writes keep an
//! explicit rollback list so a failure midway restores quota and drops
//! orphaned attachments before the error surfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use super::dedup::{DuplicateDetector, ExistingMessage};
use super::model::Message;
use super::prepare::{prepare, MimeIndexer, PreparedMessage};
use crate::attachment::AttachmentRepository;
use crate::config::StoreConfig;
use crate::journal::{JournalEntry, JournalScope, Notifier};
use crate::mailbox::{Mailbox, MailboxRegistry};
use crate::session::{SessionFrame, SessionSink};
use crate::thread::ThreadResolver;
use crate::types::{
    Flag, Flags, MailboxId, MessageId, ModSeq, SpecialUse, ThreadId, Uid, UidValidity, UserId,
};
use crate::user::UserRepository;
use crate::{Error, Result};

/// How a request names its target mailbox.
#[derive(Debug, Clone)]
pub enum MailboxTarget {
    /// By row id.
    Id(MailboxId),
    /// By full path.
    Path(String),
    /// By special-use role.
    SpecialUse(SpecialUse),
}

/// The message body handed to [`MessageHandler::add`].
pub enum MessageSource {
    /// Raw RFC 5322 bytes, parsed through the configured MIME indexer.
    Raw(Vec<u8>),
    /// A pre-parsed bundle with all derived fields computed.
    Prepared(Box<PreparedMessage>),
}

/// Parameters for [`MessageHandler::add`].
pub struct AddRequest {
    /// Owning user.
    pub user: UserId,
    /// Target mailbox.
    pub mailbox: MailboxTarget,
    /// The message body.
    pub source: MessageSource,
    /// Initial flags.
    pub flags: Flags,
    /// Skip the delivery when a duplicate already exists.
    pub skip_existing: bool,
    /// Originating session, for synchronous frames and origin suppression.
    pub session: Option<Arc<dyn SessionSink>>,
    /// Internal date override; defaults to now.
    pub idate: Option<DateTime<Utc>>,
}

/// How an `add` concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    /// A fresh message was inserted.
    New,
    /// A duplicate was replaced in place under a new UID.
    Update,
    /// A duplicate existed and the delivery was skipped.
    Skip,
}

/// Result of [`MessageHandler::add`].
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// How the delivery concluded.
    pub status: AddStatus,
    /// The target mailbox's UIDVALIDITY.
    pub uid_validity: UidValidity,
    /// The UID the message sits under.
    pub uid: Uid,
    /// The message document id.
    pub id: MessageId,
    /// The target mailbox.
    pub mailbox: MailboxId,
}

/// Parameters for [`MessageHandler::del`].
pub struct DeleteRequest {
    /// Document id; the delete is keyed by `(id, mailbox, uid)`.
    pub id: MessageId,
    /// The mailbox holding the message.
    pub mailbox: MailboxId,
    /// The UID the message sits under.
    pub uid: Uid,
    /// Originating session.
    pub session: Option<Arc<dyn SessionSink>>,
}

/// Flag and expiry changes applied by `move` and `update`.
///
/// Each boolean key keeps its flag and mirror column in lockstep; the
/// `expires` key arms or disarms retention expiry.
#[derive(Debug, Clone, Default)]
pub struct FlagUpdates {
    /// `\Seen` present iff true; `unseen` column mirrors the negation.
    pub seen: Option<bool>,
    /// `\Deleted` present iff true; `undeleted` column mirrors the negation.
    pub deleted: Option<bool>,
    /// `\Flagged` present iff true.
    pub flagged: Option<bool>,
    /// `\Draft` present iff true.
    pub draft: Option<bool>,
    /// `Some(date)` arms expiry at `date`; `None` disarms it.
    pub expires: Option<Option<DateTime<Utc>>>,
}

impl FlagUpdates {
    /// True when no recognized change key is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.seen.is_none()
            && self.deleted.is_none()
            && self.flagged.is_none()
            && self.draft.is_none()
            && self.expires.is_none()
    }

    fn apply(&self, message: &mut Message) {
        if let Some(seen) = self.seen {
            message.flags.set(Flag::Seen, seen);
        }
        if let Some(deleted) = self.deleted {
            message.flags.set(Flag::Deleted, deleted);
        }
        if let Some(flagged) = self.flagged {
            message.flags.set(Flag::Flagged, flagged);
        }
        if let Some(draft) = self.draft {
            message.flags.set(Flag::Draft, draft);
        }
        if let Some(expires) = self.expires {
            match expires {
                Some(date) => {
                    message.exp = true;
                    message.rdate = Some(date);
                }
                None => {
                    message.exp = false;
                    message.rdate = None;
                }
            }
        }
        message.recompute_flag_columns();
    }
}

/// Parameters for [`MessageHandler::move_messages`].
pub struct MoveRequest {
    /// Owning user.
    pub user: UserId,
    /// Source mailbox; missing reports as `NONEXISTENT`.
    pub source: MailboxTarget,
    /// Destination mailbox; missing reports as `TRYCREATE`.
    pub destination: MailboxTarget,
    /// UIDs to move.
    pub uids: Vec<Uid>,
    /// Flag changes applied to each moved message.
    pub updates: Option<FlagUpdates>,
    /// Mark every moved message `\Seen`.
    pub mark_seen: bool,
    /// Originating session.
    pub session: Option<Arc<dyn SessionSink>>,
}

/// Result of a move: paired UID lists ordered by source UID ascending.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    /// The destination's UIDVALIDITY.
    pub uid_validity: UidValidity,
    /// Moved UIDs in the source mailbox.
    pub source_uids: Vec<Uid>,
    /// Corresponding UIDs in the destination, pairwise with `source_uids`.
    pub dest_uids: Vec<Uid>,
}

/// Parameters for [`MessageHandler::copy_messages`].
pub struct CopyRequest {
    /// Owning user.
    pub user: UserId,
    /// Source mailbox; missing reports as `NONEXISTENT`.
    pub source: MailboxTarget,
    /// Destination mailbox; missing reports as `TRYCREATE`.
    pub destination: MailboxTarget,
    /// UIDs to copy.
    pub uids: Vec<Uid>,
    /// Originating session.
    pub session: Option<Arc<dyn SessionSink>>,
}

/// Result of a copy: paired UID lists ordered by source UID ascending.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    /// The destination's UIDVALIDITY.
    pub uid_validity: UidValidity,
    /// Copied UIDs in the source mailbox.
    pub source_uids: Vec<Uid>,
    /// Corresponding UIDs in the destination, pairwise with `source_uids`.
    pub dest_uids: Vec<Uid>,
}

/// Parameters for [`MessageHandler::update_messages`].
pub struct UpdateRequest {
    /// Owning user.
    pub user: UserId,
    /// The mailbox to update in.
    pub mailbox: MailboxTarget,
    /// UIDs to touch.
    pub uids: Vec<Uid>,
    /// The changes; an empty set fails with `NothingChanged`.
    pub changes: FlagUpdates,
    /// Originating session.
    pub session: Option<Arc<dyn SessionSink>>,
}

/// Result of a bulk update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// Number of messages touched.
    pub updated: usize,
    /// The MODSEQ stamped onto every touched message.
    pub modseq: ModSeq,
}

/// Orchestrates message mutations.
#[derive(Clone)]
pub struct MessageHandler {
    pool: SqlitePool,
    config: StoreConfig,
    registry: MailboxRegistry,
    users: UserRepository,
    attachments: AttachmentRepository,
    threads: ThreadResolver,
    dedup: DuplicateDetector,
    notifier: Notifier,
    indexer: Arc<dyn MimeIndexer>,
}

impl MessageHandler {
    /// Creates a handler over the shared components.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        config: StoreConfig,
        registry: MailboxRegistry,
        users: UserRepository,
        attachments: AttachmentRepository,
        threads: ThreadResolver,
        notifier: Notifier,
        indexer: Arc<dyn MimeIndexer>,
    ) -> Self {
        Self {
            dedup: DuplicateDetector::new(pool.clone()),
            pool,
            config,
            registry,
            users,
            attachments,
            threads,
            notifier,
            indexer,
        }
    }

    /// Initialize database schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                root TEXT NOT NULL,
                mailbox INTEGER NOT NULL,
                user INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                thread INTEGER NOT NULL,
                modseq INTEGER NOT NULL DEFAULT 0,
                flags TEXT NOT NULL DEFAULT '[]',
                unseen INTEGER NOT NULL DEFAULT 1,
                flagged INTEGER NOT NULL DEFAULT 0,
                undeleted INTEGER NOT NULL DEFAULT 1,
                draft INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL,
                idate TEXT NOT NULL,
                hdate TEXT NOT NULL,
                msgid TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                envelope TEXT,
                bodystructure TEXT,
                attachment_map TEXT NOT NULL DEFAULT '{}',
                headers TEXT NOT NULL DEFAULT '[]',
                intro TEXT NOT NULL DEFAULT '',
                text_body TEXT,
                html TEXT NOT NULL DEFAULT '[]',
                magic TEXT NOT NULL,
                searchable INTEGER NOT NULL DEFAULT 1,
                junk INTEGER NOT NULL DEFAULT 0,
                exp INTEGER NOT NULL DEFAULT 0,
                rdate TEXT,
                PRIMARY KEY (mailbox, uid)
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS idx_messages_id ON messages(id)")
            .execute(pool)
            .await?;
        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS idx_messages_dup ON messages(mailbox, hdate, msgid)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS idx_messages_modseq ON messages(mailbox, modseq)",
        )
        .execute(pool)
        .await?;
        sqlx::query(r"CREATE INDEX IF NOT EXISTS idx_messages_rdate ON messages(exp, rdate)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Delivers a message.
    ///
    /// Runs the full delivery pipeline: parse (for raw sources), mailbox
    /// resolution, duplicate probe, attachment persistence, quota
    /// accounting, slot reservation, thread resolution, insert, session
    /// frame, journal append, and notifier fire. A failure after the
    /// quota step restores the counter and drops the delivery's
    /// attachments before returning.
    ///
    /// # Errors
    ///
    /// [`Error::MailboxMissing`] when the target cannot be resolved
    /// (IMAP `TRYCREATE`), or the underlying store error.
    pub async fn add(&self, request: AddRequest) -> Result<AddOutcome> {
        let AddRequest {
            user,
            mailbox: target,
            source,
            flags,
            skip_existing,
            session,
            idate,
        } = request;

        let prepared = match source {
            MessageSource::Prepared(prepared) => *prepared,
            MessageSource::Raw(raw) => prepare(self.indexer.index(&raw)?, idate, &self.config),
        };

        let mailbox = self
            .resolve(user, &target)
            .await?
            .ok_or(Error::MailboxMissing)?;

        if let Some(existing) = self
            .dedup
            .probe(&mailbox, prepared.hdate, &prepared.msgid)
            .await?
        {
            if skip_existing {
                debug!(
                    mailbox = mailbox.id.0,
                    uid = existing.uid.get(),
                    msgid = %prepared.msgid,
                    "duplicate delivery skipped"
                );
                return Ok(AddOutcome {
                    status: AddStatus::Skip,
                    uid_validity: mailbox.uid_validity,
                    uid: existing.uid,
                    id: existing.id,
                    mailbox: mailbox.id,
                });
            }
            if let Some(outcome) = self
                .replace_in_place(&mailbox, &existing, &flags, session.as_ref())
                .await?
            {
                return Ok(outcome);
            }
            // The duplicate vanished between probe and replace; deliver fresh.
        }

        self.insert_fresh(&mailbox, prepared, flags, session.as_ref())
            .await
    }

    /// Deletes a message keyed by `(id, mailbox, uid)`.
    ///
    /// Returns false when no such document exists; a repeated delete is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn del(&self, request: DeleteRequest) -> Result<bool> {
        let DeleteRequest {
            id,
            mailbox: mailbox_id,
            uid,
            session,
        } = request;

        let Some(message) = self.message_by_uid(mailbox_id, uid).await? else {
            return Ok(false);
        };
        if message.id != id {
            return Ok(false);
        }

        let result = sqlx::query(r"DELETE FROM messages WHERE mailbox = ? AND uid = ? AND id = ?")
            .bind(mailbox_id.0)
            .bind(i64::from(uid.get()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.users
            .adjust_storage(message.user, -size_delta(message.size))
            .await?;
        self.attachments
            .delete_many(&message.attachment_hashes(), &message.magic)
            .await?;

        push_frame(session.as_ref(), mailbox_id, SessionFrame::Expunge(uid));
        if let Some(mailbox) = self.registry.get(mailbox_id).await? {
            let scope = mailbox_scope(&mailbox);
            let entry = JournalEntry::expunge(uid, message.id, message.unseen)
                .ignoring(session_id(session.as_ref()));
            self.notifier.notify(&scope, vec![entry]).await;
            self.notifier.fire(mailbox.user, &mailbox.path);
        }

        Ok(true)
    }

    /// Moves messages to another mailbox, ordered by source UID ascending.
    ///
    /// Each message is cloned under a new document id and a freshly
    /// reserved destination UID; its MODSEQ is stamped by the notifier at
    /// flush time. Entries flush every `bulk_batch_size` messages.
    /// Completed per-message steps are not rolled back on a later
    /// failure: interleaved `EXPUNGE` / `EXISTS` are observable.
    ///
    /// # Errors
    ///
    /// [`Error::MailboxNotFound`] for a missing source,
    /// [`Error::MailboxMissing`] for a missing destination, or the
    /// underlying store error.
    pub async fn move_messages(&self, request: MoveRequest) -> Result<MoveOutcome> {
        let MoveRequest {
            user,
            source,
            destination,
            mut uids,
            updates,
            mark_seen,
            session,
        } = request;

        let source = self
            .resolve(user, &source)
            .await?
            .ok_or(Error::MailboxNotFound)?;
        let dest = self
            .resolve(user, &destination)
            .await?
            .ok_or(Error::MailboxMissing)?;

        // Tip moves first so observers see the source changed even when
        // every per-message step is still in flight.
        self.registry.bump(source.id).await?;

        uids.sort_unstable();
        uids.dedup();

        let sid = session_id(session.as_ref()).map(str::to_string);
        let mut source_uids = Vec::new();
        let mut dest_uids = Vec::new();
        let mut batch: Vec<(JournalScope, JournalEntry)> = Vec::new();

        for chunk in uids.chunks(self.config.bulk_batch_size) {
            for message in self.messages_by_uids(source.id, chunk).await? {
                let slot = self.registry.reserve_slot(dest.id).await?;
                let old_uid = message.uid;
                let old_id = message.id;
                let old_unseen = message.unseen;

                let mut moved = message;
                moved.id = MessageId::generate();
                moved.mailbox = dest.id;
                moved.uid = slot.uid;
                moved.modseq = ModSeq::UNASSIGNED;
                moved.junk = dest.is_junk();
                let (exp, rdate) = retention_fields(&dest, Utc::now());
                moved.exp = exp;
                moved.rdate = rdate;
                if let Some(ref updates) = updates {
                    updates.apply(&mut moved);
                }
                // The auto-mark lands after caller updates so it has the
                // final say over an explicit `seen: false`.
                if mark_seen {
                    moved.flags.insert(Flag::Seen);
                }
                moved.recompute_flag_columns();
                moved.searchable = !dest.suppresses_search() && !moved.flags.is_deleted();

                self.insert_message(&moved).await?;
                sqlx::query(r"DELETE FROM messages WHERE mailbox = ? AND uid = ? AND id = ?")
                    .bind(source.id.0)
                    .bind(i64::from(old_uid.get()))
                    .bind(old_id.to_string())
                    .execute(&self.pool)
                    .await?;

                push_frame(session.as_ref(), source.id, SessionFrame::Expunge(old_uid));
                push_frame(session.as_ref(), dest.id, SessionFrame::Exists(slot.uid));

                batch.push((
                    mailbox_scope(&source),
                    JournalEntry::expunge(old_uid, old_id, old_unseen).ignoring(sid.as_deref()),
                ));
                batch.push((
                    mailbox_scope(&dest),
                    JournalEntry::exists(slot.uid, moved.id, None, moved.unseen)
                        .ignoring(sid.as_deref()),
                ));

                source_uids.push(old_uid);
                dest_uids.push(slot.uid);
            }

            self.flush_move_batch(&mut batch, &source, &dest).await;
        }
        self.flush_move_batch(&mut batch, &source, &dest).await;

        Ok(MoveOutcome {
            uid_validity: dest.uid_validity,
            source_uids,
            dest_uids,
        })
    }

    /// Copies messages to another mailbox, ordered by source UID ascending.
    ///
    /// Clones keep their `root` ancestry and attachment references; each
    /// referenced attachment gains one refcount and the user's storage
    /// accounting grows by each copied size.
    ///
    /// # Errors
    ///
    /// [`Error::MailboxNotFound`] for a missing source,
    /// [`Error::MailboxMissing`] for a missing destination, or the
    /// underlying store error.
    pub async fn copy_messages(&self, request: CopyRequest) -> Result<CopyOutcome> {
        let CopyRequest {
            user,
            source,
            destination,
            mut uids,
            session,
        } = request;

        let source = self
            .resolve(user, &source)
            .await?
            .ok_or(Error::MailboxNotFound)?;
        let dest = self
            .resolve(user, &destination)
            .await?
            .ok_or(Error::MailboxMissing)?;

        uids.sort_unstable();
        uids.dedup();

        let sid = session_id(session.as_ref()).map(str::to_string);
        let mut source_uids = Vec::new();
        let mut dest_uids = Vec::new();
        let mut entries: Vec<JournalEntry> = Vec::new();

        for chunk in uids.chunks(self.config.bulk_batch_size) {
            for message in self.messages_by_uids(source.id, chunk).await? {
                let slot = self.registry.reserve_slot(dest.id).await?;
                let old_uid = message.uid;

                let mut copied = message;
                copied.id = MessageId::generate();
                copied.mailbox = dest.id;
                copied.uid = slot.uid;
                copied.modseq = slot.modseq;
                copied.junk = dest.is_junk();
                copied.searchable = !dest.suppresses_search() && !copied.flags.is_deleted();
                let (exp, rdate) = retention_fields(&dest, Utc::now());
                copied.exp = exp;
                copied.rdate = rdate;

                self.insert_message(&copied).await?;
                self.attachments
                    .update_many(&copied.attachment_hashes(), 1, &copied.magic)
                    .await?;
                self.users
                    .adjust_storage(user, size_delta(copied.size))
                    .await?;

                push_frame(session.as_ref(), dest.id, SessionFrame::Exists(slot.uid));
                entries.push(
                    JournalEntry::exists(slot.uid, copied.id, Some(slot.modseq), copied.unseen)
                        .ignoring(sid.as_deref()),
                );

                source_uids.push(old_uid);
                dest_uids.push(slot.uid);
            }

            if !entries.is_empty() {
                self.notifier
                    .notify(&mailbox_scope(&dest), std::mem::take(&mut entries))
                    .await;
                self.notifier.fire(dest.user, &dest.path);
            }
        }

        Ok(CopyOutcome {
            uid_validity: dest.uid_validity,
            source_uids,
            dest_uids,
        })
    }

    /// Applies flag / expiry changes to a UID set in one mailbox.
    ///
    /// The mailbox tip advances once; every touched message is stamped
    /// with the post-image MODSEQ and journaled as a `FETCH` entry
    /// carrying its new flags, flushed every `bulk_batch_size` messages.
    ///
    /// # Errors
    ///
    /// [`Error::NothingChanged`] when no recognized change key is set,
    /// [`Error::MailboxMissing`] when the mailbox cannot be resolved, or
    /// the underlying store error.
    pub async fn update_messages(&self, request: UpdateRequest) -> Result<UpdateOutcome> {
        let UpdateRequest {
            user,
            mailbox: target,
            mut uids,
            changes,
            session,
        } = request;

        if changes.is_empty() {
            return Err(Error::NothingChanged);
        }

        let mailbox = self
            .resolve(user, &target)
            .await?
            .ok_or(Error::MailboxMissing)?;
        let post = self.registry.bump(mailbox.id).await?;
        let modseq = post.modify_index;
        let scope = mailbox_scope(&mailbox);
        let sid = session_id(session.as_ref()).map(str::to_string);

        uids.sort_unstable();
        uids.dedup();

        let mut updated = 0;
        for chunk in uids.chunks(self.config.bulk_batch_size) {
            let mut entries = Vec::new();
            for mut message in self.messages_by_uids(mailbox.id, chunk).await? {
                let was_unseen = message.unseen;
                changes.apply(&mut message);
                message.modseq = modseq;

                sqlx::query(
                    r"
                    UPDATE messages
                    SET flags = ?, unseen = ?, flagged = ?, undeleted = ?, draft = ?,
                        exp = ?, rdate = ?, modseq = ?
                    WHERE mailbox = ? AND uid = ?
                    ",
                )
                .bind(serde_json::to_string(&message.flags)?)
                .bind(message.unseen)
                .bind(message.flagged)
                .bind(message.undeleted)
                .bind(message.draft)
                .bind(message.exp)
                .bind(message.rdate.map(|d| d.to_rfc3339()))
                .bind(i64::try_from(modseq.get()).unwrap_or(i64::MAX))
                .bind(mailbox.id.0)
                .bind(i64::from(message.uid.get()))
                .execute(&self.pool)
                .await?;

                entries.push(
                    JournalEntry::fetch(
                        message.uid,
                        message.id,
                        modseq,
                        message.flags.clone(),
                        was_unseen != message.unseen,
                    )
                    .ignoring(sid.as_deref()),
                );
                updated += 1;
            }

            if !entries.is_empty() {
                self.notifier.notify(&scope, entries).await;
                self.notifier.fire(mailbox.user, &mailbox.path);
            }
        }

        Ok(UpdateOutcome { updated, modseq })
    }

    /// Loads a message by `(mailbox, uid)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn message_by_uid(
        &self,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(r"SELECT * FROM messages WHERE mailbox = ? AND uid = ?")
            .bind(mailbox.0)
            .bind(i64::from(uid.get()))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn resolve(&self, user: UserId, target: &MailboxTarget) -> Result<Option<Mailbox>> {
        match target {
            MailboxTarget::Id(id) => {
                let mailbox = self.registry.get(*id).await?;
                Ok(mailbox.filter(|m| m.user == user))
            }
            MailboxTarget::Path(path) => self.registry.by_path(user, path).await,
            MailboxTarget::SpecialUse(role) => self.registry.by_special_use(user, *role).await,
        }
    }

    async fn replace_in_place(
        &self,
        mailbox: &Mailbox,
        existing: &ExistingMessage,
        flags: &Flags,
        session: Option<&Arc<dyn SessionSink>>,
    ) -> Result<Option<AddOutcome>> {
        let slot = self.registry.reserve_slot(mailbox.id).await?;
        let unseen = !flags.is_seen();

        let result = sqlx::query(
            r"
            UPDATE messages
            SET uid = ?, modseq = ?, flags = ?, unseen = ?, flagged = ?, undeleted = ?, draft = ?
            WHERE mailbox = ? AND id = ? AND uid = ?
            ",
        )
        .bind(i64::from(slot.uid.get()))
        .bind(i64::try_from(slot.modseq.get()).unwrap_or(i64::MAX))
        .bind(serde_json::to_string(flags)?)
        .bind(unseen)
        .bind(flags.is_flagged())
        .bind(!flags.is_deleted())
        .bind(flags.is_draft())
        .bind(mailbox.id.0)
        .bind(existing.id.to_string())
        .bind(i64::from(existing.uid.get()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race: another writer already replaced or removed it.
            warn!(
                mailbox = mailbox.id.0,
                uid = existing.uid.get(),
                "duplicate vanished during replace"
            );
            return Ok(None);
        }

        push_frame(session, mailbox.id, SessionFrame::Expunge(existing.uid));
        push_frame(session, mailbox.id, SessionFrame::Exists(slot.uid));

        let sid = session_id(session);
        let scope = mailbox_scope(mailbox);
        self.notifier
            .notify(
                &scope,
                vec![
                    JournalEntry::expunge(existing.uid, existing.id, existing.unseen)
                        .with_modseq(slot.modseq)
                        .ignoring(sid),
                    JournalEntry::exists(slot.uid, existing.id, Some(slot.modseq), unseen)
                        .ignoring(sid),
                ],
            )
            .await;
        self.notifier.fire(mailbox.user, &mailbox.path);

        Ok(Some(AddOutcome {
            status: AddStatus::Update,
            uid_validity: mailbox.uid_validity,
            uid: slot.uid,
            id: existing.id,
            mailbox: mailbox.id,
        }))
    }

    async fn insert_fresh(
        &self,
        mailbox: &Mailbox,
        prepared: PreparedMessage,
        flags: Flags,
        session: Option<&Arc<dyn SessionSink>>,
    ) -> Result<AddOutcome> {
        let user = mailbox.user;

        // One refcount per distinct storage key, mirroring what `del` and
        // `copy` later settle through `attachment_hashes()`; a message
        // whose map references one hash twice still counts once.
        let mut stored_hashes: Vec<String> = Vec::new();
        for payload in &prepared.attachments {
            if stored_hashes.contains(&payload.hash) {
                continue;
            }
            if let Err(error) = self
                .attachments
                .create(&payload.hash, &prepared.magic, &payload.data)
                .await
            {
                self.drop_attachments(&stored_hashes, &prepared.magic).await;
                return Err(error);
            }
            stored_hashes.push(payload.hash.clone());
        }

        // Quota moves before the slot reservation so racing deliveries
        // cannot slip past enforcement; everything below must unwind it.
        let size = size_delta(prepared.size);
        if let Err(error) = self.users.adjust_storage(user, size).await {
            self.drop_attachments(&stored_hashes, &prepared.magic).await;
            return Err(error);
        }

        let slot = match self.registry.reserve_slot(mailbox.id).await {
            Ok(slot) => slot,
            Err(error) => {
                self.unwind_add(user, size, &stored_hashes, &prepared.magic)
                    .await;
                return Err(error);
            }
        };

        let thread = match self
            .threads
            .resolve(user, &prepared.subject, &prepared.references)
            .await
        {
            Ok(thread) => thread,
            Err(error) => {
                self.unwind_add(user, size, &stored_hashes, &prepared.magic)
                    .await;
                return Err(error);
            }
        };

        let message = build_message(mailbox, prepared, flags, slot.uid, slot.modseq, thread);
        if let Err(error) = self.insert_message(&message).await {
            self.unwind_add(user, size, &stored_hashes, &message.magic)
                .await;
            return Err(error);
        }

        push_frame(session, mailbox.id, SessionFrame::Exists(slot.uid));

        let sid = session_id(session);
        let scope = mailbox_scope(mailbox);
        self.notifier
            .notify(
                &scope,
                vec![
                    JournalEntry::exists(slot.uid, message.id, Some(slot.modseq), message.unseen)
                        .ignoring(sid),
                ],
            )
            .await;
        self.notifier.fire(mailbox.user, &mailbox.path);

        debug!(
            mailbox = mailbox.id.0,
            uid = slot.uid.get(),
            modseq = slot.modseq.get(),
            "message stored"
        );

        Ok(AddOutcome {
            status: AddStatus::New,
            uid_validity: mailbox.uid_validity,
            uid: slot.uid,
            id: message.id,
            mailbox: mailbox.id,
        })
    }

    async fn flush_move_batch(
        &self,
        batch: &mut Vec<(JournalScope, JournalEntry)>,
        source: &Mailbox,
        dest: &Mailbox,
    ) {
        if batch.is_empty() {
            return;
        }
        self.notifier.notify_batch(std::mem::take(batch)).await;
        self.notifier.fire(source.user, &source.path);
        self.notifier.fire(dest.user, &dest.path);
    }

    async fn unwind_add(&self, user: UserId, size: i64, hashes: &[String], magic: &str) {
        if let Err(error) = self.users.adjust_storage(user, -size).await {
            warn!(user = user.0, %error, "quota rollback failed");
        }
        self.drop_attachments(hashes, magic).await;
    }

    async fn drop_attachments(&self, hashes: &[String], magic: &str) {
        if hashes.is_empty() {
            return;
        }
        if let Err(error) = self.attachments.delete_many(hashes, magic).await {
            warn!(%error, "orphaned attachment cleanup failed");
        }
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO messages
                (id, root, mailbox, user, uid, thread, modseq, flags,
                 unseen, flagged, undeleted, draft, size, idate, hdate, msgid,
                 subject, envelope, bodystructure, attachment_map, headers,
                 intro, text_body, html, magic, searchable, junk, exp, rdate)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.id.to_string())
        .bind(message.root.to_string())
        .bind(message.mailbox.0)
        .bind(message.user.0)
        .bind(i64::from(message.uid.get()))
        .bind(message.thread.0)
        .bind(i64::try_from(message.modseq.get()).unwrap_or(i64::MAX))
        .bind(serde_json::to_string(&message.flags)?)
        .bind(message.unseen)
        .bind(message.flagged)
        .bind(message.undeleted)
        .bind(message.draft)
        .bind(i64::try_from(message.size).unwrap_or(i64::MAX))
        .bind(message.idate.to_rfc3339())
        .bind(message.hdate.to_rfc3339())
        .bind(&message.msgid)
        .bind(&message.subject)
        .bind(
            message
                .envelope
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            message
                .bodystructure
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&message.attachment_map)?)
        .bind(serde_json::to_string(&message.headers)?)
        .bind(&message.intro)
        .bind(&message.text)
        .bind(serde_json::to_string(&message.html)?)
        .bind(&message.magic)
        .bind(message.searchable)
        .bind(message.junk)
        .bind(message.exp)
        .bind(message.rdate.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn messages_by_uids(&self, mailbox: MailboxId, uids: &[Uid]) -> Result<Vec<Message>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut placeholders = String::new();
        for i in 0..uids.len() {
            if i > 0 {
                placeholders.push(',');
            }
            placeholders.push('?');
        }
        let query = format!(
            r"SELECT * FROM messages WHERE mailbox = ? AND uid IN ({placeholders}) ORDER BY uid ASC"
        );
        let mut q = sqlx::query(&query).bind(mailbox.0);
        for uid in uids {
            q = q.bind(i64::from(uid.get()));
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.iter().map(row_to_message).collect()
    }
}

fn build_message(
    mailbox: &Mailbox,
    prepared: PreparedMessage,
    flags: Flags,
    uid: Uid,
    modseq: ModSeq,
    thread: ThreadId,
) -> Message {
    let id = MessageId::generate();
    let (exp, rdate) = retention_fields(mailbox, prepared.idate);
    let mut message = Message {
        id,
        root: id,
        mailbox: mailbox.id,
        user: mailbox.user,
        uid,
        thread,
        modseq,
        searchable: !mailbox.suppresses_search() && !flags.is_deleted(),
        junk: mailbox.is_junk(),
        flags,
        unseen: true,
        flagged: false,
        undeleted: true,
        draft: false,
        size: prepared.size,
        idate: prepared.idate,
        hdate: prepared.hdate,
        msgid: prepared.msgid,
        subject: prepared.subject,
        envelope: prepared.envelope,
        bodystructure: prepared.bodystructure,
        attachment_map: prepared.attachment_map,
        headers: prepared.headers,
        intro: prepared.intro,
        text: prepared.text,
        html: prepared.html,
        magic: prepared.magic,
        exp,
        rdate,
    };
    message.recompute_flag_columns();
    message
}

fn retention_fields(mailbox: &Mailbox, from: DateTime<Utc>) -> (bool, Option<DateTime<Utc>>) {
    if mailbox.retention > 0 {
        let millis = i64::try_from(mailbox.retention).unwrap_or(i64::MAX);
        (true, Some(from + Duration::milliseconds(millis)))
    } else {
        (false, None)
    }
}

fn mailbox_scope(mailbox: &Mailbox) -> JournalScope {
    JournalScope {
        user: mailbox.user,
        mailbox: mailbox.id,
        path: mailbox.path.clone(),
    }
}

fn push_frame(session: Option<&Arc<dyn SessionSink>>, mailbox: MailboxId, frame: SessionFrame) {
    if let Some(session) = session {
        if session.selected_mailbox() == Some(mailbox) {
            session.send(frame);
        }
    }
}

fn session_id(session: Option<&Arc<dyn SessionSink>>) -> Option<&str> {
    session.map(|s| s.id())
}

fn size_delta(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let flags: Flags = serde_json::from_str(&row.get::<String, _>("flags"))?;
    let attachment_map: BTreeMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("attachment_map"))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&row.get::<String, _>("headers"))?;
    let html: Vec<String> = serde_json::from_str(&row.get::<String, _>("html"))?;
    let envelope: Option<Value> = row
        .get::<Option<String>, _>("envelope")
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let bodystructure: Option<Value> = row
        .get::<Option<String>, _>("bodystructure")
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Message {
        id: MessageId::parse(&row.get::<String, _>("id")).unwrap_or_else(MessageId::generate),
        root: MessageId::parse(&row.get::<String, _>("root")).unwrap_or_else(MessageId::generate),
        mailbox: MailboxId::new(row.get("mailbox")),
        user: UserId::new(row.get("user")),
        uid: Uid::new(u32::try_from(row.get::<i64, _>("uid")).unwrap_or(0)),
        thread: ThreadId(row.get("thread")),
        modseq: ModSeq::new(u64::try_from(row.get::<i64, _>("modseq")).unwrap_or(0)),
        flags,
        unseen: row.get("unseen"),
        flagged: row.get("flagged"),
        undeleted: row.get("undeleted"),
        draft: row.get("draft"),
        size: u64::try_from(row.get::<i64, _>("size")).unwrap_or(0),
        idate: parse_datetime(&row.get::<String, _>("idate")),
        hdate: parse_datetime(&row.get::<String, _>("hdate")),
        msgid: row.get("msgid"),
        subject: row.get("subject"),
        envelope,
        bodystructure,
        attachment_map,
        headers,
        intro: row.get("intro"),
        text: row.get("text_body"),
        html,
        magic: row.get("magic"),
        searchable: row.get("searchable"),
        junk: row.get("junk"),
        exp: row.get("exp"),
        rdate: row
            .get::<Option<String>, _>("rdate")
            .as_deref()
            .map(parse_datetime),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
