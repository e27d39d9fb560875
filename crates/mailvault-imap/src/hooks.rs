//! Mailbox-level command hooks.
//!
//! The handlers the wire layer calls for `SELECT`/`EXAMINE` (`on_open`),
//! `UID COPY` (`on_copy`), `GETQUOTAROOT`, and `UNSUBSCRIBE`. Store errors
//! map onto the IMAP sentinels: a missing source is `NONEXISTENT`, a
//! missing destination is `TRYCREATE`.

use std::sync::Arc;

use mailvault_store::{
    CopyRequest, Mailbox, MailboxRegistry, MailboxTarget, MessageHandler, SessionSink, Uid,
    UidValidity, UserId, UserRepository,
};

use crate::{Error, Result};

/// A selected mailbox with its UID roster.
#[derive(Debug, Clone)]
pub struct OpenedMailbox {
    /// The mailbox record.
    pub mailbox: Mailbox,
    /// All UIDs in the mailbox, ascending.
    pub uid_list: Vec<Uid>,
}

/// Parameters for `on_copy`.
pub struct CopyCommand {
    /// Destination mailbox path.
    pub destination: String,
    /// Source UIDs to copy.
    pub uids: Vec<Uid>,
    /// Originating session.
    pub session: Option<Arc<dyn SessionSink>>,
}

/// The `COPYUID` payload for a completed copy.
#[derive(Debug, Clone)]
pub struct CopyUidResponse {
    /// Destination UIDVALIDITY.
    pub uid_validity: UidValidity,
    /// Copied UIDs in the source mailbox.
    pub source_uids: Vec<Uid>,
    /// Corresponding destination UIDs, pairwise with `source_uids`.
    pub dest_uids: Vec<Uid>,
}

/// The `GETQUOTAROOT` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRoot {
    /// Quota root name; always the empty root.
    pub root: String,
    /// Quota in bytes; 0 means unlimited.
    pub quota: u64,
    /// Storage usage, clamped at zero.
    pub storage_used: u64,
}

/// Mailbox-level command hooks over the store.
pub struct CommandHooks {
    handler: MessageHandler,
    mailboxes: MailboxRegistry,
    users: UserRepository,
}

impl CommandHooks {
    /// Creates the hooks over the store's components.
    #[must_use]
    pub fn new(
        handler: MessageHandler,
        mailboxes: MailboxRegistry,
        users: UserRepository,
    ) -> Self {
        Self {
            handler,
            mailboxes,
            users,
        }
    }

    /// Opens a mailbox for `SELECT`/`EXAMINE`.
    ///
    /// # Errors
    ///
    /// [`Error::Nonexistent`] when the path does not resolve.
    pub async fn on_open(&self, user: UserId, path: &str) -> Result<OpenedMailbox> {
        let mailbox = self
            .mailboxes
            .by_path(user, path)
            .await?
            .ok_or(Error::Nonexistent)?;
        let uid_list = self.mailboxes.uid_list(mailbox.id).await?;
        Ok(OpenedMailbox { mailbox, uid_list })
    }

    /// Copies messages for `UID COPY`.
    ///
    /// # Errors
    ///
    /// [`Error::Nonexistent`] for a missing source path,
    /// [`Error::TryCreate`] for a missing destination.
    pub async fn on_copy(
        &self,
        user: UserId,
        path: &str,
        command: CopyCommand,
    ) -> Result<CopyUidResponse> {
        let outcome = self
            .handler
            .copy_messages(CopyRequest {
                user,
                source: MailboxTarget::Path(path.to_string()),
                destination: MailboxTarget::Path(command.destination),
                uids: command.uids,
                session: command.session,
            })
            .await?;
        Ok(CopyUidResponse {
            uid_validity: outcome.uid_validity,
            source_uids: outcome.source_uids,
            dest_uids: outcome.dest_uids,
        })
    }

    /// Reports quota usage for `GETQUOTAROOT`.
    ///
    /// # Errors
    ///
    /// [`Error::Nonexistent`] for an unknown user.
    pub async fn on_get_quota_root(&self, user: UserId) -> Result<QuotaRoot> {
        let user = self.users.get(user).await?.ok_or(Error::Nonexistent)?;
        Ok(QuotaRoot {
            root: String::new(),
            quota: user.quota,
            storage_used: user.storage_used(),
        })
    }

    /// Clears the subscription bit for `UNSUBSCRIBE`.
    ///
    /// # Errors
    ///
    /// [`Error::Nonexistent`] when the path does not resolve.
    pub async fn on_unsubscribe(&self, user: UserId, path: &str) -> Result<()> {
        self.mailboxes.set_subscribed(user, path, false).await?;
        Ok(())
    }
}
