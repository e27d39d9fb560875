//! Journal entry types.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::types::{Flags, MailboxId, MessageId, ModSeq, Uid, UserId};

/// Journal entry command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalCommand {
    /// A message appeared under a UID.
    Exists,
    /// A message vanished from a UID.
    Expunge,
    /// A message's flags changed.
    Fetch,
    /// Synthetic per-mailbox counter refresh (never persisted).
    Counters,
}

impl JournalCommand {
    /// Returns the command as its wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "EXISTS",
            Self::Expunge => "EXPUNGE",
            Self::Fetch => "FETCH",
            Self::Counters => "COUNTERS",
        }
    }

    /// Parses a stored command string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXISTS" => Some(Self::Exists),
            "EXPUNGE" => Some(Self::Expunge),
            "FETCH" => Some(Self::Fetch),
            "COUNTERS" => Some(Self::Counters),
            _ => None,
        }
    }
}

impl std::fmt::Display for JournalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The `(user, mailbox, path)` scope a batch of entries is appended under.
#[derive(Debug, Clone)]
pub struct JournalScope {
    /// Owning user; entries for one user are totally ordered.
    pub user: UserId,
    /// The mailbox the entries describe.
    pub mailbox: MailboxId,
    /// The mailbox path, denormalized for consumers.
    pub path: String,
}

/// An unsaved journal entry.
///
/// An entry without a `modseq` asks the notifier to assign one at append
/// time by bumping the scope mailbox and restamping the touched messages.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// The command.
    pub command: JournalCommand,
    /// The UID the event concerns.
    pub uid: Option<Uid>,
    /// The message document id.
    pub message: Option<MessageId>,
    /// The MODSEQ of the change, if already assigned.
    pub modseq: Option<ModSeq>,
    /// Whether the message counts as unseen after the change.
    pub unseen: Option<bool>,
    /// Whether the change flipped the message's unseen state.
    pub unseen_change: bool,
    /// New flags, carried by `FETCH` entries.
    pub flags: Option<Flags>,
    /// Session id that must not re-receive this event.
    pub ignore_session: Option<String>,
}

impl JournalEntry {
    /// An `EXISTS` entry for a freshly slotted message.
    #[must_use]
    pub fn exists(uid: Uid, message: MessageId, modseq: Option<ModSeq>, unseen: bool) -> Self {
        Self {
            command: JournalCommand::Exists,
            uid: Some(uid),
            message: Some(message),
            modseq,
            unseen: Some(unseen),
            unseen_change: unseen,
            flags: None,
            ignore_session: None,
        }
    }

    /// An `EXPUNGE` entry for a removed UID.
    #[must_use]
    pub fn expunge(uid: Uid, message: MessageId, unseen: bool) -> Self {
        Self {
            command: JournalCommand::Expunge,
            uid: Some(uid),
            message: Some(message),
            modseq: None,
            unseen: Some(unseen),
            unseen_change: unseen,
            flags: None,
            ignore_session: None,
        }
    }

    /// A `FETCH` entry carrying a message's new flags.
    #[must_use]
    pub fn fetch(
        uid: Uid,
        message: MessageId,
        modseq: ModSeq,
        flags: Flags,
        unseen_change: bool,
    ) -> Self {
        Self {
            command: JournalCommand::Fetch,
            uid: Some(uid),
            message: Some(message),
            modseq: Some(modseq),
            unseen: None,
            unseen_change,
            flags: Some(flags),
            ignore_session: None,
        }
    }

    /// Tags the entry with the origin session to suppress.
    #[must_use]
    pub fn ignoring(mut self, session: Option<&str>) -> Self {
        self.ignore_session = session.map(str::to_string);
        self
    }

    /// Stamps the entry with an already-assigned MODSEQ, bypassing the
    /// notifier's append-time assignment.
    #[must_use]
    pub fn with_modseq(mut self, modseq: ModSeq) -> Self {
        self.modseq = Some(modseq);
        self
    }
}

/// A persisted journal entry.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Journal sequence id; per-user total order.
    pub id: i64,
    /// Append scope.
    pub scope: JournalScope,
    /// The entry body.
    pub entry: JournalEntry,
    /// Append timestamp.
    pub created: DateTime<Utc>,
}

impl StoredEntry {
    /// The JSON payload framed to live update consumers.
    ///
    /// Internal bookkeeping (`id`, `ignore`, `user`, `modseq`,
    /// `unseen_change`, `created`) stays out of the frame, and `unseen`
    /// travels only on `COUNTERS` events.
    #[must_use]
    pub fn frame_payload(&self) -> serde_json::Value {
        let mut payload = json!({
            "command": self.entry.command.as_str(),
            "mailbox": self.scope.mailbox,
            "path": self.scope.path,
        });
        let map = payload.as_object_mut().expect("payload is an object");
        if let Some(uid) = self.entry.uid {
            map.insert("uid".to_string(), json!(uid.get()));
        }
        if let Some(message) = self.entry.message {
            map.insert("message".to_string(), json!(message.to_string()));
        }
        if let Some(ref flags) = self.entry.flags {
            map.insert("flags".to_string(), json!(flags));
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Flag;

    fn scope() -> JournalScope {
        JournalScope {
            user: UserId::new(1),
            mailbox: MailboxId::new(7),
            path: "INBOX".to_string(),
        }
    }

    #[test]
    fn command_round_trip() {
        for cmd in [
            JournalCommand::Exists,
            JournalCommand::Expunge,
            JournalCommand::Fetch,
            JournalCommand::Counters,
        ] {
            assert_eq!(JournalCommand::parse(cmd.as_str()), Some(cmd));
        }
    }

    #[test]
    fn frame_payload_omits_bookkeeping() {
        let message = MessageId::generate();
        let stored = StoredEntry {
            id: 42,
            scope: scope(),
            entry: JournalEntry::fetch(
                Uid::new(5),
                message,
                ModSeq::new(11),
                Flags::from_vec(vec![Flag::Seen]),
                true,
            )
            .ignoring(Some("s1")),
            created: Utc::now(),
        };

        let payload = stored.frame_payload();
        assert_eq!(payload["command"], "FETCH");
        assert_eq!(payload["uid"], 5);
        assert_eq!(payload["flags"][0], "\\Seen");
        for absent in ["id", "ignore", "user", "modseq", "unseen", "unseen_change", "created"] {
            assert!(payload.get(absent).is_none(), "{absent} must be omitted");
        }
    }
}
