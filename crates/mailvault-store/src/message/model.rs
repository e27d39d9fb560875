//! Message model types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{Flags, MailboxId, MessageId, ModSeq, ThreadId, Uid, UserId};

/// A stored message document, keyed by `(mailbox, uid)`.
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable document id; survives replace-in-place.
    pub id: MessageId,
    /// Ancestor id across copies; equals `id` for originals.
    pub root: MessageId,
    /// The mailbox holding the message.
    pub mailbox: MailboxId,
    /// Owning user.
    pub user: UserId,
    /// UID within the mailbox.
    pub uid: Uid,
    /// Conversation thread.
    pub thread: ThreadId,
    /// MODSEQ of the last change; [`ModSeq::UNASSIGNED`] until the
    /// notifier stamps a move clone.
    pub modseq: ModSeq,
    /// System and custom flags.
    pub flags: Flags,
    /// Mirror of `!flags.is_seen()` for index efficiency.
    pub unseen: bool,
    /// Mirror of `flags.is_flagged()`.
    pub flagged: bool,
    /// Mirror of `!flags.is_deleted()`.
    pub undeleted: bool,
    /// Mirror of `flags.is_draft()`.
    pub draft: bool,
    /// Raw message size in bytes.
    pub size: u64,
    /// Internal date (delivery time).
    pub idate: DateTime<Utc>,
    /// Parsed `Date:` header, falling back to `idate`.
    pub hdate: DateTime<Utc>,
    /// `Message-ID` header, generated when the message carried none.
    pub msgid: String,
    /// Normalized subject.
    pub subject: String,
    /// IMAP envelope structure, as produced by the MIME indexer.
    pub envelope: Option<serde_json::Value>,
    /// IMAP BODYSTRUCTURE, as produced by the MIME indexer.
    pub bodystructure: Option<serde_json::Value>,
    /// Attachment id to storage key, from the parsed MIME tree.
    pub attachment_map: BTreeMap<String, String>,
    /// Indexed-header projection.
    pub headers: Vec<(String, String)>,
    /// Preview line.
    pub intro: String,
    /// Plaintext body, LF-normalized and capped.
    pub text: Option<String>,
    /// HTML parts, cumulatively capped.
    pub html: Vec<String>,
    /// Per-delivery attachment generation salt.
    pub magic: String,
    /// False for Junk/Trash deliveries and `\Deleted` messages.
    pub searchable: bool,
    /// True for Junk deliveries.
    pub junk: bool,
    /// Whether retention expiry is armed.
    pub exp: bool,
    /// Expiry timestamp when `exp` is set.
    pub rdate: Option<DateTime<Utc>>,
}

impl Message {
    /// Refreshes the derived boolean columns from the flag set.
    pub fn recompute_flag_columns(&mut self) {
        self.unseen = !self.flags.is_seen();
        self.flagged = self.flags.is_flagged();
        self.undeleted = !self.flags.is_deleted();
        self.draft = self.flags.is_draft();
    }

    /// The distinct storage keys referenced by the attachment map.
    #[must_use]
    pub fn attachment_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = Vec::new();
        for hash in self.attachment_map.values() {
            if !hashes.contains(hash) {
                hashes.push(hash.clone());
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Flag;

    fn message() -> Message {
        let id = MessageId::generate();
        Message {
            id,
            root: id,
            mailbox: MailboxId::new(1),
            user: UserId::new(1),
            uid: Uid::new(1),
            thread: ThreadId(1),
            modseq: ModSeq::new(1),
            flags: Flags::new(),
            unseen: true,
            flagged: false,
            undeleted: true,
            draft: false,
            size: 100,
            idate: Utc::now(),
            hdate: Utc::now(),
            msgid: "<a@x>".to_string(),
            subject: "hello".to_string(),
            envelope: None,
            bodystructure: None,
            attachment_map: BTreeMap::new(),
            headers: Vec::new(),
            intro: String::new(),
            text: None,
            html: Vec::new(),
            magic: "m1".to_string(),
            searchable: true,
            junk: false,
            exp: false,
            rdate: None,
        }
    }

    #[test]
    fn flag_columns_mirror_flags() {
        let mut msg = message();
        msg.flags = Flags::from_vec(vec![Flag::Seen, Flag::Deleted, Flag::Draft]);
        msg.recompute_flag_columns();
        assert!(!msg.unseen);
        assert!(!msg.undeleted);
        assert!(msg.draft);
        assert!(!msg.flagged);
    }

    #[test]
    fn attachment_hashes_deduplicate() {
        let mut msg = message();
        msg.attachment_map
            .insert("ATT00001".to_string(), "hash-a".to_string());
        msg.attachment_map
            .insert("ATT00002".to_string(), "hash-a".to_string());
        msg.attachment_map
            .insert("ATT00003".to_string(), "hash-b".to_string());
        assert_eq!(msg.attachment_hashes(), vec!["hash-a", "hash-b"]);
    }
}
