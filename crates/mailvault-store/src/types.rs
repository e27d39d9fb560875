//! Core identifiers and flag types.
//!
//! Newtypes for the ids that flow through the store: users, mailboxes,
//! messages, threads, and the per-mailbox UID / MODSEQ / UIDVALIDITY
//! counters the IMAP contract is built on.

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Unique identifier for a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl UserId {
    /// Create a new user ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxId(pub i64);

impl MailboxId {
    /// Create a new mailbox ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub i64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a message document.
///
/// Survives replace-in-place deliveries (the UID changes, the id does not)
/// and is regenerated when a message is cloned by copy or move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh message id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its stored text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a message within one mailbox.
///
/// UIDs are handed out strictly ascending from the mailbox's `uid_next`
/// counter and are never reused while the mailbox's UIDVALIDITY holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    /// Creates a new UID.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modification sequence number.
///
/// The per-mailbox `modify_index` is the MODSEQ tip; every observable
/// mutation raises it, and every stored message carries the MODSEQ of the
/// change that last touched it. Zero marks a message awaiting a stamp from
/// the notifier (move clones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModSeq(pub u64);

impl ModSeq {
    /// The unassigned MODSEQ carried by messages the notifier restamps.
    pub const UNASSIGNED: Self = Self(0);

    /// Creates a new MODSEQ.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ModSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UIDVALIDITY value for a mailbox.
///
/// Set once at mailbox creation and never mutated; a change tells clients
/// every cached UID is void.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UidValidity(pub u32);

impl UidValidity {
    /// Creates a new UIDVALIDITY.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for UidValidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Special-use role of a mailbox (RFC 6154).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialUse {
    /// The inbox.
    Inbox,
    /// Sent mail.
    Sent,
    /// Draft messages.
    Drafts,
    /// Junk / spam.
    Junk,
    /// Deleted mail pending expunge.
    Trash,
    /// Archived mail.
    Archive,
}

impl SpecialUse {
    /// Parses a special-use attribute string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "\\Inbox" => Some(Self::Inbox),
            "\\Sent" => Some(Self::Sent),
            "\\Drafts" => Some(Self::Drafts),
            "\\Junk" => Some(Self::Junk),
            "\\Trash" => Some(Self::Trash),
            "\\Archive" => Some(Self::Archive),
            _ => None,
        }
    }

    /// Returns the attribute as an IMAP string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "\\Inbox",
            Self::Sent => "\\Sent",
            Self::Drafts => "\\Drafts",
            Self::Junk => "\\Junk",
            Self::Trash => "\\Trash",
            Self::Archive => "\\Archive",
        }
    }

    /// Whether messages landing here are excluded from search indexing.
    #[must_use]
    pub const fn suppresses_search(self) -> bool {
        matches!(self, Self::Junk | Self::Trash)
    }
}

impl std::fmt::Display for SpecialUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Message has been read.
    Seen,
    /// Message has been answered.
    Answered,
    /// Message is flagged for special attention.
    Flagged,
    /// Message is marked for deletion.
    Deleted,
    /// Message is a draft.
    Draft,
    /// Custom keyword flag.
    Keyword(String),
}

impl Flag {
    /// Parses a flag string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "\\SEEN" => Self::Seen,
            "\\ANSWERED" => Self::Answered,
            "\\FLAGGED" => Self::Flagged,
            "\\DELETED" => Self::Deleted,
            "\\DRAFT" => Self::Draft,
            _ => Self::Keyword(s.to_string()),
        }
    }

    /// Returns the flag as an IMAP string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Answered => "\\Answered",
            Self::Flagged => "\\Flagged",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Keyword(s) => s,
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Set of message flags.
///
/// Insertion preserves order and rejects duplicates, so a stored flag list
/// never carries the same flag twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    flags: Vec<Flag>,
}

impl Flags {
    /// Creates an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag set from a vector, dropping duplicates.
    #[must_use]
    pub fn from_vec(flags: Vec<Flag>) -> Self {
        let mut set = Self::new();
        for flag in flags {
            set.insert(flag);
        }
        set
    }

    /// Adds a flag if not already present.
    pub fn insert(&mut self, flag: Flag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    /// Removes a flag.
    pub fn remove(&mut self, flag: &Flag) {
        self.flags.retain(|f| f != flag);
    }

    /// Adds or removes a flag to match the given state.
    pub fn set(&mut self, flag: Flag, present: bool) {
        if present {
            self.insert(flag);
        } else {
            self.remove(&flag);
        }
    }

    /// Returns true if the flag is present.
    #[must_use]
    pub fn contains(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    /// Returns true if the message has been seen.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.contains(&Flag::Seen)
    }

    /// Returns true if the message is flagged.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        self.contains(&Flag::Flagged)
    }

    /// Returns true if the message is marked for deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.contains(&Flag::Deleted)
    }

    /// Returns true if the message is a draft.
    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.contains(&Flag::Draft)
    }

    /// Returns an iterator over the flags.
    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.flags.iter()
    }

    /// Returns the number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Returns true if there are no flags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl IntoIterator for Flags {
    type Item = Flag;
    type IntoIter = std::vec::IntoIter<Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.flags.into_iter()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl Serialize for Flags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.flags.len()))?;
        for flag in &self.flags {
            seq.serialize_element(flag.as_str())?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagsVisitor;

        impl<'de> Visitor<'de> for FlagsVisitor {
            type Value = Flags;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a sequence of flag strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Flags, A::Error> {
                let mut flags = Flags::new();
                while let Some(s) = seq.next_element::<String>()? {
                    flags.insert(Flag::parse(&s));
                }
                Ok(flags)
            }
        }

        deserializer.deserialize_seq(FlagsVisitor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod uid_tests {
        use super::*;

        #[test]
        fn ordering() {
            assert!(Uid::new(100) < Uid::new(200));
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", Uid::new(12345)), "12345");
        }
    }

    mod modseq_tests {
        use super::*;

        #[test]
        fn unassigned_is_zero() {
            assert_eq!(ModSeq::UNASSIGNED.get(), 0);
        }

        #[test]
        fn ordering() {
            assert!(ModSeq::new(10) < ModSeq::new(11));
        }
    }

    mod special_use_tests {
        use super::*;

        #[test]
        fn parse_round_trip() {
            for su in [
                SpecialUse::Inbox,
                SpecialUse::Sent,
                SpecialUse::Drafts,
                SpecialUse::Junk,
                SpecialUse::Trash,
                SpecialUse::Archive,
            ] {
                assert_eq!(SpecialUse::parse(su.as_str()), Some(su));
            }
        }

        #[test]
        fn parse_unknown() {
            assert_eq!(SpecialUse::parse("\\Nonsense"), None);
        }

        #[test]
        fn junk_and_trash_suppress_search() {
            assert!(SpecialUse::Junk.suppresses_search());
            assert!(SpecialUse::Trash.suppresses_search());
            assert!(!SpecialUse::Inbox.suppresses_search());
        }
    }

    mod flag_tests {
        use super::*;

        #[test]
        fn parse_is_case_insensitive() {
            assert_eq!(Flag::parse("\\seen"), Flag::Seen);
            assert_eq!(Flag::parse("\\SEEN"), Flag::Seen);
        }

        #[test]
        fn parse_keyword() {
            assert_eq!(
                Flag::parse("$Important"),
                Flag::Keyword("$Important".to_string())
            );
        }

        #[test]
        fn insert_rejects_duplicates() {
            let mut flags = Flags::new();
            flags.insert(Flag::Seen);
            flags.insert(Flag::Seen);
            assert_eq!(flags.len(), 1);
        }

        #[test]
        fn set_adds_and_removes() {
            let mut flags = Flags::new();
            flags.set(Flag::Deleted, true);
            assert!(flags.is_deleted());
            flags.set(Flag::Deleted, false);
            assert!(!flags.is_deleted());
        }

        #[test]
        fn serde_round_trip() {
            let flags = Flags::from_vec(vec![
                Flag::Seen,
                Flag::Flagged,
                Flag::Keyword("$Label1".to_string()),
            ]);
            let json = serde_json::to_string(&flags).unwrap();
            assert_eq!(json, r#"["\\Seen","\\Flagged","$Label1"]"#);
            let back: Flags = serde_json::from_str(&json).unwrap();
            assert_eq!(back, flags);
        }
    }

    mod message_id_tests {
        use super::*;

        #[test]
        fn generate_is_unique() {
            assert_ne!(MessageId::generate(), MessageId::generate());
        }

        #[test]
        fn parse_round_trip() {
            let id = MessageId::generate();
            assert_eq!(MessageId::parse(&id.to_string()), Some(id));
        }
    }
}
