//! Mailbox model types.

use crate::types::{MailboxId, ModSeq, SpecialUse, Uid, UidValidity, UserId};

/// A mailbox row.
///
/// Invariants: for any message M in this mailbox, `M.uid < uid_next` and
/// `M.modseq <= modify_index`; both counters only ever grow.
#[derive(Debug, Clone)]
pub struct Mailbox {
    /// Unique identifier.
    pub id: MailboxId,
    /// Owning user.
    pub user: UserId,
    /// Full path, unique per user.
    pub path: String,
    /// Special-use role, if any.
    pub special_use: Option<SpecialUse>,
    /// Whether the user is subscribed.
    pub subscribed: bool,
    /// Set once at creation, never mutated.
    pub uid_validity: UidValidity,
    /// Next UID to hand out.
    pub uid_next: u32,
    /// The MODSEQ tip.
    pub modify_index: ModSeq,
    /// Retention period in milliseconds; 0 disables expiry.
    pub retention: u64,
}

impl Mailbox {
    /// Whether messages delivered here are junk-classified.
    #[must_use]
    pub fn is_junk(&self) -> bool {
        self.special_use == Some(SpecialUse::Junk)
    }

    /// Whether messages delivered here are excluded from search.
    #[must_use]
    pub fn suppresses_search(&self) -> bool {
        self.special_use.is_some_and(SpecialUse::suppresses_search)
    }
}

/// Parameters for creating a mailbox.
#[derive(Debug, Clone)]
pub struct NewMailbox {
    /// Owning user.
    pub user: UserId,
    /// Full path.
    pub path: String,
    /// Special-use role, if any.
    pub special_use: Option<SpecialUse>,
    /// Retention period in milliseconds; 0 disables expiry.
    pub retention: u64,
}

/// The outcome of an atomic UID + MODSEQ reservation.
///
/// `uid` and `modseq` are the values assigned to the message that will
/// occupy the slot; `mailbox` is the post-image of the counters. If the
/// message insert fails the UID is simply abandoned (IMAP permits gaps).
#[derive(Debug, Clone)]
pub struct ReservedSlot {
    /// The UID assigned to the slot.
    pub uid: Uid,
    /// The MODSEQ assigned to the slot.
    pub modseq: ModSeq,
    /// Mailbox post-image after the reservation.
    pub mailbox: Mailbox,
}
