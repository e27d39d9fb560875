//! # mailvault-store
//!
//! Message-management core for the MailVault mail store.
//!
//! This crate provides:
//! - Per-mailbox UID / MODSEQ allocation under concurrent writers
//! - Deduplicated delivery with replace-in-place merging
//! - Move, copy, and bulk flag update sequencing
//! - A per-user journal with ordered fanout and origin suppression
//! - Reference-counted attachment storage
//! - Conversation threading
//!
//! The IMAP wire layer, MIME parser, and HTTP transport are external
//! collaborators; this crate defines the seams they plug into
//! ([`message::MimeIndexer`], [`session::SessionSink`],
//! [`journal::PulseBus`]) and the invariants they can rely on.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod attachment;
pub mod config;
pub mod counter;
mod error;
pub mod journal;
pub mod mailbox;
pub mod message;
pub mod session;
mod store;
pub mod thread;
pub mod types;
pub mod user;

pub use config::StoreConfig;
pub use counter::CounterService;
pub use error::{Error, Result};
pub use journal::{
    JournalCommand, JournalEntry, JournalListener, JournalScope, LocalBus, Notifier, Pulse,
    PulseBus, SseFrame, StoredEntry, UpdatesFeed,
};
pub use mailbox::{Mailbox, MailboxRegistry, NewMailbox, ReservedSlot};
pub use message::{
    AddOutcome, AddRequest, AddStatus, CopyOutcome, CopyRequest, DeleteRequest, FlagUpdates,
    IndexedMessage, MailboxTarget, Message, MessageHandler, MessageSource, MimeIndexer,
    MoveOutcome, MoveRequest, PreparedMessage, UpdateOutcome, UpdateRequest,
};
pub use session::{CollectingSession, SessionFrame, SessionSink};
pub use store::Store;
pub use types::{
    Flag, Flags, MailboxId, MessageId, ModSeq, SpecialUse, ThreadId, Uid, UidValidity, UserId,
};
pub use user::{NewUser, User, UserRepository};
