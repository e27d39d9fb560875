//! Messages: model, preparation, deduplication, and the operation handler.

mod dedup;
mod handler;
mod model;
mod prepare;

pub use dedup::{DuplicateDetector, ExistingMessage};
pub use handler::{
    AddOutcome, AddRequest, AddStatus, CopyOutcome, CopyRequest, DeleteRequest, FlagUpdates,
    MailboxTarget, MessageHandler, MessageSource, MoveOutcome, MoveRequest, UpdateOutcome,
    UpdateRequest,
};
pub use model::Message;
pub use prepare::{prepare, IndexedMessage, MimeIndexer, PreparedMessage};
