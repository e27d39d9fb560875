//! The per-user journal and change fanout.

mod model;
mod notifier;
mod updates;

pub use model::{JournalCommand, JournalEntry, JournalScope, StoredEntry};
pub use notifier::{
    CollectingListener, JournalListener, LocalBus, Notifier, Pulse, PulseBus,
};
pub use updates::{SseFrame, UpdatesFeed};
