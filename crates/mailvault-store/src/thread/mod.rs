//! Conversation threading.

mod resolver;

pub use resolver::{normalize_subject, reference_hashes, ThreadResolver};
