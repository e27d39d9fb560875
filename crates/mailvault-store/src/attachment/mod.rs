//! Content-addressed attachment storage with refcount GC.

mod repository;

pub use repository::{AttachmentPayload, AttachmentRepository};
