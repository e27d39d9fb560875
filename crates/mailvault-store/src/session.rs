//! Session ingress hooks.
//!
//! An IMAP session that has a mailbox selected must observe its own writes
//! immediately: the handler pushes `EXISTS` / `EXPUNGE` frames into the
//! originating session's output stream synchronously, before the journal
//! fanout catches up. The matching journal entries carry the session id in
//! their `ignore` slot so the notifier does not deliver them twice.

use std::sync::Mutex;

use crate::types::{MailboxId, Uid};

/// A frame written into a live session's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFrame {
    /// A message appeared under the given UID.
    Exists(Uid),
    /// The message under the given UID is gone.
    Expunge(Uid),
}

/// Sink for untagged frames targeting one live IMAP session.
///
/// Implemented by the wire layer; the store only needs to know the session's
/// identity, which mailbox it has selected, and how to push a frame.
pub trait SessionSink: Send + Sync {
    /// The session id used for journal origin suppression.
    fn id(&self) -> &str;

    /// The mailbox this session currently has selected, if any.
    fn selected_mailbox(&self) -> Option<MailboxId>;

    /// Pushes a frame into the session's output stream.
    fn send(&self, frame: SessionFrame);
}

/// A sink that collects frames for later inspection.
#[derive(Debug)]
pub struct CollectingSession {
    id: String,
    selected: Option<MailboxId>,
    frames: Mutex<Vec<SessionFrame>>,
}

impl CollectingSession {
    /// Creates a collecting session with the given id and selection.
    #[must_use]
    pub fn new(id: impl Into<String>, selected: Option<MailboxId>) -> Self {
        Self {
            id: id.into(),
            selected,
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Takes all collected frames, leaving the sink empty.
    pub fn take(&self) -> Vec<SessionFrame> {
        std::mem::take(&mut self.frames.lock().expect("frames lock"))
    }
}

impl SessionSink for CollectingSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn selected_mailbox(&self) -> Option<MailboxId> {
        self.selected
    }

    fn send(&self, frame: SessionFrame) {
        self.frames.lock().expect("frames lock").push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_session_records_in_order() {
        let session = CollectingSession::new("s1", Some(MailboxId::new(7)));
        session.send(SessionFrame::Expunge(Uid::new(5)));
        session.send(SessionFrame::Exists(Uid::new(6)));

        assert_eq!(
            session.take(),
            vec![
                SessionFrame::Expunge(Uid::new(5)),
                SessionFrame::Exists(Uid::new(6))
            ]
        );
        assert!(session.take().is_empty());
    }
}
