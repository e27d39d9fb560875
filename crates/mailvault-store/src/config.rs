//! Store configuration.

use std::time::Duration;

/// Byte cap on the stored plaintext body.
pub const MAX_PLAINTEXT_CONTENT: usize = 100 * 1024;

/// Cumulative byte cap across the stored HTML parts.
pub const MAX_HTML_CONTENT: usize = 300 * 1024;

/// Batch size for bulk move / update journal flushes.
pub const BULK_BATCH_SIZE: usize = 150;

/// Character cap on the message preview line.
pub const INTRO_LENGTH: usize = 128;

/// Byte cap on an indexed header value.
pub const MAX_INDEXED_HEADER_VALUE: usize = 880;

/// Byte cap on an indexed header key.
pub const MAX_INDEXED_HEADER_KEY: usize = 255;

/// Cap on the reference-id set carried by a thread.
pub const MAX_THREAD_REFS: usize = 10;

/// Header keys projected into the indexed-header list for every message.
pub const INDEXED_HEADERS: &[&str] = &[
    "to",
    "cc",
    "subject",
    "from",
    "sender",
    "reply-to",
    "message-id",
    "thread-index",
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Byte cap on the stored plaintext body.
    pub max_plaintext_content: usize,
    /// Cumulative byte cap across stored HTML parts.
    pub max_html_content: usize,
    /// Batch size for bulk move / update flushes.
    pub bulk_batch_size: usize,
    /// Extra header keys to project beyond [`INDEXED_HEADERS`].
    pub extra_indexed_headers: Vec<String>,
    /// Interval between keep-alive comments on a live updates stream.
    pub idle_comment_interval: Duration,
    /// Idle period after which a live updates stream is torn down.
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_plaintext_content: MAX_PLAINTEXT_CONTENT,
            max_html_content: MAX_HTML_CONTENT,
            bulk_batch_size: BULK_BATCH_SIZE,
            extra_indexed_headers: Vec::new(),
            idle_comment_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl StoreConfig {
    /// Returns true when the given lower-cased header key is projected.
    #[must_use]
    pub fn indexes_header(&self, key: &str) -> bool {
        INDEXED_HEADERS.contains(&key) || self.extra_indexed_headers.iter().any(|h| h == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = StoreConfig::default();
        assert_eq!(config.max_plaintext_content, 100 * 1024);
        assert_eq!(config.max_html_content, 300 * 1024);
        assert_eq!(config.bulk_batch_size, 150);
        assert_eq!(config.idle_comment_interval, Duration::from_secs(15));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn extra_headers_extend_the_fixed_set() {
        let mut config = StoreConfig::default();
        config.extra_indexed_headers.push("x-priority".to_string());
        assert!(config.indexes_header("subject"));
        assert!(config.indexes_header("x-priority"));
        assert!(!config.indexes_header("received"));
    }
}
