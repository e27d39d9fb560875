//! Message preparation.
//!
//! MIME parsing itself is an external collaborator behind [`MimeIndexer`];
//! this module turns an indexer's output into the derived fields a stored
//! message carries: normalized and capped bodies, the preview line, the
//! indexed-header projection, and the identity fields the duplicate probe
//! and thread resolver key on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::RngCore;
use uuid::Uuid;

use crate::attachment::AttachmentPayload;
use crate::config::{StoreConfig, INTRO_LENGTH, MAX_INDEXED_HEADER_KEY, MAX_INDEXED_HEADER_VALUE};
use crate::thread::normalize_subject;

/// Output of the external MIME indexer for one raw message.
#[derive(Debug, Clone, Default)]
pub struct IndexedMessage {
    /// Header name/value pairs in message order, unfolded.
    pub headers: Vec<(String, String)>,
    /// Decoded plaintext body.
    pub text: Option<String>,
    /// Decoded HTML parts.
    pub html: Vec<String>,
    /// Raw message size in bytes.
    pub size: u64,
    /// IMAP envelope structure.
    pub envelope: Option<serde_json::Value>,
    /// IMAP BODYSTRUCTURE.
    pub bodystructure: Option<serde_json::Value>,
    /// Attachment bodies to persist.
    pub attachments: Vec<AttachmentPayload>,
    /// Attachment id to storage key.
    pub attachment_map: BTreeMap<String, String>,
    /// Per-delivery generation salt; generated here when absent.
    pub magic: Option<String>,
}

/// External MIME parser contract.
///
/// Implementations parse raw RFC 5322 bytes into the indexed bundle. The
/// store never inspects MIME syntax itself.
pub trait MimeIndexer: Send + Sync {
    /// Parses a raw message.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes cannot be parsed at all; indexers
    /// are expected to be lenient and degrade to an empty body instead
    /// where possible.
    fn index(&self, raw: &[u8]) -> crate::Result<IndexedMessage>;
}

/// A message with every derived field computed, ready for a slot.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    /// Internal date.
    pub idate: DateTime<Utc>,
    /// Parsed `Date:` header, falling back to `idate`.
    pub hdate: DateTime<Utc>,
    /// `Message-ID`, generated when missing.
    pub msgid: String,
    /// Normalized subject.
    pub subject: String,
    /// Raw reference strings for thread resolution.
    pub references: Vec<String>,
    /// Preview line.
    pub intro: String,
    /// Normalized, capped plaintext body.
    pub text: Option<String>,
    /// Cumulatively capped HTML parts.
    pub html: Vec<String>,
    /// Indexed-header projection.
    pub headers: Vec<(String, String)>,
    /// Raw message size in bytes.
    pub size: u64,
    /// IMAP envelope structure.
    pub envelope: Option<serde_json::Value>,
    /// IMAP BODYSTRUCTURE.
    pub bodystructure: Option<serde_json::Value>,
    /// Attachment bodies to persist.
    pub attachments: Vec<AttachmentPayload>,
    /// Attachment id to storage key.
    pub attachment_map: BTreeMap<String, String>,
    /// Per-delivery generation salt.
    pub magic: String,
}

/// Derives the stored fields from an indexed message.
#[must_use]
pub fn prepare(
    indexed: IndexedMessage,
    idate: Option<DateTime<Utc>>,
    config: &StoreConfig,
) -> PreparedMessage {
    let idate = idate.unwrap_or_else(Utc::now);
    let hdate = header(&indexed.headers, "date")
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
        .map_or(idate, |dt| dt.with_timezone(&Utc));

    let msgid = header(&indexed.headers, "message-id")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("<{}@mailvault>", Uuid::new_v4()));

    let subject = normalize_subject(header(&indexed.headers, "subject").unwrap_or(""));
    let references = collect_references(&indexed.headers, &msgid);

    let text = indexed
        .text
        .map(|t| truncate_chars(&normalize_newlines(&t), config.max_plaintext_content));
    let intro = text.as_deref().map(build_intro).unwrap_or_default();
    let html = truncate_html(indexed.html, config.max_html_content);
    let headers = project_headers(&indexed.headers, config);
    let magic = indexed.magic.unwrap_or_else(generate_magic);

    PreparedMessage {
        idate,
        hdate,
        msgid,
        subject,
        references,
        intro,
        text,
        html,
        headers,
        size: indexed.size,
        envelope: indexed.envelope,
        bodystructure: indexed.bodystructure,
        attachments: indexed.attachments,
        attachment_map: indexed.attachment_map,
        magic,
    }
}

/// First header value under the given lower-cased name.
fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Reference strings feeding the thread resolver: the message's own id,
/// `In-Reply-To`, the first 22 characters of `Thread-Index`, and the last
/// entry of `References`.
fn collect_references(headers: &[(String, String)], msgid: &str) -> Vec<String> {
    let mut refs = vec![msgid.to_string()];
    if let Some(value) = header(headers, "in-reply-to") {
        refs.push(value.trim().to_string());
    }
    if let Some(value) = header(headers, "thread-index") {
        let head: String = value.trim().chars().take(22).collect();
        if !head.is_empty() {
            refs.push(head);
        }
    }
    if let Some(value) = header(headers, "references") {
        if let Some(last) = value.split_whitespace().last() {
            refs.push(last.to_string());
        }
    }
    refs.retain(|r| !r.is_empty());
    refs
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Truncates to at most `max` bytes without tearing a UTF-8 sequence.
fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// The preview line: whitespace-collapsed text capped at
/// [`INTRO_LENGTH`] characters, cut back to the last word boundary when one
/// exists and suffixed with an ellipsis on truncation.
fn build_intro(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= INTRO_LENGTH {
        return collapsed;
    }
    let head: String = collapsed.chars().take(INTRO_LENGTH).collect();
    let cut = head.rfind(' ').unwrap_or(head.len());
    let mut intro = head[..cut].trim_end().to_string();
    intro.push('…');
    intro
}

/// Keeps HTML parts while they fit the cumulative byte budget; parts past
/// the budget are dropped rather than retained empty.
fn truncate_html(html: Vec<String>, budget: usize) -> Vec<String> {
    let mut remaining = budget;
    let mut out = Vec::with_capacity(html.len());
    for part in html {
        if part.len() <= remaining {
            remaining -= part.len();
            out.push(part);
        } else if remaining > 0 {
            out.push(truncate_chars(&part, remaining));
            remaining = 0;
        } else {
            break;
        }
    }
    out
}

/// Projects the indexed headers: keys lower-cased and restricted to the
/// fixed set plus configured extras, keys and values byte-capped. Value
/// truncation backs off four bytes so a torn multi-byte sequence can never
/// survive the cut.
fn project_headers(headers: &[(String, String)], config: &StoreConfig) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in headers {
        let key = truncate_chars(&key.to_lowercase(), MAX_INDEXED_HEADER_KEY);
        if !config.indexes_header(&key) {
            continue;
        }
        let value = if value.len() > MAX_INDEXED_HEADER_VALUE {
            truncate_chars(value, MAX_INDEXED_HEADER_VALUE - 4)
        } else {
            value.clone()
        };
        out.push((key, value));
    }
    out
}

/// Per-delivery attachment generation salt.
fn generate_magic() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn indexed(headers: Vec<(&str, &str)>) -> IndexedMessage {
        IndexedMessage {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            size: 1,
            ..IndexedMessage::default()
        }
    }

    #[test]
    fn hdate_parses_date_header_with_idate_fallback() {
        let config = StoreConfig::default();
        let idate = Utc::now();

        let parsed = prepare(
            indexed(vec![("Date", "Mon, 1 Jan 2024 10:00:00 +0000")]),
            Some(idate),
            &config,
        );
        assert_eq!(parsed.hdate.to_rfc3339(), "2024-01-01T10:00:00+00:00");

        let fallback = prepare(indexed(vec![("Date", "not a date")]), Some(idate), &config);
        assert_eq!(fallback.hdate, idate);
    }

    #[test]
    fn missing_msgid_is_generated() {
        let config = StoreConfig::default();
        let prepared = prepare(indexed(vec![]), None, &config);
        assert!(prepared.msgid.starts_with('<'));
        assert!(prepared.msgid.ends_with("@mailvault>"));
    }

    #[test]
    fn subject_is_normalized() {
        let config = StoreConfig::default();
        let prepared = prepare(
            indexed(vec![("Subject", "Re: Fwd:  hello   world")]),
            None,
            &config,
        );
        assert_eq!(prepared.subject, "hello world");
    }

    #[test]
    fn references_collect_one_of_each() {
        let config = StoreConfig::default();
        let prepared = prepare(
            indexed(vec![
                ("Message-ID", "<m@x>"),
                ("In-Reply-To", "<p@x>"),
                ("Thread-Index", "AdGxkNYgvYf3C7oVSpqlH6qJZVQavz0123456789"),
                ("References", "<a@x> <b@x> <c@x>"),
            ]),
            None,
            &config,
        );
        assert_eq!(
            prepared.references,
            vec!["<m@x>", "<p@x>", "AdGxkNYgvYf3C7oVSpqlH6", "<c@x>"]
        );
    }

    #[test]
    fn text_is_lf_normalized_and_capped() {
        let mut config = StoreConfig::default();
        config.max_plaintext_content = 8;
        let mut msg = indexed(vec![]);
        msg.text = Some("ab\r\ncd\r\nefghij".to_string());
        let prepared = prepare(msg, None, &config);
        assert_eq!(prepared.text.unwrap(), "ab\ncd\nef");
    }

    #[test]
    fn text_cap_respects_char_boundaries() {
        let mut config = StoreConfig::default();
        config.max_plaintext_content = 4;
        let mut msg = indexed(vec![]);
        msg.text = Some("aaaé".to_string());
        let prepared = prepare(msg, None, &config);
        // é straddles the cap; the whole char goes.
        assert_eq!(prepared.text.unwrap(), "aaa");
    }

    #[test]
    fn short_intro_is_untruncated() {
        let mut msg = indexed(vec![]);
        msg.text = Some("  hello \n world  ".to_string());
        let prepared = prepare(msg, None, &StoreConfig::default());
        assert_eq!(prepared.intro, "hello world");
    }

    #[test]
    fn long_intro_cuts_at_word_boundary_with_ellipsis() {
        let mut msg = indexed(vec![]);
        msg.text = Some("word ".repeat(40));
        let prepared = prepare(msg, None, &StoreConfig::default());
        assert!(prepared.intro.ends_with('…'));
        let body = prepared.intro.trim_end_matches('…');
        assert!(body.chars().count() <= INTRO_LENGTH);
        // A word boundary cut never leaves a split word.
        assert!(body.split(' ').all(|w| w == "word"));
    }

    #[test]
    fn html_budget_is_cumulative_and_drops_overflow() {
        let mut config = StoreConfig::default();
        config.max_html_content = 10;
        let mut msg = indexed(vec![]);
        msg.html = vec![
            "aaaa".to_string(),
            "bbbb".to_string(),
            "cccc".to_string(),
            "dddd".to_string(),
        ];
        let prepared = prepare(msg, None, &config);
        // 4 + 4 fit, the third is cut to the remaining 2, the fourth drops.
        assert_eq!(prepared.html, vec!["aaaa", "bbbb", "cc"]);
    }

    #[test]
    fn header_projection_filters_and_caps() {
        let config = StoreConfig::default();
        let long_value = "v".repeat(2000);
        let prepared = prepare(
            indexed(vec![
                ("From", "alice@example.com"),
                ("Received", "by relay"),
                ("SUBJECT", long_value.as_str()),
            ]),
            None,
            &config,
        );

        let keys: Vec<_> = prepared.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["from", "subject"]);
        let subject = &prepared.headers[1].1;
        assert_eq!(subject.len(), MAX_INDEXED_HEADER_VALUE - 4);
    }

    #[test]
    fn magic_is_generated_when_absent() {
        let prepared = prepare(indexed(vec![]), None, &StoreConfig::default());
        assert_eq!(prepared.magic.len(), 16);
        let other = prepare(indexed(vec![]), None, &StoreConfig::default());
        assert_ne!(prepared.magic, other.magic);
    }
}
