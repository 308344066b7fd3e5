//! Message parsing and body selection.

use std::sync::LazyLock;

use mail_parser::{Address, MessageParser, MimeHeaders, PartType};
use regex::Regex;

use crate::mail::RawMail;
use crate::pipeline::types::{DedupStrategy, InboundMail};

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("static pattern"));

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static pattern"));

/// The fields of a raw message the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    pub from: String,
    pub sender_addresses: Vec<String>,
    pub to: String,
    pub subject: String,
    pub message_id: Option<String>,
    /// Unix seconds of the internal date, or of the Date header as fallback.
    pub timestamp: i64,
    /// Last inline text/plain part.
    pub plain: Option<String>,
    /// Last inline text/html part.
    pub html: Option<String>,
    pub attachment_names: Vec<String>,
}

impl ParsedMail {
    /// Parse a fetched message. `None` if it is not a message at all.
    pub fn parse(raw: &RawMail) -> Option<Self> {
        if raw.body.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let message = MessageParser::default().parse(&raw.body)?;

        let mut parsed = Self {
            from: format_addresses(message.from()),
            sender_addresses: bare_addresses(message.from()),
            to: format_addresses(message.to()),
            subject: message.subject().unwrap_or_default().to_string(),
            message_id: message.message_id().map(str::to_string),
            timestamp: raw
                .internal_date
                .map(|d| d.timestamp())
                .or_else(|| message.date().map(|d| d.to_timestamp()))
                .unwrap_or(0),
            ..Self::default()
        };

        for part in &message.parts {
            let is_attachment = part.attachment_name().is_some()
                || part
                    .content_disposition()
                    .is_some_and(|d| d.is_attachment());
            match &part.body {
                PartType::Multipart(_) => {}
                PartType::Text(text) if !is_attachment => parsed.plain = Some(text.to_string()),
                PartType::Html(html) if !is_attachment => parsed.html = Some(html.to_string()),
                _ if is_attachment => parsed
                    .attachment_names
                    .push(part.attachment_name().unwrap_or("unnamed").to_string()),
                _ => {}
            }
        }

        Some(parsed)
    }

    /// Choose the body to deliver given the room's HTML preference.
    ///
    /// Returns the body and whether it is HTML.
    pub fn select_body(&self, prefer_html: bool) -> (String, bool) {
        // A blank plain part is common in multipart/alternative mail.
        let plain = self.plain.as_ref().filter(|p| !p.trim().is_empty());
        match (&self.html, plain) {
            (Some(html), _) if prefer_html => (unescape(html), true),
            (_, Some(plain)) => (plain.clone(), false),
            (Some(html), None) => (html_to_plain(html), false),
            (None, None) => (String::new(), false),
        }
    }

    /// The room-scoped key that marks this message as seen.
    pub fn dedup_key(&self, strategy: DedupStrategy) -> String {
        match (strategy, &self.message_id) {
            (DedupStrategy::MessageId, Some(id)) if !id.is_empty() => id.clone(),
            _ => format!("{}{}", self.subject, self.timestamp),
        }
    }

    /// Normalize for delivery.
    pub fn into_inbound(self, prefer_html: bool) -> InboundMail {
        let (body, is_html) = self.select_body(prefer_html);
        InboundMail {
            from: self.from,
            sender_addresses: self.sender_addresses,
            to: self.to,
            subject: self.subject,
            body,
            is_html,
            attachment_names: self.attachment_names,
        }
    }
}

fn bare_addresses(addr: Option<&Address>) -> Vec<String> {
    addr.map(|a| {
        a.iter()
            .filter_map(|a| a.address())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn format_addresses(addr: Option<&Address>) -> String {
    let Some(addr) = addr else {
        return String::new();
    };
    addr.iter()
        .map(|a| match (a.name(), a.address()) {
            (Some(name), Some(address)) => format!("{name} <{address}>"),
            (None, Some(address)) => address.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode HTML entities.
pub fn unescape(html: &str) -> String {
    html_escape::decode_html_entities(html).into_owned()
}

/// Plain-text fallback for an HTML body: line breaks kept, tags dropped,
/// entities decoded.
pub fn html_to_plain(html: &str) -> String {
    let with_breaks = LINE_BREAK.replace_all(html, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    unescape(stripped.trim())
}
