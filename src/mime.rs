//! Message parsing
//!
//! Parses RFC 5322 / MIME messages using `mailparse` into the normalized
//! representation the store persists: an ordered header list with folded
//! values preserved verbatim, parsed address lists, and a flat part list
//! produced by a depth-first walk in which every multipart container is
//! emitted before its children.

use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use tracing::debug;

use crate::errors::{StoreError, StoreResult};
use crate::models::{AddressField, HeaderField};

/// Body variant of a freshly parsed part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedBody {
    /// `multipart/*` container; children follow in the flat list
    Container,
    /// Original encoded body bytes, exactly as on the wire
    Data(Vec<u8>),
}

/// One part of the flat, depth-first part list
///
/// `parent` refers by index into the list; the root of the traversal has
/// no parent. `part_number` is the 1-based position at the part's
/// recursion level, so the pair reconstructs the tree.
#[derive(Debug, Clone)]
pub struct ParsedPart {
    pub part_number: i64,
    pub parent: Option<usize>,
    pub content_type: String,
    /// Raw `Content-Disposition` value, or empty
    pub content_disposition: String,
    pub transfer_encoding: String,
    pub charset: String,
    pub filename: Option<String>,
    /// `Content-ID` verbatim including angle brackets, or empty
    pub content_id: String,
    pub body: ParsedBody,
}

/// Parsed message representation
///
/// Holds everything the store half needs: headers in original order,
/// convenience fields, address lists, and the flat part list.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Ordered headers; values keep folded continuations verbatim
    pub headers: Vec<HeaderField>,
    pub subject: String,
    pub in_reply_to: String,
    pub references: String,
    /// Parsed `Date` header; invalid or missing falls back to the
    /// caller-supplied instant
    pub date: DateTime<Utc>,
    pub from: Vec<AddressField>,
    pub to: Vec<AddressField>,
    pub cc: Vec<AddressField>,
    pub bcc: Vec<AddressField>,
    pub parts: Vec<ParsedPart>,
    /// Length of the raw message buffer
    pub size: usize,
}

impl ParsedMessage {
    /// First header value by case-insensitive name, unfolded
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Parse one RFC 5322 message
///
/// The parser is lenient: missing or unparseable child content types
/// fall back to `text/plain`, a `multipart/*` without a usable boundary
/// becomes an opaque single part, and only an unparseable outer envelope
/// fails.
///
/// # Errors
///
/// Returns `MalformedMessage` if the outer envelope cannot be parsed.
pub fn parse_message(raw: &[u8], fallback_date: DateTime<Utc>) -> StoreResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| StoreError::MalformedMessage(format!("cannot parse message: {e}")))?;

    let headers = collect_headers(&parsed.headers);
    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or(fallback_date);

    let mut parts = Vec::new();
    walk_parts(&parsed, None, 1, &mut parts);
    debug!(
        headers = headers.len(),
        parts = parts.len(),
        size = raw.len(),
        "message parsed"
    );

    Ok(ParsedMessage {
        subject: parsed.headers.get_first_value("Subject").unwrap_or_default(),
        in_reply_to: parsed
            .headers
            .get_first_value("In-Reply-To")
            .unwrap_or_default(),
        references: parsed
            .headers
            .get_first_value("References")
            .unwrap_or_default(),
        date,
        from: address_list(&parsed.headers, "From"),
        to: address_list(&parsed.headers, "To"),
        cc: address_list(&parsed.headers, "Cc"),
        bcc: address_list(&parsed.headers, "Bcc"),
        headers,
        parts,
        size: raw.len(),
    })
}

/// Collect ordered headers with folded values preserved
///
/// `get_value_raw` keeps internal `\r\n ` / `\r\n\t` continuation
/// sequences; only the outer whitespace is trimmed. Re-wrapping or
/// trimming internal whitespace here would break clients that verify
/// signatures over folded values.
fn collect_headers(headers: &[MailHeader<'_>]) -> Vec<HeaderField> {
    headers
        .iter()
        .map(|h| HeaderField {
            name: h.get_key(),
            value: String::from_utf8_lossy(h.get_value_raw())
                .trim()
                .to_owned(),
        })
        .collect()
}

/// Parse one address header into ordered (name, email) pairs
///
/// Groups are flattened; an unparseable header yields an empty list.
fn address_list(headers: &[MailHeader<'_>], name: &str) -> Vec<AddressField> {
    let Some(header) = headers.iter().find(|h| h.get_key_ref().eq_ignore_ascii_case(name)) else {
        return Vec::new();
    };
    let Ok(parsed) = mailparse::addrparse_header(header) else {
        debug!(header = name, "unparseable address header skipped");
        return Vec::new();
    };

    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(single) => out.push(AddressField {
                name: single.display_name.clone().unwrap_or_default(),
                email: single.addr.clone(),
            }),
            MailAddr::Group(group) => {
                for single in &group.addrs {
                    out.push(AddressField {
                        name: single.display_name.clone().unwrap_or_default(),
                        email: single.addr.clone(),
                    });
                }
            }
        }
    }
    out
}

/// Depth-first walk emitting containers before their children
///
/// `number` is the 1-based position at the current recursion level. A
/// `multipart/*` part without subparts (no boundary, or an empty body)
/// is treated as an opaque leaf.
fn walk_parts(part: &ParsedMail<'_>, parent: Option<usize>, number: i64, out: &mut Vec<ParsedPart>) {
    let is_container = part.ctype.mimetype.starts_with("multipart/") && !part.subparts.is_empty();
    let index = out.len();
    out.push(build_part(part, parent, number, is_container));

    if is_container {
        for (i, sub) in part.subparts.iter().enumerate() {
            walk_parts(sub, Some(index), (i + 1) as i64, out);
        }
    }
}

/// Extract one part's metadata and body
fn build_part(
    part: &ParsedMail<'_>,
    parent: Option<usize>,
    number: i64,
    is_container: bool,
) -> ParsedPart {
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());

    let body = if is_container {
        ParsedBody::Container
    } else {
        ParsedBody::Data(raw_body(part))
    };

    ParsedPart {
        part_number: number,
        parent,
        content_type: part.ctype.mimetype.to_ascii_lowercase(),
        content_disposition: part
            .headers
            .get_first_value("Content-Disposition")
            .map(|v| v.trim().to_owned())
            .unwrap_or_default(),
        transfer_encoding: part
            .headers
            .get_first_value("Content-Transfer-Encoding")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default(),
        charset: part.ctype.charset.to_ascii_lowercase(),
        filename,
        content_id: part
            .headers
            .get_first_value("Content-ID")
            .map(|v| v.trim().to_owned())
            .unwrap_or_default(),
        body,
    }
}

/// Undecoded body bytes of a leaf part
///
/// The store keeps the on-the-wire form; decoding happens only for blob
/// fingerprinting and front-end rendering.
fn raw_body(part: &ParsedMail<'_>) -> Vec<u8> {
    use mailparse::body::Body;
    match part.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw().to_vec(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().to_vec(),
        Body::Binary(body) => body.get_raw().to_vec(),
    }
}
