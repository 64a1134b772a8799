//! Message reconstruction
//!
//! Rebuilds a wire-format RFC 5322 message from the stored rows so that a
//! conforming IMAP `FETCH BODY[]` returns it unchanged. Reconstruction is
//! deterministic for a fixed message and never fails on a message that
//! was successfully stored: a missing blob yields an empty body inside a
//! syntactically valid message.

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::blobs::{self, BlobBackend};
use crate::clock::Clock;
use crate::errors::StoreResult;
use crate::message;
use crate::models::{HeaderField, PartRow, StoredBody};

/// Headers regenerated for multipart output instead of replayed
const REGENERATED: [&str; 3] = ["Content-Type", "MIME-Version", "Content-Transfer-Encoding"];

/// Reconstruct one stored message as CRLF-terminated bytes
///
/// # Errors
///
/// Returns `NotFound` if the message row is absent; storage-level read
/// failures surface. Blob fetch failures do not fail the call.
pub fn reconstruct_message(
    conn: &Connection,
    message_id: i64,
    clock: &dyn Clock,
    backend: Option<&dyn BlobBackend>,
) -> StoreResult<Vec<u8>> {
    message::get_message(conn, message_id)?;
    let headers = message::load_headers(conn, message_id)?;
    let parts = message::load_parts(conn, message_id)?;

    let mut out = Vec::new();
    if parts.len() > 1 {
        emit_multipart(&mut out, &headers, &parts, conn, clock, backend);
    } else {
        emit_single(&mut out, &headers, parts.first(), conn, backend);
    }
    debug!(message_id, bytes = out.len(), "message reconstructed");
    Ok(out)
}

/// Structural plan for the rebuilt body
///
/// Leaves index into the stored part list; containers carry the multipart
/// subtype they will be emitted as.
enum Node {
    Leaf(usize),
    Multi { subtype: &'static str, children: Vec<Node> },
}

/// Classification of a stored leaf part
#[derive(PartialEq, Eq, Clone, Copy)]
enum Role {
    Text,
    Attachment,
    InlineResource,
}

/// Classify one non-container part
///
/// Order matters: an explicit `attachment` disposition always wins, text
/// follows, and a `Content-ID` under a `multipart/related` container
/// marks an inline resource even without a disposition.
fn classify(part: &PartRow, parts: &[PartRow]) -> Role {
    let disposition = part.content_disposition.to_ascii_lowercase();
    if disposition.starts_with("attachment") {
        return Role::Attachment;
    }
    if part.content_type.starts_with("text/") {
        return Role::Text;
    }
    let related_parent = part
        .parent_part_id
        .and_then(|pid| parts.iter().find(|p| p.id == pid))
        .is_some_and(|p| p.content_type.starts_with("multipart/related"));
    if disposition.starts_with("inline") || (!part.content_id.is_empty() && related_parent) {
        return Role::InlineResource;
    }
    Role::Attachment
}

/// Decide the body structure for the classified leaves
///
/// Implements the structure table: attachments force a `multipart/mixed`
/// envelope; inline resources hang off a `multipart/related` block whose
/// HTML part comes first; plain+html pairs become `multipart/alternative`.
fn plan_body(parts: &[PartRow]) -> Option<Node> {
    let mut texts = Vec::new();
    let mut attachments = Vec::new();
    let mut inlines = Vec::new();
    for (index, part) in parts.iter().enumerate() {
        if part.is_container() {
            continue;
        }
        match classify(part, parts) {
            Role::Text => texts.push(index),
            Role::Attachment => attachments.push(index),
            Role::InlineResource => inlines.push(index),
        }
    }

    let block = plan_text_block(parts, &texts, &inlines);
    if attachments.is_empty() {
        return block;
    }
    let mut children = Vec::new();
    if let Some(block) = block {
        children.push(block);
    }
    children.extend(attachments.into_iter().map(Node::Leaf));
    Some(Node::Multi {
        subtype: "mixed",
        children,
    })
}

/// Resolve the text/inline-resource block of the structure table
fn plan_text_block(parts: &[PartRow], texts: &[usize], inlines: &[usize]) -> Option<Node> {
    let plain = texts
        .iter()
        .copied()
        .find(|&i| parts[i].content_type.starts_with("text/plain"));
    let html = texts
        .iter()
        .copied()
        .find(|&i| parts[i].content_type.starts_with("text/html"));
    let mut others: Vec<usize> = texts
        .iter()
        .copied()
        .filter(|&i| Some(i) != plain && Some(i) != html)
        .collect();

    let core = match (plain, html) {
        (Some(plain), Some(html)) if !inlines.is_empty() => Node::Multi {
            subtype: "alternative",
            children: vec![Node::Leaf(plain), related_block(html, inlines)],
        },
        (None, Some(html)) if !inlines.is_empty() => related_block(html, inlines),
        (Some(plain), Some(html)) => Node::Multi {
            subtype: "alternative",
            children: vec![Node::Leaf(plain), Node::Leaf(html)],
        },
        _ if texts.len() == 1 && inlines.is_empty() => Node::Leaf(texts[0]),
        _ if texts.is_empty() && inlines.is_empty() => return None,
        // Combinations the table leaves open keep every part visible.
        _ => Node::Multi {
            subtype: "mixed",
            children: texts
                .iter()
                .chain(inlines.iter())
                .copied()
                .map(Node::Leaf)
                .collect(),
        },
    };

    if others.is_empty()
        || matches!(core, Node::Leaf(_))
        || matches!(core, Node::Multi { subtype: "mixed", .. })
    {
        return Some(core);
    }
    let mut children = vec![core];
    children.extend(others.drain(..).map(Node::Leaf));
    Some(Node::Multi {
        subtype: "mixed",
        children,
    })
}

/// Build a `multipart/related` block with the HTML root first
///
/// Clients take the first part of a related block as the root; an inline
/// image emitted before the HTML would render as the whole body.
fn related_block(html: usize, inlines: &[usize]) -> Node {
    let mut children = vec![Node::Leaf(html)];
    children.extend(inlines.iter().copied().map(Node::Leaf));
    Node::Multi {
        subtype: "related",
        children,
    }
}

/// Deterministic per-call boundary source
struct Boundaries {
    next: u64,
}

impl Boundaries {
    fn new(clock: &dyn Clock) -> Self {
        Self { next: clock.ticks() }
    }

    fn take(&mut self, subtype: &str) -> String {
        let n = self.next;
        self.next += 1;
        let kind = match subtype {
            "alternative" => "Alternative",
            "related" => "Related",
            _ => "Mixed",
        };
        format!("----=_Part_{kind}_{n}")
    }
}

/// Emit the multipart path: filtered headers plus a regenerated body
fn emit_multipart(
    out: &mut Vec<u8>,
    headers: &[HeaderField],
    parts: &[PartRow],
    conn: &Connection,
    clock: &dyn Clock,
    backend: Option<&dyn BlobBackend>,
) {
    for header in headers {
        if REGENERATED.iter().any(|r| header.name.eq_ignore_ascii_case(r)) {
            continue;
        }
        push_header(out, &header.name, &header.value);
    }
    push_header(out, "MIME-Version", "1.0");

    let mut boundaries = Boundaries::new(clock);
    match plan_body(parts) {
        Some(node) => emit_node(out, &node, parts, &mut boundaries, conn, backend),
        None => {
            // Nothing but containers survived; a bare empty text part
            // keeps the output well-formed.
            push_header(out, "Content-Type", "text/plain; charset=us-ascii");
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Emit the single-part path: stored headers replayed verbatim
fn emit_single(
    out: &mut Vec<u8>,
    headers: &[HeaderField],
    part: Option<&PartRow>,
    conn: &Connection,
    backend: Option<&dyn BlobBackend>,
) {
    for header in headers {
        push_header(out, &header.name, &header.value);
    }
    let Some(part) = part else {
        out.extend_from_slice(b"\r\n");
        return;
    };

    let has = |name: &str| headers.iter().any(|h| h.name.eq_ignore_ascii_case(name));
    if !has("Content-Type") {
        push_header(out, "Content-Type", &content_type_value(part));
    }
    if !has("Content-Transfer-Encoding") && !part.transfer_encoding.is_empty() {
        push_header(out, "Content-Transfer-Encoding", &part.transfer_encoding);
    }
    out.extend_from_slice(b"\r\n");
    push_body(out, part, conn, backend);
}

/// Emit one structure node (headers and content, no surrounding boundary)
fn emit_node(
    out: &mut Vec<u8>,
    node: &Node,
    parts: &[PartRow],
    boundaries: &mut Boundaries,
    conn: &Connection,
    backend: Option<&dyn BlobBackend>,
) {
    match node {
        Node::Leaf(index) => {
            let part = &parts[*index];
            emit_leaf_headers(out, part);
            out.extend_from_slice(b"\r\n");
            push_body(out, part, conn, backend);
        }
        Node::Multi { subtype, children } => {
            let boundary = boundaries.take(subtype);
            push_header(
                out,
                "Content-Type",
                &format!("multipart/{subtype}; boundary=\"{boundary}\""),
            );
            out.extend_from_slice(b"\r\n");
            for child in children {
                out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
                emit_node(out, child, parts, boundaries, conn, backend);
            }
            out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        }
    }
}

/// Per-part header block for an emitted leaf
fn emit_leaf_headers(out: &mut Vec<u8>, part: &PartRow) {
    push_header(out, "Content-Type", &content_type_value(part));

    let is_text = part.content_type.starts_with("text/");
    if !part.transfer_encoding.is_empty() {
        push_header(out, "Content-Transfer-Encoding", &part.transfer_encoding);
    } else if is_text {
        push_header(out, "Content-Transfer-Encoding", "7bit");
    }
    if !part.content_id.is_empty() {
        push_header(out, "Content-ID", &part.content_id);
    }
    if !part.content_disposition.is_empty() {
        push_header(out, "Content-Disposition", &part.content_disposition);
    } else if !is_text
        && let Some(filename) = &part.filename
    {
        push_header(
            out,
            "Content-Disposition",
            &format!("attachment; filename=\"{filename}\""),
        );
    }
}

/// `Content-Type` value with charset and name parameters
fn content_type_value(part: &PartRow) -> String {
    let mut value = part.content_type.clone();
    if part.content_type.starts_with("text/") && !part.charset.is_empty() {
        value.push_str(&format!("; charset={}", part.charset));
    }
    if let Some(filename) = &part.filename {
        value.push_str(&format!("; name=\"{filename}\""));
    }
    value
}

/// Append one header line
fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Append a part's content, CRLF-terminated
fn push_body(out: &mut Vec<u8>, part: &PartRow, conn: &Connection, backend: Option<&dyn BlobBackend>) {
    let bytes = match &part.body {
        StoredBody::Inline(text) => text.clone().into_bytes(),
        StoredBody::Blob(id) => match blobs::get(conn, *id, backend) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(blob_id = id, error = %e, "blob unavailable, emitting empty body");
                Vec::new()
            }
        },
        StoredBody::Container => Vec::new(),
    };
    let bytes = rewrap_base64(bytes, &part.transfer_encoding);
    out.extend_from_slice(&bytes);
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
}

/// Re-wrap single-line base64 at 76 columns (RFC 2045)
///
/// Content already wrapped at 78 columns or less is left untouched.
fn rewrap_base64(bytes: Vec<u8>, transfer_encoding: &str) -> Vec<u8> {
    if !transfer_encoding.eq_ignore_ascii_case("base64") {
        return bytes;
    }
    let content = bytes.trim_ascii_end();
    if content.contains(&b'\n') || content.len() <= 78 {
        return bytes;
    }
    let mut wrapped = Vec::with_capacity(content.len() + content.len() / 38);
    for chunk in content.chunks(76) {
        wrapped.extend_from_slice(chunk);
        wrapped.extend_from_slice(b"\r\n");
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    use crate::clock::{Clock, FixedClock};
    use crate::message::store_message;
    use crate::mime::parse_message;
    use crate::schema;

    use super::reconstruct_message;

    fn shard() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        schema::configure_connection(&conn).expect("configure");
        schema::install_shard(&conn).expect("install");
        conn
    }

    fn clock() -> FixedClock {
        FixedClock::at(Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap())
    }

    fn store(conn: &mut Connection, raw: &[u8]) -> i64 {
        let parsed = parse_message(raw, clock().now()).expect("parse");
        store_message(conn, &parsed, clock().now(), 1024, None).expect("store")
    }

    #[test]
    fn single_part_replays_stored_headers_verbatim() {
        let mut conn = shard();
        let raw = b"From: alice@example.com\r\nTo: bob@example.com\r\nSubject: plain\r\nContent-Type: text/plain; charset=utf-8\r\n\r\njust text\r\n";
        let id = store(&mut conn, raw);
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");

        let text = String::from_utf8(rebuilt).expect("utf8");
        assert!(text.starts_with("From: alice@example.com\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\njust text\r\n"));
    }

    #[test]
    fn single_part_without_content_type_gets_a_synthesized_one() {
        let mut conn = shard();
        let id = store(&mut conn, b"Subject: bare\r\n\r\nbody");
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");
        assert!(text.contains("Content-Type: text/plain; charset=us-ascii\r\n"));
    }

    #[test]
    fn html_precedes_inline_resources_in_related_blocks() {
        let mut conn = shard();
        let raw = concat!(
            "From: a@example.com\r\n",
            "Subject: inline image\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"alt\"\r\n",
            "\r\n",
            "--alt\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "see image\r\n",
            "--alt\r\n",
            "Content-Type: multipart/related; boundary=\"rel\"\r\n",
            "\r\n",
            "--rel\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<img src=\"cid:logo@x\">\r\n",
            "--rel\r\n",
            "Content-Type: image/png\r\n",
            "Content-ID: <logo@x>\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "iVBORw0KGgo=\r\n",
            "--rel--\r\n",
            "--alt--\r\n",
        )
        .as_bytes();
        let id = store(&mut conn, raw);
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");

        let related = text.find("multipart/related").expect("related block");
        let html = text[related..].find("text/html").expect("html part") + related;
        let image = text[related..].find("image/png").expect("image part") + related;
        assert!(html < image, "html must be the related root");
        assert!(text.contains("cid:logo@x"));
        assert!(text.contains("Content-ID: <logo@x>"));
        assert!(text.contains("multipart/alternative"));
    }

    #[test]
    fn nested_alternative_under_related_keeps_image_last() {
        // multipart/related { multipart/alternative { plain, html }, image }
        let mut conn = shard();
        let raw = concat!(
            "Subject: layered\r\n",
            "Content-Type: multipart/related; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hello\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>hello</p>\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: image/png\r\n",
            "Content-ID: <logo>\r\n",
            "\r\n",
            "PNG\r\n",
            "--outer--\r\n",
        )
        .as_bytes();
        let id = store(&mut conn, raw);
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");

        let alt = text.find("multipart/alternative").expect("alt block");
        let related = text.find("multipart/related").expect("related block");
        let html = text.find("text/html").expect("html part");
        let image = text.find("image/png").expect("image part");
        assert!(alt < image, "alternative must precede the inline image");
        assert!(related < image && html < image);
    }

    #[test]
    fn attachments_force_a_mixed_envelope_with_synthesized_disposition() {
        let mut conn = shard();
        let payload = "QUJD".repeat(700);
        let raw = format!(
            concat!(
                "Subject: with attachment\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: text/plain\r\n",
                "\r\n",
                "body text\r\n",
                "--b\r\n",
                "Content-Type: application/pdf; name=\"file.pdf\"\r\n",
                "Content-Transfer-Encoding: base64\r\n",
                "\r\n",
                "{payload}\r\n",
                "--b--\r\n",
            ),
            payload = payload
        );
        let id = store(&mut conn, raw.as_bytes());
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");

        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("Content-Disposition: attachment; filename=\"file.pdf\""));
        let body = text.find("body text").expect("text part");
        let pdf = text.find("application/pdf").expect("attachment");
        assert!(body < pdf);
    }

    #[test]
    fn long_single_line_base64_is_rewrapped_at_76_columns() {
        let mut conn = shard();
        let payload = "QUJD".repeat(700);
        let raw = format!(
            concat!(
                "Subject: wrap me\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: application/octet-stream\r\n",
                "Content-Disposition: attachment; filename=\"blob.bin\"\r\n",
                "Content-Transfer-Encoding: base64\r\n",
                "\r\n",
                "{payload}\r\n",
                "--b--\r\n",
            ),
            payload = payload
        );
        let id = store(&mut conn, raw.as_bytes());
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");

        let longest = text.lines().map(str::len).max().unwrap_or(0);
        assert!(longest <= 78, "longest line is {longest}");
        assert!(text.contains(&payload[..76]));
    }

    #[test]
    fn missing_blob_yields_empty_body_not_an_error() {
        let mut conn = shard();
        let payload = "QUJD".repeat(700);
        let raw = format!(
            concat!(
                "Subject: doomed blob\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: text/plain\r\n",
                "\r\n",
                "survivor\r\n",
                "--b\r\n",
                "Content-Type: application/octet-stream\r\n",
                "Content-Disposition: attachment; filename=\"gone.bin\"\r\n",
                "Content-Transfer-Encoding: base64\r\n",
                "\r\n",
                "{payload}\r\n",
                "--b--\r\n",
            ),
            payload = payload
        );
        let id = store(&mut conn, raw.as_bytes());
        conn.execute("DELETE FROM blobs", []).expect("drop blobs");

        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");
        assert!(text.contains("survivor"));
        assert!(text.contains("gone.bin"));
        assert!(text.ends_with("--\r\n"));
    }

    #[test]
    fn boundaries_are_unique_within_one_reconstruction() {
        let mut conn = shard();
        let raw = concat!(
            "Subject: three levels\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: multipart/alternative; boundary=\"a\"\r\n",
            "\r\n",
            "--a\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "p\r\n",
            "--a\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>p</p>\r\n",
            "--a--\r\n",
            "--b\r\n",
            "Content-Type: application/zip\r\n",
            "Content-Disposition: attachment; filename=\"z.zip\"\r\n",
            "\r\n",
            "PK\r\n",
            "--b--\r\n",
        )
        .as_bytes();
        let id = store(&mut conn, raw);
        let rebuilt = reconstruct_message(&conn, id, &clock(), None).expect("reconstruct");
        let text = String::from_utf8(rebuilt).expect("utf8");

        let mixed = text.find("boundary=\"----=_Part_Mixed_").expect("mixed boundary");
        let alternative = text
            .find("boundary=\"----=_Part_Alternative_")
            .expect("alternative boundary");
        assert_ne!(mixed, alternative);

        // Re-parsing the rebuilt stream yields the same part shape.
        let reparsed = crate::mime::parse_message(text.as_bytes(), clock().now()).expect("reparse");
        let types: Vec<&str> = reparsed
            .parts
            .iter()
            .map(|p| p.content_type.as_str())
            .collect();
        assert_eq!(
            types,
            [
                "multipart/mixed",
                "multipart/alternative",
                "text/plain",
                "text/html",
                "application/zip",
            ]
        );
    }
}
