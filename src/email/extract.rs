//! MIME body → plain text.
//!
//! Transfer encodings and charsets are decoded by `mail-parser`; text parts
//! it cannot classify (unknown charset) are decoded as lossy UTF-8 here.

use std::sync::LazyLock;

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use regex::Regex;

use super::types::PlainText;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
        .expect("static regex")
});
static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"));
static BLOCK_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|table|blockquote)\s*>").expect("static regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("static regex"));

/// Non-fatal extraction problem. The message proceeds with empty text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionWarning {
    #[error("message could not be parsed as MIME")]
    Unparseable,
    #[error("no decodable text/plain or text/html part")]
    NoTextPart,
}

/// Extract the readable body of a raw MIME message.
///
/// Prefers the first non-empty `text/plain` part in tree order; falls back to
/// the first non-empty `text/html` part with markup stripped. Attachments and
/// embedded `message/rfc822` parts are not descended into.
pub fn extract(raw: &[u8]) -> (PlainText, Option<ExtractionWarning>) {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return (PlainText::empty(), Some(ExtractionWarning::Unparseable));
    };

    let mut leaves = Vec::new();
    collect_leaves(&parsed, 0, &mut leaves);

    let mut first_html: Option<String> = None;
    for part in leaves {
        match body_text(part) {
            Some(Body::Plain(text)) if !text.trim().is_empty() => {
                return (PlainText::new(normalize_newlines(&text), false), None);
            }
            Some(Body::Html(html)) if first_html.is_none() => {
                let text = strip_html(&html);
                if !text.trim().is_empty() {
                    first_html = Some(text);
                }
            }
            _ => {}
        }
    }

    match first_html {
        Some(text) => (PlainText::new(text, true), None),
        None => (PlainText::empty(), Some(ExtractionWarning::NoTextPart)),
    }
}

enum Body {
    Plain(String),
    Html(String),
}

/// Depth-first walk of the part tree, keeping leaf parts in document order.
fn collect_leaves<'a>(message: &'a Message<'a>, id: usize, out: &mut Vec<&'a MessagePart<'a>>) {
    let Some(part) = message.parts.get(id) else {
        return;
    };
    match &part.body {
        PartType::Multipart(children) => {
            for child in children {
                collect_leaves(message, *child as usize, out);
            }
        }
        PartType::Message(_) => {}
        _ => out.push(part),
    }
}

fn body_text(part: &MessagePart<'_>) -> Option<Body> {
    if is_attachment(part) {
        return None;
    }
    match &part.body {
        // mail-parser files every non-html `text/*` subtype here.
        PartType::Text(text) if is_plain(part) => Some(Body::Plain(text.to_string())),
        PartType::Text(_) => None,
        PartType::Html(html) => Some(Body::Html(html.to_string())),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            let ct = part.content_type()?;
            if !ct.ctype().eq_ignore_ascii_case("text") {
                return None;
            }
            let decoded = String::from_utf8_lossy(bytes).into_owned();
            match ct.subtype() {
                Some(sub) if sub.eq_ignore_ascii_case("html") => Some(Body::Html(decoded)),
                Some(sub) if sub.eq_ignore_ascii_case("plain") => Some(Body::Plain(decoded)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Missing Content-Type defaults to `text/plain`.
fn is_plain(part: &MessagePart<'_>) -> bool {
    match part.content_type() {
        None => true,
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_none_or(|sub| sub.eq_ignore_ascii_case("plain"))
        }
    }
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Convert HTML to readable text.
///
/// Drops script/style blocks, turns `<br>` into a newline and block-level
/// closers into a blank line, strips remaining tags, decodes common entities
/// and collapses runs of blank lines.
pub fn strip_html(html: &str) -> String {
    let text = normalize_newlines(html);
    let text = SCRIPT_STYLE.replace_all(&text, "");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = BLOCK_END.replace_all(&text, "\n\n");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);

    let trimmed_lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = trimmed_lines.join("\n");
    BLANK_RUN.replace_all(&joined, "\n\n").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
