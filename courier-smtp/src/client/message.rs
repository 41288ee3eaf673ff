//! MIME rendering for outgoing mail.
//!
//! Messages are always `multipart/alternative` with a `text/plain` part
//! followed by a `text/html` part (either may be omitted). Each part is base64
//! encoded so arbitrary UTF-8 survives 7-bit relays. Attachments are never
//! fetched; they are listed as links at the end of each part.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use courier_common::Attachment;
use ulid::Ulid;

/// Column at which base64 bodies are wrapped (RFC 2045).
const BASE64_LINE_LENGTH: usize = 76;

/// Raw bytes per RFC 2047 encoded word, keeping each word under 75 characters.
const ENCODED_WORD_BYTES: usize = 45;

#[derive(Debug, Clone)]
struct Mailbox {
    email: String,
    name: Option<String>,
}

impl Mailbox {
    fn render(&self) -> String {
        let email = strip_line_breaks(&self.email);
        match self.name.as_deref().map(strip_line_breaks) {
            Some(name) if !name.is_empty() => {
                format!("{} <{email}>", encode_display_name(&name))
            }
            _ => format!("<{email}>"),
        }
    }
}

/// Builder for a complete RFC 5322 message, headers included.
///
/// ```
/// use courier_smtp::client::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("noreply@example.com", Some("Bookings"))
///     .to("jane@example.com", None)
///     .subject("Your booking")
///     .text("See you on Monday")
///     .build();
///
/// assert!(message.contains("Subject: Your booking\r\n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<Mailbox>,
    to: Option<Mailbox>,
    subject: Option<String>,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, email: impl Into<String>, name: Option<&str>) -> Self {
        self.from = Some(Mailbox {
            email: email.into(),
            name: name.map(str::to_string),
        });
        self
    }

    #[must_use]
    pub fn to(mut self, email: impl Into<String>, name: Option<&str>) -> Self {
        self.to = Some(Mailbox {
            email: email.into(),
            name: name.map(str::to_string),
        });
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the `text/plain` alternative.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    /// Sets the `text/html` alternative.
    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    #[must_use]
    pub fn attachments(mut self, attachments: &[Attachment]) -> Self {
        self.attachments.extend_from_slice(attachments);
        self
    }

    /// Renders the message with CRLF line endings.
    #[must_use]
    pub fn build(self) -> String {
        let boundary = generate_boundary();
        let mut lines = Vec::with_capacity(32);

        if let Some(from) = &self.from {
            lines.push(format!("From: {}", from.render()));
        }
        if let Some(to) = &self.to {
            lines.push(format!("To: {}", to.render()));
        }
        if let Some(subject) = &self.subject {
            lines.push(format!("Subject: {}", encode_header_text(subject)));
        }
        lines.push(format!("Date: {}", Utc::now().to_rfc2822()));
        lines.push(format!("Message-ID: <{}@{}>", Ulid::new(), self.id_domain()));

        lines.push("MIME-Version: 1.0".to_string());
        lines.push(format!(
            "Content-Type: multipart/alternative; boundary=\"{boundary}\""
        ));
        lines.push(String::new());

        if let Some(text) = &self.text {
            let body = append_text_links(text, &self.attachments);
            push_part(&mut lines, &boundary, "text/plain", &body);
        }
        if let Some(html) = &self.html {
            let body = append_html_links(html, &self.attachments);
            push_part(&mut lines, &boundary, "text/html", &body);
        }

        lines.push(format!("--{boundary}--"));
        lines.push(String::new());

        lines.join("\r\n")
    }

    /// The sender's domain, or `localhost` without a sender.
    fn id_domain(&self) -> String {
        self.from
            .as_ref()
            .and_then(|from| from.email.rsplit_once('@'))
            .map(|(_, domain)| strip_line_breaks(domain))
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn push_part(lines: &mut Vec<String>, boundary: &str, content_type: &str, body: &str) {
    lines.push(format!("--{boundary}"));
    lines.push(format!("Content-Type: {content_type}; charset=utf-8"));
    lines.push("Content-Transfer-Encoding: base64".to_string());
    lines.push(String::new());
    lines.push(wrap_base64(body.as_bytes()));
}

/// A boundary that cannot collide with base64 content or another message.
fn generate_boundary() -> String {
    format!("=_courier_{}", Ulid::new())
}

fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + 2 * (encoded.len() / BASE64_LINE_LENGTH));

    for (i, c) in encoded.chars().enumerate() {
        if i > 0 && i % BASE64_LINE_LENGTH == 0 {
            out.push_str("\r\n");
        }
        out.push(c);
    }

    out
}

fn strip_line_breaks(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Encodes free header text as RFC 2047 encoded words when it is not plain
/// ASCII, folding between words.
fn encode_header_text(value: &str) -> String {
    let value = strip_line_breaks(value);
    if value.is_ascii() {
        return value;
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }

    words.join("\r\n ")
}

fn encoded_word(text: &str) -> String {
    format!("=?UTF-8?B?{}?=", STANDARD.encode(text))
}

fn encode_display_name(name: &str) -> String {
    if name.is_ascii() {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        encode_header_text(name)
    }
}

fn append_text_links(body: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return body.to_string();
    }

    let mut out = body.trim_end().to_string();
    out.push_str("\n\nAttachments:\n");
    for attachment in attachments {
        out.push_str("- ");
        out.push_str(&attachment.to_string());
        out.push('\n');
    }
    out
}

fn append_html_links(body: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return body.to_string();
    }

    let mut list = String::from("<p>Attachments:</p><ul>");
    for attachment in attachments {
        list.push_str("<li><a href=\"");
        list.push_str(&escape_html(&attachment.url));
        list.push_str("\">");
        list.push_str(&escape_html(&attachment.filename));
        list.push_str("</a></li>");
    }
    list.push_str("</ul>");

    match body.to_ascii_lowercase().rfind("</body>") {
        Some(index) => {
            let (head, tail) = body.split_at(index);
            format!("{head}{list}{tail}")
        }
        None => format!("{body}{list}"),
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Decodes every base64 body part of a rendered message, in order.
    fn decoded_parts(message: &str) -> Vec<String> {
        message
            .split("Content-Transfer-Encoding: base64\r\n\r\n")
            .skip(1)
            .map(|rest| {
                let encoded: String = rest
                    .split("\r\n--")
                    .next()
                    .unwrap()
                    .split("\r\n")
                    .collect();
                String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_headers() {
        let message = MessageBuilder::new()
            .from("noreply@example.com", Some("Training Team"))
            .to("jane@example.com", None)
            .subject("Booking confirmed")
            .text("Hello")
            .build();

        assert!(message.contains("From: \"Training Team\" <noreply@example.com>\r\n"));
        assert!(message.contains("To: <jane@example.com>\r\n"));
        assert!(message.contains("Subject: Booking confirmed\r\n"));
        assert!(message.contains("MIME-Version: 1.0\r\n"));
        assert!(message.contains("@example.com>\r\n"));
        assert!(message.contains("\r\nDate: "));
        assert!(message.contains("Content-Type: multipart/alternative; boundary=\"=_courier_"));
    }

    #[test]
    fn test_parts_are_text_then_html() {
        let message = MessageBuilder::new()
            .to("jane@example.com", None)
            .subject("Hi")
            .html("<p>Hello</p>")
            .text("Hello")
            .build();

        let text_at = message.find("Content-Type: text/plain").unwrap();
        let html_at = message.find("Content-Type: text/html").unwrap();
        assert!(text_at < html_at);

        assert_eq!(decoded_parts(&message), vec!["Hello", "<p>Hello</p>"]);
        assert!(message.trim_end().ends_with("--"));
    }

    #[test]
    fn test_boundaries_are_unique() {
        assert_ne!(generate_boundary(), generate_boundary());
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        let message = MessageBuilder::new()
            .subject("Bestätigung")
            .text("x")
            .build();

        assert!(message.contains("Subject: =?UTF-8?B?"));
        assert!(!message.contains("Bestätigung"));
    }

    #[test]
    fn test_long_subject_is_folded() {
        let subject = "ü".repeat(60);
        let encoded = encode_header_text(&subject);
        assert!(encoded.contains("\r\n =?UTF-8?B?"));
        assert!(encoded.split("\r\n ").all(|word| word.len() <= 75));
    }

    #[test]
    fn test_header_injection_is_neutralised() {
        let message = MessageBuilder::new()
            .subject("Hi\r\nBcc: victim@example.com")
            .text("x")
            .build();

        assert!(!message.contains("\r\nBcc:"));
    }

    #[test]
    fn test_base64_wrapping() {
        let wrapped = wrap_base64(&[b'a'; 200]);
        assert!(wrapped.split("\r\n").all(|line| line.len() <= 76));
        assert_eq!(wrapped.split("\r\n").next().unwrap().len(), 76);
    }

    #[test]
    fn test_attachments_listed_as_links() {
        let attachments = [Attachment::new(
            "https://files.example.com/cert.pdf?a=1&b=2",
            "certificate.pdf",
        )];
        let message = MessageBuilder::new()
            .text("Your certificate")
            .html("<html><body><p>Your certificate</p></body></html>")
            .attachments(&attachments)
            .build();

        let parts = decoded_parts(&message);
        assert!(parts[0].contains(
            "Attachments:\n- certificate.pdf <https://files.example.com/cert.pdf?a=1&b=2>"
        ));
        assert!(parts[1].contains(
            "<li><a href=\"https://files.example.com/cert.pdf?a=1&amp;b=2\">certificate.pdf</a></li></ul></body>"
        ));
    }
}
