//! SMTP reply parsing and representation.

use core::fmt::{self, Display, Formatter};

use super::error::{ClientError, Result};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The SMTP status code (e.g., 220, 250, 550).
    pub code: u16,
    /// Whether this is the last line in a multi-line reply.
    pub is_last: bool,
    /// The text following the status code.
    pub message: String,
}

/// A complete SMTP reply, which may span several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// All text lines in the reply.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Whether any line of the reply advertises `keyword` (case-insensitive),
    /// used to look for EHLO capabilities such as `STARTTLS` or `AUTH`.
    #[must_use]
    pub fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }

    /// Parses a single reply line (without its line terminator).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let Some(code_str) = line.get(..3) else {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        };

        if !code_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::ParseError(format!(
                "Invalid status code: '{code_str}'"
            )));
        }

        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns `Ok(None)` while the final line has not arrived yet, otherwise
    /// the reply and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut first_code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = String::from_utf8_lossy(raw);
            let parsed = Self::parse_line(&line)?;

            match first_code {
                None => first_code = Some(parsed.code),
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(first_code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl Display for Response {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.code, self.lines.join(" / "))
    }
}
