use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A file linked from an email.
///
/// The queue never downloads the file; the pair travels with the job unchanged
/// through resends and forwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
}

impl Attachment {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
        }
    }
}

impl Display for Attachment {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} <{}>", self.filename, self.url)
    }
}
