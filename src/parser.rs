//! Raw-byte → normalized-reading parsing
//!
//! Pure functions only: no state, no failure mode. Unparseable input
//! yields an already-trimmed empty string; emptiness is handled
//! downstream, not here.

use chrono::{DateTime, Utc};

use crate::config::Encoding;

/// Fixed framing window for the legacy binary dialect.
pub const FRAME_LEN: usize = 20;

/// A normalized reading plus arrival metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Trimmed, normalized string content
    pub text: String,
    /// Raw byte length before trimming
    pub len: usize,
    pub received_at: DateTime<Utc>,
}

/// Turn a raw byte chunk into a normalized reading.
///
/// Binary mode truncates oversized input to the fixed framing window and
/// strips NUL padding; UTF-8 mode takes the whole chunk (lossy).
pub fn parse(bytes: &[u8], encoding: Encoding) -> Reading {
    let len = bytes.len();
    let text = match encoding {
        Encoding::Binary => {
            let window = &bytes[..bytes.len().min(FRAME_LEN)];
            String::from_utf8_lossy(window)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string()
        }
        Encoding::Utf8 => String::from_utf8_lossy(bytes).trim().to_string(),
    };

    Reading {
        text,
        len,
        received_at: Utc::now(),
    }
}
