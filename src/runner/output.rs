//! Length-capped capture of a child's output stream.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Raw bytes captured from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Exactly what the process wrote, up to the cap
    pub bytes: Vec<u8>,
    /// Content past the cap was dropped
    pub truncated: bool,
}

impl CapturedOutput {
    /// Keep at most `max_chars` characters of `bytes`, unmodified.
    ///
    /// `overflowed` is set when the reader already discarded bytes.
    pub fn from_bytes(mut bytes: Vec<u8>, max_chars: usize, overflowed: bool) -> Self {
        match char_boundary(&bytes, max_chars) {
            Some(cut) => {
                bytes.truncate(cut);
                Self {
                    bytes,
                    truncated: true,
                }
            }
            None => Self {
                bytes,
                truncated: overflowed,
            },
        }
    }

    /// Decoded view for comparison and display. Invalid UTF-8 becomes U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Byte offset of character number `max_chars`, if there are more than that.
///
/// Each invalid UTF-8 sequence counts as one character, as in lossy decoding.
fn char_boundary(bytes: &[u8], max_chars: usize) -> Option<usize> {
    let mut chars = 0;
    let mut offset = 0;
    for chunk in bytes.utf8_chunks() {
        for (i, _) in chunk.valid().char_indices() {
            if chars == max_chars {
                return Some(offset + i);
            }
            chars += 1;
        }
        offset += chunk.valid().len();
        if !chunk.invalid().is_empty() {
            if chars == max_chars {
                return Some(offset);
            }
            chars += 1;
            offset += chunk.invalid().len();
        }
    }
    None
}

/// Read `reader` to EOF, keeping enough bytes for `max_chars` characters.
///
/// The stream is always drained so the writer never blocks on a full pipe.
pub async fn capture<R>(mut reader: R, max_chars: usize) -> std::io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    // A UTF-8 character is at most 4 bytes.
    let byte_cap = max_chars.saturating_mul(4);
    let mut kept = Vec::new();
    let mut overflowed = false;
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = byte_cap - kept.len();
        if n > room {
            kept.extend_from_slice(&chunk[..room]);
            overflowed = true;
        } else {
            kept.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(CapturedOutput::from_bytes(kept, max_chars, overflowed))
}
