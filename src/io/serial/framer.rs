// src/io/serial/framer.rs
//
// Line framing for the AT command protocol.
// Splits an arbitrarily chunked byte stream into logical lines. Lines end at
// any run of CR, LF or NUL, except inside a double-quoted value: a quoted PIN
// or SMS body may carry stray control characters and must never be split.

// =============================================================================
// Constants
// =============================================================================

const QUOTE: char = '"';

/// Longest partial line kept between chunks. An unmatched quote would
/// otherwise hold every following byte.
pub const MAX_CARRY: usize = 4096;

fn is_terminator(c: char) -> bool {
    matches!(c, '\r' | '\n' | '\0')
}

fn is_delimiter(c: char) -> bool {
    c == QUOTE || is_terminator(c)
}

/// Strip one trailing NUL and surrounding whitespace from a framed line.
pub fn clean_line(line: &str) -> &str {
    line.strip_suffix('\0').unwrap_or(line).trim()
}

// =============================================================================
// Line Framer
// =============================================================================

/// Stateful line framer for streaming data.
///
/// Bytes are mapped one-to-one onto chars (latin-1 style) so a chunk boundary
/// can never fall inside a character. The unterminated tail of each chunk is
/// carried over to the next call.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: String,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            carry: String::new(),
        }
    }

    /// Feed raw bytes into the framer.
    /// Returns every complete, non-empty line, in stream order, without its
    /// terminators.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend(chunk.iter().map(|&b| b as char));

        let mut lines = Vec::new();
        let mut pos = 0;

        loop {
            let Some(offset) = data[pos..].find(is_delimiter) else {
                // No delimiter, wait for more
                break;
            };
            let at = pos + offset;

            if data[at..].starts_with(QUOTE) {
                match data[at + 1..].find(QUOTE) {
                    // Only one quote, the line is incomplete
                    None => break,
                    // Terminators inside the quotes are not line ends
                    Some(close) => pos = at + 1 + close + 1,
                }
                continue;
            }

            let run = data[at..]
                .find(|c: char| !is_terminator(c))
                .unwrap_or(data.len() - at);
            let rest = data.split_off(at + run);
            data.truncate(at);
            if !data.is_empty() {
                lines.push(data);
            }
            data = rest;
            pos = 0;
        }

        if data.len() > MAX_CARRY {
            tlog!("[framer] Dropping {} bytes of unterminated input", data.len());
            data.clear();
        }
        self.carry = data;
        lines
    }

    /// Unterminated data waiting for the rest of its line.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// Drop any carried-over partial line.
    pub fn clear(&mut self) {
        self.carry.clear();
    }
}
