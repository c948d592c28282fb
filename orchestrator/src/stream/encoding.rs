//! Text normalisation between the client terminal and the shell

use crate::config::LineEnding;

/// Strip carriage returns and surrounding whitespace from a client line
pub fn normalize_input(line: &str) -> String {
    line.replace('\r', "").trim().to_string()
}

/// Rewrite every `\n` to the client's line terminator
pub fn normalize_output(text: &str, line_ending: LineEnding) -> String {
    match line_ending {
        LineEnding::Lf => text.to_string(),
        LineEnding::Crlf => text.replace('\n', line_ending.as_str()),
    }
}

/// Incremental UTF-8 decoder that carries split multi-byte sequences across reads
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode the next chunk; invalid bytes become U+FFFD, an incomplete tail is held back
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = consumed + e.valid_up_to();
                    // bytes before valid_up_to() always decode
                    if let Ok(valid) = std::str::from_utf8(&self.pending[consumed..valid_up_to]) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + len;
                        }
                        None => {
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is still held back once the stream has ended
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
