/// Append-only record of a process's output plus the retrieval cursor of pull consumers.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    full: String,
    cursor: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.full.push_str(chunk);
    }

    pub fn full_output(&self) -> &str {
        &self.full
    }

    /// Byte offset up to which output has been handed out.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn has_unretrieved(&self) -> bool {
        self.cursor < self.full.len()
    }

    /// Takes everything up to and including the last newline past the cursor.
    /// Leaves the cursor untouched when the tail holds no newline.
    pub fn take_complete_lines(&mut self) -> String {
        let tail = &self.full[self.cursor..];
        match tail.rfind('\n') {
            Some(index) => {
                let end = index + 1;
                let lines = tail[..end].to_string();
                self.cursor += end;
                lines
            }
            None => String::new(),
        }
    }

    /// Takes the whole unretrieved tail, including a trailing partial line.
    pub fn take_remaining(&mut self) -> String {
        let remaining = self.full[self.cursor..].to_string();
        self.cursor = self.full.len();
        remaining
    }
}

/// Turns raw pipe reads into text without splitting multi-byte characters.
///
/// Bytes of an incomplete trailing sequence are held back until the next read.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes held-back bytes once the stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_output_is_exact_concatenation() {
        let chunks = ["he", "llo\nwor", "", "ld\n", "tail"];
        let mut buffer = OutputBuffer::new();
        for chunk in chunks {
            buffer.push(chunk);
            // interleaved pulls must never disturb the accumulated text
            buffer.take_complete_lines();
        }
        assert_eq!(buffer.full_output(), chunks.concat());
    }

    #[test]
    fn take_complete_lines_stops_at_last_newline() {
        let mut buffer = OutputBuffer::new();
        buffer.push("a\nb");
        assert_eq!(buffer.take_complete_lines(), "a\n");
        assert_eq!(buffer.cursor(), 2);
        assert!(buffer.has_unretrieved());

        assert_eq!(buffer.take_complete_lines(), "");
        assert_eq!(buffer.take_complete_lines(), "");
        assert_eq!(buffer.cursor(), 2);

        buffer.push("c\nd\n");
        assert_eq!(buffer.take_complete_lines(), "bc\nd\n");
        assert!(!buffer.has_unretrieved());
    }

    #[test]
    fn pulled_text_always_ends_with_newline_or_is_empty() {
        let mut buffer = OutputBuffer::new();
        for chunk in ["x", "y\nz", "\n", "partial", "", "\n\n", "q"] {
            buffer.push(chunk);
            let pulled = buffer.take_complete_lines();
            assert!(pulled.is_empty() || pulled.ends_with('\n'), "got {:?}", pulled);
        }
    }

    #[test]
    fn take_remaining_includes_partial_line() {
        let mut buffer = OutputBuffer::new();
        buffer.push("a\nb");
        buffer.take_complete_lines();
        assert_eq!(buffer.take_remaining(), "b");
        assert!(!buffer.has_unretrieved());
        assert_eq!(buffer.take_remaining(), "");
    }

    #[test]
    fn decoder_reassembles_split_characters() {
        let text = "héllo → wörld\n";
        let bytes = text.as_bytes();
        let mut decoder = ChunkDecoder::default();
        let mut out = String::new();
        for piece in bytes.chunks(1) {
            out.push_str(&decoder.decode(piece));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{FFFD}ok");
        assert_eq!(decoder.decode(&[0xe2, 0x86]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
