/// Reassembles newline-delimited text from arbitrarily split byte chunks.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte UTF-8 character
/// or a line split across network reads is only decoded once complete.
/// A trailing `\r` is stripped from every line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flush whatever remains after the last newline, if anything.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_complete_lines_only() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"data: a\ndata: b"), vec!["data: a"]);
        assert_eq!(buf.push(b"c\n\n"), vec!["data: bc", ""]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\r\ntwo\r\n"), vec!["one", "two"]);
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let text = "data: ⛔ Stopped\n".as_bytes();
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for byte in text {
            lines.extend(buf.push(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec!["data: ⛔ Stopped"]);
    }

    #[test]
    fn finish_returns_unterminated_tail() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: [DONE]").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(buf.finish(), None);
    }
}
