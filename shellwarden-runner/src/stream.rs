//! Byte-stream helpers shared by the engine and the background forwarder.

/// Returns true when `data` looks like binary output (contains a NUL byte).
pub fn is_binary_content(data: &[u8]) -> bool {
    data.contains(&0)
}

/// Incremental UTF-8 decoder for one pipe.
///
/// Multi-byte sequences split across reads are carried over to the next
/// chunk; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete trailing sequence; wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Watches the leading bytes of an execution for binary content.
#[derive(Debug)]
pub(crate) struct BinarySniffer {
    inspected: usize,
    limit: usize,
    detected: bool,
}

impl BinarySniffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inspected: 0,
            limit,
            detected: false,
        }
    }

    /// Feed the next chunk. Returns true once binary content has been seen.
    pub(crate) fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.detected || self.inspected >= self.limit {
            return self.detected;
        }
        let take = chunk.len().min(self.limit - self.inspected);
        self.inspected += take;
        self.detected = is_binary_content(&chunk[..take]);
        self.detected
    }

    pub(crate) fn detected(&self) -> bool {
        self.detected
    }
}

/// An unterminated line longer than this is emitted as if it had ended.
pub(crate) const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;

/// Reassembles complete lines from arbitrarily split text chunks.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Append `chunk` and return every line it completed, without terminators.
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut complete = match self.partial.rfind('\n') {
            Some(last_newline) => {
                let rest = self.partial.split_off(last_newline + 1);
                let done = std::mem::replace(&mut self.partial, rest);
                done.lines()
                    .map(|line| line.trim_end_matches('\r').to_string())
                    .collect()
            }
            None => Vec::new(),
        };

        if self.partial.len() > MAX_PARTIAL_LINE_BYTES {
            complete.push(std::mem::take(&mut self.partial));
        }
        complete
    }

    /// Return the trailing unterminated line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches('\r');
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_carries_split_multibyte_sequences() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8StreamDecoder::default();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8StreamDecoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn sniffer_only_inspects_leading_bytes() {
        let mut sniffer = BinarySniffer::new(4);
        assert!(!sniffer.observe(b"text"));
        assert!(!sniffer.observe(b"\0late nul"));
        assert!(!sniffer.detected());

        let mut sniffer = BinarySniffer::new(4);
        assert!(sniffer.observe(b"ab\0cd"));
        assert!(sniffer.observe(b"anything"));
    }

    #[test]
    fn assembler_joins_split_lines() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push("hel").is_empty());
        assert_eq!(assembler.push("lo\nwor"), vec!["hello"]);
        assert_eq!(assembler.push("ld\r\n\nnext"), vec!["world", ""]);
        assert_eq!(assembler.finish().as_deref(), Some("next"));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn assembler_flushes_oversized_partial_line() {
        let mut lines = LineAssembler::default();
        let long = "x".repeat(MAX_PARTIAL_LINE_BYTES);
        assert!(lines.push(&long).is_empty());

        let flushed = lines.push("yz");
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), MAX_PARTIAL_LINE_BYTES + 2);

        assert_eq!(lines.push("tail\n"), vec!["tail".to_string()]);
        assert_eq!(lines.finish(), None);
    }
}
