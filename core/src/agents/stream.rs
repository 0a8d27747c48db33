//! Incremental framing for the two streaming wire formats.
//!
//! Both work on raw bytes so a multi-byte UTF-8 character split across two
//! network chunks is reassembled before decoding. JSON's structural
//! characters are ASCII and never occur inside a UTF-8 continuation byte,
//! which makes byte-level scanning safe.

/// Splits newline-delimited JSON into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete, non-blank line it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream ended without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Isolates complete top-level JSON objects from an undelimited stream such
/// as `[{...}\n,{...}]`.
///
/// Tracks brace depth plus string and escape state so braces inside string
/// values do not count. Bytes between objects (array brackets, commas,
/// whitespace) are discarded.
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buf: Vec<u8>,
    scanned: usize,
    depth: usize,
    start: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut objects = Vec::new();
        let mut consumed = 0;

        let mut i = self.scanned;
        while i < self.buf.len() {
            let byte = self.buf[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else {
                match byte {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = i;
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let object = &self.buf[self.start..=i];
                            objects.push(String::from_utf8_lossy(object).into_owned());
                            consumed = i + 1;
                        }
                    }
                    _ if self.depth == 0 => consumed = i + 1,
                    _ => {}
                }
            }
            i += 1;
        }

        self.buf.drain(..consumed);
        self.scanned = i - consumed;
        if self.depth > 0 {
            self.start -= consumed;
        }
        objects
    }

    /// True when a partial object is still buffered.
    pub fn has_partial(&self) -> bool {
        self.depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(br#"{"response":"Hel"#).is_empty());
        let lines = buf.push(b"lo\"}\n{\"response\":\"!\"}\n\n");
        assert_eq!(lines, vec![r#"{"response":"Hello"}"#, r#"{"response":"!"}"#]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let mut buf = LineBuffer::new();
        let bytes = "{\"response\":\"é\"}\n".as_bytes();
        // 'é' is two bytes; cut between them.
        let cut = bytes.iter().position(|b| *b == 0xC3).expect("lead byte") + 1;
        assert!(buf.push(&bytes[..cut]).is_empty());
        assert_eq!(buf.push(&bytes[cut..]), vec!["{\"response\":\"é\"}"]);
    }

    #[test]
    fn trailing_line_without_newline_is_returned_on_finish() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(br#"{"done":true}"#).is_empty());
        assert_eq!(buf.finish().as_deref(), Some(r#"{"done":true}"#));
    }

    #[test]
    fn scanner_extracts_objects_from_array_stream() {
        let mut scanner = JsonObjectScanner::new();
        let objects = scanner.push(b"[{\"a\":1}\n,{\"b\":{\"c\":2}}");
        assert_eq!(objects, vec![r#"{"a":1}"#, r#"{"b":{"c":2}}"#]);
        assert!(scanner.push(b"]").is_empty());
        assert!(!scanner.has_partial());
    }

    #[test]
    fn scanner_ignores_braces_inside_strings() {
        let mut scanner = JsonObjectScanner::new();
        let objects = scanner.push(br#"[{"text":"fn main() { } \"}\" {"}]"#);
        assert_eq!(objects.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&objects[0]).expect("valid json");
        assert_eq!(value["text"], "fn main() { } \"}\" {");
    }

    #[test]
    fn scanner_handles_escaped_backslash_before_quote() {
        let mut scanner = JsonObjectScanner::new();
        let objects = scanner.push(br#"{"p":"C:\\"}{"q":1}"#);
        assert_eq!(objects, vec![r#"{"p":"C:\\"}"#, r#"{"q":1}"#]);
    }

    #[test]
    fn scanner_resumes_across_arbitrary_chunk_boundaries() {
        let stream = br#"[{"candidates":[{"content":{"parts":[{"text":"a{b"}]}}]},{"candidates":[{"content":{"parts":[{"text":"c\"d}"}]}}]}]"#;
        for split in 1..stream.len() {
            let mut scanner = JsonObjectScanner::new();
            let mut objects = scanner.push(&stream[..split]);
            objects.extend(scanner.push(&stream[split..]));
            assert_eq!(objects.len(), 2, "split at {split}");
            for object in &objects {
                serde_json::from_str::<serde_json::Value>(object).expect("valid json");
            }
        }
    }

    #[test]
    fn scanner_byte_at_a_time() {
        let stream = "[{\"text\":\"héllo\"},{\"text\":\"wörld\"}]".as_bytes();
        let mut scanner = JsonObjectScanner::new();
        let mut objects = Vec::new();
        for byte in stream {
            objects.extend(scanner.push(std::slice::from_ref(byte)));
        }
        assert_eq!(objects, vec!["{\"text\":\"héllo\"}", "{\"text\":\"wörld\"}"]);
    }
}
