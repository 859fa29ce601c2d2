//! Incremental row extraction from streaming JSON service responses.
//!
//! Row-based services return a single root object whose `results` (or
//! `rows`) field is a large array. The lexer emits each element as raw
//! bytes as soon as it is complete, without buffering the whole response,
//! and keeps the surrounding metadata parseable. Failure modes are the
//! `streaming_json` error domain: a malformed tail can never corrupt rows
//! that were already delivered.

use crate::error::StreamingJsonError;

/// Containers deeper than this are rejected rather than tracked
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

/// Streaming lexer for one response body.
#[derive(Debug)]
pub struct RowLexer {
    /// Root field whose array elements are the rows
    pointer: String,
    stack: Vec<Container>,
    in_string: bool,
    escaped: bool,
    /// Set while scanning a depth-1 key string
    key_capture: bool,
    key_buf: String,
    /// Key most recently completed in key position at depth 1
    pending_key: Option<String>,
    /// Set between a depth-1 ':' and the following ',' or '}'
    after_colon: bool,
    /// Inside the rows array
    in_rows: bool,
    /// Stack depth of the rows array itself
    rows_depth: usize,
    /// Current row bytes, when mid-element
    row_buf: Option<Vec<u8>>,
    /// Everything except row content, for end-of-stream metadata
    meta: Vec<u8>,
    root_seen: bool,
    root_closed: bool,
    failed: bool,
}

impl RowLexer {
    /// `pointer` names the array field holding the rows, e.g. `results`
    pub fn new(pointer: &str) -> Self {
        Self {
            pointer: pointer.to_string(),
            stack: Vec::new(),
            in_string: false,
            escaped: false,
            key_capture: false,
            key_buf: String::new(),
            pending_key: None,
            after_colon: false,
            in_rows: false,
            rows_depth: 0,
            row_buf: None,
            meta: Vec::new(),
            root_seen: false,
            root_closed: false,
            failed: false,
        }
    }

    /// Consume a chunk, returning the rows it completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, StreamingJsonError> {
        if self.failed {
            return Err(StreamingJsonError::GarbageTrailing);
        }
        let mut rows = Vec::new();
        for &b in bytes {
            if let Err(e) = self.push_byte(b, &mut rows) {
                self.failed = true;
                return Err(e);
            }
        }
        Ok(rows)
    }

    /// Validate end of stream; the root must have opened and closed.
    pub fn finish(&self) -> Result<(), StreamingJsonError> {
        if self.failed {
            return Err(StreamingJsonError::GarbageTrailing);
        }
        if !self.root_seen || !self.root_closed || !self.stack.is_empty() || self.in_string {
            return Err(StreamingJsonError::BracketMismatch);
        }
        Ok(())
    }

    /// Response bytes minus the row content; a parseable object once the
    /// stream is complete
    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    fn push_byte(&mut self, b: u8, rows: &mut Vec<Vec<u8>>) -> Result<(), StreamingJsonError> {
        if b == 0 {
            return Err(StreamingJsonError::FoundNullByte);
        }

        if self.in_string {
            self.sink(b);
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
                if self.key_capture {
                    self.key_capture = false;
                    self.pending_key = Some(std::mem::take(&mut self.key_buf));
                }
            } else if self.key_capture {
                self.key_buf.push(b as char);
            }
            return Ok(());
        }

        match b {
            b' ' | b'\t' | b'\n' | b'\r' => {
                if self.row_buf.is_none() {
                    self.meta.push(b);
                }
            }
            b'"' => {
                if self.root_closed {
                    return Err(StreamingJsonError::GarbageTrailing);
                }
                if !self.root_seen {
                    return Err(StreamingJsonError::RootIsNotAnObject);
                }
                self.maybe_start_row(b);
                self.in_string = true;
                if self.stack.len() == 1 && !self.after_colon {
                    self.key_capture = true;
                    self.key_buf.clear();
                }
                self.sink(b);
            }
            b'{' | b'[' => {
                if self.root_closed {
                    return Err(StreamingJsonError::GarbageTrailing);
                }
                if !self.root_seen {
                    if b != b'{' {
                        return Err(StreamingJsonError::RootIsNotAnObject);
                    }
                    self.root_seen = true;
                }
                if self.stack.len() == MAX_DEPTH {
                    return Err(StreamingJsonError::LevelsExceeded);
                }
                // the rows array itself opens here
                if b == b'[' && self.stack.len() == 1 && !self.in_rows {
                    if self.after_colon && self.pending_key.as_deref() == Some(&self.pointer) {
                        self.in_rows = true;
                        self.rows_depth = self.stack.len() + 1;
                        self.stack.push(Container::Array);
                        self.meta.push(b);
                        return Ok(());
                    }
                }
                self.maybe_start_row(b);
                self.stack.push(if b == b'{' { Container::Object } else { Container::Array });
                self.sink(b);
            }
            b'}' | b']' => {
                let expected = if b == b'}' { Container::Object } else { Container::Array };
                match self.stack.pop() {
                    Some(container) if container == expected => {}
                    _ => return Err(StreamingJsonError::BracketMismatch),
                }
                if self.in_rows && self.stack.len() + 1 == self.rows_depth {
                    // closing the rows array itself
                    self.flush_row(rows);
                    self.in_rows = false;
                    self.meta.push(b);
                } else {
                    self.sink(b);
                    if self.row_buf.is_some() && self.stack.len() == self.rows_depth {
                        self.flush_row(rows);
                    }
                }
                if self.stack.is_empty() {
                    self.root_closed = true;
                }
                if self.stack.len() == 1 {
                    self.after_colon = false;
                }
            }
            b':' => {
                if self.root_closed {
                    return Err(StreamingJsonError::GarbageTrailing);
                }
                if self.stack.len() == 1 {
                    self.after_colon = true;
                }
                self.sink(b);
            }
            b',' => {
                if self.root_closed {
                    return Err(StreamingJsonError::GarbageTrailing);
                }
                if self.in_rows && self.stack.len() == self.rows_depth {
                    // separator between rows
                    self.flush_row(rows);
                } else {
                    self.sink(b);
                }
                if self.stack.len() == 1 {
                    self.after_colon = false;
                    self.pending_key = None;
                }
            }
            _ => {
                if self.root_closed {
                    return Err(StreamingJsonError::GarbageTrailing);
                }
                if !self.root_seen {
                    return Err(StreamingJsonError::RootIsNotAnObject);
                }
                self.maybe_start_row(b);
                self.sink(b);
            }
        }
        Ok(())
    }

    /// A value byte at row level opens a new row capture
    fn maybe_start_row(&mut self, _b: u8) {
        if self.in_rows && self.row_buf.is_none() && self.stack.len() == self.rows_depth {
            self.row_buf = Some(Vec::new());
        }
    }

    fn flush_row(&mut self, rows: &mut Vec<Vec<u8>>) {
        if let Some(row) = self.row_buf.take() {
            if !row.is_empty() {
                rows.push(row);
            }
        }
    }

    fn sink(&mut self, b: u8) {
        match &mut self.row_buf {
            Some(row) => row.push(b),
            None => self.meta.push(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(lexer: &mut RowLexer, input: &[u8]) -> Result<Vec<Vec<u8>>, StreamingJsonError> {
        let mut rows = Vec::new();
        for chunk in input.chunks(7) {
            rows.extend(lexer.feed(chunk)?);
        }
        Ok(rows)
    }

    #[test]
    fn emits_rows_lazily_and_keeps_metadata() {
        let body = br#"{"requestID":"7b6a","results":[{"name":"a"},{"name":"b"},{"n":[1,2]}],"status":"success"}"#;
        let mut lexer = RowLexer::new("results");
        let rows = feed_all(&mut lexer, body).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], br#"{"name":"a"}"#);
        assert_eq!(rows[2], br#"{"n":[1,2]}"#);
        lexer.finish().unwrap();

        let meta: serde_json::Value = serde_json::from_slice(lexer.meta()).unwrap();
        assert_eq!(meta["status"], "success");
        assert_eq!(meta["results"], serde_json::json!([]));
    }

    #[test]
    fn rows_split_across_chunks_survive() {
        let mut lexer = RowLexer::new("results");
        let mut rows = lexer.feed(br#"{"results":[{"x":"#).unwrap();
        assert!(rows.is_empty(), "row is not complete yet");
        rows.extend(lexer.feed(br#"1}"#).unwrap());
        assert_eq!(rows, vec![br#"{"x":1}"#.to_vec()]);
        rows.extend(lexer.feed(br#",{"x":2}]}"#).unwrap());
        assert_eq!(rows, vec![br#"{"x":1}"#.to_vec(), br#"{"x":2}"#.to_vec()]);
        lexer.finish().unwrap();
    }

    #[test]
    fn scalar_rows_are_supported() {
        let mut lexer = RowLexer::new("rows");
        let rows = lexer.feed(br#"{"rows":[1,"two",null]}"#).unwrap();
        assert_eq!(rows, vec![b"1".to_vec(), br#""two""#.to_vec(), b"null".to_vec()]);
    }

    #[test]
    fn root_must_be_an_object() {
        let mut lexer = RowLexer::new("results");
        assert_eq!(lexer.feed(b"[1,2]"), Err(StreamingJsonError::RootIsNotAnObject));
    }

    #[test]
    fn trailing_garbage_is_its_own_failure() {
        let mut lexer = RowLexer::new("results");
        let rows = lexer.feed(br#"{"results":[7]}"#).unwrap();
        assert_eq!(rows, vec![b"7".to_vec()]);
        assert_eq!(lexer.feed(b"x"), Err(StreamingJsonError::GarbageTrailing));
    }

    #[test]
    fn bracket_mismatch_does_not_lose_delivered_rows() {
        let mut lexer = RowLexer::new("results");
        let rows = lexer.feed(br#"{"results":[{"ok":1},"#).unwrap();
        assert_eq!(rows.len(), 1, "first row was already delivered");
        assert_eq!(lexer.feed(b"}"), Err(StreamingJsonError::BracketMismatch));
    }

    #[test]
    fn truncated_stream_fails_on_finish() {
        let mut lexer = RowLexer::new("results");
        lexer.feed(br#"{"results":[1,2"#).unwrap();
        assert_eq!(lexer.finish(), Err(StreamingJsonError::BracketMismatch));
    }

    #[test]
    fn null_bytes_are_rejected() {
        let mut lexer = RowLexer::new("results");
        assert_eq!(lexer.feed(b"{\"a\":\0}"), Err(StreamingJsonError::FoundNullByte));
    }

    #[test]
    fn escaped_quotes_inside_rows() {
        let mut lexer = RowLexer::new("results");
        let rows = lexer.feed(br#"{"results":["a\"],[b"]}"#).unwrap();
        assert_eq!(rows, vec![br#""a\"],[b""#.to_vec()]);
        lexer.finish().unwrap();
    }

    #[test]
    fn a_results_key_nested_deeper_is_not_the_rows_array() {
        let mut lexer = RowLexer::new("results");
        let rows = lexer.feed(br#"{"meta":{"results":[1,2]},"results":[3]}"#).unwrap();
        assert_eq!(rows, vec![b"3".to_vec()]);
    }
}
