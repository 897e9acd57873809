//! Streaming JSON row lexer
//!
//! Service results arrive as one large JSON object whose interesting part is
//! a single array of rows (for example `{"results": [...], "metrics": ...}`).
//! The lexer splits that array out incrementally: each completed element is
//! handed to the row callback, while everything around the array accumulates
//! into a "meta" buffer (with the array left empty), so callers still get
//! status and metrics without holding every row in memory.

pub type RowCallback = Box<dyn FnMut(Vec<u8>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Copying into the meta buffer, watching for the target key.
    Meta,
    /// Inside the target array, between elements.
    Rows,
    /// Inside the target array, accumulating one element.
    RowValue,
}

pub struct JsonRowStreamer {
    /// Key of the row array at the top level, without JSON-pointer slash.
    target_key: String,
    callback: RowCallback,

    mode: Mode,
    depth: usize,
    /// Depth of the target array once entered.
    rows_depth: usize,
    in_string: bool,
    escaped: bool,
    /// Most recent complete string literal at depth 1, candidate key.
    last_string: Vec<u8>,
    collecting_string: bool,
    meta: Vec<u8>,
    row: Vec<u8>,
    rows_emitted: usize,
}

impl JsonRowStreamer {
    /// `pointer` is a single-level JSON pointer such as `/results`.
    pub fn new(pointer: &str, callback: RowCallback) -> JsonRowStreamer {
        JsonRowStreamer {
            target_key: pointer.trim_start_matches('/').to_string(),
            callback,
            mode: Mode::Meta,
            depth: 0,
            rows_depth: 0,
            in_string: false,
            escaped: false,
            last_string: Vec::new(),
            collecting_string: false,
            meta: Vec::new(),
            row: Vec::new(),
            rows_emitted: 0,
        }
    }

    pub fn rows_emitted(&self) -> usize {
        self.rows_emitted
    }

    pub fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            self.step(byte);
        }
    }

    /// The buffered document with the row array elided.
    pub fn into_meta(self) -> Vec<u8> {
        self.meta
    }

    fn step(&mut self, byte: u8) {
        if self.in_string {
            self.copy(byte);
            if self.collecting_string && !self.escaped && byte != b'"' {
                self.last_string.push(byte);
            }
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                self.collecting_string = false;
            }
            return;
        }

        match byte {
            b'"' => {
                if self.mode == Mode::Rows {
                    // string scalar element begins
                    self.mode = Mode::RowValue;
                }
                self.in_string = true;
                if self.mode == Mode::Meta && self.depth == 1 {
                    self.last_string.clear();
                    self.collecting_string = true;
                }
                self.copy(byte);
            }
            b'{' | b'[' => {
                if self.mode == Mode::Rows {
                    // a structured element starts
                    self.mode = Mode::RowValue;
                }
                self.depth += 1;
                self.copy(byte);
            }
            b'}' | b']' => {
                self.depth -= 1;
                if self.mode == Mode::Rows && byte == b']' && self.depth == self.rows_depth - 1 {
                    // the row array closed with no pending element
                    self.mode = Mode::Meta;
                    self.meta.push(byte);
                    return;
                }
                if self.mode == Mode::RowValue {
                    self.row.push(byte);
                    if self.depth == self.rows_depth {
                        self.emit_row();
                        self.mode = Mode::Rows;
                    } else if self.depth == self.rows_depth - 1 {
                        // scalar tail then array close handled above; this is
                        // the closing bracket of the array itself
                        self.flush_scalar_row();
                        self.mode = Mode::Meta;
                        self.meta.push(byte);
                    }
                    return;
                }
                self.copy(byte);
            }
            b',' => {
                if self.mode == Mode::RowValue && self.depth == self.rows_depth {
                    self.emit_row();
                    self.mode = Mode::Rows;
                    return;
                }
                if self.mode == Mode::Rows {
                    return;
                }
                self.copy(byte);
            }
            b':' => {
                self.copy(byte);
            }
            _ => {
                if self.mode == Mode::Rows && !byte.is_ascii_whitespace() {
                    // scalar element begins
                    self.mode = Mode::RowValue;
                    self.row.push(byte);
                    return;
                }
                self.copy(byte);
            }
        }

        // detect "<target>": [ — only a string, colon, and whitespace may sit
        // between the key and its array, so anything else invalidates the key
        if self.mode == Mode::Meta && !self.in_string {
            match byte {
                b'[' => {
                    if self.depth >= 1 && self.last_string == self.target_key.as_bytes() {
                        // the bracket was already copied to meta, leaving
                        // "key": [ there; rows now divert to the callback
                        self.mode = Mode::Rows;
                        self.rows_depth = self.depth;
                    }
                    self.last_string.clear();
                }
                b':' | b'"' => {}
                _ if byte.is_ascii_whitespace() => {}
                _ => self.last_string.clear(),
            }
        }
    }

    fn copy(&mut self, byte: u8) {
        match self.mode {
            Mode::Meta => self.meta.push(byte),
            Mode::Rows => {}
            Mode::RowValue => self.row.push(byte),
        }
    }

    fn emit_row(&mut self) {
        let row = std::mem::take(&mut self.row);
        let trimmed: Vec<u8> = {
            let text = row;
            let start = text.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(0);
            let end = text.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1);
            text[start..end].to_vec()
        };
        if !trimmed.is_empty() {
            self.rows_emitted += 1;
            (self.callback)(trimmed);
        }
    }

    fn flush_scalar_row(&mut self) {
        // the closing bracket was appended to the pending row; strip it
        if self.row.last() == Some(&b']') {
            self.row.pop();
        }
        self.emit_row();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collect_rows(pointer: &str, chunks: &[&[u8]]) -> (Vec<String>, String) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = rows.clone();
        let mut streamer = JsonRowStreamer::new(
            pointer,
            Box::new(move |row| {
                sink.lock().unwrap().push(String::from_utf8(row).unwrap());
            }),
        );
        for chunk in chunks {
            streamer.feed(chunk);
        }
        let meta = String::from_utf8(streamer.into_meta()).unwrap();
        let rows = rows.lock().unwrap().clone();
        (rows, meta)
    }

    #[test]
    fn splits_rows_and_keeps_meta() {
        let body = br#"{"requestID":"abc","results":[{"id":1},{"id":2},{"id":3}],"status":"success"}"#;
        let (rows, meta) = collect_rows("/results", &[body]);
        assert_eq!(rows, vec![r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]);
        assert_eq!(meta, r#"{"requestID":"abc","results":[],"status":"success"}"#);
    }

    #[test]
    fn handles_chunked_input_at_awkward_boundaries() {
        let body = br#"{"results": [ {"a": "x,y]"}, {"b": [1, 2]} ], "ok": true}"#;
        let chunks: Vec<&[u8]> = body.chunks(3).collect();
        let (rows, meta) = collect_rows("/results", &chunks);
        assert_eq!(rows, vec![r#"{"a": "x,y]"}"#, r#"{"b": [1, 2]}"#]);
        assert!(meta.contains(r#""ok": true"#));
    }

    #[test]
    fn empty_array_yields_no_rows() {
        let body = br#"{"results":[],"status":"success"}"#;
        let (rows, meta) = collect_rows("/results", &[body]);
        assert!(rows.is_empty());
        assert_eq!(meta, r#"{"results":[],"status":"success"}"#);
    }

    #[test]
    fn ignores_same_named_keys_deeper_in_the_tree() {
        let body = br#"{"metrics":{"results":[9,9]},"results":[{"id":1}]}"#;
        let (rows, _meta) = collect_rows("/results", &[body]);
        assert_eq!(rows, vec![r#"{"id":1}"#]);
    }

    #[test]
    fn scalar_rows_are_supported() {
        let body = br#"{"results":[1,2,3]}"#;
        let (rows, _meta) = collect_rows("/results", &[body]);
        assert_eq!(rows, vec!["1", "2", "3"]);
    }

    #[test]
    fn string_rows_are_supported() {
        let body = br#"{"results":["a","b,c"]}"#;
        let (rows, _meta) = collect_rows("/results", &[body]);
        assert_eq!(rows, vec![r#""a""#, r#""b,c""#]);
    }

    #[test]
    fn object_valued_target_key_does_not_trigger() {
        let body = br#"{"results":{"x":[1,2]},"other":[3]}"#;
        let (rows, meta) = collect_rows("/results", &[body]);
        assert!(rows.is_empty());
        assert_eq!(meta, String::from_utf8_lossy(body));
    }

    #[test]
    fn escaped_quotes_inside_rows_do_not_confuse_the_lexer() {
        let body = br#"{"results":[{"text":"he said \"hi\""}]}"#;
        let (rows, _meta) = collect_rows("/results", &[body]);
        assert_eq!(rows, vec![r#"{"text":"he said \"hi\""}"#]);
    }
}
