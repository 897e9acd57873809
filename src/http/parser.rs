//! Incremental HTTP/1.1 response parser
//!
//! Head parsing is delegated to `httparse`; body framing (content-length,
//! chunked, or read-to-close) is handled here. Body bytes flow into a sink
//! so the streaming mode can lex rows without buffering the full payload.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::http::message::HttpResponse;
use crate::http::streaming::JsonRowStreamer;

enum BodyFraming {
    ContentLength(usize),
    Chunked(ChunkState),
    ReadToEnd,
}

enum ChunkState {
    Size,
    Data(usize),
    DataCr(usize),
    Trailer,
}

/// Where decoded body bytes go.
pub enum BodySink {
    Buffer(Vec<u8>),
    Streaming(JsonRowStreamer),
}

impl BodySink {
    fn push(&mut self, data: &[u8]) {
        match self {
            BodySink::Buffer(buffer) => buffer.extend_from_slice(data),
            BodySink::Streaming(streamer) => streamer.feed(data),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            BodySink::Buffer(buffer) => buffer,
            BodySink::Streaming(streamer) => streamer.into_meta(),
        }
    }
}

enum Phase {
    Head,
    Body(BodyFraming),
    Complete,
}

pub struct ResponseParser {
    phase: Phase,
    buffer: Vec<u8>,
    status_code: u16,
    reason: String,
    headers: HashMap<String, String>,
    sink: Option<BodySink>,
}

impl ResponseParser {
    pub fn buffered() -> ResponseParser {
        ResponseParser::with_sink(BodySink::Buffer(Vec::new()))
    }

    pub fn streaming(streamer: JsonRowStreamer) -> ResponseParser {
        ResponseParser::with_sink(BodySink::Streaming(streamer))
    }

    fn with_sink(sink: BodySink) -> ResponseParser {
        ResponseParser {
            phase: Phase::Head,
            buffer: Vec::new(),
            status_code: 0,
            reason: String::new(),
            headers: HashMap::new(),
            sink: Some(sink),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// Feed bytes from the wire. Returns true once the response is complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<bool> {
        self.buffer.extend_from_slice(data);
        loop {
            match &mut self.phase {
                Phase::Head => {
                    let mut headers = [httparse::EMPTY_HEADER; 64];
                    let mut response = httparse::Response::new(&mut headers);
                    let parsed = response
                        .parse(&self.buffer)
                        .map_err(|err| Error::ParsingFailure(format!("response head: {err}")))?;
                    let head_len = match parsed {
                        httparse::Status::Partial => return Ok(false),
                        httparse::Status::Complete(len) => len,
                    };
                    self.status_code = response.code.unwrap_or(0);
                    self.reason = response.reason.unwrap_or("").to_string();
                    for header in response.headers.iter() {
                        self.headers.insert(
                            header.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(header.value).to_string(),
                        );
                    }
                    self.buffer.drain(..head_len);

                    let framing = if self
                        .headers
                        .get("transfer-encoding")
                        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
                    {
                        BodyFraming::Chunked(ChunkState::Size)
                    } else if let Some(length) = self.headers.get("content-length") {
                        let length = length.trim().parse::<usize>().map_err(|_| {
                            Error::ParsingFailure("invalid content-length".into())
                        })?;
                        BodyFraming::ContentLength(length)
                    } else {
                        BodyFraming::ReadToEnd
                    };
                    self.phase = Phase::Body(framing);
                }
                Phase::Body(BodyFraming::ContentLength(remaining)) => {
                    let take = (*remaining).min(self.buffer.len());
                    if take > 0 {
                        let chunk: Vec<u8> = self.buffer.drain(..take).collect();
                        self.sink.as_mut().expect("sink present until completion").push(&chunk);
                        *remaining -= take;
                    }
                    if *remaining == 0 {
                        self.phase = Phase::Complete;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Phase::Body(BodyFraming::Chunked(state)) => match state {
                    ChunkState::Size => {
                        let Some(line_end) =
                            self.buffer.windows(2).position(|window| window == b"\r\n")
                        else {
                            return Ok(false);
                        };
                        let line = String::from_utf8_lossy(&self.buffer[..line_end]).to_string();
                        self.buffer.drain(..line_end + 2);
                        let size_text = line.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
                            Error::ParsingFailure(format!("invalid chunk size \"{size_text}\""))
                        })?;
                        *state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        let take = (*remaining).min(self.buffer.len());
                        if take > 0 {
                            let chunk: Vec<u8> = self.buffer.drain(..take).collect();
                            self.sink.as_mut().expect("sink present until completion").push(&chunk);
                            *remaining -= take;
                        }
                        if *remaining == 0 {
                            *state = ChunkState::DataCr(2);
                        } else {
                            return Ok(false);
                        }
                    }
                    ChunkState::DataCr(remaining) => {
                        let take = (*remaining).min(self.buffer.len());
                        self.buffer.drain(..take);
                        *remaining -= take;
                        if *remaining == 0 {
                            *state = ChunkState::Size;
                        } else {
                            return Ok(false);
                        }
                    }
                    ChunkState::Trailer => {
                        // consume trailer lines until the blank terminator
                        let Some(line_end) =
                            self.buffer.windows(2).position(|window| window == b"\r\n")
                        else {
                            return Ok(false);
                        };
                        let is_blank = line_end == 0;
                        self.buffer.drain(..line_end + 2);
                        if is_blank {
                            self.phase = Phase::Complete;
                            return Ok(true);
                        }
                    }
                },
                Phase::Body(BodyFraming::ReadToEnd) => {
                    if !self.buffer.is_empty() {
                        let chunk = std::mem::take(&mut self.buffer);
                        self.sink.as_mut().expect("sink present until completion").push(&chunk);
                    }
                    return Ok(false);
                }
                Phase::Complete => return Ok(true),
            }
        }
    }

    /// Mark an EOF-framed body as finished.
    pub fn finish_on_eof(&mut self) -> bool {
        if matches!(self.phase, Phase::Body(BodyFraming::ReadToEnd)) {
            self.phase = Phase::Complete;
            return true;
        }
        self.is_complete()
    }

    pub fn take_response(&mut self) -> HttpResponse {
        let body = self.sink.take().map(BodySink::finish).unwrap_or_default();
        HttpResponse {
            status_code: self.status_code,
            reason: std::mem::take(&mut self.reason),
            headers: std::mem::take(&mut self.headers),
            body,
        }
    }
}
