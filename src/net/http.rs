//! Minimal HTTP/1.1 client plumbing: request serialization and an
//! incremental response parser, both driven by the reactor's byte
//! callbacks. Only what a one-shot request/response exchange needs.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use errors::{Result, ResultExt};

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, path: &str) -> Self {
        HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }

    /// Serialized request line, headers and body. A `content-length`
    /// header is added unless one was set explicitly.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.path).as_bytes());
        for &(ref name, ref value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        let has_length = self
            .headers
            .iter()
            .any(|&(ref name, _)| name.eq_ignore_ascii_case("content-length"));
        if !has_length {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }

    fn has_body(&self) -> bool {
        !(self.code < 200 || self.code == 204 || self.code == 304)
    }

    fn is_chunked(&self) -> bool {
        match self.header("transfer-encoding") {
            Some(value) => value.to_ascii_lowercase().contains("chunked"),
            None => false,
        }
    }

    fn content_length(&self) -> Result<usize> {
        match self.header("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .chain_err(|| format!("malformed content-length: {:?}", value)),
            None => Ok(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    StatusLine,
    Headers,
    FixedBody(usize),
    ChunkSize,
    ChunkData(usize),
    ChunkTrailer,
}

/// Incremental response parser with the same queue discipline as the
/// message codec: feed bytes with `parse`, take finished responses with
/// `front`/`pop`.
pub struct HttpResponseParser {
    buffer: BytesMut,
    phase: Phase,
    current: Option<HttpResponse>,
    completed: VecDeque<HttpResponse>,
}

fn take_line(buffer: &mut BytesMut) -> Option<String> {
    let pos = buffer.windows(2).position(|w| w == b"\r\n")?;
    let line = buffer.split_to(pos);
    buffer.advance(2);
    Some(String::from_utf8_lossy(&line).into_owned())
}

impl HttpResponseParser {
    pub fn new() -> Self {
        HttpResponseParser {
            buffer: BytesMut::new(),
            phase: Phase::StatusLine,
            current: None,
            completed: VecDeque::new(),
        }
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        loop {
            match self.phase {
                Phase::StatusLine => {
                    let line = match take_line(&mut self.buffer) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().unwrap_or("");
                    if !version.starts_with("HTTP/") {
                        bail!("malformed status line: {:?}", line);
                    }
                    let code: u16 = parts
                        .next()
                        .unwrap_or("")
                        .parse()
                        .chain_err(|| format!("malformed status line: {:?}", line))?;
                    self.current = Some(HttpResponse {
                        code,
                        reason: parts.next().unwrap_or("").to_string(),
                        headers: Vec::new(),
                        body: Vec::new(),
                    });
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let line = match take_line(&mut self.buffer) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        let (has_body, chunked, length) = {
                            let response = self.current.as_ref().expect("response in progress");
                            (response.has_body(), response.is_chunked(), response.content_length()?)
                        };
                        if !has_body {
                            self.finish();
                        } else if chunked {
                            self.phase = Phase::ChunkSize;
                        } else if length == 0 {
                            self.finish();
                        } else {
                            self.phase = Phase::FixedBody(length);
                        }
                        continue;
                    }
                    let colon = match line.find(':') {
                        Some(colon) => colon,
                        None => bail!("malformed header line: {:?}", line),
                    };
                    self.current
                        .as_mut()
                        .expect("response in progress")
                        .headers
                        .push((
                            line[..colon].trim().to_string(),
                            line[colon + 1..].trim().to_string(),
                        ));
                }
                Phase::FixedBody(remaining) => {
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.buffer.len());
                    let chunk = self.buffer.split_to(take);
                    self.current
                        .as_mut()
                        .expect("response in progress")
                        .body
                        .extend_from_slice(&chunk);
                    if take == remaining {
                        self.finish();
                    } else {
                        self.phase = Phase::FixedBody(remaining - take);
                        return Ok(());
                    }
                }
                Phase::ChunkSize => {
                    let line = match take_line(&mut self.buffer) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .chain_err(|| format!("malformed chunk size: {:?}", line))?;
                    if size == 0 {
                        self.phase = Phase::ChunkTrailer;
                    } else {
                        self.phase = Phase::ChunkData(size);
                    }
                }
                Phase::ChunkData(size) => {
                    // chunk data plus its trailing CRLF
                    if self.buffer.len() < size + 2 {
                        return Ok(());
                    }
                    let chunk = self.buffer.split_to(size);
                    self.current
                        .as_mut()
                        .expect("response in progress")
                        .body
                        .extend_from_slice(&chunk);
                    let crlf = self.buffer.split_to(2);
                    if &crlf[..] != b"\r\n" {
                        bail!("malformed chunk terminator");
                    }
                    self.phase = Phase::ChunkSize;
                }
                Phase::ChunkTrailer => {
                    let line = match take_line(&mut self.buffer) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.finish();
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        let response = self.current.take().expect("response in progress");
        self.completed.push_back(response);
        self.phase = Phase::StatusLine;
    }

    pub fn front(&self) -> Option<&HttpResponse> {
        self.completed.front()
    }

    pub fn pop(&mut self) -> Option<HttpResponse> {
        self.completed.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}
