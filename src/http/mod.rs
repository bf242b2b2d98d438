//! Support for reassembling HTTP message bodies from proxied streams.

use flate2::read::GzDecoder;
use log::info;
use std::cmp::min;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read};
use std::mem;

use crate::cache::FlowKey;

/// Represents the maximum size of a header section.
const MAX_HEADER_SIZE: usize = 64 * 1024;
/// Represents the maximum size of a chunk size line.
const MAX_LINE_SIZE: usize = 1024;
/// Represents the maximum size of a message body.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Represents the direction of a message in a flow.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    /// Represents messages sent by the device.
    Request,
    /// Represents messages received from the network.
    Response,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// Trait for receiving reassembled message bodies.
pub trait BodySink: Send + Sync {
    /// Delivers a complete, decoded body of the flow.
    fn deliver(&self, key: FlowKey, direction: Direction, body: Vec<u8>);
}

/// Represents a `BodySink` which logs the bodies it receives.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl BodySink for LogSink {
    fn deliver(&self, key: FlowKey, direction: Direction, body: Vec<u8>) {
        info!("reassemble {} of {} ({} Bytes)", direction, key, body.len());
    }
}

/// Represents the state of a `Reassembler`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReassemblerState {
    /// Waiting for the end of the header section.
    AwaitingHeaders,
    /// Reading a body framed by `Content-Length`.
    ReadingFixedBody,
    /// Reading a chunked body.
    ReadingChunkedBody,
    /// Reading the trailer section after the last chunk.
    ReadingTrailers,
}

#[derive(Clone, Copy, Debug)]
enum Framing {
    Headers,
    Fixed { remaining: usize },
    ChunkSize,
    ChunkData { data: usize, crlf: usize },
    Trailers,
}

struct Header {
    chunked: bool,
    content_length: Option<usize>,
    gzip: bool,
}

/// Represents a reassembler of one direction of an HTTP/1.x stream. Bytes are pushed as
/// they are seen, complete bodies are returned as soon as their last byte arrives.
#[derive(Debug)]
pub struct Reassembler {
    framing: Framing,
    buffer: Vec<u8>,
    body: Vec<u8>,
    gzip: bool,
}

impl Reassembler {
    /// Creates a new `Reassembler`.
    pub fn new() -> Reassembler {
        Reassembler {
            framing: Framing::Headers,
            buffer: Vec::new(),
            body: Vec::new(),
            gzip: false,
        }
    }

    /// Returns the state of the reassembler.
    pub fn state(&self) -> ReassemblerState {
        match self.framing {
            Framing::Headers => ReassemblerState::AwaitingHeaders,
            Framing::Fixed { .. } => ReassemblerState::ReadingFixedBody,
            Framing::ChunkSize | Framing::ChunkData { .. } => ReassemblerState::ReadingChunkedBody,
            Framing::Trailers => ReassemblerState::ReadingTrailers,
        }
    }

    /// Discards any partial message.
    pub fn reset(&mut self) {
        self.framing = Framing::Headers;
        self.buffer.clear();
        self.body.clear();
        self.gzip = false;
    }

    /// Pushes stream bytes, returns the bodies completed by them. Malformed framing resets
    /// the reassembler and returns an `InvalidData` error.
    pub fn push(&mut self, data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let mut buffer = mem::take(&mut self.buffer);
        buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        let mut pos = 0;
        loop {
            let rest = &buffer[pos..];
            match self.framing {
                Framing::Headers => {
                    // Tolerate empty lines between messages
                    if rest.starts_with(b"\r\n") {
                        pos += 2;
                        continue;
                    }
                    let end = match find(rest, b"\r\n\r\n") {
                        Some(i) => i + 4,
                        None => {
                            if rest.len() > MAX_HEADER_SIZE {
                                return Err(self.fail("header too large"));
                            }
                            break;
                        }
                    };
                    let header = match parse_header(&rest[..end]) {
                        Ok(header) => header,
                        Err(e) => return Err(self.fail(e)),
                    };
                    pos += end;

                    self.gzip = header.gzip;
                    if header.chunked {
                        self.framing = Framing::ChunkSize;
                    } else {
                        match header.content_length {
                            Some(n) if n > MAX_BODY_SIZE => {
                                return Err(self.fail("body too large"))
                            }
                            Some(n) if n > 0 => self.framing = Framing::Fixed { remaining: n },
                            _ => self.finish(&mut bodies),
                        }
                    }
                }
                Framing::Fixed { remaining } => {
                    if rest.is_empty() {
                        break;
                    }
                    let n = min(remaining, rest.len());
                    self.body.extend_from_slice(&rest[..n]);
                    pos += n;
                    if n == remaining {
                        self.finish(&mut bodies);
                    } else {
                        self.framing = Framing::Fixed {
                            remaining: remaining - n,
                        };
                    }
                }
                Framing::ChunkSize => {
                    let lf = match rest.iter().position(|b| *b == b'\n') {
                        Some(i) => i,
                        None => {
                            if rest.len() > MAX_LINE_SIZE {
                                return Err(self.fail("chunk size line too long"));
                            }
                            break;
                        }
                    };
                    let size = match parse_chunk_size(&rest[..lf]) {
                        Some(size) => size,
                        None => return Err(self.fail("invalid chunk size")),
                    };
                    pos += lf + 1;
                    if size == 0 {
                        self.framing = Framing::Trailers;
                    } else {
                        if self.body.len().saturating_add(size) > MAX_BODY_SIZE {
                            return Err(self.fail("body too large"));
                        }
                        self.framing = Framing::ChunkData {
                            data: size,
                            crlf: 2,
                        };
                    }
                }
                Framing::ChunkData { data, crlf } => {
                    if rest.is_empty() {
                        break;
                    }
                    if data > 0 {
                        let n = min(data, rest.len());
                        self.body.extend_from_slice(&rest[..n]);
                        pos += n;
                        self.framing = Framing::ChunkData {
                            data: data - n,
                            crlf,
                        };
                    } else {
                        let n = min(crlf, rest.len());
                        pos += n;
                        self.framing = if n == crlf {
                            Framing::ChunkSize
                        } else {
                            Framing::ChunkData {
                                data: 0,
                                crlf: crlf - n,
                            }
                        };
                    }
                }
                Framing::Trailers => {
                    let lf = match rest.iter().position(|b| *b == b'\n') {
                        Some(i) => i,
                        None => {
                            if rest.len() > MAX_HEADER_SIZE {
                                return Err(self.fail("trailer too large"));
                            }
                            break;
                        }
                    };
                    let line = trim_cr(&rest[..lf]);
                    pos += lf + 1;
                    if line.is_empty() {
                        self.finish(&mut bodies);
                    }
                }
            }
        }

        buffer.drain(..pos);
        self.buffer = buffer;

        Ok(bodies)
    }

    fn finish(&mut self, bodies: &mut Vec<Vec<u8>>) {
        let body = mem::take(&mut self.body);
        let gzip = self.gzip;
        self.framing = Framing::Headers;
        self.gzip = false;

        if body.is_empty() {
            return;
        }
        if gzip || body.starts_with(&GZIP_MAGIC) {
            bodies.push(gunzip(&body).unwrap_or(body));
        } else {
            bodies.push(body);
        }
    }

    fn fail(&mut self, msg: &str) -> io::Error {
        self.reset();
        io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
    }
}

impl Default for Reassembler {
    fn default() -> Reassembler {
        Reassembler::new()
    }
}

/// Represents the reassemblers of both directions of a flow.
#[derive(Debug, Default)]
pub struct HttpInspector {
    request: Reassembler,
    response: Reassembler,
}

impl HttpInspector {
    /// Creates a new `HttpInspector`.
    pub fn new() -> HttpInspector {
        HttpInspector::default()
    }

    /// Pushes stream bytes of the direction, returns the bodies completed by them.
    pub fn push(&mut self, direction: Direction, data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        match direction {
            Direction::Request => self.request.push(data),
            Direction::Response => self.response.push(data),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn parse_header(header: &[u8]) -> Result<Header, &'static str> {
    let text = String::from_utf8_lossy(header);
    let mut result = Header {
        chunked: false,
        content_length: None,
        gzip: false,
    };

    // Skip the start line
    for line in text.split("\r\n").skip(1) {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_ascii_lowercase();
        match name.as_str() {
            "transfer-encoding" => {
                if value.split(',').any(|coding| coding.trim() == "chunked") {
                    result.chunked = true;
                }
            }
            "content-length" => match value.parse::<usize>() {
                Ok(n) => result.content_length = Some(n),
                Err(_) => return Err("invalid content length"),
            },
            "content-encoding" => {
                if value.split(',').any(|coding| coding.trim() == "gzip") {
                    result.gzip = true;
                }
            }
            _ => {}
        }
    }

    Ok(result)
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = trim_cr(line);
    // Ignore chunk extensions
    let size = match line.iter().position(|b| *b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let size = std::str::from_utf8(size).ok()?.trim();
    if size.is_empty() {
        return None;
    }

    usize::from_str_radix(size, 16).ok()
}

fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut decompressed)?;

    Ok(decompressed)
}

#[cfg(test)]
fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn reassemble_fixed() {
    let mut reassembler = Reassembler::new();
    let bodies = reassembler
        .push(b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nhello world!!")
        .unwrap();
    assert_eq!(bodies, vec![b"hello world!!".to_vec()]);
    assert_eq!(reassembler.state(), ReassemblerState::AwaitingHeaders);
}

#[test]
fn reassemble_fixed_incomplete() {
    let mut reassembler = Reassembler::new();
    let bodies = reassembler
        .push(b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nhello")
        .unwrap();
    assert!(bodies.is_empty());
    assert_eq!(reassembler.state(), ReassemblerState::ReadingFixedBody);

    let bodies = reassembler.push(b" world!!").unwrap();
    assert_eq!(bodies, vec![b"hello world!!".to_vec()]);
}

#[test]
fn reassemble_chunked() {
    let mut reassembler = Reassembler::new();
    let bodies = reassembler
        .push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n")
        .unwrap();
    assert_eq!(bodies, vec![b"Wikipedia".to_vec()]);
}

#[test]
fn reassemble_chunked_byte_by_byte() {
    let message: &[u8] = b"HTTP/1.1 200 OK\r\ntransfer-encoding: Chunked\r\n\r\n4;name=value\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
    let mut reassembler = Reassembler::new();
    let mut bodies = Vec::new();
    for byte in message {
        bodies.extend(reassembler.push(&[*byte]).unwrap());
    }
    assert_eq!(bodies, vec![b"Wikipedia".to_vec()]);
    assert_eq!(reassembler.state(), ReassemblerState::AwaitingHeaders);
}

#[test]
fn reassemble_chunked_gzip() {
    let plain = b"The quick brown fox jumps over the lazy dog. ".repeat(40);
    let compressed = gzip(&plain);
    let (a, b) = compressed.split_at(compressed.len() / 2);

    let mut message = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for chunk in [a, b] {
        message.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        message.extend_from_slice(chunk);
        message.extend_from_slice(b"\r\n");
    }
    message.extend_from_slice(b"0\r\n\r\n");

    let mut reassembler = Reassembler::new();
    let bodies = reassembler.push(&message).unwrap();
    assert_eq!(bodies, vec![plain]);
}

#[test]
fn reassemble_gzip_magic_without_header() {
    let compressed = gzip(b"compressed body");
    let mut message = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    message.extend_from_slice(&compressed);

    let mut reassembler = Reassembler::new();
    assert_eq!(
        reassembler.push(&message).unwrap(),
        vec![b"compressed body".to_vec()]
    );
}

#[test]
fn reassemble_gzip_failure_keeps_raw() {
    let mut reassembler = Reassembler::new();
    let bodies = reassembler
        .push(b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 5\r\n\r\nplain")
        .unwrap();
    assert_eq!(bodies, vec![b"plain".to_vec()]);
}

#[test]
fn reassemble_pipelined() {
    let mut reassembler = Reassembler::new();
    let bodies = reassembler
        .push(b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcHTTP/1.1 200 OK\r\nCONTENT-LENGTH: 2\r\n\r\nde")
        .unwrap();
    assert_eq!(bodies, vec![b"abc".to_vec(), b"de".to_vec()]);
}

#[test]
fn reassemble_request() {
    let mut inspector = HttpInspector::new();
    let bodies = inspector
        .push(
            Direction::Request,
            b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nping",
        )
        .unwrap();
    assert_eq!(bodies, vec![b"ping".to_vec()]);
    assert!(inspector
        .push(Direction::Response, b"HTTP/1.1 200 OK\r\n")
        .unwrap()
        .is_empty());
}

#[test]
fn reassemble_malformed_resets() {
    let mut reassembler = Reassembler::new();
    let err = reassembler
        .push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert_eq!(reassembler.state(), ReassemblerState::AwaitingHeaders);

    let err = reassembler
        .push(b"HTTP/1.1 200 OK\r\nContent-Length: many\r\n\r\n")
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // Recovers on the next message
    let bodies = reassembler
        .push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .unwrap();
    assert_eq!(bodies, vec![b"ok".to_vec()]);
}
