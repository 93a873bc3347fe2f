#![deny(warnings, rust_2018_idioms)]

use bytes::{BufMut, BytesMut};
use std::{io, mem};
use tokio_util::codec::{Decoder, Encoder};

const NUL: u8 = b'\0';
/// Cap on the SCGI header netstring payload. Matches the limit the relay applies on the other
/// side of the hop.
const MAX_HDRS: usize = 65536;
/// Longest run of bytes accepted for the netstring length field before giving up on ever seeing
/// the ':'. MAX_HDRS needs five digits.
const MAX_SIZE_DIGITS: usize = 8;

/// A parsed SCGI request header with key/value header data, and/or bytes from the raw request body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SCGIRequest {
    /// The header fields in wire order, plus however much of the body was already buffered behind
    /// them. When that is shorter than `CONTENT_LENGTH` the rest follows as `BodyFragment`s.
    Request(Vec<(String, String)>, BytesMut),

    /// Body bytes that arrived after the leading `Request` frame.
    BodyFragment(BytesMut),
}

/// A CGI-style response to be written back to the SCGI client: a `Status:` preamble followed by an
/// opaque body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SCGIResponse {
    /// Status line content, e.g. `200 OK`.
    pub status: &'static str,

    /// Value for the `Content-Type` header.
    pub content_type: &'static str,

    /// Value for the `Content-Length` header, omitted from the preamble when `None`.
    pub content_length: Option<usize>,

    /// Response body, written verbatim after the blank line.
    pub body: BytesMut,
}

impl SCGIResponse {
    /// Returns a `200 OK` response carrying `body` as an opaque byte payload. The body may be
    /// empty; `Content-Length` is always present.
    pub fn ok(body: BytesMut) -> SCGIResponse {
        SCGIResponse {
            status: "200 OK",
            content_type: "application/octet-stream",
            content_length: Some(body.len()),
            body,
        }
    }

    /// Returns an error response with a plain-text diagnostic body.
    pub fn error(status: &'static str, diagnostic: String) -> SCGIResponse {
        SCGIResponse {
            status,
            content_type: "text/plain",
            content_length: None,
            body: BytesMut::from(diagnostic.as_bytes()),
        }
    }
}

/// Where the decoder currently is within one request.
#[derive(Clone, Debug, Eq, PartialEq)]
enum CodecState {
    /// Reading the decimal length that opens the netstring, up to its ':'.
    BlockSize,

    /// Reading a field key, up to its NUL.
    FieldKey,

    /// Reading a field value, up to its NUL. The value that exhausts the block hands off to
    /// Terminator.
    FieldValue,

    /// Expecting the ',' that closes the netstring.
    Terminator,

    /// Past the ','. Everything from here on is body payload and passes through untouched.
    Body,
}

/// A `Codec` implementation for the backend relay's SCGI listener. The Decoder parses and returns
/// `SCGIRequest` objects containing header/body request data from the fronting web server. The
/// Encoder writes `SCGIResponse` values as CGI-style `Status:` preambles followed by the raw body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SCGICodec {
    state: CodecState,

    /// Bytes of the declared header block not yet consumed.
    block_remaining: usize,

    /// Key parsed in FieldKey, waiting for its value.
    pending_key: String,

    /// Completed pairs. Kept as a Vec so wire order survives and first-match lookup works.
    fields: Vec<(String, String)>,

    /// How far into the buffer previous calls already scanned for a delimiter, so a request
    /// arriving in dribbles isn't rescanned from the start each time. Must return to 0 whenever
    /// bytes are consumed from the buffer.
    scan_from: usize,
}

/// Shorthand for an InvalidData error with a formatted message.
macro_rules! io_err {
    ($($arg:tt)*) => (Err(io::Error::new(io::ErrorKind::InvalidData, format!($($arg)+))))
}

/// Returns the value of the first header pair whose key exactly equals `key`, or `None` when no
/// pair matches. Later duplicates are ignored.
pub fn first_header<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

impl SCGICodec {
    /// Returns a server `SCGICodec` for accepting and parsing SCGI-format requests sent by the
    /// fronting web server.
    pub fn new() -> SCGICodec {
        SCGICodec {
            state: CodecState::BlockSize,
            block_remaining: 0,
            pending_key: String::new(),
            fields: Vec::new(),
            scan_from: 0,
        }
    }

    /// Works through the header block as far as the buffer allows. Emits the `Request` frame once
    /// the closing ',' is reached, or `None` if more bytes are needed first.
    fn parse_fields(&mut self, buf: &mut BytesMut) -> Result<Option<SCGIRequest>, io::Error> {
        loop {
            match self.state {
                CodecState::Terminator => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    if buf[0] != b',' {
                        return io_err!("Netstring is not terminated by ','");
                    }
                    let _ = buf.split_to(1);
                    self.scan_from = 0;
                    self.state = CodecState::Body;
                    // Anything buffered behind the ',' is body payload; hand over what is here
                    // along with the fields, which usually completes a small request in one frame.
                    return Ok(Some(SCGIRequest::Request(
                        mem::take(&mut self.fields),
                        buf.split_to(buf.len()),
                    )));
                }
                CodecState::FieldKey | CodecState::FieldValue => {
                    let Some(offset) = buf[self.scan_from..].iter().position(|b| *b == NUL) else {
                        // The delimiter isn't here yet. Remember how far the scan got, and if it
                        // already passed where the block is declared to end, no NUL can close
                        // this field.
                        self.scan_from = buf.len();
                        if self.scan_from > self.block_remaining {
                            return io_err!(
                                "Header field runs past the declared netstring boundary"
                            );
                        }
                        return Ok(None);
                    };
                    // Take the field and its NUL off the front of the buffer.
                    let field = buf.split_to(self.scan_from + offset + 1);
                    self.scan_from = 0;
                    if field.len() > self.block_remaining {
                        return io_err!("Header field runs past the declared netstring boundary");
                    }
                    self.block_remaining -= field.len();
                    match self.state {
                        CodecState::FieldKey => {
                            self.pending_key = field_string(field)
                                .or_else(|e| io_err!("Bad header key: {}", e))?;
                            if self.block_remaining == 0 {
                                // A key flush against the end of the block means an odd field
                                // count.
                                return io_err!(
                                    "Header key '{}' has no accompanying value",
                                    self.pending_key
                                );
                            }
                            self.state = CodecState::FieldValue;
                        }
                        CodecState::FieldValue => {
                            let value = field_string(field).or_else(|e| {
                                io_err!("Bad value for header {}: {}", self.pending_key, e)
                            })?;
                            self.fields.push((mem::take(&mut self.pending_key), value));
                            self.state = if self.block_remaining > 0 {
                                CodecState::FieldKey
                            } else {
                                CodecState::Terminator
                            };
                        }
                        _ => unreachable!("field handling in state {:?}", self.state),
                    }
                }
                CodecState::BlockSize | CodecState::Body => {
                    unreachable!("parse_fields entered in state {:?}", self.state);
                }
            }
        }
    }
}

impl Default for SCGICodec {
    fn default() -> Self {
        SCGICodec::new()
    }
}

/// Decodes SCGI-format requests, while forwarding through any content payload
impl Decoder for SCGICodec {
    type Item = SCGIRequest;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<SCGIRequest>, io::Error> {
        match self.state {
            CodecState::BlockSize => {
                let Some(offset) = buf[self.scan_from..].iter().position(|b| *b == b':') else {
                    self.scan_from = buf.len();
                    if self.scan_from > MAX_SIZE_DIGITS {
                        return io_err!(
                            "Header size field exceeds {} digits without a ':'",
                            MAX_SIZE_DIGITS
                        );
                    }
                    return Ok(None);
                };
                let size_field = buf.split_to(self.scan_from + offset + 1);
                // Drop the scan offset before any early error return; a later call must not
                // index past the now-shortened buffer.
                self.scan_from = 0;
                self.block_remaining = parse_block_size(size_field)?;
                if self.block_remaining > MAX_HDRS {
                    return io_err!("Header size exceeds maximum {} bytes", MAX_HDRS);
                }
                // A declared size of zero ("0:,") skips straight to the terminator. SCGI wants at
                // least CONTENT_LENGTH in there, but required-field checks belong to the relay,
                // not the framing.
                self.state = if self.block_remaining > 0 {
                    CodecState::FieldKey
                } else {
                    CodecState::Terminator
                };
                self.parse_fields(buf)
            }
            CodecState::FieldKey | CodecState::FieldValue | CodecState::Terminator => {
                // Pick the header block back up wherever the last call left off.
                self.parse_fields(buf)
            }
            CodecState::Body => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(SCGIRequest::BodyFragment(buf.split_to(buf.len()))))
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<SCGIRequest>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        match self.state {
            // Body shortness against CONTENT_LENGTH is the caller's to judge.
            CodecState::Body => Ok(None),
            // Clean close before any request bytes arrived.
            CodecState::BlockSize if buf.is_empty() => Ok(None),
            _ => io_err!("Connection ended before the SCGI header block was complete"),
        }
    }
}

/// Parses the length digits off the front of the netstring. `field` includes the trailing ':'.
fn parse_block_size(field: BytesMut) -> Result<usize, io::Error> {
    let digits = &field[..field.len() - 1];
    if digits.is_empty() {
        return io_err!("Netstring length is empty");
    }
    if digits.len() > 1 && digits[0] == b'0' {
        // "0" alone is fine; "007" is not a length.
        return io_err!("Netstring length has a leading zero");
    }
    let digits =
        std::str::from_utf8(digits).or_else(|_| io_err!("Netstring length is not valid UTF-8"))?;
    digits
        .parse()
        .or_else(|_| io_err!("Netstring length is not a number: '{}'", digits))
}

/// Converts a field and its trailing NUL into an owned string.
fn field_string(field: BytesMut) -> Result<String, io::Error> {
    String::from_utf8(field[..field.len() - 1].to_vec())
        .or_else(|_| io_err!("Header field is not valid UTF-8"))
}

/// Writes a CGI-style response preamble followed by the raw body. Every preamble ends with a blank
/// line, whether or not Content-Length is present.
impl Encoder<SCGIResponse> for SCGICodec {
    type Error = io::Error;

    fn encode(&mut self, response: SCGIResponse, buf: &mut BytesMut) -> Result<(), io::Error> {
        let preamble = match response.content_length {
            Some(len) => format!(
                "Status: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                response.status, response.content_type, len
            ),
            None => format!(
                "Status: {}\r\nContent-Type: {}\r\n\r\n",
                response.status, response.content_type
            ),
        };
        buf.reserve(preamble.len() + response.body.len());
        buf.put_slice(preamble.as_bytes());
        buf.put(response.body);
        Ok(())
    }
}
