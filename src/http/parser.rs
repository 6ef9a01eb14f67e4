//! HTTP/1.x parser

use std::io::Read;
use std::sync::OnceLock;

use flate2::read::{GzDecoder, ZlibDecoder};
use regex::bytes::Regex;
use thiserror::Error;

use crate::core::headers::HeaderMap;
use crate::stream::reader::{ReadError, Reader};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("end of stream")]
    Eof,

    #[error("bad first line: {0}")]
    BadFirstLine(String),

    #[error("bad header line {0}: {1}")]
    BadHeader(usize, String),

    #[error("bad chunk: {0}")]
    BadChunk(String),

    #[error("bad content length: {0}")]
    BadContentLength(String),

    #[error("decompress body: {0}")]
    Decompress(#[from] std::io::Error),
}

impl From<ReadError> for ParseError {
    fn from(_: ReadError) -> Self {
        ParseError::Eof
    }
}

impl ParseError {
    /// End-of-stream terminations are the normal way a connection ends.
    pub fn is_eof(&self) -> bool {
        matches!(self, ParseError::Eof)
    }
}

/// Which message kind a half-stream carries, once discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Unknown,
    Request,
    Response,
}

/// A parsed request or status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        code: u16,
        reason: String,
    },
}

fn request_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z]+) (.+) (HTTP/.+)\r\n$").unwrap())
}

fn response_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(HTTP/.+) (\d{3}) (.+)\r\n$").unwrap())
}

fn field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn try_request_line(line: &[u8]) -> Option<FirstLine> {
    let caps = request_line_re().captures(line)?;
    Some(FirstLine::Request {
        method: field(&caps[1]),
        uri: field(&caps[2]),
        version: field(&caps[3]),
    })
}

fn try_response_line(line: &[u8]) -> Option<FirstLine> {
    let caps = response_line_re().captures(line)?;
    let code = field(&caps[2]).parse().ok()?;
    Some(FirstLine::Response {
        version: field(&caps[1]),
        code,
        reason: field(&caps[3]),
    })
}

/// Read and classify the first line of the next message.
///
/// The hint restricts which pattern is tried; on `Unknown` the response
/// pattern wins because a status line is the less ambiguous of the two.
pub async fn parse_first_line(
    reader: &mut Reader,
    hint: Direction,
) -> Result<FirstLine, ParseError> {
    let line = reader.read_until(b"\r\n").await?;
    let parsed = match hint {
        Direction::Request => try_request_line(&line),
        Direction::Response => try_response_line(&line),
        Direction::Unknown => try_response_line(&line).or_else(|| try_request_line(&line)),
    };
    parsed.ok_or_else(|| ParseError::BadFirstLine(field(&line).trim_end().to_string()))
}

/// Read the header block up to the empty line.
pub async fn parse_headers(reader: &mut Reader) -> Result<HeaderMap, ParseError> {
    let block = reader.read_until(b"\r\n\r\n").await?;
    let data = &block[..block.len() - 4];

    let mut headers = HeaderMap::new();
    for (i, line) in split_crlf(data).enumerate() {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ParseError::BadHeader(i, field(line)))?;
        let name = field(&line[..colon]);
        let value = field(&line[colon + 1..]);
        headers.append(name, value.trim_matches(' ').to_string());
    }
    Ok(headers)
}

fn split_crlf(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let data = rest.take()?;
        match find_crlf(data) {
            Some(pos) => {
                rest = Some(&data[pos + 2..]);
                Some(&data[..pos])
            }
            None => Some(data),
        }
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

struct ContentInfo {
    length: usize,
    encoding: Option<String>,
    chunked: bool,
}

fn content_info(headers: &HeaderMap) -> Result<ContentInfo, ParseError> {
    let mut info = ContentInfo {
        length: 0,
        encoding: None,
        chunked: false,
    };
    for h in headers.iter() {
        match h.name.to_ascii_lowercase().as_str() {
            "content-length" => {
                info.length = h
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::BadContentLength(h.value.clone()))?;
            }
            "transfer-encoding" => info.chunked = h.value == "chunked",
            "content-encoding" => info.encoding = Some(h.value.clone()),
            _ => {}
        }
    }
    Ok(info)
}

/// Parse the message body as framed by its headers.
///
/// `method` is the method of the request this message belongs to; responses
/// to `HEAD` never carry a body no matter what their headers claim.
pub async fn parse_body(
    reader: &mut Reader,
    method: &str,
    headers: &HeaderMap,
    is_request: bool,
) -> Result<Vec<u8>, ParseError> {
    let info = content_info(headers)?;

    if (info.length == 0 && !info.chunked) || (!is_request && method == "HEAD") {
        return Ok(Vec::new());
    }

    let body = if info.chunked {
        parse_chunked(reader).await?
    } else {
        reader.next(info.length).await?
    };

    match info.encoding.as_deref() {
        Some("gzip") => decompress(GzDecoder::new(body.as_slice())),
        Some("deflate") => decompress(ZlibDecoder::new(body.as_slice())),
        _ => Ok(body),
    }
}

fn decompress(mut decoder: impl Read) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

async fn parse_chunked(reader: &mut Reader) -> Result<Vec<u8>, ParseError> {
    let mut body = Vec::new();
    loop {
        let line = reader.read_until(b"\r\n").await?;
        let size_field = field(&line[..line.len() - 2]);
        let size_field = size_field.trim_matches(' ');
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ParseError::BadChunk(format!("bad chunk size {size_field:?}")))?;

        let chunk = reader.next(size).await?;
        body.extend_from_slice(&chunk);

        let terminator = reader.next(2).await?;
        if terminator != b"\r\n" {
            return Err(ParseError::BadChunk("missing chunk terminator".into()));
        }

        if size == 0 {
            return Ok(body);
        }
    }
}
