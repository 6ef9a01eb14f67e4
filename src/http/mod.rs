//! HTTP/1.x message framing
//!
//! First-line recognition, header parsing, body framing (content-length and
//! chunked) and content-encoding decompression over a half-connection
//! reader. The logic itself is synchronous; all suspension happens inside
//! the reader.

pub mod parser;

pub use parser::{
    parse_body, parse_first_line, parse_headers, Direction, FirstLine, ParseError,
};
