//! Half-connection plumbing between the reassembler and the parser
//!
//! - `reader`: parser-facing buffered reads over a bounded block channel
//! - `stream`: reassembler-facing ingest with gap/stall handling
//! - `pair`: per-connection transaction engine
//! - `factory`: reverse-key pairing and pair task lifecycle

pub mod factory;
pub mod pair;
pub mod reader;
pub mod stream;

pub use factory::{Factory, MethodFilter};
pub use pair::Pair;
pub use reader::{DataBlock, ReadError, Reader};
pub use stream::HttpStream;
