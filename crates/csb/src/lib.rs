//! `gx-csb`: Control Stream Builder.
//!
//! Builds GPU command streams in chains of fixed-size buffer objects:
//!
//! - [`ControlStream`]: allocate, extend-and-link, relocation marks,
//!   deferred host streams, bake
//! - [`ControlWord`]: packet headers and stream control words
//! - [`StreamReader`]: parses a built stream back through an address space

pub mod error;
pub mod reader;
pub mod stream;
pub mod words;

pub use error::StreamError;
pub use reader::{read_stream, Packet, ReadError, StreamReader};
pub use stream::{ControlStream, RelocationMarkState, StreamType, StreamWords};
pub use words::{ControlWord, LINK_BYTES, LINK_WORDS, MAX_PACKET_WORDS, WORD_SIZE};
