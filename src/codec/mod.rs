//! Streaming frame I/O over split async transports.

mod framed;

pub use framed::{FrameReader, FrameWriter};
