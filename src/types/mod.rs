//! Core data types shared by the capture, encode and upload stages.
//!
//! - [`Frame`] is one raw capture with its dimensions and pixel layout
//! - [`PixelFormat`] tags the layout of a frame buffer
//! - [`Chunk`] is one piece of streaming JPEG output, or the end marker
//!
//! Frame buffers and chunk payloads are [`bytes::Bytes`], so handing them
//! between threads moves a reference rather than copying pixel data.

mod chunk;
mod frame;

pub use chunk::Chunk;
pub use frame::{Frame, PixelFormat};
