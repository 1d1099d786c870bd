//! # Core Framing Components
//!
//! Length-prefixed, tag-checked frames over byte streams.
//!
//! ## Components
//! - **Frame**: header arithmetic and resumable outbound frames
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Header(4, big-endian) = size XOR MAGIC] [Body(size)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 10 MiB by default (prevents memory exhaustion)
//! - The top header byte must equal the tag byte of `MAGIC`
//! - Header validation before allocation

pub mod codec;
pub mod frame;
