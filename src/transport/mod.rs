//! # Transport Layer
//!
//! Connection management over any async byte stream.
//!
//! ## Components
//! - **Socket**: channel table, quarantine and failure reporting
//! - **Reader**: one task per channel, frames in
//! - **Decoder**: one task per socket, frames to envelopes
//! - **Encoder**: envelopes to frames
//! - **Writer**: one task per socket, ordered frames out
//!
//! ## Data Flow
//! ```text
//! stream -> reader -> bounded queue -> decoder -> quarantine | listener
//! listener -> encoder -> per-channel queue -> writer -> stream
//! ```

mod decoder;
pub mod encoder;
mod reader;
pub mod socket;
mod writer;

/// Socket-local connection identifier
pub type ChannelId = u64;

pub use socket::{Socket, SocketListener};
