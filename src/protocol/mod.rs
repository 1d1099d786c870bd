//! # Protocol Layer
//!
//! Wire messages, the login quarantine, and location-transparent RPC.
//!
//! ## Components
//! - **Envelope**: sender, recipient and payload of every frame
//! - **Handshake**: server and client login conversations
//! - **Dispatcher**: typed operation tables replacing name-based lookup
//! - **Endpoint / Registry**: local implementors and per-endpoint call order
//! - **Pending**: wait-for-result calls in flight
//! - **Invoker**: fire-and-forget and wait-for-result calls
//! - **Hub**: table of remote endpoint locations
//!
//! ## Handshake Flow
//! ```text
//! Client                                  Server
//!   |-- Name, Mac ----------------------->|
//!   |<-- Challenge -----------------------|
//!   |-- Response ------------------------>|
//!   |<-- LoginResult(None), Welcome,      |
//!   |    Addresses -----------------------|  (Unquarantine)
//!   |                                     |
//!   |<-- LoginResult(Some(reason)) -------|  (rejected)
//!   |-- Ack ----------------------------->|  (Terminate)
//! ```

pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod handshake;
pub mod hub;
pub mod invoker;
pub mod pending;
pub mod registry;

#[cfg(test)]
mod tests;
