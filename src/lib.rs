//! # nodewire
//!
//! Node-to-node messaging over framed TCP connections, with a quarantine login
//! handshake and location-transparent RPC endpoints.
//!
//! ## Layers
//! - [`core`]: frame header arithmetic and the Tokio codec
//! - [`transport`]: sockets, per-channel writer queues and the decode loop
//! - [`protocol`]: envelopes, login conversations, endpoints and the invoker
//! - [`service`]: server and client messengers tying the layers together
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Quick Start
//! ```rust,no_run
//! use nodewire::config::NetworkConfig;
//! use nodewire::protocol::handshake::AnonymousLogin;
//! use nodewire::protocol::invoker::Invoker;
//! use nodewire::service::{ClientMessenger, Messenger, ServerMessenger};
//! use std::sync::Arc;
//!
//! # fn main() -> nodewire::error::Result<()> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let config = NetworkConfig::default();
//!
//! let server = runtime.block_on(ServerMessenger::bind(&config, None))?;
//! let server = Arc::new(server);
//! let _hub_invoker = Invoker::attach(server.clone(), &config.dispatch)?;
//!
//! let client = runtime.block_on(ClientMessenger::connect(&config, Arc::new(AnonymousLogin)))?;
//! let client: Arc<dyn Messenger> = Arc::new(client);
//! let _invoker = Invoker::attach(client, &config.dispatch)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
