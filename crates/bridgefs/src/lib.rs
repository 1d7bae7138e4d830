//! BridgeFS device-side server.
//!
//! Exposes a root directory over a framed TCP protocol so a remote client
//! can mount it. The engine multiplexes many outstanding requests over one
//! connection: independent operations overlap, operations on the same open
//! handle run strictly in order, and every response carries the request id
//! it answers.
//!
//! Modules:
//! - [`protocol`]: wire frames, opcodes, request/response codecs
//! - [`handle`]: session-scoped table of open file/directory handles
//! - [`executor`]: the real filesystem calls, confined to the root
//! - [`session`]: per-connection request multiplexer
//! - [`server`]: TCP accept loop, one connection at a time

pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{Config, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use server::Server;
pub use session::Session;
