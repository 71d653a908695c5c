//! snigate — TLS terminating edge server
//!
//! HTTPS/1.1 and websocket traffic multiplexed on one secure port,
//! certificates selected by Server Name Indication, matching requests
//! upgraded to websocket in place, payloads dispatched to URI keyed
//! handlers, and a JSON event layer on top of text frames.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use snigate::{Server, ServerCallbacks, WebsocketConfig};
//!
//! # async fn run() -> Result<(), snigate::ServerError> {
//! let config = snigate::ServerConfig::from_json_file("server.json".as_ref())?;
//! let server = Server::create(config, ServerCallbacks::default()).await?;
//!
//! let echo = server.clone();
//! server.configure_websocket_callback(
//!     b"example.test",
//!     Some("/echo"),
//!     WebsocketConfig {
//!         assembled: Some(Arc::new(move |socket, _domain, _uri, content, text| {
//!             let opcode = if text {
//!                 snigate::frame::OpCode::Text
//!             } else {
//!                 snigate::frame::OpCode::Binary
//!             };
//!             let frame = snigate::frame::WsFrame::data(
//!                 echo.config().websocket,
//!                 opcode,
//!                 true,
//!                 content,
//!             );
//!             echo.send_secure(socket, frame.into_buffer())
//!         })),
//!         ..WebsocketConfig::default()
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

/// server configuration tree
pub mod config;
mod connection;
/// domain table and SNI selection
pub mod domain;
/// error definitions
pub mod errors;
/// GET and HEAD file answering
pub mod files;
/// websocket frame parse object
pub mod frame;
/// embedder callback surface
pub mod handler;
/// websocket upgrade handshake
pub mod handshake;
/// HTTP/1.1 message parse object
pub mod http;
mod send;
/// the io engine
pub mod server;

pub use config::ServerConfig;
pub use errors::{HttpError, ProtocolError, ServerError};
pub use files::FileFormat;
pub use handler::{ConnId, EventHandler, EventParameter, ServerCallbacks, WebsocketConfig};
pub use server::Server;

/// outcome of feeding a parse object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsing {
    /// grammar consistent so far, more bytes needed
    Progress,
    /// one complete unit parsed, `next` points past its last byte
    Complete {
        /// offset of the first byte after the parsed unit
        next: usize,
    },
}
