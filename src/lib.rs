//! # websock - RFC 6455 WebSocket endpoint library
//!
//! A WebSocket (protocol version 13) endpoint that acts as both client and
//! server over plaintext or TLS transports, with stream-based messaging and
//! a callback handler API.
//!
//! - Strict RFC 6455 framing: masking direction, reserved bits, control
//!   frame constraints, close-code semantics
//! - Opening handshake with `Sec-WebSocket-Accept` derivation and
//!   subprotocol negotiation; extensions are rejected, not ignored
//! - Message fragmentation and reassembly with incremental UTF-8
//!   validation and size limits
//! - Ping/pong liveness with a two-deadline policy
//! - A process-wide [`WebSocket`] registry with bulk shutdown
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use websock::{Handler, Message, WebSocket, WsConnection, WsParameters};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn on_message(&self, conn: &WsConnection, message: Message) {
//!         match message {
//!             Message::Text(text) => { let _ = conn.send_text(text).await; }
//!             Message::Binary(data) => { let _ = conn.send_binary(data).await; }
//!         }
//!     }
//! }
//!
//! # async fn run() -> websock::Result<()> {
//! let endpoint = WebSocket::new();
//! let server = endpoint.server(8080, Arc::new(Echo), WsParameters::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod message;
pub mod params;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod tls;

mod upgrade;

pub use connection::{Phase, Role, WsConnection};
pub use endpoint::WebSocket;
pub use error::{Error, Result};
pub use handler::Handler;
pub use message::{CloseCode, Message, WsStatus};
pub use params::{TlsParameters, WsParameters};
pub use protocol::{compute_accept_key, Frame, OpCode, WS_GUID};
pub use server::WsServer;
