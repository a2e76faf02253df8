//! The handler capability set delivered to each connection.

use async_trait::async_trait;

use crate::connection::WsConnection;
use crate::error::Error;
use crate::message::{Message, WsStatus};

/// Event callbacks for a connection.
///
/// One handler instance may serve many connections (a server shares its
/// handler across all accepted connections), but events for any single
/// connection are serialized: `on_open` first, then every `on_message` and
/// `on_error` in order, then exactly one `on_close` after the transport is
/// released. Events for different connections may run concurrently.
///
/// All methods default to doing nothing, so an implementation only overrides
/// what it needs.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The handshake completed and the connection is open.
    async fn on_open(&self, conn: &WsConnection) {
        let _ = conn;
    }

    /// A complete data message arrived.
    async fn on_message(&self, conn: &WsConnection, message: Message) {
        let _ = (conn, message);
    }

    /// Best-effort error notification. `conn` is `None` for server accept
    /// failures that are not tied to a connection. The connection may still
    /// transition to closed after this call.
    async fn on_error(&self, conn: Option<&WsConnection>, error: &Error) {
        let _ = (conn, error);
    }

    /// The connection reached its terminal state. Called exactly once,
    /// after every other event for this connection.
    async fn on_close(&self, conn: &WsConnection, status: WsStatus) {
        let _ = (conn, status);
    }
}
