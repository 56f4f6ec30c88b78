// WebSocket session manager: connection registry, per-connection outbound
// queues and the socket loop.

mod handler;
mod outbound;
mod session;

use axum::extract::ws::{Message, WebSocket};
use tablesync_common::protocol::ws::{encode_envelope, ServerMessage};

use crate::error::RelayError;

pub use handler::ws_upgrade;
pub use outbound::{Outbound, OutboundQueue, PushOutcome, QueueError};
pub use session::{Admission, AdmissionError, Connection, ConnectionState, SessionManager};

/// The `error` push for a registry error.
pub fn error_message(error: &RelayError) -> ServerMessage {
    ServerMessage::error(error.code().as_str(), error.message(), error.code().retryable())
}

pub(crate) async fn send_server_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let envelope = message.to_envelope().map_err(|_| ())?;
    let encoded = encode_envelope(&envelope).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
