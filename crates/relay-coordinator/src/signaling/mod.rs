//! Duplex signaling over WebSocket.
//!
//! See [`protocol`] for the frame format.

pub mod protocol;
pub mod websocket;

pub use protocol::{decode_request, DecodeError, RequestFrame, ServerFrame};
pub use websocket::{handle_socket, signaling_router};
