//! The `transport` module carries the relay over WebSockets.
//!
//! It defines the JSON protocol spoken with clients and the server that
//! accepts connections, reads the handshake from the request URL, runs the
//! relay's connect step, and then shuttles submissions in and events out.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, ServerMessage};
pub use websocket::{handle_client_message, serve, start_websocket_server};
