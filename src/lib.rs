//! # PopChat
//!
//! `popchat` is a real-time chat relay built with Rust. Clients connect over
//! WebSockets, submit messages tagged with a client-generated token, and
//! receive every message in log order. Messages are kept in a durable,
//! append-only log so a client that reconnects can catch up on what it
//! missed.
//!
//! Delivery is at-least-once: a client resends a submission with the same
//! token until it is acknowledged, and the log stores each token once.
//!
//! ## Core Modules
//!
//! - `broker`: The relay engine. Appends submissions, broadcasts them to every
//!   session in log order and brings reconnecting sessions up to date.
//! - `client`: A WebSocket client that resends submissions until acknowledged.
//! - `config`: Handles loading and managing server configuration.
//! - `persistence`: The append-only message log, deduplicated by client token.
//! - `session`: Per-connection session state and the connect handshake.
//! - `transport`: Manages the WebSocket server and the wire format.
//! - `utils`: Shared utilities such as error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod session;
pub mod transport;
pub mod utils;
