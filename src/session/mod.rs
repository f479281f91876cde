//! The `session` module describes a live connection from the relay's point
//! of view.
//!
//! A `Session` owns no durable state. It records whether the transport
//! resumed an earlier connection and which offset the client claims to have
//! seen, which is all the recovery step needs to decide on a replay.

pub mod connection;

pub use connection::{Handshake, Session, SessionId};
