//! The `persistence` module holds the message log.
//!
//! The log is append-only and strictly ordered by a store-assigned id. Each
//! message also carries a client token that is unique across the log; a
//! second append with a known token is refused with `DuplicateSubmission`,
//! which is how retried submissions are absorbed.
//!
//! It uses `sled` as an embedded key-value store for efficient and durable
//! message storage.

pub mod sled_store;

pub use sled_store::{LogCursor, MessageStore};
