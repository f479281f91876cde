//! The `client` module is the other half of the delivery contract.
//!
//! `RelayClient` keeps a submission's token stable across resends, so the
//! relay can tell a retry from a new message, and tracks the highest id it
//! has seen so a reconnect can ask for exactly what it missed.

pub mod relay_client;
pub use relay_client::RelayClient;
