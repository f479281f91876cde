//! The `utils` module provides shared pieces used across `popchat`:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{StoreError, TransportError};
