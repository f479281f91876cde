//! popchat broker
//!
//! The relay core: appending submissions to the log, fanning them out to
//! connected sessions, and bringing (re)connecting sessions back in sync.
//!
//! Public types:
//! - `Relay`: the engine the transport drives
//! - `SessionRegistry`: per-session outbound channels and their state
//! - `Message`, `Delivery`, `Event`: what is stored and what is sent

pub mod engine;
pub mod message;
pub mod recovery;
pub mod registry;

pub use engine::Relay;
pub use message::{Delivery, Event, Message, MessageId, SubmitOutcome};
pub use registry::{EventSender, SessionRegistry};

#[cfg(test)]
mod tests;
