//! Message definitions for the relay
//!
//! `Message` is the durable unit of the log. `Delivery` is what sessions
//! receive, during replay and live broadcast alike, so clients handle both
//! paths the same way. `Event` is everything the relay pushes down a
//! session's outbound channel.

use serde::{Deserialize, Serialize};

/// Store-assigned position in the log; also the replay offset.
pub type MessageId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub client_token: String,
    pub content: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub content: String,
    pub id: MessageId,
    pub sender_name: String,
}

impl From<Message> for Delivery {
    fn from(msg: Message) -> Self {
        Self {
            content: msg.content,
            id: msg.id,
            sender_name: msg.sender_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Delivered(Delivery),
    /// The submission carrying this token is in the log, whether it was
    /// stored just now or by an earlier attempt.
    Acknowledged { client_token: String },
    /// A frame from the session was refused before reaching the store.
    /// `client_token` is set when the frame was a readable submission.
    Rejected {
        reason: String,
        client_token: Option<String>,
    },
}

/// Result of a submission that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Stored(MessageId),
    AlreadyStored,
}
