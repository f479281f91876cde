use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Event, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "submit")]
    Submit {
        content: String,
        client_token: String,
        sender_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every connection.
    #[serde(rename = "session")]
    Session { session_id: String, recovered: bool },
    #[serde(rename = "message")]
    Message {
        content: String,
        id: MessageId,
        sender_name: String,
    },
    #[serde(rename = "ack")]
    Ack { client_token: String },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_token: Option<String>,
    },
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        match event {
            Event::Delivered(d) => ServerMessage::Message {
                content: d.content,
                id: d.id,
                sender_name: d.sender_name,
            },
            Event::Acknowledged { client_token } => ServerMessage::Ack { client_token },
            Event::Rejected {
                reason,
                client_token,
            } => ServerMessage::Error {
                message: reason,
                client_token,
            },
        }
    }
}

impl ServerMessage {
    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}
