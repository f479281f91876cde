use url::form_urlencoded;
use uuid::Uuid;

use crate::broker::message::MessageId;

pub type SessionId = String;

const SESSION_ID_PARAM: &str = "session_id";
const OFFSET_PARAM: &str = "offset";

/// Connection metadata for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    /// The transport resumed a previous connection with nothing lost.
    pub recovered: bool,
    /// Highest message id the client says it has seen.
    pub last_known_id: MessageId,
}

impl Session {
    /// A brand-new session with a random id.
    pub fn fresh(last_known_id: MessageId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recovered: false,
            last_known_id,
        }
    }

    /// A session the transport picked back up under its old id.
    pub fn resumed(id: SessionId, last_known_id: MessageId) -> Self {
        Self {
            id,
            recovered: true,
            last_known_id,
        }
    }
}

/// What a client states when it opens a connection, carried in the
/// WebSocket URL query (`?offset=12&session_id=...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: Option<SessionId>,
    pub offset: MessageId,
}

impl Handshake {
    /// Parse a request query string. Unknown keys are ignored and a missing
    /// or malformed offset counts as 0.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut handshake = Self::default();
        let Some(query) = query else {
            return handshake;
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                SESSION_ID_PARAM if !value.is_empty() => {
                    handshake.session_id = Some(value.into_owned());
                }
                OFFSET_PARAM => handshake.offset = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        handshake
    }

    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair(OFFSET_PARAM, &self.offset.to_string());
        if let Some(id) = &self.session_id {
            query.append_pair(SESSION_ID_PARAM, id);
        }
        query.finish()
    }
}
