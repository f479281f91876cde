//! Message log backed by `sled`
//!
//! Three trees make up the log:
//! - `messages`: big-endian id -> JSON row, so iteration is id order
//! - `tokens`: client token -> id, the uniqueness index used for dedup
//! - `meta`: the last assigned id
//!
//! An append touches all three inside one serializable transaction. The
//! token probe and the insert therefore commit or conflict together, and of
//! several concurrent appends carrying the same token exactly one wins.

use std::ops::Bound;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, Transactional, abort};
use sled::{Db, Tree};
use tracing::debug;

use crate::broker::message::{Message, MessageId};
use crate::utils::error::StoreError;

const MESSAGES_TREE: &str = "messages";
const TOKENS_TREE: &str = "tokens";
const META_TREE: &str = "meta";
const LAST_ID_KEY: &[u8] = b"last_id";

/// On-disk row. The id lives in the key.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredMessage {
    client_token: String,
    content: String,
    sender_name: String,
}

#[derive(Clone)]
pub struct MessageStore {
    db: Db,
    messages: Tree,
    tokens: Tree,
    meta: Tree,
    flush_on_append: bool,
}

impl MessageStore {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>, flush_on_append: bool) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, flush_on_append)
    }

    /// A throwaway store that is removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    fn from_db(db: Db, flush_on_append: bool) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree(MESSAGES_TREE)?,
            tokens: db.open_tree(TOKENS_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
            flush_on_append,
        })
    }

    /// Append a message, assigning it the next id.
    ///
    /// Fails with `DuplicateSubmission` if `client_token` is already stored;
    /// nothing is written in that case.
    pub fn append(
        &self,
        sender_name: &str,
        content: &str,
        client_token: &str,
    ) -> Result<MessageId, StoreError> {
        let row = serde_json::to_vec(&StoredMessage {
            client_token: client_token.to_string(),
            content: content.to_string(),
            sender_name: sender_name.to_string(),
        })?;

        let id = (&self.messages, &self.tokens, &self.meta).transaction(
            |(messages, tokens, meta)| {
                if tokens.get(client_token.as_bytes())?.is_some() {
                    return abort(StoreError::DuplicateSubmission(client_token.to_string()));
                }

                let last = match meta.get(LAST_ID_KEY)? {
                    Some(raw) => decode_id(&raw).ok_or_else(|| {
                        ConflictableTransactionError::Abort(StoreError::StoreUnavailable(
                            "corrupt last_id".to_string(),
                        ))
                    })?,
                    None => 0,
                };
                let id = last + 1;
                let key = id.to_be_bytes();

                messages.insert(&key[..], row.as_slice())?;
                tokens.insert(client_token.as_bytes(), &key[..])?;
                meta.insert(LAST_ID_KEY, &key[..])?;
                Ok(id)
            },
        )?;

        if self.flush_on_append {
            self.db.flush()?;
        }

        debug!(id, client_token, "appended message");
        Ok(id)
    }

    /// All messages with `id > after_id`, ascending.
    ///
    /// The cursor stops at the last id committed when this call was made, so
    /// concurrent appends never extend it. Iterating it again requires a new
    /// call.
    pub fn read_from(&self, after_id: MessageId) -> Result<LogCursor, StoreError> {
        let upper = self.last_id()?;
        let inner = if upper > after_id {
            Some(self.messages.range((
                Bound::Excluded(after_id.to_be_bytes()),
                Bound::Included(upper.to_be_bytes()),
            )))
        } else {
            None
        };
        Ok(LogCursor { inner })
    }

    /// Highest id assigned so far, 0 for an empty log.
    pub fn last_id(&self) -> Result<MessageId, StoreError> {
        match self.meta.get(LAST_ID_KEY)? {
            Some(raw) => decode_id(&raw)
                .ok_or_else(|| StoreError::StoreUnavailable("corrupt last_id".to_string())),
            None => Ok(0),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Lazy, finite, ordered view over part of the log.
pub struct LogCursor {
    inner: Option<sled::Iter>,
}

impl Iterator for LogCursor {
    type Item = Result<Message, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.as_mut()?.next()?;
        Some(entry.map_err(StoreError::from).and_then(|(key, value)| {
            let id = decode_id(&key)
                .ok_or_else(|| StoreError::StoreUnavailable("corrupt message key".to_string()))?;
            let row: StoredMessage = serde_json::from_slice(&value)?;
            Ok(Message {
                id,
                client_token: row.client_token,
                content: row.content,
                sender_name: row.sender_name,
            })
        }))
    }
}

fn decode_id(raw: &[u8]) -> Option<MessageId> {
    raw.try_into().ok().map(MessageId::from_be_bytes)
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("db", &"sled::Db")
            .field("flush_on_append", &self.flush_on_append)
            .finish()
    }
}
