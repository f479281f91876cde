//! Relay engine
//!
//! Ties the message store to the connected sessions:
//! - `submit` appends to the log and, on success, broadcasts the new message
//!   to every session, the submitter included
//! - `connect` runs the recovery step for a new connection and registers it
//! - `disconnect` detaches a session so it can be resumed for a while
//!
//! Concurrency notes:
//! - Submissions are serialized by `append_order` across the append and the
//!   broadcast pass, so message N is fanned out before N+1 is. The lock also
//!   holds the highest id broadcast so far. A row that was committed but not
//!   broadcast (the append reported a failure after its commit) is sent out
//!   by the next submission before anything newer.
//! - The registry sits behind a plain mutex that is never held across an
//!   await point. Store work runs on the blocking pool.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::message::{Delivery, MessageId, SubmitOutcome};
use crate::broker::recovery::{self, RecoveryPlan};
use crate::broker::registry::{EventSender, SessionRegistry};
use crate::config::RelaySettings;
use crate::persistence::MessageStore;
use crate::session::{Handshake, Session, SessionId};
use crate::utils::error::StoreError;

#[derive(Debug)]
pub struct Relay {
    store: MessageStore,
    sessions: Mutex<SessionRegistry>,
    /// Highest id broadcast so far; `None` until the first submission reads
    /// it from the store.
    append_order: tokio::sync::Mutex<Option<MessageId>>,
    sweep_interval: Duration,
}

impl Relay {
    pub fn new(store: MessageStore, settings: &RelaySettings) -> Self {
        Self {
            store,
            sessions: Mutex::new(SessionRegistry::new(
                Duration::from_secs(settings.recovery_window_secs),
                settings.max_backlog,
            )),
            append_order: tokio::sync::Mutex::new(None),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms.max(1)),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Lock the session registry. A poisoned lock is recovered since every
    /// registry operation leaves it consistent.
    pub fn sessions(&self) -> MutexGuard<'_, SessionRegistry> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a submission and broadcast it.
    ///
    /// A token that is already in the log yields `AlreadyStored` and nothing
    /// new is broadcast. `StoreUnavailable` is returned as an error; the
    /// caller must not acknowledge it. Whatever the store committed is
    /// broadcast either way.
    pub async fn submit(
        &self,
        sender_name: &str,
        content: &str,
        client_token: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let mut broadcast_through = self.append_order.lock().await;
        let through = match *broadcast_through {
            Some(through) => through,
            None => {
                let store = self.store.clone();
                let last = tokio::task::spawn_blocking(move || store.last_id())
                    .await
                    .map_err(|e| StoreError::StoreUnavailable(format!("read task failed: {e}")))??;
                *broadcast_through = Some(last);
                last
            }
        };

        let store = self.store.clone();
        let (name, text, token) = (
            sender_name.to_string(),
            content.to_string(),
            client_token.to_string(),
        );
        let appended = tokio::task::spawn_blocking(move || store.append(&name, &text, &token))
            .await
            .unwrap_or_else(|e| Err(StoreError::StoreUnavailable(format!("append task failed: {e}"))));

        let outcome = match appended {
            Ok(id) if id == through + 1 => {
                let delivered = self.sessions().broadcast(&Delivery {
                    content: content.to_string(),
                    id,
                    sender_name: sender_name.to_string(),
                });
                debug!(id, delivered, "broadcast message");
                *broadcast_through = Some(id);
                return Ok(SubmitOutcome::Stored(id));
            }
            Ok(id) => Ok(SubmitOutcome::Stored(id)),
            Err(StoreError::DuplicateSubmission(_)) => {
                debug!(client_token, "duplicate submission absorbed");
                Ok(SubmitOutcome::AlreadyStored)
            }
            Err(e) => {
                warn!(error = %e, client_token, "append failed, not acknowledging");
                Err(e)
            }
        };

        // the log may hold rows that never went out; send them in order
        *broadcast_through = Some(self.broadcast_committed(through).await);
        outcome
    }

    /// Broadcast every stored message after `through`. Returns the new
    /// high-water mark, which stays put if the store cannot be read.
    async fn broadcast_committed(&self, through: MessageId) -> MessageId {
        let store = self.store.clone();
        let pending = tokio::task::spawn_blocking(move || {
            store.read_from(through)?.collect::<Result<Vec<_>, StoreError>>()
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::StoreUnavailable(format!("read task failed: {e}"))));

        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, through, "could not read committed messages to broadcast");
                return through;
            }
        };

        let mut through = through;
        let mut sessions = self.sessions();
        for msg in pending {
            let id = msg.id;
            let delivered = sessions.broadcast(&Delivery::from(msg));
            debug!(id, delivered, "broadcast committed message");
            through = id;
        }
        through
    }

    /// Bring a new connection in sync and register it for broadcasts.
    ///
    /// A known, still-resumable `session_id` is reattached without replay.
    /// Anything else becomes a fresh session replayed from `offset`. The
    /// session is live when this returns.
    pub async fn connect(&self, handshake: &Handshake, sender: EventSender) -> Session {
        let resumed = match &handshake.session_id {
            Some(id) => {
                let mut sessions = self.sessions();
                sessions
                    .resume(id, handshake.offset, sender.clone())
                    .then(|| id.clone())
            }
            None => None,
        };
        let session = match resumed {
            Some(id) => Session::resumed(id, handshake.offset),
            None => Session::fresh(handshake.offset),
        };

        match RecoveryPlan::for_session(&session) {
            RecoveryPlan::Live => {
                info!(session_id = %session.id, "session resumed without replay");
            }
            RecoveryPlan::Replay { after } => {
                // registered before the read starts so nothing broadcast
                // in between is lost
                self.sessions()
                    .begin_replay(session.id.clone(), sender.clone());
                let report = recovery::replay(self.store.clone(), after, sender).await;
                self.sessions().go_live(&session.id, report.watermark);
                info!(
                    session_id = %session.id,
                    after,
                    replayed = report.delivered,
                    complete = report.complete,
                    "session connected"
                );
            }
        }

        session
    }

    /// The connection for `session_id` is gone.
    pub fn disconnect(&self, session_id: &SessionId) {
        self.sessions().detach(session_id);
        debug!(session_id = %session_id, "session detached");
    }

    /// Periodically drop detached sessions that can no longer be resumed.
    pub async fn start_expiry_loop(relay: Arc<Relay>) {
        let mut ticker = tokio::time::interval(relay.sweep_interval);
        loop {
            ticker.tick().await;
            let expired = relay.sessions().sweep_expired(Instant::now());
            if expired > 0 {
                debug!(expired, "dropped expired sessions");
            }
        }
    }
}
