//! Session registry
//!
//! The registry is the fan-out target for broadcasts: one slot per session,
//! holding that session's outbound channel. A slot is in one of three states:
//!
//! - `Replaying`: the session is being brought up to date from the store.
//!   Broadcasts are parked in a backlog until the replay finishes.
//! - `Live`: broadcasts go straight to the session's channel.
//! - `Detached`: the connection dropped. Broadcasts keep accumulating for the
//!   recovery window so a reconnect under the same id can pick them up
//!   without replay.
//!
//! Live and detached slots remember `sent_through`, the highest id handed to
//! the session's channel. Nothing at or below it is sent again, and a resume
//! is only accepted from a client that has seen everything up to it.
//!
//! Callers must synchronize access (the relay keeps it behind a mutex).

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::broker::message::{Delivery, Event, MessageId};
use crate::session::SessionId;

pub type EventSender = UnboundedSender<Event>;

#[derive(Debug)]
enum Slot {
    Replaying {
        sender: EventSender,
        backlog: Vec<Delivery>,
    },
    Live {
        sender: EventSender,
        sent_through: MessageId,
    },
    Detached {
        backlog: Vec<Delivery>,
        expires_at: Instant,
        sent_through: MessageId,
    },
}

#[derive(Debug)]
pub struct SessionRegistry {
    slots: HashMap<SessionId, Slot>,
    recovery_window: Duration,
    max_backlog: usize,
}

impl SessionRegistry {
    pub fn new(recovery_window: Duration, max_backlog: usize) -> Self {
        Self {
            slots: HashMap::new(),
            recovery_window,
            max_backlog,
        }
    }

    /// Register a session that is about to be replayed.
    pub fn begin_replay(&mut self, id: SessionId, sender: EventSender) {
        self.slots.insert(
            id,
            Slot::Replaying {
                sender,
                backlog: Vec::new(),
            },
        );
    }

    /// Finish a replay: deliver parked broadcasts newer than `watermark` and
    /// switch the slot to live. Returns false if the session is gone.
    pub fn go_live(&mut self, id: &SessionId, watermark: MessageId) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };

        match slot {
            Slot::Replaying { sender, backlog } => {
                if sender.is_closed() {
                    debug!(session_id = %id, "session closed before going live");
                    return false;
                }
                let mut sent_through = watermark;
                for delivery in backlog.into_iter().filter(|d| d.id > watermark) {
                    let delivered_id = delivery.id;
                    if sender.send(Event::Delivered(delivery)).is_err() {
                        debug!(session_id = %id, "session closed while going live");
                        return false;
                    }
                    sent_through = sent_through.max(delivered_id);
                }
                self.slots.insert(
                    id.clone(),
                    Slot::Live {
                        sender,
                        sent_through,
                    },
                );
                true
            }
            other => {
                // already live or detached; leave it as it was
                self.slots.insert(id.clone(), other);
                false
            }
        }
    }

    /// Reattach a detached session to a new channel, flushing what it missed.
    ///
    /// `last_seen` is the highest id the client reports having received. If
    /// it is behind what was handed to the old connection, some of those
    /// deliveries were lost in flight: the slot is dropped and false is
    /// returned. False also covers ids that are unknown, expired, or not
    /// detached. The caller then starts a fresh session and replays.
    pub fn resume(&mut self, id: &SessionId, last_seen: MessageId, sender: EventSender) -> bool {
        let resumable = matches!(
            self.slots.get(id),
            Some(Slot::Detached { expires_at, .. }) if Instant::now() < *expires_at
        );
        if !resumable {
            debug!(session_id = %id, "session not resumable");
            return false;
        }
        let Some(Slot::Detached {
            backlog,
            sent_through,
            ..
        }) = self.slots.remove(id)
        else {
            return false;
        };

        if last_seen < sent_through {
            debug!(
                session_id = %id,
                last_seen,
                sent_through,
                "client missed deliveries, not resuming"
            );
            return false;
        }

        let mut sent_through = last_seen;
        for delivery in backlog.into_iter().filter(|d| d.id > last_seen) {
            let delivered_id = delivery.id;
            if sender.send(Event::Delivered(delivery)).is_err() {
                return false;
            }
            sent_through = delivered_id;
        }
        self.slots.insert(
            id.clone(),
            Slot::Live {
                sender,
                sent_through,
            },
        );
        true
    }

    /// Stop delivering to a session's channel.
    ///
    /// A live session is kept resumable for the recovery window. A session
    /// that never finished its replay is dropped outright.
    pub fn detach(&mut self, id: &SessionId) {
        let resumable_from = match self.slots.get(id) {
            Some(Slot::Live { sent_through, .. }) if !self.recovery_window.is_zero() => {
                Some(*sent_through)
            }
            Some(Slot::Live { .. }) | Some(Slot::Replaying { .. }) => None,
            Some(Slot::Detached { .. }) | None => return,
        };

        if let Some(sent_through) = resumable_from {
            let expires_at = Instant::now() + self.recovery_window;
            self.slots.insert(
                id.clone(),
                Slot::Detached {
                    backlog: Vec::new(),
                    expires_at,
                    sent_through,
                },
            );
        } else {
            self.slots.remove(id);
        }
    }

    /// Forget a session entirely.
    pub fn remove(&mut self, id: &SessionId) {
        self.slots.remove(id);
    }

    /// Fan a delivery out to every session. Returns how many live sessions it
    /// was handed to directly.
    ///
    /// A closed channel only affects its own session; the transport detaches
    /// it when its connection task ends. Sessions that already have the
    /// delivery, from replay or an earlier pass, are skipped.
    pub fn broadcast(&mut self, delivery: &Delivery) -> usize {
        let mut sent = 0;
        let mut overflowed = Vec::new();

        for (id, slot) in self.slots.iter_mut() {
            match slot {
                Slot::Live {
                    sender,
                    sent_through,
                } => {
                    if delivery.id <= *sent_through {
                        continue;
                    }
                    if sender.send(Event::Delivered(delivery.clone())).is_err() {
                        warn!(
                            session_id = %id,
                            message_id = delivery.id,
                            "failed to deliver to session"
                        );
                    } else {
                        *sent_through = delivery.id;
                        sent += 1;
                    }
                }
                Slot::Replaying { backlog, .. } => backlog.push(delivery.clone()),
                Slot::Detached {
                    backlog,
                    sent_through,
                    ..
                } => {
                    if delivery.id <= *sent_through {
                        continue;
                    }
                    if backlog.len() >= self.max_backlog {
                        overflowed.push(id.clone());
                    } else {
                        backlog.push(delivery.clone());
                    }
                }
            }
        }

        for id in overflowed {
            debug!(session_id = %id, "detached session backlog full, dropping it");
            self.slots.remove(&id);
        }
        sent
    }

    /// Drop detached sessions whose recovery window has passed.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Detached { expires_at, .. } => *expires_at > now,
            _ => true,
        });
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_live(&self, id: &SessionId) -> bool {
        matches!(self.slots.get(id), Some(Slot::Live { .. }))
    }

    pub fn is_detached(&self, id: &SessionId) -> bool {
        matches!(self.slots.get(id), Some(Slot::Detached { .. }))
    }
}
