//! Connection-time recovery
//!
//! Runs once per connection. A session the transport resumed goes live as
//! is. Any other session is sent every stored message after its
//! `last_known_id` before it sees live traffic. Read failures are logged and
//! the session goes live anyway, possibly with a gap.

use tracing::{debug, warn};

use crate::broker::message::{Event, MessageId};
use crate::broker::registry::EventSender;
use crate::persistence::MessageStore;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    Live,
    Replay { after: MessageId },
}

impl RecoveryPlan {
    pub fn for_session(session: &Session) -> Self {
        if session.recovered {
            RecoveryPlan::Live
        } else {
            RecoveryPlan::Replay {
                after: session.last_known_id,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    /// Id of the last message handed to the session, or the starting offset
    /// if none was.
    pub watermark: MessageId,
    /// False if the read failed or the session went away part way.
    pub complete: bool,
}

/// Stream messages after `after` into `sender`, in log order.
///
/// The read runs on the blocking pool so slow storage never stalls other
/// sessions.
pub async fn replay(store: MessageStore, after: MessageId, sender: EventSender) -> ReplayReport {
    match tokio::task::spawn_blocking(move || stream_missed(&store, after, &sender)).await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, after, "replay task failed");
            ReplayReport {
                delivered: 0,
                watermark: after,
                complete: false,
            }
        }
    }
}

fn stream_missed(store: &MessageStore, after: MessageId, sender: &EventSender) -> ReplayReport {
    let mut report = ReplayReport {
        delivered: 0,
        watermark: after,
        complete: true,
    };

    let cursor = match store.read_from(after) {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(error = %e, after, "replay failed, continuing live");
            report.complete = false;
            return report;
        }
    };

    for item in cursor {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, watermark = report.watermark, "replay interrupted, continuing live");
                report.complete = false;
                break;
            }
        };

        let id = msg.id;
        if sender.send(Event::Delivered(msg.into())).is_err() {
            debug!(watermark = report.watermark, "session closed during replay");
            report.complete = false;
            break;
        }
        report.delivered += 1;
        report.watermark = id;
    }

    report
}
