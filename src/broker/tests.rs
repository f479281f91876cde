use super::recovery::{self, RecoveryPlan};
use super::{Delivery, Event, Relay, SessionRegistry, SubmitOutcome};
use crate::config::RelaySettings;
use crate::persistence::MessageStore;
use crate::session::{Handshake, Session};

use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{Duration, Instant};

fn delivery(id: u64) -> Delivery {
    Delivery {
        content: format!("msg{id}"),
        id,
        sender_name: "alice".to_string(),
    }
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn delivered_ids(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Delivered(d) => Some(d.id),
            _ => None,
        })
        .collect()
}

fn test_relay() -> Relay {
    Relay::new(MessageStore::temporary().unwrap(), &RelaySettings::default())
}

fn registry() -> SessionRegistry {
    SessionRegistry::new(Duration::from_secs(120), 100)
}

#[test]
fn test_registry_broadcast_reaches_live_sessions() {
    let mut reg = registry();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    reg.begin_replay("a".to_string(), tx_a);
    reg.begin_replay("b".to_string(), tx_b);
    assert!(reg.go_live(&"a".to_string(), 0));
    assert!(reg.go_live(&"b".to_string(), 0));

    assert_eq!(reg.broadcast(&delivery(1)), 2);
    assert_eq!(delivered_ids(&drain(&mut rx_a)), vec![1]);
    assert_eq!(delivered_ids(&drain(&mut rx_b)), vec![1]);
}

#[test]
fn test_registry_closed_channel_does_not_block_others() {
    let mut reg = registry();
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    reg.begin_replay("a".to_string(), tx_a);
    reg.begin_replay("b".to_string(), tx_b);
    reg.go_live(&"a".to_string(), 0);
    reg.go_live(&"b".to_string(), 0);
    drop(rx_a);

    assert_eq!(reg.broadcast(&delivery(1)), 1);
    assert_eq!(delivered_ids(&drain(&mut rx_b)), vec![1]);
}

#[test]
fn test_registry_parks_broadcasts_during_replay() {
    let mut reg = registry();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = "s".to_string();
    reg.begin_replay(id.clone(), tx.clone());

    // replay delivered up to 5; 5 was also broadcast meanwhile
    tx.send(Event::Delivered(delivery(4))).unwrap();
    tx.send(Event::Delivered(delivery(5))).unwrap();
    reg.broadcast(&delivery(5));
    reg.broadcast(&delivery(6));
    assert!(!reg.is_live(&id));

    assert!(reg.go_live(&id, 5));
    assert!(reg.is_live(&id));
    reg.broadcast(&delivery(7));

    assert_eq!(delivered_ids(&drain(&mut rx)), vec![4, 5, 6, 7]);
}

#[test]
fn test_registry_go_live_unknown_session() {
    let mut reg = registry();
    assert!(!reg.go_live(&"missing".to_string(), 0));
    assert!(reg.is_empty());
}

#[test]
fn test_registry_detach_and_resume_flushes_backlog() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);
    drop(rx);

    reg.detach(&id);
    assert!(reg.is_detached(&id));
    assert_eq!(reg.broadcast(&delivery(1)), 0);
    reg.broadcast(&delivery(2));

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(reg.resume(&id, 0, tx));
    assert!(reg.is_live(&id));
    reg.broadcast(&delivery(3));

    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1, 2, 3]);
}

#[test]
fn test_registry_resume_refused_when_client_missed_deliveries() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);
    reg.broadcast(&delivery(1));
    reg.broadcast(&delivery(2));
    // the connection died with 1 and 2 still queued
    drop(rx);
    reg.detach(&id);

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(!reg.resume(&id, 1, tx));
    assert!(reg.is_empty(), "a slot that lost deliveries is dropped");
}

#[test]
fn test_registry_resume_skips_what_the_client_has() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 3);
    reg.detach(&id);
    reg.broadcast(&delivery(4));
    reg.broadcast(&delivery(5));

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(reg.resume(&id, 4, tx));
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![5]);
}

#[test]
fn test_registry_broadcast_skips_already_sent() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 2);

    assert_eq!(reg.broadcast(&delivery(2)), 0);
    assert_eq!(reg.broadcast(&delivery(3)), 1);
    assert_eq!(reg.broadcast(&delivery(3)), 0);
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![3]);
}

#[test]
fn test_registry_resume_requires_detached_session() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(!reg.resume(&id, 0, tx.clone()));

    reg.begin_replay(id.clone(), tx.clone());
    reg.go_live(&id, 0);
    let (other_tx, _other_rx) = mpsc::unbounded_channel();
    assert!(!reg.resume(&id, 0, other_tx));
    assert!(reg.is_live(&id), "a live session must not be taken over");
}

#[test]
fn test_registry_detach_during_replay_forgets_session() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);

    reg.detach(&id);
    assert!(reg.is_empty());
}

#[test]
fn test_registry_zero_window_is_not_resumable() {
    let mut reg = SessionRegistry::new(Duration::ZERO, 100);
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);

    reg.detach(&id);
    assert!(reg.is_empty());
}

#[test]
fn test_registry_backlog_overflow_drops_detached_session() {
    let mut reg = SessionRegistry::new(Duration::from_secs(120), 2);
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);
    reg.detach(&id);

    reg.broadcast(&delivery(1));
    reg.broadcast(&delivery(2));
    assert!(reg.is_detached(&id));
    reg.broadcast(&delivery(3));
    assert!(!reg.is_detached(&id));

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(!reg.resume(&id, 0, tx));
}

#[tokio::test(start_paused = true)]
async fn test_registry_resume_after_window_fails() {
    let mut reg = SessionRegistry::new(Duration::from_secs(10), 100);
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);
    reg.detach(&id);

    tokio::time::advance(Duration::from_secs(11)).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(!reg.resume(&id, 0, tx));
    assert_eq!(reg.sweep_expired(Instant::now()), 1);
    assert!(reg.is_empty());
}

#[test]
fn test_registry_sweep_keeps_sessions_within_window() {
    let mut reg = registry();
    let id = "s".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    reg.begin_replay(id.clone(), tx);
    reg.go_live(&id, 0);
    reg.detach(&id);

    assert_eq!(reg.sweep_expired(Instant::now()), 0);
    assert_eq!(
        reg.sweep_expired(Instant::now() + Duration::from_secs(121)),
        1
    );
}

#[test]
fn test_recovery_plan() {
    assert_eq!(
        RecoveryPlan::for_session(&Session::fresh(4)),
        RecoveryPlan::Replay { after: 4 }
    );
    assert_eq!(
        RecoveryPlan::for_session(&Session::resumed("s".to_string(), 4)),
        RecoveryPlan::Live
    );
}

#[tokio::test]
async fn test_replay_streams_tail_in_order() {
    let store = MessageStore::temporary().unwrap();
    for i in 1..=3 {
        store.append("alice", &format!("m{i}"), &format!("t{i}")).unwrap();
    }
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = recovery::replay(store, 1, tx).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.watermark, 3);
    assert!(report.complete);

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            Event::Delivered(Delivery {
                content: "m2".to_string(),
                id: 2,
                sender_name: "alice".to_string(),
            }),
            Event::Delivered(Delivery {
                content: "m3".to_string(),
                id: 3,
                sender_name: "alice".to_string(),
            }),
        ]
    );
}

#[tokio::test]
async fn test_replay_stops_when_session_closes() {
    let store = MessageStore::temporary().unwrap();
    store.append("alice", "m1", "t1").unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);

    let report = recovery::replay(store, 0, tx).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.watermark, 0);
    assert!(!report.complete);
}

#[tokio::test]
async fn test_submit_dedups_and_does_not_rebroadcast() {
    let relay = test_relay();
    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx).await;

    assert_eq!(
        relay.submit("alice", "hi", "t1").await.unwrap(),
        SubmitOutcome::Stored(1)
    );
    assert_eq!(
        relay.submit("bob", "yo", "t2").await.unwrap(),
        SubmitOutcome::Stored(2)
    );
    assert_eq!(
        relay.submit("alice", "hi", "t1").await.unwrap(),
        SubmitOutcome::AlreadyStored
    );

    assert_eq!(relay.store().len(), 2);
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1, 2]);
}

#[tokio::test]
async fn test_submitter_receives_its_own_message() {
    let relay = test_relay();
    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx).await;

    relay.submit("alice", "hello", "t1").await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![Event::Delivered(Delivery {
            content: "hello".to_string(),
            id: 1,
            sender_name: "alice".to_string(),
        })]
    );
}

#[tokio::test]
async fn test_connect_replays_gap_then_goes_live() {
    let relay = test_relay();
    for (name, text, token) in [("alice", "a", "t1"), ("bob", "b", "t2"), ("carol", "c", "t3")] {
        relay.submit(name, text, token).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handshake = Handshake {
        session_id: None,
        offset: 1,
    };
    let session = relay.connect(&handshake, tx).await;
    assert!(!session.recovered);
    assert_eq!(session.last_known_id, 1);
    assert!(relay.sessions().is_live(&session.id));

    relay.submit("dave", "d", "t4").await.unwrap();
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![2, 3, 4]);
}

#[tokio::test]
async fn test_resumed_session_gets_no_replay() {
    let relay = test_relay();
    relay.submit("alice", "before", "t1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = relay.connect(&Handshake::default(), tx).await;
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1]);

    relay.disconnect(&first.id);
    relay.submit("bob", "while away", "t2").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handshake = Handshake {
        session_id: Some(first.id.clone()),
        offset: 1,
    };
    let second = relay.connect(&handshake, tx).await;
    assert!(second.recovered);
    assert_eq!(second.id, first.id);

    relay.submit("carol", "after", "t3").await.unwrap();
    // only what the transport buffered plus live traffic, never message 1 again
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![2, 3]);
}

#[tokio::test]
async fn test_resume_after_lost_delivery_replays_instead() {
    let relay = test_relay();
    let (tx, rx) = mpsc::unbounded_channel();
    let first = relay.connect(&Handshake::default(), tx).await;

    relay.submit("alice", "in flight", "t1").await.unwrap();
    // never read by the client before the connection went away
    drop(rx);
    relay.disconnect(&first.id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handshake = Handshake {
        session_id: Some(first.id.clone()),
        offset: 0,
    };
    let second = relay.connect(&handshake, tx).await;

    assert!(!second.recovered);
    assert_ne!(second.id, first.id);
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1]);
    assert!(!relay.sessions().is_detached(&first.id));
}

#[tokio::test]
async fn test_committed_but_unbroadcast_message_goes_out_on_retry() {
    let relay = test_relay();
    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx).await;
    relay.submit("alice", "first", "t1").await.unwrap();

    // committed, but the append reported a failure so nothing was broadcast
    relay.store().append("bob", "orphan", "t2").unwrap();
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1]);

    assert_eq!(
        relay.submit("bob", "orphan", "t2").await.unwrap(),
        SubmitOutcome::AlreadyStored
    );
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![2]);

    relay.submit("carol", "next", "t3").await.unwrap();
    relay.submit("bob", "orphan", "t2").await.unwrap();
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![3]);
}

#[tokio::test]
async fn test_unbroadcast_message_goes_out_before_newer_ones() {
    let relay = test_relay();
    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx).await;
    relay.submit("alice", "first", "t1").await.unwrap();
    relay.store().append("bob", "orphan", "t2").unwrap();

    assert_eq!(
        relay.submit("carol", "next", "t3").await.unwrap(),
        SubmitOutcome::Stored(3)
    );
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unknown_session_id_falls_back_to_replay() {
    let relay = test_relay();
    relay.submit("alice", "a", "t1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handshake = Handshake {
        session_id: Some("no-such-session".to_string()),
        offset: 0,
    };
    let session = relay.connect(&handshake, tx).await;

    assert!(!session.recovered);
    assert_ne!(session.id, "no-such-session");
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1]);
}

#[tokio::test]
async fn test_disconnect_during_replay_leaves_no_session() {
    let relay = test_relay();
    relay.submit("alice", "a", "t1").await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let session = relay.connect(&Handshake::default(), tx).await;

    assert!(!relay.sessions().is_live(&session.id));
    assert!(relay.sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_reach_everyone_once() {
    let relay = Arc::new(test_relay());
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let (tx_c, mut rx_c) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx_a).await;
    relay.connect(&Handshake::default(), tx_b).await;
    relay.connect(&Handshake::default(), tx_c).await;

    let a = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.submit("alice", "from a", "t3").await })
    };
    let b = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.submit("bob", "from b", "t4").await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    let (SubmitOutcome::Stored(id_a), SubmitOutcome::Stored(id_b)) = (a, b) else {
        panic!("both submissions should be stored, got {a:?} and {b:?}");
    };
    assert_ne!(id_a, id_b);

    for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
        assert_eq!(delivered_ids(&drain(rx)), vec![1, 2]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_broadcast_once() {
    let relay = Arc::new(test_relay());
    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.connect(&Handshake::default(), tx).await;

    let attempts: Vec<_> = (0..6)
        .map(|_| {
            let relay = relay.clone();
            tokio::spawn(async move { relay.submit("alice", "once", "retry-token").await })
        })
        .collect();
    let outcomes: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let stored = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Stored(_)))
        .count();
    assert_eq!(stored, 1);
    assert_eq!(relay.store().len(), 1);
    assert_eq!(delivered_ids(&drain(&mut rx)), vec![1]);
}
