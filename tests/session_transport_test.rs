//! Session transport behaviour against an in-process backend.
//!
//! All tests run on paused tokio time, so backoff pauses and the idle watchdog elapse
//! instantly once every task is waiting.

use std::time::Duration;

use nrn_viewer::error::ViewerError;
use nrn_viewer::params::SimulationParams;
use nrn_viewer::protocol::{InboundMessage, MessageText, OutboundCommand};
use nrn_viewer::transport::backoff::RETRY_EXHAUSTED_MESSAGE;
use nrn_viewer::transport::{
    spawn_with_rng, ConnectionState, LifecycleEvent, MemoryConnector, SessionHandle,
    SessionOptions, Target, DISCONNECT_MESSAGE,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;
use url::Url;

fn options() -> SessionOptions {
    SessionOptions::new(Url::parse("ws://backend.test/ws").unwrap())
}

fn session(connector: &MemoryConnector, seed: u64) -> SessionHandle {
    let (handle, _inbound, _task) =
        spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(seed));
    handle
}

/// Collects lifecycle events until `stop` matches one (inclusive).
async fn events_until(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    stop: impl Fn(&LifecycleEvent) -> bool,
) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        let done = stop(&event);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

fn connecting_attempts(events: &[LifecycleEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::Connecting { attempt } => Some(*attempt),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_nineteen_failures_still_connect() {
    let connector = MemoryConnector::new();
    for i in 0..19 {
        connector.refuse(format!("refused {i}"));
    }
    let mut peer = connector.accept();
    let handle = session(&connector, 1);
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    let seen = events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;

    assert_eq!(connecting_attempts(&seen), (1..=20).collect::<Vec<_>>());
    assert!(!seen.iter().any(|e| matches!(e, LifecycleEvent::Error(_))));
    assert_eq!(connector.attempts(), 20);

    handle.send(OutboundCommand::GetUiData).await.unwrap();
    assert_eq!(peer.recv().await.unwrap().unwrap(), OutboundCommand::GetUiData);
}

#[tokio::test(start_paused = true)]
async fn test_twenty_failures_are_terminal() {
    let connector = MemoryConnector::new();
    let handle = session(&connector, 2);
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    let seen = events_until(&mut events, |e| matches!(e, LifecycleEvent::Error(_))).await;

    assert_eq!(connecting_attempts(&seen).len(), 20);
    match seen.last() {
        Some(LifecycleEvent::Error(notification)) => {
            assert_eq!(notification.msg, RETRY_EXHAUSTED_MESSAGE);
        }
        other => panic!("expected a terminal error, got {other:?}"),
    }
    assert!(matches!(
        handle.state(),
        ConnectionState::FatallyErrored { .. }
    ));

    // No retries after the cap, however long we wait.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(connector.attempts(), 20);
    assert!(events.try_recv().is_err());

    let err = handle.send(OutboundCommand::StopSimulation).await.unwrap_err();
    assert!(matches!(err, ViewerError::TransientNetworkFailure(_)));
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_halts_retries() {
    let connector = MemoryConnector::new();
    for _ in 0..3 {
        connector.refuse("pod starting");
    }
    let peer = connector.accept();
    let handle = session(&connector, 3);
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;
    assert_eq!(connector.attempts(), 4);

    peer.push(&InboundMessage::Error(MessageText::Text("busy".into())))
        .unwrap();
    let seen = events_until(&mut events, |e| matches!(e, LifecycleEvent::Error(_))).await;
    let errors: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::Error(n) => Some(n.msg.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["busy".to_string()]);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 4);
    assert!(events.try_recv().is_err());
    assert_eq!(
        handle.state(),
        ConnectionState::FatallyErrored {
            message: "busy".into()
        }
    );

    let err = handle.send(OutboundCommand::GetUiData).await.unwrap_err();
    assert!(matches!(err, ViewerError::BackendRejected(msg) if msg == "busy"));
}

#[tokio::test(start_paused = true)]
async fn test_send_after_disconnect_is_rejected() {
    let connector = MemoryConnector::new();
    let mut peer = connector.accept();
    let handle = session(&connector, 4);
    let mut state = handle.state_watch();
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    state.wait_for(ConnectionState::is_open).await.unwrap();

    handle.disconnect(false);
    state
        .wait_for(|s| matches!(s, ConnectionState::Closed))
        .await
        .unwrap();
    let seen = events_until(&mut events, |e| {
        matches!(e, LifecycleEvent::Disconnected(_))
    })
    .await;
    assert_eq!(seen.last(), Some(&LifecycleEvent::Disconnected(String::new())));

    let err = handle
        .send(OutboundCommand::StartSimulation(SimulationParams::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ViewerError::NotConnected));

    // The socket was closed without anything being written to it.
    assert!(peer.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_disconnects() {
    let connector = MemoryConnector::new();
    let mut peer = connector.accept();
    let handle = session(&connector, 5);
    let mut events = handle.subscribe();

    handle.connect(Target::Url("https://models.test/cell.zip".into()))
        .unwrap();
    events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;
    let opened = tokio::time::Instant::now();

    let seen = events_until(&mut events, |e| {
        matches!(e, LifecycleEvent::Disconnected(_))
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&LifecycleEvent::Disconnected(DISCONNECT_MESSAGE.to_string()))
    );
    assert!(opened.elapsed() >= Duration::from_millis(300_000));
    assert_eq!(handle.state(), ConnectionState::Closed);

    // Deliberate disconnect: no reconnect attempts follow.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(peer.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_traffic_resets_idle_timer() {
    let connector = MemoryConnector::new();
    let peer = connector.accept();
    let (handle, mut inbound, _task) =
        spawn_with_rng(connector.clone(), options(), StdRng::seed_from_u64(6));
    let mut state = handle.state_watch();

    handle.connect(Target::Model("model-42".into())).unwrap();
    state.wait_for(ConnectionState::is_open).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(200)).await;
        peer.push(&InboundMessage::Status(MessageText::Text("alive".into())))
            .unwrap();
        assert!(inbound.recv().await.is_some());
    }
    assert!(handle.state().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_connect_supersedes_pending_attempt() {
    let connector = MemoryConnector::new();
    connector.refuse("first target refused");
    let _peer = connector.accept();
    let handle = session(&connector, 7);
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-1".into())).unwrap();
    handle.connect(Target::Model("model-2".into())).unwrap();
    let seen = events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;

    // The first target's attempt never ran; the second cycle started over at attempt 1.
    assert_eq!(connecting_attempts(&seen), vec![1, 1, 2]);
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_reconnects() {
    let connector = MemoryConnector::new();
    let mut first = connector.accept();
    let mut second = connector.accept();
    let handle = session(&connector, 8);
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;

    first.close();
    let seen = events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await;
    assert_eq!(
        seen,
        vec![
            LifecycleEvent::Closed,
            LifecycleEvent::Connecting { attempt: 1 },
            LifecycleEvent::Open,
        ]
    );
    assert_eq!(connector.attempts(), 2);
    assert!(handle.state().is_open());

    handle.send(OutboundCommand::GetUiData).await.unwrap();
    assert_eq!(second.recv().await.unwrap().unwrap(), OutboundCommand::GetUiData);
    assert!(first.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_send_while_connecting_is_flushed_on_open() {
    let connector = MemoryConnector::new();
    connector.refuse("pod starting");
    let mut peer = connector.accept();
    let handle = session(&connector, 9);
    let mut state = handle.state_watch();
    let mut events = handle.subscribe();

    handle.connect(Target::Model("model-42".into())).unwrap();
    state
        .wait_for(|s| matches!(s, ConnectionState::Connecting { .. }))
        .await
        .unwrap();

    // The send only completes once the queue is flushed onto the new socket.
    let (sent, seen) = tokio::join!(handle.send(OutboundCommand::GetUiData), async {
        assert!(peer.try_recv().is_none());
        events_until(&mut events, |e| matches!(e, LifecycleEvent::Open)).await
    });
    sent.unwrap();
    assert_eq!(connecting_attempts(&seen), vec![1, 2]);
    assert_eq!(connector.attempts(), 2);

    assert_eq!(peer.recv().await.unwrap().unwrap(), OutboundCommand::GetUiData);
    assert!(peer.try_recv().is_none());
}
