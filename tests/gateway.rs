//! End-to-end tests against a scripted in-process gateway server.

use futures_util::{Sink, SinkExt, StreamExt};
use gateway_shard_manager::{
    DestroyOptions, ErrorKind, FetchMetadata, GatewayMetadata, Manager, ManagerConfig,
    OutboundPayload, Placement, SessionCallbacks, SessionInfo, SessionStartLimit, ShardEvent,
    ShardStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug)]
enum ServerEvent {
    Identify {
        shard_id: u64,
        shard_count: u64,
        at: Instant,
    },
    Resume {
        session_id: String,
        seq: u64,
    },
}

#[derive(Debug, Clone)]
enum ServerCommand {
    /// Release the READY dispatch on a connection holding it back
    Ready,
    /// Push a dispatch frame to every connection
    Dispatch(String, Value),
}

struct MockGateway {
    url: String,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    control: broadcast::Sender<ServerCommand>,
}

async fn start_gateway(hold_ready: bool) -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (control, _) = broadcast::channel(32);

    let accept_control = control.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let events_tx = events_tx.clone();
            let control_rx = accept_control.subscribe();
            tokio::spawn(serve_connection(stream, events_tx, control_rx, hold_ready));
        }
    });

    MockGateway {
        url: format!("ws://{addr}"),
        events,
        control,
    }
}

async fn serve_connection(
    stream: TcpStream,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    mut control_rx: broadcast::Receiver<ServerCommand>,
    hold_ready: bool,
) {
    let ws = accept_async(stream).await.unwrap();
    let (mut sink, mut source) = ws.split();

    sink.send(Message::Text(
        json!({"op": 10, "d": {"heartbeat_interval": 45_000}}).to_string(),
    ))
    .await
    .unwrap();

    let mut shard_id: u64 = 0;
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            message = source.next() => {
                let Some(Ok(message)) = message else { break };
                match message {
                    Message::Text(text) => {
                        let payload: Value = serde_json::from_str(&text).unwrap();
                        match payload["op"].as_u64().unwrap() {
                            1 => {
                                sink.send(Message::Text(json!({"op": 11, "d": null}).to_string()))
                                    .await
                                    .unwrap();
                            }
                            2 => {
                                shard_id = payload["d"]["shard"][0].as_u64().unwrap();
                                let shard_count = payload["d"]["shard"][1].as_u64().unwrap();
                                let _ = events_tx.send(ServerEvent::Identify {
                                    shard_id,
                                    shard_count,
                                    at: Instant::now(),
                                });
                                if !hold_ready {
                                    sequence += 1;
                                    send_ready(&mut sink, shard_id, sequence).await;
                                }
                            }
                            6 => {
                                let _ = events_tx.send(ServerEvent::Resume {
                                    session_id: payload["d"]["session_id"]
                                        .as_str()
                                        .unwrap()
                                        .to_string(),
                                    seq: payload["d"]["seq"].as_u64().unwrap(),
                                });
                                sequence = payload["d"]["seq"].as_u64().unwrap() + 1;
                                sink.send(Message::Text(
                                    json!({"op": 0, "t": "RESUMED", "s": sequence, "d": {}})
                                        .to_string(),
                                ))
                                .await
                                .unwrap();
                            }
                            _ => {}
                        }
                    }
                    Message::Ping(data) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    _ => {}
                }
            }
            command = control_rx.recv() => {
                match command {
                    Ok(ServerCommand::Ready) => {
                        sequence += 1;
                        send_ready(&mut sink, shard_id, sequence).await;
                    }
                    Ok(ServerCommand::Dispatch(event, data)) => {
                        sequence += 1;
                        let frame = json!({"op": 0, "t": event, "s": sequence, "d": data});
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn send_ready(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    shard_id: u64,
    sequence: u64,
) {
    let frame = json!({
        "op": 0,
        "t": "READY",
        "s": sequence,
        "d": {"session_id": format!("sess-{shard_id}")},
    });
    let _ = sink.send(Message::Text(frame.to_string())).await;
}

fn metadata_fetch(url: &str, shards: u16, max_concurrency: u16) -> FetchMetadata {
    let url = url.to_string();
    Arc::new(move || {
        let url = url.clone();
        Box::pin(async move {
            Ok(GatewayMetadata {
                url,
                shards,
                session_start_limit: SessionStartLimit {
                    total: 1000,
                    remaining: 1000,
                    reset_after: 60_000,
                    max_concurrency,
                },
            })
        })
    })
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<(u16, ShardEvent)>,
    mut predicate: impl FnMut(&(u16, ShardEvent)) -> bool,
) -> (u16, ShardEvent) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_server_event(gateway: &mut MockGateway) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(10), gateway.events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server event stream ended")
}

#[tokio::test]
async fn in_process_handshake_dispatch_and_destroy() {
    let mut gateway = start_gateway(false).await;
    let session = SessionCallbacks::in_memory();
    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 1, 1))
        .intents(513)
        .session(session.clone())
        .identify_cooldown(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Manager::new(config);
    let mut events = manager.events().unwrap();

    manager.connect().await.unwrap();

    let (shard_id, _) = next_event(&mut events, |(_, e)| matches!(e, ShardEvent::Ready { .. })).await;
    assert_eq!(shard_id, 0);

    match next_server_event(&mut gateway).await {
        ServerEvent::Identify {
            shard_id,
            shard_count,
            ..
        } => {
            assert_eq!(shard_id, 0);
            assert_eq!(shard_count, 1);
        }
        other => panic!("expected identify, got {other:?}"),
    }

    // The session is persisted through the host callbacks
    let stored = (session.retrieve)(0).await.expect("session stored");
    assert_eq!(stored.session_id, "sess-0");
    assert_eq!(stored.shard_count, 1);

    // Dispatches flow upward as opaque events
    gateway
        .control
        .send(ServerCommand::Dispatch(
            "MESSAGE_CREATE".into(),
            json!({"id": "42"}),
        ))
        .unwrap();
    let (_, event) = next_event(&mut events, |(_, e)| {
        matches!(e, ShardEvent::Dispatch { event, .. } if event == "MESSAGE_CREATE")
    })
    .await;
    match event {
        ShardEvent::Dispatch { data, .. } => assert_eq!(data["id"], "42"),
        _ => unreachable!(),
    }

    // destroy(preserve_session: false) clears the stored session
    manager
        .destroy(DestroyOptions {
            preserve_session: false,
        })
        .await
        .unwrap();
    assert_eq!((session.retrieve)(0).await, None);
}

#[tokio::test]
async fn send_before_ready_rejects_non_allowlisted() {
    let mut gateway = start_gateway(true).await;
    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 1, 1))
        .identify_cooldown(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Arc::new(Manager::new(config));
    let mut events = manager.events().unwrap();

    let connect_manager = manager.clone();
    let connect = tokio::spawn(async move { connect_manager.connect().await });

    // Identify arrived at the server, READY withheld: the shard is not
    // Ready yet
    match next_server_event(&mut gateway).await {
        ServerEvent::Identify { .. } => {}
        other => panic!("expected identify, got {other:?}"),
    }

    // A non-allow-listed opcode is rejected outright
    let error = manager
        .send(0, OutboundPayload { op: 14, d: json!({}) })
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotReady);

    // An allow-listed opcode (heartbeat) goes through
    manager.send(0, OutboundPayload::heartbeat(None)).await.unwrap();

    gateway.control.send(ServerCommand::Ready).unwrap();
    connect.await.unwrap().unwrap();

    next_event(&mut events, |(_, e)| matches!(e, ShardEvent::Ready { .. })).await;

    // Ready now: the same opcode is accepted
    manager
        .send(0, OutboundPayload { op: 14, d: json!({}) })
        .await
        .unwrap();

    manager.destroy(DestroyOptions::default()).await.unwrap();
}

#[tokio::test]
async fn worker_placement_behaves_like_in_process() {
    let mut gateway = start_gateway(false).await;
    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 2, 2))
        .placement(Placement::Workers {
            shards_per_worker: Some(1),
        })
        .identify_cooldown(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Manager::new(config);
    let mut events = manager.events().unwrap();

    manager.connect().await.unwrap();

    // Both shards reach Ready, events re-emitted with the shard id attached
    let mut ready = std::collections::HashSet::new();
    while ready.len() < 2 {
        let (shard_id, _) =
            next_event(&mut events, |(_, e)| matches!(e, ShardEvent::Ready { .. })).await;
        ready.insert(shard_id);
    }
    assert_eq!(ready, [0u16, 1u16].into_iter().collect());

    // The identify pair covered exactly the requested ids
    let mut identified = std::collections::HashSet::new();
    for _ in 0..2 {
        match next_server_event(&mut gateway).await {
            ServerEvent::Identify {
                shard_id,
                shard_count,
                ..
            } => {
                assert_eq!(shard_count, 2);
                identified.insert(shard_id);
            }
            other => panic!("expected identify, got {other:?}"),
        }
    }
    assert_eq!(identified, [0u64, 1u64].into_iter().collect());

    // Status crosses the worker boundary via nonce-correlated envelopes
    let statuses = manager.fetch_status().await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.values().all(|s| *s == ShardStatus::Ready));

    // Sends route to the owning worker
    manager
        .send(1, OutboundPayload::heartbeat(Some(1)))
        .await
        .unwrap();

    // Dispatches from worker shards still reach the host
    gateway
        .control
        .send(ServerCommand::Dispatch("GUILD_CREATE".into(), json!({})))
        .unwrap();
    next_event(&mut events, |(_, e)| {
        matches!(e, ShardEvent::Dispatch { event, .. } if event == "GUILD_CREATE")
    })
    .await;

    manager.destroy(DestroyOptions::default()).await.unwrap();
}

#[tokio::test]
async fn resume_is_chosen_iff_shard_count_matches() {
    // Matching shard count: the client resumes
    let mut gateway = start_gateway(false).await;
    let session = SessionCallbacks::in_memory();
    (session.update)(
        0,
        Some(SessionInfo {
            session_id: "sess-old".into(),
            sequence: 42,
            shard_id: 0,
            shard_count: 1,
            resume_url: None,
        }),
    )
    .await;

    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 1, 1))
        .session(session.clone())
        .identify_cooldown(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Manager::new(config);
    let mut events = manager.events().unwrap();
    manager.connect().await.unwrap();

    match next_server_event(&mut gateway).await {
        ServerEvent::Resume { session_id, seq } => {
            assert_eq!(session_id, "sess-old");
            assert_eq!(seq, 42);
        }
        other => panic!("expected resume, got {other:?}"),
    }
    next_event(&mut events, |(_, e)| matches!(e, ShardEvent::Resumed { .. })).await;
    manager.destroy(DestroyOptions::default()).await.unwrap();

    // Stored count 4, reconfigured to 1 shard: identify, never resume
    let mut gateway = start_gateway(false).await;
    let session = SessionCallbacks::in_memory();
    (session.update)(
        0,
        Some(SessionInfo {
            session_id: "sess-stale".into(),
            sequence: 42,
            shard_id: 0,
            shard_count: 4,
            resume_url: None,
        }),
    )
    .await;

    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 1, 1))
        .session(session)
        .identify_cooldown(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Manager::new(config);
    manager.connect().await.unwrap();

    match next_server_event(&mut gateway).await {
        ServerEvent::Identify { .. } => {}
        other => panic!("expected identify, got {other:?}"),
    }
    manager.destroy(DestroyOptions::default()).await.unwrap();
}

#[tokio::test]
async fn identifies_are_paced_by_the_throttle() {
    let cooldown = Duration::from_millis(150);
    let mut gateway = start_gateway(false).await;
    let config = ManagerConfig::builder("test-token", metadata_fetch(&gateway.url, 4, 1))
        .identify_cooldown(cooldown)
        .build()
        .unwrap();
    let manager = Manager::new(config);

    manager.connect().await.unwrap();

    let mut times = Vec::new();
    let mut identified = std::collections::HashSet::new();
    for _ in 0..4 {
        match next_server_event(&mut gateway).await {
            ServerEvent::Identify { shard_id, at, .. } => {
                identified.insert(shard_id);
                times.push(at);
            }
            other => panic!("expected identify, got {other:?}"),
        }
    }
    assert_eq!(identified.len(), 4, "every shard identified exactly once");

    // max_concurrency = 1: strictly one bucket, one admission per cooldown
    times.sort();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= cooldown - Duration::from_millis(50),
            "identifies {gap:?} apart, expected at least ~{cooldown:?}"
        );
    }

    manager.destroy(DestroyOptions::default()).await.unwrap();
}
