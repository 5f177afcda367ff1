//! End-to-end signaling scenarios against the loopback engine
//!
//! Run with: cargo test -p roomwire-sfu --test signaling

use roomwire_sfu::{
    DtlsParameters, ErrorCode, LocalEngine, MediaKind, PeerId, ProducerId, RoomId,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters, ServerEvent, Session,
    SfuConfig, SignalingGateway, TransportDirection, TransportId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Events = mpsc::Receiver<ServerEvent>;

fn opus() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        }],
        ..Default::default()
    }
}

fn vp8() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Map::new(),
        }],
        ..Default::default()
    }
}

fn full_caps() -> RtpCapabilities {
    RtpCapabilities::new(roomwire_sfu::default_media_codecs())
}

fn video_only_caps() -> RtpCapabilities {
    RtpCapabilities::new(vec![RtpCodecCapability::video("video/VP8", 90000)])
}

fn setup_with(config: SfuConfig) -> (LocalEngine, Arc<SignalingGateway>) {
    let engine = LocalEngine::new();
    let gateway = SignalingGateway::new(config, Arc::new(engine.clone()));
    (engine, gateway)
}

fn setup() -> (LocalEngine, Arc<SignalingGateway>) {
    setup_with(SfuConfig::default())
}

async fn joined(gateway: &Arc<SignalingGateway>, room: &str, peer: &str) -> (Session, Events) {
    let (mut session, events) = gateway.connect();
    session
        .join(RoomId::from(room), PeerId::from(peer), peer.to_uppercase())
        .await
        .unwrap();
    (session, events)
}

async fn transport(session: &Session, direction: TransportDirection) -> TransportId {
    let info = session.create_transport(direction, None).await.unwrap();
    session
        .connect_transport(
            info.transport_id.clone(),
            DtlsParameters(json!({ "role": "client", "fingerprints": [] })),
        )
        .await
        .unwrap();
    info.transport_id
}

async fn publish(session: &Session, kind: MediaKind) -> (TransportId, ProducerId) {
    let send = transport(session, TransportDirection::Send).await;
    let params = match kind {
        MediaKind::Audio => opus(),
        MediaKind::Video => vp8(),
    };
    let produced = session
        .produce(send.clone(), kind, params, None, Value::Null)
        .await
        .unwrap();
    (send, produced.producer_id)
}

/// Everything queued for a connection right now
fn drain(events: &mut Events) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Wait for the next event matching `pred`, skipping others
async fn wait_for(events: &mut Events, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_disconnect_removes_every_owned_entity() {
    let (_engine, gateway) = setup();
    let (mut alice, _alice_events) = joined(&gateway, "r1", "alice").await;
    let (bob, _bob_events) = joined(&gateway, "r1", "bob").await;

    let (send, producer_id) = publish(&alice, MediaKind::Audio).await;
    let recv = transport(&alice, TransportDirection::Recv).await;
    let (_, bob_producer) = publish(&bob, MediaKind::Video).await;
    let consumer = alice
        .consume(recv.clone(), bob_producer.clone(), full_caps(), false)
        .await
        .unwrap();

    alice.disconnect().await;

    let index = gateway.registry().index();
    assert!(index.transport_room(&send).is_none());
    assert!(index.transport_room(&recv).is_none());
    assert!(index.producer_room(&producer_id).is_none());
    assert!(index.consumer_room(&consumer.consumer_id).is_none());
    assert!(index.producer_room(&bob_producer).is_some());

    let stats = gateway.registry().room_stats(&RoomId::from("r1")).await.unwrap();
    assert_eq!(stats.peer_count, 1);
    assert_eq!(stats.audio_producers, 0);
    assert_eq!(stats.consumer_count, 0);
}

#[tokio::test]
async fn test_last_peer_leaving_removes_room() {
    let (engine, gateway) = setup();
    let (mut alice, _a) = joined(&gateway, "r1", "alice").await;
    let (mut bob, _b) = joined(&gateway, "r1", "bob").await;
    publish(&bob, MediaKind::Audio).await;

    alice.disconnect().await;
    assert!(gateway.registry().contains(&RoomId::from("r1")));

    bob.leave().await.unwrap();
    assert!(!gateway.registry().contains(&RoomId::from("r1")));
    assert!(gateway.registry().index().is_empty());

    // A later join builds a fresh room with a new router
    let (_carol, _c) = joined(&gateway, "r1", "carol").await;
    assert_eq!(engine.routers_created(), 2);
}

#[tokio::test]
async fn test_participants_are_told_about_joins_and_leaves() {
    let (_engine, gateway) = setup();
    let (_alice, mut alice_events) = joined(&gateway, "r1", "alice").await;
    let (mut bob, _b) = gateway.connect();

    let snapshot = bob
        .join(RoomId::from("r1"), PeerId::from("bob"), "Bob".to_string())
        .await
        .unwrap();
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(snapshot.participants[0].peer_id, PeerId::from("alice"));

    assert_eq!(
        drain(&mut alice_events),
        vec![ServerEvent::ParticipantJoined {
            peer_id: PeerId::from("bob"),
            display_name: "Bob".to_string(),
        }]
    );

    bob.disconnect().await;
    assert_eq!(
        drain(&mut alice_events),
        vec![ServerEvent::ParticipantLeft {
            peer_id: PeerId::from("bob"),
        }]
    );
}

#[tokio::test]
async fn test_consume_with_incompatible_capabilities_creates_nothing() {
    let (_engine, gateway) = setup();
    let (alice, _a) = joined(&gateway, "r1", "alice").await;
    let (bob, _b) = joined(&gateway, "r1", "bob").await;

    let (_, producer_id) = publish(&alice, MediaKind::Audio).await;
    let recv = transport(&bob, TransportDirection::Recv).await;

    let err = bob
        .consume(recv, producer_id, video_only_caps(), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapabilityMismatch);

    let stats = gateway.stats().await;
    assert_eq!(stats.total_consumers, 0);
}

#[tokio::test]
async fn test_closed_producer_is_not_found() {
    let (_engine, gateway) = setup();
    let (alice, _a) = joined(&gateway, "r1", "alice").await;
    let (_, producer_id) = publish(&alice, MediaKind::Audio).await;

    alice.close_producer(producer_id.clone()).await.unwrap();

    let err = alice.pause_producer(producer_id.clone()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    let err = alice.close_producer(producer_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_new_producer_skips_the_producing_peer() {
    let (_engine, gateway) = setup();
    let (alice, mut alice_events) = joined(&gateway, "r1", "alice").await;
    let (bob, mut bob_events) = joined(&gateway, "r1", "bob").await;
    drain(&mut alice_events);

    let (_, producer_id) = publish(&alice, MediaKind::Audio).await;

    assert!(drain(&mut alice_events).is_empty());
    assert_eq!(
        drain(&mut bob_events),
        vec![ServerEvent::NewProducer {
            producer_id,
            kind: MediaKind::Audio,
            peer_id: PeerId::from("alice"),
        }]
    );

    // get-producers never lists the caller's own producers
    let own = alice
        .get_producers(&RoomId::from("r1"), full_caps())
        .await
        .unwrap();
    assert!(own.is_empty());
    let others = bob
        .get_producers(&RoomId::from("r1"), full_caps())
        .await
        .unwrap();
    assert_eq!(others.len(), 1);
}

#[tokio::test]
async fn test_get_producers_filters_by_capabilities() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;

    let (_, audio) = publish(&a, MediaKind::Audio).await;
    publish(&b, MediaKind::Audio).await;

    let audio_only = RtpCapabilities::new(vec![RtpCodecCapability::audio("audio/opus", 48000, 2)]);
    let listed = b
        .get_producers(&RoomId::from("r1"), audio_only)
        .await
        .unwrap();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].producer_id, audio);
    assert_eq!(listed[0].peer_id, PeerId::from("a"));
}

#[tokio::test]
async fn test_get_producers_respects_room_name() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;

    let err = a
        .get_producers(&RoomId::from("elsewhere"), full_caps())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_host_mute_all_pauses_everyone_else() {
    let (_engine, gateway) = setup();
    let (host, mut host_events) = joined(&gateway, "r1", "host").await;
    let (guest, mut guest_events) = joined(&gateway, "r1", "guest").await;
    let (watcher, mut watcher_events) = joined(&gateway, "r1", "watcher").await;

    let (_, host_audio) = publish(&host, MediaKind::Audio).await;
    let (_, guest_audio) = publish(&guest, MediaKind::Audio).await;
    let (_, guest_video) = publish(&guest, MediaKind::Video).await;
    drain(&mut host_events);
    drain(&mut guest_events);
    drain(&mut watcher_events);

    let result = watcher
        .host_mute_all(&RoomId::from("r1"), PeerId::from("host"))
        .await
        .unwrap();
    assert_eq!(result.muted, 1);
    assert_eq!(result.failed, 0);

    assert_eq!(
        drain(&mut guest_events),
        vec![ServerEvent::MutedByHost {
            producer_id: guest_audio.clone(),
        }]
    );
    let paused = ServerEvent::ProducerPaused {
        producer_id: guest_audio,
        peer_id: PeerId::from("guest"),
    };
    assert_eq!(drain(&mut host_events), vec![paused.clone()]);
    assert_eq!(drain(&mut watcher_events), vec![paused]);

    let producers = watcher
        .get_producers(&RoomId::from("r1"), full_caps())
        .await
        .unwrap();
    for info in producers {
        let expect_paused = info.producer_id != host_audio && info.producer_id != guest_video;
        assert_eq!(info.paused, expect_paused, "{}", info.producer_id);
    }

    // Already paused producers are not muted twice
    let again = watcher
        .host_mute_all(&RoomId::from("r1"), PeerId::from("host"))
        .await
        .unwrap();
    assert_eq!(again.muted, 0);
}

#[tokio::test]
async fn test_host_mute_all_counts_engine_failures() {
    let (engine, gateway) = setup();
    let (host, _h) = joined(&gateway, "r1", "host").await;
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;

    let (_, stuck) = publish(&a, MediaKind::Audio).await;
    publish(&b, MediaKind::Audio).await;
    engine.fail_pause(stuck);

    let result = host
        .host_mute_all(&RoomId::from("r1"), PeerId::from("host"))
        .await
        .unwrap();
    assert_eq!(result.muted, 1);
    assert_eq!(result.failed, 1);
}

#[tokio::test]
async fn test_host_mute_all_needs_membership_of_that_room() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (outsider, _o) = joined(&gateway, "r2", "outsider").await;
    let (stranger, _s) = gateway.connect();
    publish(&a, MediaKind::Audio).await;

    let err = stranger
        .host_mute_all(&RoomId::from("r1"), PeerId::from("host"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotJoined);

    let err = outsider
        .host_mute_all(&RoomId::from("r1"), PeerId::from("outsider"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let (b, _b) = joined(&gateway, "r1", "b").await;
    let producers = b.get_producers(&RoomId::from("r1"), full_caps()).await.unwrap();
    assert_eq!(producers.len(), 1);
    assert!(!producers[0].paused);
}

#[tokio::test]
async fn test_disconnecting_peer_producer_is_gone() {
    let (_engine, gateway) = setup();
    let (mut a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;
    let (_, producer_id) = publish(&a, MediaKind::Audio).await;

    a.disconnect().await;

    let listed = b
        .get_producers(&RoomId::from("r1"), full_caps())
        .await
        .unwrap();
    assert!(listed.is_empty());
    let err = b.pause_producer(producer_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_consumer_owner_told_when_producer_closes() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, mut b_events) = joined(&gateway, "r1", "b").await;

    let (_, producer_id) = publish(&a, MediaKind::Audio).await;
    let recv = transport(&b, TransportDirection::Recv).await;
    let consumer = b
        .consume(recv, producer_id.clone(), full_caps(), false)
        .await
        .unwrap();
    drain(&mut b_events);

    a.close_producer(producer_id.clone()).await.unwrap();

    let event = wait_for(&mut b_events, |e| {
        matches!(e, ServerEvent::ConsumerClosed { .. })
    })
    .await;
    assert_eq!(
        event,
        ServerEvent::ConsumerClosed {
            consumer_id: consumer.consumer_id.clone(),
            producer_id,
        }
    );
    let err = b.pause_consumer(consumer.consumer_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_engine_transport_failure_closes_its_producers() {
    let (engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, mut b_events) = joined(&gateway, "r1", "b").await;

    let (send, producer_id) = publish(&a, MediaKind::Video).await;
    drain(&mut b_events);

    assert!(engine.fail_transport(&send));

    let event = wait_for(&mut b_events, |e| {
        matches!(e, ServerEvent::ProducerClosed { .. })
    })
    .await;
    assert_eq!(
        event,
        ServerEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            peer_id: PeerId::from("a"),
        }
    );

    // The failed transport goes too once its own notification lands
    tokio::time::timeout(Duration::from_secs(2), async {
        while gateway.registry().index().transport_room(&send).is_some() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert!(gateway.registry().index().producer_room(&producer_id).is_none());
}

#[tokio::test]
async fn test_foreign_transport_is_not_found() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;
    let (c, _c) = joined(&gateway, "r2", "c").await;

    let send = transport(&a, TransportDirection::Send).await;

    let err = b
        .produce(send.clone(), MediaKind::Audio, opus(), None, Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let err = c.close_transport(send.clone()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    // Still usable by its owner
    a.produce(send, MediaKind::Audio, opus(), None, Value::Null)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_producer_app_data_carries_server_peer_id() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;
    let send = transport(&a, TransportDirection::Send).await;

    let err = a
        .produce(send.clone(), MediaKind::Audio, opus(), None, json!("label"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    let produced = a
        .produce(
            send,
            MediaKind::Audio,
            opus(),
            None,
            json!({ "peerId": "mallory", "source": "mic" }),
        )
        .await
        .unwrap();
    let expected = json!({ "peerId": "a", "source": "mic" });

    let listed = b
        .get_producers(&RoomId::from("r1"), full_caps())
        .await
        .unwrap();
    assert_eq!(listed[0].app_data, expected);

    let recv = transport(&b, TransportDirection::Recv).await;
    let consumer = b
        .consume(recv, produced.producer_id, full_caps(), false)
        .await
        .unwrap();
    assert_eq!(consumer.app_data, expected);
}

#[tokio::test]
async fn test_transport_direction_is_enforced() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;
    let (send, producer_id) = publish(&a, MediaKind::Audio).await;
    let recv = transport(&a, TransportDirection::Recv).await;

    let err = a
        .produce(recv, MediaKind::Audio, opus(), None, Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    let (_, other) = publish(&b, MediaKind::Audio).await;
    let err = a
        .consume(send, other, full_caps(), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert_eq!(gateway.stats().await.total_consumers, 0);
    assert!(gateway.registry().index().producer_room(&producer_id).is_some());
}

#[tokio::test]
async fn test_room_limits() {
    let (_engine, gateway) = setup_with(SfuConfig {
        max_rooms: 1,
        max_peers_per_room: 1,
        ..Default::default()
    });
    let (_a, _ae) = joined(&gateway, "r1", "a").await;

    let (mut b, _be) = gateway.connect();
    let err = b
        .join(RoomId::from("r1"), PeerId::from("b"), String::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RoomFull);
    assert!(!b.is_joined());

    let err = b
        .join(RoomId::from("r2"), PeerId::from("b"), String::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RoomLimit);
}

#[tokio::test]
async fn test_concurrent_joins_share_one_router() {
    let (engine, gateway) = setup();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            let (mut session, events) = gateway.connect();
            session
                .join(RoomId::from("busy"), PeerId::from(format!("p{i}")), String::new())
                .await
                .unwrap();
            (session, events)
        }));
    }
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    assert_eq!(engine.routers_created(), 1);
    assert_eq!(gateway.stats().await.total_peers, 16);

    for (session, _) in &mut sessions {
        session.disconnect().await;
    }
    assert_eq!(gateway.registry().room_count(), 0);
}

#[tokio::test]
async fn test_consumer_lifecycle_and_transport_close() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;

    let caps = b.router_capabilities().await.unwrap();
    assert_eq!(
        caps.rtp_capabilities.codecs.len(),
        roomwire_sfu::default_media_codecs().len()
    );

    let (send, producer_id) = publish(&a, MediaKind::Audio).await;
    let recv = transport(&b, TransportDirection::Recv).await;
    let consumer = b
        .consume(recv, producer_id.clone(), caps.rtp_capabilities, true)
        .await
        .unwrap();
    assert!(consumer.paused);
    assert!(!consumer.producer_paused);
    assert_eq!(consumer.app_data, json!({ "peerId": "a" }));

    // Only the owner may touch the consumer
    let err = a.resume_consumer(consumer.consumer_id.clone()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    b.resume_consumer(consumer.consumer_id.clone()).await.unwrap();
    b.pause_consumer(consumer.consumer_id.clone()).await.unwrap();
    b.close_consumer(consumer.consumer_id.clone()).await.unwrap();
    let err = b.close_consumer(consumer.consumer_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    // Closing a transport takes its producers along
    a.close_transport(send.clone()).await.unwrap();
    let index = gateway.registry().index();
    assert!(index.transport_room(&send).is_none());
    assert!(index.producer_room(&producer_id).is_none());
}

#[tokio::test]
async fn test_consume_reports_paused_producer() {
    let (_engine, gateway) = setup();
    let (a, _a) = joined(&gateway, "r1", "a").await;
    let (b, _b) = joined(&gateway, "r1", "b").await;

    let (_, producer_id) = publish(&a, MediaKind::Audio).await;
    a.pause_producer(producer_id.clone()).await.unwrap();

    let recv = transport(&b, TransportDirection::Recv).await;
    let consumer = b
        .consume(recv, producer_id, full_caps(), false)
        .await
        .unwrap();
    assert!(consumer.producer_paused);
    assert!(!consumer.paused);
}

#[tokio::test]
async fn test_abandoned_join_is_undone_by_disconnect() {
    let (_engine, gateway) = setup();
    let (mut session, _events) = gateway.connect();

    {
        let join = std::pin::pin!(session.join(
            RoomId::from("r1"),
            PeerId::from("ghost"),
            String::new()
        ));
        // The join command is queued, then its caller gives up.
        assert!(futures::poll!(join).is_pending());
    }
    assert!(!session.is_joined());

    session.disconnect().await;

    assert!(!gateway.registry().contains(&RoomId::from("r1")));
    assert_eq!(gateway.stats().await.total_peers, 0);
    assert!(gateway.registry().index().is_empty());
}

#[tokio::test]
async fn test_abandoned_join_is_rolled_back_by_room() {
    let (_engine, gateway) = setup();
    let (_host, mut host_events) = joined(&gateway, "r1", "host").await;
    let (mut session, _events) = gateway.connect();

    {
        let join = std::pin::pin!(session.join(
            RoomId::from("r1"),
            PeerId::from("ghost"),
            String::new()
        ));
        assert!(futures::poll!(join).is_pending());
    }

    // The room drops the membership nobody is waiting for.
    wait_for(&mut host_events, |e| {
        matches!(e, ServerEvent::ParticipantLeft { .. })
    })
    .await;
    assert_eq!(gateway.stats().await.total_peers, 1);

    // The session can still join normally afterwards
    session
        .join(RoomId::from("r1"), PeerId::from("ghost"), String::new())
        .await
        .unwrap();
    assert_eq!(gateway.stats().await.total_peers, 2);
}

#[tokio::test]
async fn test_join_racing_room_teardown_is_retried() {
    let (engine, gateway) = setup();
    let (mut alice, _a) = joined(&gateway, "r1", "alice").await;

    let mut leave = std::pin::pin!(alice.leave());
    assert!(futures::poll!(leave.as_mut()).is_pending());

    // Queued behind the last leave, so the first attempt hits a retiring room.
    let (mut bob, _b) = gateway.connect();
    bob.join(RoomId::from("r1"), PeerId::from("bob"), String::new())
        .await
        .unwrap();
    leave.await.unwrap();

    assert!(bob.is_joined());
    assert_eq!(engine.routers_created(), 2);
    assert_eq!(gateway.stats().await.total_peers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_peers_leaving_while_another_joins() {
    let (_engine, gateway) = setup();
    let room_id = RoomId::from("race");

    for _ in 0..50 {
        let (mut a, _ae) = joined(&gateway, "race", "a").await;
        let (mut b, _be) = joined(&gateway, "race", "b").await;

        let joiner = {
            let gateway = Arc::clone(&gateway);
            let room_id = room_id.clone();
            tokio::spawn(async move {
                let (mut c, events) = gateway.connect();
                c.join(room_id, PeerId::from("c"), String::new())
                    .await
                    .map(|_| (c, events))
            })
        };
        let leaving_a = tokio::spawn(async move { a.disconnect().await });
        let leaving_b = tokio::spawn(async move { b.disconnect().await });

        leaving_a.await.unwrap();
        leaving_b.await.unwrap();
        let (mut c, _ce) = joiner.await.unwrap().unwrap();

        assert_eq!(gateway.registry().room_count(), 1);
        assert_eq!(gateway.stats().await.total_peers, 1);

        c.disconnect().await;
        assert!(!gateway.registry().contains(&room_id));
    }
}
