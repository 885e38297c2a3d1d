mod common;

use common::*;
use quantum_qos::mqtt::dedupe::FlushedAck;
use quantum_qos::mqtt::flow_control::OutboundStage;
use quantum_qos::mqtt::protocol::{AckPacket, DisconnectReason, InboundPacket, OutboundPacket, Qos};
use quantum_qos::mqtt::session::{ConnectionEvent, ConnectionSettings};
use quantum_qos::DeliveryStatus;

fn persistent(client_id: &str) -> ConnectionSettings {
    ConnectionSettings::new(client_id).with_session_expiry(3600)
}

#[tokio::test]
async fn reconnect_resends_original_identifier_before_new_messages() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("resumer"));
    let lost = first.handle.enqueue(msg("in-flight", Qos::AtLeastOnce));
    assert_eq!(
        publish_parts(&next_packet(&mut first).await),
        ("in-flight".to_string(), Some(1), false)
    );
    first.handle.disconnect().await.unwrap();
    let summary = first.task.await.unwrap();
    assert!(summary.session_persisted);
    assert_eq!(lost.await, DeliveryStatus::NotDelivered);
    assert_eq!(t.store.inflight_ids("resumer"), vec![1]);

    let mut second = t.engine.connect(persistent("resumer").resuming());
    let fresh = second.handle.enqueue(msg("fresh", Qos::AtLeastOnce));

    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("in-flight".to_string(), Some(1), true)
    );
    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("fresh".to_string(), Some(2), false)
    );

    puback(&second, 1).await;
    puback(&second, 2).await;
    assert_eq!(fresh.await, DeliveryStatus::Delivered);
    assert!(t.store.inflight_ids("resumer").is_empty());
    assert_eq!(t.engine.metrics().redelivered.get(), 1);
}

#[tokio::test]
async fn released_qos2_message_resumes_with_pubrel() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("half-done"));
    first.handle.enqueue(msg("exactly", Qos::ExactlyOnce));
    next_packet(&mut first).await;
    send(&first, InboundPacket::PubRec(AckPacket::new(1))).await;
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::PubRel(AckPacket::new(1))
    );
    first.handle.disconnect().await.unwrap();
    first.task.await.unwrap();
    assert_eq!(
        t.store.stage("half-done", 1),
        Some(OutboundStage::AwaitingPubComp)
    );

    let mut second = t.engine.connect(persistent("half-done").resuming());
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubRel(AckPacket::new(1))
    );
    send(&second, InboundPacket::PubComp(AckPacket::new(1))).await;
    assert_quiet(&mut second).await;
    assert!(t.store.inflight_ids("half-done").is_empty());
    assert_eq!(t.store.delivered(), vec![("half-done".to_string(), 1)]);
}

#[tokio::test]
async fn queued_messages_return_after_redelivered_ones() {
    let t = engine_with_window(1);

    let mut first = t.engine.connect(persistent("backlog"));
    first.handle.enqueue(msg("admitted", Qos::AtLeastOnce));
    first.handle.enqueue(msg("waiting", Qos::AtLeastOnce));
    next_packet(&mut first).await;
    first.handle.disconnect().await.unwrap();
    let summary = first.task.await.unwrap();
    assert_eq!((summary.inflight, summary.queued), (1, 1));
    assert_eq!(t.store.unsent_count("backlog"), 1);

    let mut second = t.engine.connect(persistent("backlog").resuming());
    second.handle.enqueue(msg("newest", Qos::AtLeastOnce));
    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("admitted".to_string(), Some(1), true)
    );
    puback(&second, 1).await;
    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("waiting".to_string(), Some(1), false)
    );
    puback(&second, 1).await;
    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("newest".to_string(), Some(1), false)
    );
}

#[tokio::test]
async fn inbound_records_survive_reconnect_of_persistent_session() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("slow-client"));
    let publish = msg("command", Qos::ExactlyOnce).with_packet_id(9);
    send(&first, InboundPacket::Publish(publish.clone())).await;
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::PubRec(AckPacket::new(9))
    );
    first.handle.disconnect().await.unwrap();
    assert_eq!(first.task.await.unwrap().inbound_retained, 1);

    let mut second = t.engine.connect(persistent("slow-client").resuming());
    send(&second, InboundPacket::Publish(publish.as_duplicate())).await;
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubRec(AckPacket::new(9))
    );
    assert_eq!(t.sink.count(), 1);
}

#[tokio::test]
async fn clean_session_forgets_everything() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(ConnectionSettings::new("ephemeral"));
    first.handle.enqueue(msg("gone", Qos::AtLeastOnce));
    next_packet(&mut first).await;
    send(
        &first,
        InboundPacket::Publish(msg("in", Qos::ExactlyOnce).with_packet_id(4)),
    )
    .await;
    next_packet(&mut first).await;
    first.handle.disconnect().await.unwrap();
    let summary = first.task.await.unwrap();
    assert!(!summary.session_persisted);
    assert!(t.store.inflight_ids("ephemeral").is_empty());
    assert!(!t.store.has_inbound("ephemeral"));
    assert!(t.engine.registry().get("ephemeral").is_none());

    let mut second = t.engine.connect(ConnectionSettings::new("ephemeral"));
    send(
        &second,
        InboundPacket::Publish(msg("in", Qos::ExactlyOnce).with_packet_id(4)),
    )
    .await;
    next_packet(&mut second).await;
    assert_eq!(t.sink.count(), 2);
    assert_quiet(&mut second).await;
}

#[tokio::test]
async fn redelivery_identifier_collision_terminates_connection() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("inconsistent"));
    first.handle.enqueue(msg("pending", Qos::AtLeastOnce));
    next_packet(&mut first).await;
    first.handle.disconnect().await.unwrap();
    first.task.await.unwrap();

    // a stale holder of identifier 1 that persistence does not know about
    t.engine
        .registry()
        .for_client("inconsistent")
        .lock()
        .take_specific(1)
        .unwrap();

    let mut second = t.engine.connect(persistent("inconsistent").resuming());
    let queued = second.handle.enqueue(msg("after", Qos::AtLeastOnce));
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::Disconnect(DisconnectReason::ImplementationSpecificError)
    );
    assert_eq!(queued.await, DeliveryStatus::NotDelivered);
    second.task.await.unwrap();
    assert_eq!(t.engine.connection_count(), 0);
}

#[tokio::test]
async fn takeover_redelivers_what_the_live_connection_had_in_flight() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("roamer"));
    let lost = first.handle.enqueue(msg("in-flight", Qos::AtLeastOnce));
    assert_eq!(
        publish_parts(&next_packet(&mut first).await),
        ("in-flight".to_string(), Some(1), false)
    );

    // no disconnect: the client simply shows up again on a new connection
    let mut second = t.engine.connect(persistent("roamer").resuming());
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::Disconnect(DisconnectReason::SessionTakenOver)
    );
    let summary = first.task.await.unwrap();
    assert_eq!(summary.inflight, 1);
    assert_eq!(lost.await, DeliveryStatus::NotDelivered);

    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("in-flight".to_string(), Some(1), true)
    );
    puback(&second, 1).await;
    assert_quiet(&mut second).await;
    assert!(t.store.inflight_ids("roamer").is_empty());
    assert_eq!(t.engine.connection_count(), 1);
    assert_eq!(
        t.engine
            .client_connection("roamer")
            .map(|h| h.connection_id()),
        Some(second.handle.connection_id())
    );
}

#[tokio::test]
async fn takeover_keeps_inbound_duplicate_filter() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("double-dialer"));
    let publish = msg("command", Qos::ExactlyOnce).with_packet_id(9);
    send(&first, InboundPacket::Publish(publish.clone())).await;
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::PubRec(AckPacket::new(9))
    );

    let mut second = t.engine.connect(persistent("double-dialer").resuming());
    send(&second, InboundPacket::Publish(publish.as_duplicate())).await;
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::Disconnect(DisconnectReason::SessionTakenOver)
    );
    assert_eq!(first.task.await.unwrap().inbound_retained, 1);
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubRec(AckPacket::new(9))
    );
    assert_eq!(t.sink.count(), 1);

    send(&second, InboundPacket::PubRel(AckPacket::new(9))).await;
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubComp(AckPacket::new(9))
    );
}

#[tokio::test]
async fn clean_takeover_starts_from_a_fresh_pool() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(ConnectionSettings::new("flapper"));
    first.handle.enqueue(msg("old", Qos::AtLeastOnce));
    next_packet(&mut first).await;

    let mut second = t.engine.connect(ConnectionSettings::new("flapper"));
    second.handle.enqueue(msg("new", Qos::AtLeastOnce));
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::Disconnect(DisconnectReason::SessionTakenOver)
    );
    assert!(!first.task.await.unwrap().session_persisted);

    assert_eq!(
        publish_parts(&next_packet(&mut second).await),
        ("new".to_string(), Some(1), false)
    );
    assert!(t.engine.registry().get("flapper").is_some());
    assert_eq!(t.store.inflight_ids("flapper"), vec![1]);
}

#[tokio::test]
async fn ack_flush_confirmed_during_disconnect_retires_the_record() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("flusher"));
    send(
        &first,
        InboundPacket::Publish(msg("m1", Qos::AtLeastOnce).with_packet_id(42)),
    )
    .await;
    assert_eq!(
        next_packet(&mut first).await,
        OutboundPacket::PubAck(AckPacket::new(42))
    );

    // the codec reports the flush right behind the disconnect
    first.handle.disconnect().await.unwrap();
    first
        .handle
        .submit(ConnectionEvent::AckWritten {
            ack: FlushedAck::PubAck,
            packet_id: 42,
        })
        .await
        .unwrap();
    assert_eq!(first.task.await.unwrap().inbound_retained, 0);
    assert!(!t.store.has_inbound("flusher"));

    let mut second = t.engine.connect(persistent("flusher").resuming());
    send(
        &second,
        InboundPacket::Publish(msg("m2-new", Qos::AtLeastOnce).with_packet_id(42)),
    )
    .await;
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubAck(AckPacket::new(42))
    );
    assert_eq!(t.sink.topics(), vec!["m1".to_string(), "m2-new".to_string()]);
}

#[tokio::test]
async fn reused_identifier_before_flush_is_not_suppressed_across_reconnect() {
    let t = engine_with_window(4);

    let mut first = t.engine.connect(persistent("fast-reuse"));
    send(
        &first,
        InboundPacket::Publish(msg("m1", Qos::AtLeastOnce).with_packet_id(7)),
    )
    .await;
    next_packet(&mut first).await;
    first.handle.disconnect().await.unwrap();
    assert_eq!(first.task.await.unwrap().inbound_retained, 1);

    let mut second = t.engine.connect(persistent("fast-reuse").resuming());
    send(
        &second,
        InboundPacket::Publish(msg("m1", Qos::AtLeastOnce).with_packet_id(7).as_duplicate()),
    )
    .await;
    send(
        &second,
        InboundPacket::Publish(msg("m2", Qos::AtLeastOnce).with_packet_id(7)),
    )
    .await;
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubAck(AckPacket::new(7))
    );
    assert_eq!(
        next_packet(&mut second).await,
        OutboundPacket::PubAck(AckPacket::new(7))
    );
    assert_eq!(t.sink.topics(), vec!["m1".to_string(), "m2".to_string()]);
}
