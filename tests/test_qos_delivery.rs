//! Outbound QoS 1/2 delivery: acknowledgments, retransmission and failure

mod common;

use common::{client_with_broker, connect, test_config, LONG_WAIT, SHORT_WAIT};
use mqtt_ingest::protocol::{Packet, Publish};
use mqtt_ingest::testing::{MockBroker, Recorded};
use mqtt_ingest::{ClientError, PresenceSection, QoS};
use std::time::Duration;

async fn expect_publish(broker: &mut MockBroker) -> Publish {
    match broker.recv().await {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos1_publish_acknowledged() {
    // Arrange
    let (mut client, mut broker, _handler) = client_with_broker(test_config("qos1"));
    connect(&mut client, &mut broker).await;

    // Act
    client
        .publish("factory/B7/line3/telemetry", r#"{"rpm":1200}"#, QoS::AtLeastOnce)
        .unwrap();
    let publish = expect_publish(&mut broker).await;
    let packet_id = publish.packet_id.expect("QoS 1 publish carries a packet id");
    broker.send(Packet::PubAck(packet_id)).await;

    // Assert
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert_eq!(&publish.payload[..], br#"{"rpm":1200}"#);

    let deadline = tokio::time::Instant::now() + LONG_WAIT;
    while client.metrics().outbound.acknowledged == 0 {
        assert!(tokio::time::Instant::now() < deadline, "PUBACK not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        broker.recv_timeout(SHORT_WAIT).await,
        None,
        "acknowledged publish must not be retransmitted"
    );

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos2_publish_completes_four_way_handshake() {
    // Arrange
    let (mut client, mut broker, _handler) = client_with_broker(test_config("qos2"));
    connect(&mut client, &mut broker).await;

    // Act
    client
        .publish("factory/B7/line3/batch", "batch-17 complete", QoS::ExactlyOnce)
        .unwrap();
    let publish = expect_publish(&mut broker).await;
    let packet_id = publish.packet_id.expect("QoS 2 publish carries a packet id");
    broker.send(Packet::PubRec(packet_id)).await;

    // Assert
    assert_eq!(broker.recv().await, Some(Packet::PubRel(packet_id)));
    broker.send(Packet::PubComp(packet_id)).await;

    let deadline = tokio::time::Instant::now() + LONG_WAIT;
    while client.metrics().outbound.acknowledged == 0 {
        assert!(tokio::time::Instant::now() < deadline, "PUBCOMP not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.recv_timeout(SHORT_WAIT).await, None);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_publish_retransmitted_then_failed() {
    // Arrange: retry every 200ms, give up after 2 retransmissions
    let (mut client, mut broker, handler) = client_with_broker(test_config("retry"));
    connect(&mut client, &mut broker).await;

    // Act
    client
        .publish("factory/B7/line3/telemetry", "reading", QoS::AtLeastOnce)
        .unwrap();
    let first = expect_publish(&mut broker).await;
    let retry_1 = expect_publish(&mut broker).await;
    let retry_2 = expect_publish(&mut broker).await;

    // Assert
    assert!(!first.dup);
    for retry in [&retry_1, &retry_2] {
        assert!(retry.dup, "retransmissions carry the DUP flag");
        assert_eq!(retry.packet_id, first.packet_id);
        assert_eq!(retry.payload, first.payload);
    }

    let failed = handler
        .wait_for(LONG_WAIT, |events| {
            events
                .iter()
                .any(|e| matches!(e, Recorded::Error(ClientError::Delivery { .. })))
        })
        .await;
    assert!(failed, "delivery failure should reach the error handler");

    match handler.errors().as_slice() {
        [ClientError::Delivery {
            topic,
            packet_id,
            attempts,
        }] => {
            assert_eq!(topic, "factory/B7/line3/telemetry");
            assert_eq!(Some(*packet_id), first.packet_id);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected one delivery error, got {other:?}"),
    }

    let outbound = client.metrics().outbound;
    assert_eq!(outbound.retransmitted, 2);
    assert_eq!(outbound.failed, 1);
    assert_eq!(broker.recv_timeout(SHORT_WAIT).await, None);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_inflight_publish_resent_with_dup_after_reconnect() {
    // Arrange
    let mut config = test_config("resend");
    config.queue.retry_interval_ms = 10_000;
    let (mut client, mut broker, _handler) = client_with_broker(config);
    connect(&mut client, &mut broker).await;

    client
        .publish("factory/B7/line3/state", "running", QoS::AtLeastOnce)
        .unwrap();
    let original = expect_publish(&mut broker).await;

    // Act
    broker.drop_connection();
    assert!(broker.handshake().await.is_some());

    // Assert
    let resent = expect_publish(&mut broker).await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, original.packet_id);
    assert_eq!(resent.topic, original.topic);
    assert_eq!(resent.payload, original.payload);

    broker.send(Packet::PubAck(resent.packet_id.unwrap_or_default())).await;
    let deadline = tokio::time::Instant::now() + LONG_WAIT;
    while client.metrics().outbound.acknowledged == 0 {
        assert!(tokio::time::Instant::now() < deadline, "PUBACK not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publishes_queued_offline_are_sent_in_order_on_connect() {
    // Arrange
    let (mut client, mut broker, _handler) = client_with_broker(test_config("offline"));
    for n in 0..3 {
        client
            .publish("factory/B7/line3/telemetry", format!("reading-{n}"), QoS::AtMostOnce)
            .unwrap();
    }
    client
        .publish("factory/B7/line3/state", "idle", QoS::AtLeastOnce)
        .unwrap();
    assert_eq!(client.queued(), 4);

    // Act
    connect(&mut client, &mut broker).await;

    // Assert
    let mut payloads = Vec::new();
    for _ in 0..4 {
        let publish = expect_publish(&mut broker).await;
        payloads.push(String::from_utf8(publish.payload.to_vec()).unwrap());
    }
    assert_eq!(payloads, vec!["reading-0", "reading-1", "reading-2", "idle"]);
    assert_eq!(client.queued(), 0);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos0_publish_queued_during_outage_is_sent_after_reconnect() {
    // Arrange
    let mut config = test_config("outage");
    config.session.initial_backoff_ms = 300;
    config.session.max_backoff_ms = 300;
    let (mut client, mut broker, handler) = client_with_broker(config);
    connect(&mut client, &mut broker).await;

    // Act
    broker.drop_connection();
    let lost = handler
        .wait_for(LONG_WAIT, |events| {
            events
                .iter()
                .any(|e| matches!(e, Recorded::Disconnected { .. }))
        })
        .await;
    assert!(lost);
    client
        .publish("factory/B7/line3/telemetry", "buffered", QoS::AtMostOnce)
        .unwrap();
    assert!(broker.handshake().await.is_some());

    // Assert
    let publish = expect_publish(&mut broker).await;
    assert_eq!(&publish.payload[..], b"buffered");
    assert_eq!(client.metrics().outbound.dropped, 0);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_delivery_token_waits_for_its_own_acknowledgment() {
    // Arrange: presence announces itself with a QoS 1 publish on connect
    let mut config = test_config("tracked");
    config.queue.retry_interval_ms = 10_000;
    config.presence = Some(PresenceSection {
        topic: "factory/B7/line3/presence".to_string(),
        online_payload: "online".to_string(),
        offline_payload: "offline".to_string(),
        qos: QoS::AtLeastOnce,
    });
    let (mut client, mut broker, _handler) = client_with_broker(config);
    connect(&mut client, &mut broker).await;
    let presence = expect_publish(&mut broker).await;
    assert_eq!(presence.topic, "factory/B7/line3/presence");

    // Act
    let token = client
        .publish_tracked("factory/B7/line3/state", "running", QoS::AtLeastOnce, false)
        .unwrap();
    let publish = expect_publish(&mut broker).await;
    broker
        .send(Packet::PubAck(presence.packet_id.unwrap_or_default()))
        .await;
    let mut delivery = Box::pin(token.wait());

    // Assert
    assert!(
        tokio::time::timeout(SHORT_WAIT, &mut delivery).await.is_err(),
        "the presence PUBACK must not settle another delivery"
    );
    broker
        .send(Packet::PubAck(publish.packet_id.unwrap_or_default()))
        .await;
    let outcome = tokio::time::timeout(LONG_WAIT, delivery).await.unwrap();
    assert!(outcome.is_ok());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_tracked_publish_abandoned_at_disconnect_reports_shutdown() {
    // Arrange
    let mut config = test_config("tracked-abandoned");
    config.queue.retry_interval_ms = 10_000;
    let (mut client, mut broker, _handler) = client_with_broker(config);
    connect(&mut client, &mut broker).await;
    let token = client
        .publish_tracked("factory/B7/line3/state", "stopping", QoS::AtLeastOnce, false)
        .unwrap();
    expect_publish(&mut broker).await;

    // Act
    client.disconnect().await.unwrap();

    // Assert
    let outcome = tokio::time::timeout(LONG_WAIT, token.wait()).await.unwrap();
    assert!(matches!(outcome, Err(ClientError::ShuttingDown)));
}

#[tokio::test]
async fn test_unconfirmed_release_is_not_a_failed_delivery() {
    // Arrange
    let (mut client, mut broker, handler) = client_with_broker(test_config("release"));
    connect(&mut client, &mut broker).await;
    let token = client
        .publish_tracked("factory/B7/line3/batch", "batch-18 complete", QoS::ExactlyOnce, false)
        .unwrap();
    let publish = expect_publish(&mut broker).await;
    let packet_id = publish.packet_id.expect("QoS 2 publish carries a packet id");

    // Act: the broker accepts the message but never answers PUBREL
    broker.send(Packet::PubRec(packet_id)).await;
    assert_eq!(broker.recv().await, Some(Packet::PubRel(packet_id)));

    // Assert
    let outcome = tokio::time::timeout(LONG_WAIT, token.wait()).await.unwrap();
    assert!(outcome.is_ok(), "PUBREC settles the delivery");

    let reported = handler
        .wait_for(LONG_WAIT, |events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    Recorded::Error(ClientError::ReleaseUnconfirmed { packet_id: id, .. }) if *id == packet_id
                )
            })
        })
        .await;
    assert!(reported);
    assert!(!handler
        .errors()
        .iter()
        .any(|e| matches!(e, ClientError::Delivery { .. })));
    assert_eq!(client.metrics().outbound.failed, 0);

    client.disconnect().await.unwrap();
}
