//! Subscription replay across reconnects
//!
//! The active subscription set must reach the broker exactly once per
//! connection, in insertion order, no matter how often the link drops.

mod common;

use common::{client_with_broker, connect, test_config, LONG_WAIT, SHORT_WAIT};
use mqtt_ingest::protocol::{Packet, Publish, SubAck, SubscribeFilter, SubscribeReturnCode};
use mqtt_ingest::testing::{MockBroker, Recorded};
use mqtt_ingest::{AckStatus, ClientError, QoS, SessionState};

async fn expect_subscribe(broker: &mut MockBroker) -> (u16, Vec<SubscribeFilter>) {
    match broker.recv().await {
        Some(Packet::Subscribe(subscribe)) => (subscribe.packet_id, subscribe.filters),
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }
}

async fn grant_all(broker: &mut MockBroker, packet_id: u16, filters: &[SubscribeFilter]) {
    broker
        .send(Packet::SubAck(SubAck {
            packet_id,
            return_codes: filters
                .iter()
                .map(|f| SubscribeReturnCode::Success(f.qos))
                .collect(),
        }))
        .await;
}

#[tokio::test]
async fn test_subscriptions_replayed_once_in_order_after_drop() {
    // Arrange
    let (mut client, mut broker, handler) = client_with_broker(test_config("replay"));
    client.subscribe("factory/+/+/telemetry", QoS::AtLeastOnce).unwrap();
    client.subscribe("factory/+/+/state", QoS::AtMostOnce).unwrap();
    connect(&mut client, &mut broker).await;

    let (packet_id, filters) = expect_subscribe(&mut broker).await;
    assert_eq!(
        filters,
        vec![
            SubscribeFilter::new("factory/+/+/telemetry", QoS::AtLeastOnce),
            SubscribeFilter::new("factory/+/+/state", QoS::AtMostOnce),
        ]
    );
    grant_all(&mut broker, packet_id, &filters).await;

    // Act
    broker.drop_connection();
    let reconnect = broker.handshake().await;

    // Assert
    assert!(reconnect.is_some(), "client should reconnect on its own");
    let (packet_id, replayed) = expect_subscribe(&mut broker).await;
    assert_eq!(replayed, filters);
    grant_all(&mut broker, packet_id, &replayed).await;
    assert_eq!(broker.recv_timeout(SHORT_WAIT).await, None, "replayed more than once");

    assert!(client.wait_for_state(SessionState::Connected, LONG_WAIT).await);
    let seen = handler
        .wait_for(LONG_WAIT, |events| {
            events
                .iter()
                .filter(|e| matches!(e, Recorded::Connected(_)))
                .count()
                == 2
        })
        .await;
    assert!(seen);
    assert!(handler.events().iter().any(|e| matches!(
        e,
        Recorded::Disconnected {
            will_reconnect: true,
            ..
        }
    )));
    assert_eq!(client.metrics().inbound.subscriptions_replayed, 4);
    assert!(client
        .subscriptions()
        .iter()
        .all(|s| matches!(s.status, AckStatus::Granted(_))));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_changes_while_connected_shape_the_next_replay() {
    // Arrange
    let (mut client, mut broker, _handler) = client_with_broker(test_config("live-changes"));
    connect(&mut client, &mut broker).await;

    // Act
    client.subscribe("factory/B7/+/telemetry", QoS::AtLeastOnce).unwrap();
    let (packet_id, filters) = expect_subscribe(&mut broker).await;
    grant_all(&mut broker, packet_id, &filters).await;

    client.subscribe("factory/B7/+/alarms", QoS::ExactlyOnce).unwrap();
    let (packet_id, filters) = expect_subscribe(&mut broker).await;
    grant_all(&mut broker, packet_id, &filters).await;

    client.unsubscribe("factory/B7/+/telemetry").unwrap();
    let unsubscribe = match broker.recv().await {
        Some(Packet::Unsubscribe(unsubscribe)) => unsubscribe,
        other => panic!("expected UNSUBSCRIBE, got {other:?}"),
    };
    assert_eq!(unsubscribe.filters, vec!["factory/B7/+/telemetry"]);
    broker.send(Packet::UnsubAck(unsubscribe.packet_id)).await;

    broker.drop_connection();
    assert!(broker.handshake().await.is_some());

    // Assert
    let (_, replayed) = expect_subscribe(&mut broker).await;
    assert_eq!(
        replayed,
        vec![SubscribeFilter::new("factory/B7/+/alarms", QoS::ExactlyOnce)]
    );

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_subscription_reported_and_retried_on_reconnect() {
    // Arrange
    let (mut client, mut broker, handler) = client_with_broker(test_config("rejected"));
    client.subscribe("factory/secret/#", QoS::AtLeastOnce).unwrap();
    connect(&mut client, &mut broker).await;

    // Act
    let (packet_id, _) = expect_subscribe(&mut broker).await;
    broker
        .send(Packet::SubAck(SubAck {
            packet_id,
            return_codes: vec![SubscribeReturnCode::Failure],
        }))
        .await;

    // Assert
    let reported = handler
        .wait_for(LONG_WAIT, |events| {
            events.iter().any(|e| {
                matches!(e, Recorded::Error(ClientError::SubscriptionRejected { filter }) if filter == "factory/secret/#")
            })
        })
        .await;
    assert!(reported);
    assert_eq!(client.subscriptions()[0].status, AckStatus::Rejected);

    // A rejected filter never matches inbound traffic
    broker
        .send(Packet::Publish(Publish::new(
            "factory/secret/door",
            QoS::AtMostOnce,
            "open",
        )))
        .await;
    tokio::time::sleep(SHORT_WAIT).await;
    assert!(handler.messages().is_empty());

    broker.drop_connection();
    assert!(broker.handshake().await.is_some());
    let (_, replayed) = expect_subscribe(&mut broker).await;
    assert_eq!(
        replayed,
        vec![SubscribeFilter::new("factory/secret/#", QoS::AtLeastOnce)]
    );

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_inbound_message_dispatched_once_per_matching_filter() {
    // Arrange
    let (mut client, mut broker, handler) = client_with_broker(test_config("fan-out"));
    client.subscribe("factory/+/+/telemetry", QoS::AtLeastOnce).unwrap();
    client.subscribe("factory/B7/#", QoS::AtLeastOnce).unwrap();
    client.subscribe("factory/+/+/state", QoS::AtLeastOnce).unwrap();
    connect(&mut client, &mut broker).await;
    let (packet_id, filters) = expect_subscribe(&mut broker).await;
    grant_all(&mut broker, packet_id, &filters).await;

    // Act
    let mut publish = Publish::new(
        "factory/B7/line3/telemetry",
        QoS::AtLeastOnce,
        r#"{"temperature":71.5}"#,
    );
    publish.packet_id = Some(42);
    broker.send(Packet::Publish(publish)).await;

    // Assert
    assert_eq!(broker.recv().await, Some(Packet::PubAck(42)));
    let delivered = handler
        .wait_for(LONG_WAIT, |events| {
            events
                .iter()
                .filter(|e| matches!(e, Recorded::Message { .. }))
                .count()
                == 2
        })
        .await;
    assert!(delivered);

    let mut matched: Vec<String> = handler
        .messages()
        .into_iter()
        .map(|(filter, topic, _)| {
            assert_eq!(topic, "factory/B7/line3/telemetry");
            filter
        })
        .collect();
    matched.sort();
    assert_eq!(matched, vec!["factory/+/+/telemetry", "factory/B7/#"]);
    assert_eq!(client.metrics().inbound.received, 1);

    client.disconnect().await.unwrap();
}
