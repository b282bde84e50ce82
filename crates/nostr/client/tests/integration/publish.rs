//! Publish fan-out, outcome maps and circuit behavior under publish load.

use super::{Behavior, MockTransport, manager_with, note};
use nostr_client::{
    CircuitState, ClientError, OperationKind, PublishOutcome, RelayDescriptor, RelayError,
    SelectionRequest,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const A: &str = "wss://a.example";
const B: &str = "wss://b.example";
const C: &str = "wss://c.example";

#[tokio::test(start_paused = true)]
async fn test_silent_relay_times_out_without_blocking_others() {
    let transport = MockTransport::new();
    transport.set_behavior(C, Behavior::Silent);
    let manager = manager_with(&transport, &[A, B, C], |_| {});

    let report = manager
        .publish(note("e1"), SelectionRequest::write(3))
        .await
        .unwrap();

    assert_eq!(report.event_id, "e1");
    assert_eq!(report.outcomes[A], PublishOutcome::Ok);
    assert_eq!(report.outcomes[B], PublishOutcome::Ok);
    assert_eq!(report.outcomes[C], PublishOutcome::Timeout);

    let silent = manager.relay_health(C).unwrap();
    assert_eq!(silent.circuit.failure_count, 1);
    assert_eq!(silent.circuit.state, CircuitState::Closed);
    assert_eq!(silent.performance.failure_count, 1);
    assert_eq!(silent.performance.success_count, 0);

    let healthy = manager.relay_health(A).unwrap();
    assert_eq!(healthy.performance.success_count, 1);
    assert_eq!(
        healthy.performance.operations[&OperationKind::Write].success_count,
        1
    );
    assert!(healthy.performance.score > silent.performance.score);
}

#[tokio::test]
async fn test_rejection_is_a_failure() {
    let transport = MockTransport::new();
    transport.set_behavior(B, Behavior::Reject);
    let manager = manager_with(&transport, &[A, B], |_| {});

    let report = manager
        .publish(note("e1"), SelectionRequest::write(2))
        .await
        .unwrap();

    assert_eq!(report.accepted(), vec![A]);
    assert!(matches!(
        &report.outcomes[B],
        PublishOutcome::Rejected(message) if message.starts_with("blocked:")
    ));
    assert_eq!(manager.relay_health(B).unwrap().circuit.failure_count, 1);
}

#[tokio::test]
async fn test_all_relays_failed() {
    let transport = MockTransport::new();
    for url in [A, B] {
        transport.set_behavior(url, Behavior::Refuse);
    }
    let manager = manager_with(&transport, &[A, B], |_| {});

    match manager.publish(note("e1"), SelectionRequest::write(2)).await {
        Err(ClientError::AllRelaysFailed(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.values().all(|e| matches!(e, RelayError::Connection(_))));
        }
        other => panic!("expected AllRelaysFailed, got {other:?}"),
    }
    for url in [A, B] {
        let health = manager.relay_health(url).unwrap();
        assert_eq!(health.circuit.failure_count, 1);
        assert_eq!(health.performance.failure_count, 1);
    }
}

#[tokio::test]
async fn test_selection_exhausted_surfaces_immediately() {
    let transport = MockTransport::new();
    let manager = manager_with(&transport, &[A], |_| {});
    manager.remove_relay(A).unwrap();

    assert!(matches!(
        manager.publish(note("e1"), SelectionRequest::write(1)).await,
        Err(ClientError::SelectionExhausted)
    ));
    assert_eq!(transport.connect_count(A), 0);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_then_recovers_through_trial() {
    let transport = MockTransport::new();
    transport.set_behavior(C, Behavior::Silent);
    let manager = manager_with(&transport, &[A, B, C], |config| {
        config.circuit.reset_timeout_ms = 30_000;
    });

    for i in 0..3 {
        manager
            .publish(note(&format!("e{i}")), SelectionRequest::write(3))
            .await
            .unwrap();
    }
    let health = manager.relay_health(C).unwrap();
    assert_eq!(health.circuit.state, CircuitState::Open);
    assert_eq!(health.circuit.failure_count, 3);

    // Open circuit: excluded even though the caller asked for three relays
    let report = manager
        .publish(note("e3"), SelectionRequest::write(3))
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(!report.outcomes.contains_key(C));

    // After the reset timeout the relay comes back as a trial and closes on success
    transport.set_behavior(C, Behavior::Accept);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let report = manager
        .publish(note("e4"), SelectionRequest::write(3))
        .await
        .unwrap();
    assert_eq!(report.outcomes[C], PublishOutcome::Ok);

    let health = manager.relay_health(C).unwrap();
    assert_eq!(health.circuit.state, CircuitState::Closed);
    assert_eq!(health.circuit.failure_count, 0);
}

#[tokio::test]
async fn test_required_relay_always_selected() {
    let transport = MockTransport::new();
    transport.set_behavior(C, Behavior::Reject);
    let manager = manager_with(&transport, &[A, B], |_| {});
    manager
        .register_relay(RelayDescriptor::new(C).required())
        .unwrap();

    // Two rejections push the required relay's score well below the others
    for i in 0..2 {
        manager
            .publish(note(&format!("e{i}")), SelectionRequest::write(3))
            .await
            .unwrap();
    }
    let c_score = manager.relay_health(C).unwrap().performance.score;
    assert!(c_score < manager.relay_health(A).unwrap().performance.score);

    let report = manager
        .publish(note("e9"), SelectionRequest::write(1).min_score(60.0))
        .await;
    // Only the required relay fits the single slot, and it rejects
    match report {
        Err(ClientError::AllRelaysFailed(errors)) => {
            assert_eq!(errors.keys().collect::<Vec<_>>(), vec![C]);
        }
        other => panic!("expected the required relay to be chosen, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dropped_publish_still_records() {
    let transport = MockTransport::new();
    transport.set_behavior(A, Behavior::Silent);
    let manager = manager_with(&transport, &[A], |config| {
        config.publish_timeout_ms = 50;
    });

    let call = manager.publish(note("e1"), SelectionRequest::write(1));
    // Caller gives up before the relay answers
    let _ = tokio::time::timeout(Duration::from_millis(5), call).await;

    super::eventually(|| manager.relay_health(A).unwrap().performance.failure_count == 1).await;
    assert_eq!(manager.relay_health(A).unwrap().circuit.failure_count, 1);
}

#[tokio::test]
async fn test_same_event_in_flight_twice() {
    let transport = MockTransport::new();
    transport.set_behavior(A, Behavior::Silent);
    let manager = manager_with(&transport, &[A], |_| {});

    let sent_events = |count: usize| {
        let transport = transport.clone();
        move || {
            transport
                .received(A)
                .iter()
                .filter(|frame| frame.starts_with(r#"["EVENT""#))
                .count()
                == count
        }
    };
    let spawn_publish = || {
        let manager = manager.clone();
        tokio::spawn(async move { manager.publish(note("e1"), SelectionRequest::write(1)).await })
    };

    let first = spawn_publish();
    super::eventually(sent_events(1)).await;
    let second = spawn_publish();
    super::eventually(sent_events(2)).await;

    assert!(transport.inject(A, r#"["OK","e1",true,""]"#.to_string()));

    for call in [first, second] {
        let report = call.await.unwrap().unwrap();
        assert_eq!(report.outcomes[A], PublishOutcome::Ok);
    }
    let health = manager.relay_health(A).unwrap();
    assert_eq!(health.circuit.failure_count, 0);
    assert_eq!(health.performance.success_count, 2);
    assert_eq!(health.performance.failure_count, 0);
}
