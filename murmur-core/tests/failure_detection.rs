#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use murmur_core::event::{EventBus, GossipEvent};
use murmur_core::failure::PhiAccrualDetector;

/// A peer heartbeating on a steady rhythm, then going silent: suspicion
/// after phi crosses the threshold, failure only after the suspicion level
/// reaches `phi_threshold * suspicion_multiplier` further checks.
#[tokio::test]
async fn sustained_silence_walks_suspected_then_failed() {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let detector = PhiAccrualDetector::new(
        8.0,
        2.0,
        100,
        Duration::from_millis(10),
        false,
        events,
    );

    // Establish a ~50ms rhythm.
    for _ in 0..20 {
        detector.heartbeat("node-p");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!detector.is_suspected("node-p"));

    // Roughly five missed intervals of silence.
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Phi keeps growing with silence until the peer is suspected.
    let mut previous_phi = 0.0;
    let mut checks = 0;
    while !detector.is_suspected("node-p") {
        assert!(detector.check().is_empty());
        let phi = detector.phi("node-p").unwrap();
        assert!(phi >= previous_phi, "phi regressed during silence");
        previous_phi = phi;
        checks += 1;
        assert!(checks < 50, "peer was never suspected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Failure is declared after threshold * multiplier further checks, and
    // the tracking record is discarded.
    let failure_level = (8.0_f64 * 2.0) as usize;
    let mut failed = Vec::new();
    for _ in 0..=failure_level {
        failed = detector.check();
        if !failed.is_empty() {
            break;
        }
    }
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].peer_id, "node-p");
    assert!(failed[0].phi > 8.0);
    assert!(detector.phi("node-p").is_none());

    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        if let GossipEvent::PeerFailed { peer_id, phi } = event {
            assert_eq!(peer_id, "node-p");
            assert!(phi > 8.0);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

/// A heartbeat from a suspected peer clears suspicion instead of letting the
/// suspicion level keep accruing.
#[tokio::test]
async fn flapping_peer_recovers_on_heartbeat() {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let detector = PhiAccrualDetector::new(
        8.0,
        2.0,
        100,
        Duration::from_millis(10),
        false,
        events,
    );

    for _ in 0..10 {
        detector.heartbeat("node-p");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut checks = 0;
    while !detector.is_suspected("node-p") {
        detector.check();
        checks += 1;
        assert!(checks < 50, "peer was never suspected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    detector.heartbeat("node-p");
    assert!(!detector.is_suspected("node-p"));

    let mut recovered = false;
    while let Ok(event) = rx.try_recv() {
        if let GossipEvent::PeerRecovered { peer_id } = event {
            assert_eq!(peer_id, "node-p");
            recovered = true;
        }
    }
    assert!(recovered);
    // The window survives recovery; the peer is still tracked.
    assert!(detector.phi("node-p").is_some());
}
