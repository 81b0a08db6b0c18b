use std::sync::Arc;

use autolink_router::autolink::{
    AutolinkEvent, AutolinkSpec, Direction, ExponentialBackoff, ImmediateRetry, RouterOptions,
    TransportEvent, types::LegDirection,
};

use crate::support::{Harness, attach_for};

fn specs(count: usize) -> Vec<AutolinkSpec> {
    (0..count)
        .map(|index| {
            let direction = if index % 2 == 0 {
                Direction::In
            } else {
                Direction::Out
            };
            AutolinkSpec::new(format!("node.{}", index / 2), "container.1", direction, 0)
        })
        .collect()
}

#[test]
fn given_container_with_four_autolinks_when_connection_drops_then_four_attachments_after_reconnect()
{
    let mut harness = Harness::with(specs(4), RouterOptions::default(), Arc::new(ImmediateRetry));
    let first = harness.bring_up();
    let old_connection = first[0].connection;
    assert_eq!(harness.attached_count(old_connection), 4);

    harness.close(old_connection);

    let reconnects = harness.connect_requests();
    assert_eq!(reconnects.len(), 1, "immediate retry reconnects at once");
    let (container_id, new_connection) = reconnects[0].clone();
    assert_eq!(container_id, "container.1");
    assert_ne!(new_connection, old_connection);

    let attaches = harness.establish(new_connection);
    assert_eq!(attaches.len(), 4);
    for attach in &attaches {
        assert!(
            first.iter().all(|old| old.link != attach.link),
            "reattach uses fresh links"
        );
        let address = attach.request.address.clone();
        harness.answer(attach, &address);
    }

    assert_eq!(harness.attached_count(new_connection), 4);
    assert_eq!(
        harness
            .router
            .supervisor()
            .state("container.1")
            .map(|entry| entry.attempts),
        Some(0),
        "a successful connection resets the attempt counter"
    );
    let events = harness.events();
    assert!(events.iter().any(|event| matches!(
        event,
        AutolinkEvent::ConnectionLost { connection, .. } if *connection == old_connection
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        AutolinkEvent::ReconnectScheduled { attempt: 1, .. }
    )));
}

#[test]
fn given_backoff_strategy_when_connection_drops_then_reconnect_waits_for_the_delay() {
    let mut harness = Harness::with(
        specs(1),
        RouterOptions::default(),
        Arc::new(ExponentialBackoff::new(100, 1_000)),
    );
    let first = harness.bring_up();

    harness.close(first[0].connection);

    assert!(harness.connect_requests().is_empty());
    let scheduled = harness.router.take_scheduled_reconnects();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].container_id, "container.1");
    assert!(!scheduled[0].delay.is_zero());

    let connection = harness
        .router
        .reconnect_due("container.1")
        .expect("reconnect should be requested once due");
    assert_eq!(harness.connect_requests(), vec![("container.1".to_string(), connection)]);
    assert_eq!(harness.router.reconnect_due("container.1"), None);
}

#[test]
fn given_failed_connect_when_retry_fires_then_attempt_counter_grows() {
    let mut harness = Harness::with(
        specs(1),
        RouterOptions::default(),
        Arc::new(ExponentialBackoff::new(100, 1_000)),
    );
    harness.router.start();
    let (_, connection) = harness.connect_requests()[0].clone();

    harness.deliver(TransportEvent::ConnectFailed {
        connection,
        reason: "connection refused".to_string(),
    });
    let retry = harness
        .router
        .reconnect_due("container.1")
        .expect("retry should be requested");
    harness.deliver(TransportEvent::ConnectFailed {
        connection: retry,
        reason: "connection refused".to_string(),
    });

    let attempts: Vec<u32> = harness
        .events()
        .into_iter()
        .filter_map(|event| match event {
            AutolinkEvent::ReconnectScheduled { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[test]
fn given_bound_client_sender_when_container_reconnects_then_binding_reforms() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    let first = harness.bring_up();
    let egress = attach_for(&first, "node.1", LegDirection::Egress).clone();

    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 5);
    assert_eq!(harness.last_flow_on(sender), Some(5));

    harness.close(egress.connection);
    assert_eq!(harness.last_flow_on(sender), Some(0));
    assert_eq!(harness.binding_count(), 0);

    let (_, connection) = harness.connect_requests()[0].clone();
    let attaches = harness.establish(connection);
    harness.answer(&attaches[0], "node.1");
    assert_eq!(harness.binding_count(), 1);

    harness.flow(connection, attaches[0].link, 7);
    assert_eq!(harness.last_flow_on(sender), Some(7));
}

#[test]
fn given_transfer_sent_before_revoke_when_binding_reforms_then_it_is_relayed_not_rejected() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    let first = harness.bring_up();
    let egress = attach_for(&first, "node.1", LegDirection::Egress).clone();

    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 10);
    assert_eq!(harness.last_flow_on(sender), Some(10));

    harness.close(egress.connection);
    assert_eq!(harness.last_flow_on(sender), Some(0));

    let (_, connection) = harness.connect_requests()[0].clone();
    let attaches = harness.establish(connection);
    harness.answer(&attaches[0], "node.1");
    assert_eq!(harness.binding_count(), 1);

    // Sent against the credit granted before the container dropped.
    harness.transfer(client, sender, b"in flight");
    assert!(harness.violations().is_empty());

    harness.flow(connection, attaches[0].link, 5);
    let relayed = harness.transfers_on(attaches[0].link);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].1, b"in flight".to_vec());
}
