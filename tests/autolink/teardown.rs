use autolink_router::autolink::{
    AutolinkEvent, AutolinkSpec, Direction, Outcome, TransportCommand, types::LegDirection,
};

use crate::support::{Harness, attach_for, payload};

fn out_autolink() -> Harness {
    Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )])
}

#[test]
fn given_deliveries_in_flight_when_client_sender_closes_then_late_dispositions_are_dropped() {
    let mut harness = out_autolink();
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 10);
    for index in 0..10 {
        harness.transfer(client, sender, &payload(index));
    }
    let relayed = harness.transfers_on(egress.link);
    assert_eq!(relayed.len(), 10);

    harness.close(client);
    for (delivery, _) in &relayed {
        harness.dispose(egress.connection, egress.link, *delivery, Outcome::Accepted);
    }
    harness.flow(egress.connection, egress.link, 10);

    assert_eq!(
        harness.settlements_on(egress.link).len(),
        10,
        "the container still gets its dispositions acknowledged"
    );
    let dropped = harness
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                AutolinkEvent::DeliveryDropped {
                    reason: "origin_closed",
                    ..
                }
            )
        })
        .count();
    assert_eq!(dropped, 10);
    assert!(harness.violations().is_empty());

    let next_client = harness.accept_client();
    let next_sender = harness.open_link(next_client, LegDirection::Ingress, "node.1");
    assert_eq!(harness.binding_count(), 1);
    assert_eq!(harness.last_flow_on(next_sender), Some(10));
}

#[test]
fn given_bound_sender_when_autolink_detaches_then_credit_is_revoked_within_one_step() {
    let mut harness = out_autolink();
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 10);
    assert_eq!(harness.last_flow_on(sender), Some(10));
    let pending = harness.transfer(client, sender, b"pending");

    harness.detach(egress.connection, egress.link);

    assert_eq!(harness.last_flow_on(sender), Some(0));
    assert_eq!(
        harness.settlements_on(sender),
        vec![(pending, Outcome::Released)]
    );
    assert!(harness.events().iter().any(|event| matches!(
        event,
        AutolinkEvent::DeliveryReleased { delivery, .. } if *delivery == pending
    )));
    assert_eq!(harness.binding_count(), 0);
}

#[test]
fn given_revoked_credit_when_in_flight_transfers_arrive_then_they_are_released() {
    let mut harness = out_autolink();
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 4);

    harness.close(egress.connection);
    let late = harness.transfer(client, sender, b"late");

    assert!(harness.violations().is_empty());
    assert_eq!(harness.settlements_on(sender), vec![(late, Outcome::Released)]);
}

#[test]
fn given_client_closes_when_autolink_outlives_it_then_router_keeps_both_contexts_consistent() {
    let mut harness = out_autolink();
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    assert_eq!(harness.router.context_count(), 2);
    assert_eq!(
        harness
            .executor
            .with_context(client, |context| (context.leg_count(), context.is_bound(sender))),
        Some((1, true))
    );

    harness.close(client);

    assert_eq!(harness.router.context_count(), 1);
    assert_eq!(harness.binding_count(), 0);
    assert_eq!(harness.attached_count(egress.connection), 1);
    assert_eq!(
        harness
            .executor
            .with_context(egress.connection, |context| context.is_bound(egress.link)),
        Some(false)
    );
    assert!(
        harness
            .executor
            .with_context(client, |context| context.is_closed())
            .expect("context was launched")
    );
}

#[test]
fn given_running_router_when_shut_down_then_every_container_connection_is_closed() {
    let mut harness = Harness::new(vec![
        AutolinkSpec::new("xfer.2", "container.2", Direction::In, 4),
        AutolinkSpec::new("xfer.2", "container.3", Direction::Out, 4),
    ]);
    harness.bring_up();

    harness.router.shutdown();
    harness.executor.run_until_idle();

    let closed = harness.take(|command| match command {
        TransportCommand::Close { connection, .. } => {
            Some(*connection)
        }
        _ => None,
    });
    assert_eq!(closed.len(), 2);
    assert_eq!(harness.binding_count(), 0);
    assert!(harness.connect_requests().is_empty());
}
