use autolink_router::autolink::{
    AutolinkEvent, AutolinkSpec, Direction, Outcome, types::LegDirection,
};

use crate::support::{Harness, attach_for, payload, pump};

fn relay_through_out_autolink(count: usize) {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");

    let pumped = pump(
        &mut harness,
        (client, sender),
        (egress.connection, egress.link),
        count,
        100,
    );

    let expected: Vec<_> = (0..count).map(payload).collect();
    assert_eq!(pumped.received, expected, "messages arrive once and in order");
    let settled: Vec<_> = pumped.settled.iter().map(|(delivery, _)| *delivery).collect();
    assert_eq!(settled, pumped.sent, "every origin delivery settles in order");
    assert!(
        pumped
            .settled
            .iter()
            .all(|(_, outcome)| *outcome == Outcome::Accepted)
    );
    assert!(harness.violations().is_empty());
}

#[test]
fn given_out_autolink_when_one_message_is_sent_then_container_receives_it() {
    relay_through_out_autolink(1);
}

#[test]
fn given_out_autolink_when_275_messages_are_sent_then_all_settle() {
    relay_through_out_autolink(275);
}

#[test]
fn given_out_autolink_when_1000_messages_are_sent_then_all_settle() {
    relay_through_out_autolink(1000);
}

#[test]
fn given_in_autolink_when_container_sends_275_messages_then_client_receiver_gets_them() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::In,
        0,
    )]);
    let attaches = harness.bring_up();
    let ingress = attach_for(&attaches, "node.1", LegDirection::Ingress).clone();
    let client = harness.accept_client();
    let receiver = harness.open_link(client, LegDirection::Egress, "node.1");

    let pumped = pump(
        &mut harness,
        (ingress.connection, ingress.link),
        (client, receiver),
        275,
        50,
    );

    assert_eq!(pumped.received.len(), 275);
    assert_eq!(pumped.settled.len(), 275);
}

#[test]
fn given_waypoint_phase_between_two_containers_when_275_messages_flow_then_all_settle() {
    let mut harness = Harness::new(vec![
        AutolinkSpec::new("xfer.2", "container.2", Direction::In, 4),
        AutolinkSpec::new("xfer.2", "container.3", Direction::Out, 4),
    ]);
    let attaches = harness.bring_up();
    let from = attach_for(&attaches, "xfer.2#4", LegDirection::Ingress).clone();
    let to = attach_for(&attaches, "xfer.2#4", LegDirection::Egress).clone();
    assert_eq!(harness.binding_count(), 1);

    let pumped = pump(
        &mut harness,
        (from.connection, from.link),
        (to.connection, to.link),
        275,
        100,
    );

    let expected: Vec<_> = (0..275).map(payload).collect();
    assert_eq!(pumped.received, expected);
    let settled: Vec<_> = pumped.settled.iter().map(|(delivery, _)| *delivery).collect();
    assert_eq!(settled, pumped.sent);
}

#[test]
fn given_out_of_order_dispositions_when_relayed_then_origin_settles_in_order() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");
    harness.flow(egress.connection, egress.link, 10);

    let first = harness.transfer(client, sender, b"first");
    let second = harness.transfer(client, sender, b"second");
    let relayed = harness.transfers_on(egress.link);
    assert_eq!(relayed.len(), 2);
    assert_eq!(
        harness
            .executor
            .with_context(client, |context| context.unsettled(sender)),
        Some(2)
    );

    harness.dispose(egress.connection, egress.link, relayed[1].0, Outcome::Rejected);
    assert!(
        harness.settlements_on(sender).is_empty(),
        "second waits for first"
    );

    harness.dispose(egress.connection, egress.link, relayed[0].0, Outcome::Accepted);
    assert_eq!(
        harness.settlements_on(sender),
        vec![(first, Outcome::Accepted), (second, Outcome::Rejected)]
    );
}

#[test]
fn given_two_client_senders_when_one_autolink_is_configured_then_the_second_waits() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();

    let first_client = harness.accept_client();
    let first = harness.open_link(first_client, LegDirection::Ingress, "node.1");
    let second_client = harness.accept_client();
    let second = harness.open_link(second_client, LegDirection::Ingress, "node.1");
    assert_eq!(harness.binding_count(), 1);

    harness.flow(egress.connection, egress.link, 3);
    assert_eq!(harness.last_flow_on(first), Some(3));
    assert_eq!(harness.last_flow_on(second), None);

    harness.detach(first_client, first);
    assert_eq!(harness.binding_count(), 1, "the waiting sender takes over");
    assert_eq!(harness.last_flow_on(second), Some(3));
    assert!(harness.events().iter().any(|event| matches!(
        event,
        AutolinkEvent::BindingTorn { closed, .. } if *closed == first
    )));
}
