use std::{collections::VecDeque, sync::Arc};

use autolink_router::autolink::{
    AutolinkEvent, AutolinkSpec, ConnectionId, Direction, ImmediateRetry, LinkId, Outcome,
    PairingPolicy, RouterOptions, types::LegDirection,
};

use proptest::prelude::*;

use crate::support::{Harness, attach_for, payload};

struct OutRoute {
    harness: Harness,
    container: ConnectionId,
    egress: LinkId,
    client: ConnectionId,
    sender: LinkId,
}

fn out_route(link_capacity: u32) -> OutRoute {
    let mut harness = Harness::with(
        vec![AutolinkSpec::new("node.1", "container.1", Direction::Out, 0)],
        RouterOptions {
            link_capacity,
            pairing_policy: PairingPolicy::Queue,
        },
        Arc::new(ImmediateRetry),
    );
    let attaches = harness.bring_up();
    let egress = attach_for(&attaches, "node.1", LegDirection::Egress).clone();
    let client = harness.accept_client();
    let sender = harness.open_link(client, LegDirection::Ingress, "node.1");

    OutRoute {
        harness,
        container: egress.connection,
        egress: egress.link,
        client,
        sender,
    }
}

#[test]
fn given_bound_sender_when_container_grants_credit_then_sender_never_sees_more_than_available() {
    let OutRoute {
        mut harness,
        container,
        egress,
        client,
        sender,
    } = out_route(250);
    assert_eq!(harness.last_flow_on(sender), None, "no credit before the receiver grants any");

    harness.flow(container, egress, 10);
    assert_eq!(harness.last_flow_on(sender), Some(10));

    for index in 0..4 {
        harness.transfer(client, sender, &payload(index));
        assert!(harness.advertised(client, sender) <= harness.egress_credit(container, egress));
    }
    assert_eq!(harness.advertised(client, sender), 6);
    assert_eq!(harness.egress_credit(container, egress), 6);
    assert_eq!(harness.transfers_on(egress).len(), 4);

    harness.flow(container, egress, 20);
    assert_eq!(harness.last_flow_on(sender), Some(20));
    assert!(harness.violations().is_empty());
}

#[test]
fn given_small_link_capacity_when_nothing_settles_then_credit_stops_at_capacity() {
    let OutRoute {
        mut harness,
        container,
        egress,
        client,
        sender,
    } = out_route(5);

    harness.flow(container, egress, 100);
    assert_eq!(harness.last_flow_on(sender), Some(5));

    for index in 0..5 {
        harness.transfer(client, sender, &payload(index));
    }
    assert_eq!(harness.advertised(client, sender), 0);

    let relayed = harness.transfers_on(egress);
    assert_eq!(relayed.len(), 5);
    harness.dispose(container, egress, relayed[0].0, Outcome::Accepted);

    assert_eq!(harness.last_flow_on(sender), Some(1));
    assert_eq!(harness.settlements_on(sender).len(), 1);
}

#[test]
fn given_receiver_reduces_credit_when_in_flight_transfers_arrive_then_they_are_accepted() {
    let OutRoute {
        mut harness,
        container,
        egress,
        client,
        sender,
    } = out_route(250);
    harness.flow(container, egress, 10);
    assert_eq!(harness.last_flow_on(sender), Some(10));

    harness.flow(container, egress, 2);
    assert_eq!(harness.last_flow_on(sender), Some(2));

    // The sender had not seen the reduction yet.
    for index in 0..5 {
        harness.transfer(client, sender, &payload(index));
    }
    assert!(harness.violations().is_empty());
    assert_eq!(harness.transfers_on(egress).len(), 2);

    harness.flow(container, egress, 10);
    assert_eq!(harness.transfers_on(egress).len(), 3, "backlog drains on new credit");
}

#[test]
fn given_no_credit_granted_when_sender_transfers_then_connection_closes_with_violation() {
    let OutRoute {
        mut harness,
        client,
        sender,
        ..
    } = out_route(250);

    harness.transfer(client, sender, b"unsolicited");

    assert_eq!(harness.violations(), vec![client]);
    assert!(harness.events().iter().any(|event| matches!(
        event,
        AutolinkEvent::ProtocolViolation { connection, link: Some(link), .. }
            if *connection == client && *link == sender
    )));
    assert_eq!(harness.binding_count(), 0);
}

#[test]
fn given_egress_autolink_when_container_grants_negative_credit_then_connection_closes() {
    let OutRoute {
        mut harness,
        container,
        egress,
        ..
    } = out_route(250);

    harness.flow(container, egress, -1);

    assert_eq!(harness.violations(), vec![container]);
}

#[derive(Debug, Clone)]
enum RouteStep {
    Grant(i64),
    Send,
    Accept(usize),
}

fn route_step() -> impl Strategy<Value = RouteStep> {
    prop_oneof![
        1 => (0_i64..30).prop_map(RouteStep::Grant),
        3 => Just(RouteStep::Send),
        2 => (1_usize..6).prop_map(RouteStep::Accept),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn given_random_grants_sends_and_accepts_then_advertised_credit_stays_within_receiver_credit(
        steps in prop::collection::vec(route_step(), 1..150)
    ) {
        let OutRoute {
            mut harness,
            container,
            egress,
            client,
            sender,
        } = out_route(8);
        let mut credit = 0_u32;
        let mut pending = VecDeque::new();
        let mut accepted = 0_usize;

        for step in steps {
            match step {
                RouteStep::Grant(granted) => harness.flow(container, egress, granted),
                RouteStep::Send => {
                    if let Some(granted) = harness.last_flow_on(sender) {
                        credit = granted;
                    }
                    if credit > 0 {
                        harness.transfer(client, sender, &payload(accepted + pending.len()));
                        credit -= 1;
                    }
                }
                RouteStep::Accept(count) => {
                    pending.extend(harness.transfers_on(egress));
                    for _ in 0..count {
                        let Some((delivery, _)) = pending.pop_front() else {
                            break;
                        };
                        harness.dispose(container, egress, delivery, Outcome::Accepted);
                        accepted += 1;
                    }
                }
            }

            prop_assert!(
                harness.advertised(client, sender) <= harness.egress_credit(container, egress)
            );
            prop_assert!(harness.advertised(client, sender) <= 8);
            prop_assert!(harness.violations().is_empty());
        }

        prop_assert_eq!(harness.settlements_on(sender).len(), accepted);
    }
}
