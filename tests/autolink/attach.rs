use autolink_router::autolink::{
    AutolinkEvent, AutolinkSpec, Direction, TransportCommand,
    types::{ErrorCondition, LegDirection},
};

use crate::support::{Harness, attach_for};

fn container_specs() -> Vec<AutolinkSpec> {
    vec![
        AutolinkSpec::new("node.1", "container.1", Direction::In, 0),
        AutolinkSpec::new("node.1", "container.1", Direction::Out, 0),
        AutolinkSpec::new("xfer.2", "container.1", Direction::In, 4),
    ]
}

#[test]
fn given_three_autolinks_on_one_container_when_connected_then_one_attach_per_spec() {
    let mut harness = Harness::new(container_specs());
    harness.router.start();

    let connects = harness.connect_requests();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].0, "container.1");

    let attaches = harness.establish(connects[0].1);
    assert_eq!(attaches.len(), 3);
    let mut links: Vec<_> = attaches.iter().map(|attach| attach.link).collect();
    links.sort();
    links.dedup();
    assert_eq!(links.len(), 3, "every attach needs its own link");

    let phased = attach_for(&attaches, "xfer.2#4", LegDirection::Ingress);
    assert_eq!(phased.request.name, "autolink:container.1:xfer.2#4:in");
    attach_for(&attaches, "node.1", LegDirection::Egress);

    for attach in &attaches {
        let address = attach.request.address.clone();
        harness.answer(attach, &address);
    }

    assert_eq!(harness.attached_count(connects[0].1), 3);
    let succeeded = harness
        .events()
        .into_iter()
        .filter(|event| matches!(event, AutolinkEvent::AttachSucceeded { .. }))
        .count();
    assert_eq!(succeeded, 3);
}

#[test]
fn given_pending_attach_when_remote_declares_another_address_then_autolink_never_attaches_or_binds()
{
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::Out,
        0,
    )]);
    harness.router.start();
    let (_, container) = harness.connect_requests()[0].clone();
    let attaches = harness.establish(container);

    let client = harness.accept_client();
    harness.open_link(client, LegDirection::Ingress, "node.1");

    harness.answer(&attaches[0], "node.2");

    let detaches = harness.take(|command| match command {
        TransportCommand::Detach {
            link,
            condition: Some(ErrorCondition::AddressMismatch { expected, actual }),
            ..
        } => Some((*link, expected.clone(), actual.clone())),
        _ => None,
    });
    assert_eq!(
        detaches,
        vec![(
            attaches[0].link,
            "node.1".to_string(),
            Some("node.2".to_string())
        )]
    );
    assert_eq!(harness.attached_count(container), 0);
    assert_eq!(harness.binding_count(), 0);
    assert!(harness.events().iter().any(|event| matches!(
        event,
        AutolinkEvent::AttachFailed { reason, .. } if reason.contains("node.2")
    )));
    assert!(
        !harness
            .events()
            .iter()
            .any(|event| matches!(event, AutolinkEvent::BindingFormed { .. }))
    );
}

#[test]
fn given_mismatched_attach_when_remote_answers_again_then_it_is_ignored() {
    let mut harness = Harness::new(vec![AutolinkSpec::new(
        "node.1",
        "container.1",
        Direction::In,
        0,
    )]);
    harness.router.start();
    let (_, container) = harness.connect_requests()[0].clone();
    let attaches = harness.establish(container);

    harness.answer(&attaches[0], "elsewhere");
    harness.answer(&attaches[0], "node.1");

    assert_eq!(harness.attached_count(container), 0);
}

#[test]
fn given_phased_autolink_when_remote_declares_plain_or_qualified_address_then_both_attach() {
    let mut harness = Harness::new(vec![
        AutolinkSpec::new("xfer.2", "container.2", Direction::In, 4),
        AutolinkSpec::new("xfer.2", "container.2", Direction::Out, 5),
    ]);
    harness.router.start();
    let (_, container) = harness.connect_requests()[0].clone();
    let attaches = harness.establish(container);

    let inbound = attach_for(&attaches, "xfer.2#4", LegDirection::Ingress).clone();
    let outbound = attach_for(&attaches, "xfer.2#5", LegDirection::Egress).clone();
    harness.answer(&inbound, "xfer.2#4");
    harness.answer(&outbound, "xfer.2");

    assert_eq!(harness.attached_count(container), 2);
}

#[test]
fn given_autolinks_on_two_containers_when_started_then_each_container_gets_its_own_connection() {
    let mut harness = Harness::new(vec![
        AutolinkSpec::new("xfer.2", "container.2", Direction::In, 4),
        AutolinkSpec::new("xfer.2", "container.3", Direction::Out, 4),
    ]);

    let attaches = harness.bring_up();

    assert_eq!(attaches.len(), 2);
    assert_ne!(attaches[0].connection, attaches[1].connection);
    assert_eq!(harness.router.context_count(), 2);
    assert_eq!(
        harness.binding_count(),
        1,
        "the two autolinks of the phase pair with each other"
    );
}
