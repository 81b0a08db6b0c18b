use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use tokio::sync::mpsc;

use crate::autolink::{
    attach::{AttachManager, AttachOutcome},
    binding::{LegRef, Registration, RouteBinding},
    credit::{CreditRelay, EgressCredit},
    error::{AutolinkError, protocol_violation},
    observability::AutolinkEvent,
    ports::{TransportCommand, TransportEvent},
    router::RouterShared,
    settlement::{RelayedDeliveries, SettlementPropagator},
    types::{
        AddressKey, BindingId, ConnectionId, ContainerId, DeliveryId, ErrorCondition,
        LegDirection, LegSide, LinkId, Outcome,
    },
};

/// Cross-context messages. They are the only way one context affects a leg
/// owned by another.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    BindingFormed(Arc<RouteBinding>),
    BindingTorn {
        binding: Arc<RouteBinding>,
        closed: LinkId,
    },
    Deliver {
        binding: BindingId,
        origin: DeliveryId,
        payload: Vec<u8>,
    },
    CreditReport {
        binding: BindingId,
        credit: u32,
        delivered: u64,
    },
    /// Sent by a newly bound ingress leg; the egress answers with a report.
    CreditRequest {
        binding: BindingId,
    },
    Settle {
        binding: BindingId,
        origin: DeliveryId,
        outcome: Outcome,
    },
}

#[derive(Debug, Clone)]
pub enum ContextInput {
    Transport(TransportEvent),
    Relay(RelayMessage),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ContextHandle {
    sender: mpsc::UnboundedSender<ContextInput>,
}

impl ContextHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ContextInput>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn post(&self, input: ContextInput) -> bool {
        self.sender.send(input).is_ok()
    }

    pub fn post_transport(&self, event: TransportEvent) -> bool {
        self.post(ContextInput::Transport(event))
    }

    pub fn post_relay(&self, message: RelayMessage) -> bool {
        self.post(ContextInput::Relay(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextKind {
    Normal,
    Container { container_id: ContainerId },
}

#[derive(Debug)]
enum LegRelay {
    Ingress {
        binding: Arc<RouteBinding>,
        credit: CreditRelay,
        settlement: SettlementPropagator,
    },
    Egress {
        binding: Arc<RouteBinding>,
        relayed: RelayedDeliveries,
        delivered: u64,
    },
}

impl LegRelay {
    fn binding(&self) -> &Arc<RouteBinding> {
        match self {
            LegRelay::Ingress { binding, .. } | LegRelay::Egress { binding, .. } => binding,
        }
    }
}

#[derive(Debug)]
struct Leg {
    key: AddressKey,
    direction: LegDirection,
    side: LegSide,
    peer_credit: EgressCredit,
    relay: Option<LegRelay>,
    /// Transfers the remote may still send against credit that was revoked.
    grace: u32,
    /// Outbound deliveries whose origin leg is gone.
    orphaned: HashSet<DeliveryId>,
}

impl Leg {
    fn new(key: AddressKey, direction: LegDirection, side: LegSide) -> Self {
        Self {
            key,
            direction,
            side,
            peer_credit: EgressCredit::default(),
            relay: None,
            grace: 0,
            orphaned: HashSet::new(),
        }
    }

    fn bound_to(&self, binding: BindingId) -> bool {
        self.relay
            .as_ref()
            .is_some_and(|relay| relay.binding().id == binding)
    }
}

/// Everything that happens on one connection, processed sequentially. Owns
/// the connection's legs and their relay state; peers are reached only
/// through their [`ContextHandle`].
pub struct ConnectionContext {
    connection: ConnectionId,
    kind: ContextKind,
    shared: Arc<RouterShared>,
    handle: ContextHandle,
    inbox: mpsc::UnboundedReceiver<ContextInput>,
    attach: Option<AttachManager>,
    legs: BTreeMap<LinkId, Leg>,
    closed: bool,
}

impl ConnectionContext {
    pub fn new(connection: ConnectionId, kind: ContextKind, shared: Arc<RouterShared>) -> Self {
        let (handle, inbox) = ContextHandle::channel();
        let attach = match &kind {
            ContextKind::Container { container_id } => Some(AttachManager::new(
                container_id.clone(),
                connection,
                Arc::clone(&shared.transport),
                Arc::clone(&shared.sink),
            )),
            ContextKind::Normal => None,
        };

        Self {
            connection,
            kind,
            shared,
            handle,
            inbox,
            attach,
            legs: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn attachments(&self) -> Option<&AttachManager> {
        self.attach.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }

    pub fn is_bound(&self, link: LinkId) -> bool {
        self.legs.get(&link).is_some_and(|leg| leg.relay.is_some())
    }

    pub fn advertised_credit(&self, link: LinkId) -> Option<u32> {
        match self.legs.get(&link)?.relay.as_ref()? {
            LegRelay::Ingress { credit, .. } => Some(credit.advertised()),
            LegRelay::Egress { .. } => None,
        }
    }

    pub fn egress_credit(&self, link: LinkId) -> Option<u32> {
        let leg = self.legs.get(&link)?;
        (leg.direction == LegDirection::Egress).then(|| leg.peer_credit.available())
    }

    pub fn unsettled(&self, link: LinkId) -> usize {
        match self.legs.get(&link).and_then(|leg| leg.relay.as_ref()) {
            Some(LegRelay::Ingress { settlement, .. }) => settlement.unsettled(),
            Some(LegRelay::Egress { relayed, .. }) => {
                relayed.in_flight() + relayed.backlog_len()
            }
            None => 0,
        }
    }

    pub fn start(&mut self) {
        if let Some(attach) = self.attach.as_mut() {
            attach.start(&self.shared.registry, &self.shared.ids);
        }
    }

    pub async fn run(mut self) {
        while let Some(input) = self.inbox.recv().await {
            self.handle_input(input);
            if self.closed {
                break;
            }
        }
        tracing::debug!(
            target: "router",
            connection = %self.connection,
            "connection_context_stopped"
        );
    }

    pub fn poll_pending(&mut self) -> usize {
        let mut handled = 0;
        while !self.closed {
            let Ok(input) = self.inbox.try_recv() else {
                break;
            };
            self.handle_input(input);
            handled += 1;
        }
        handled
    }

    pub fn handle_input(&mut self, input: ContextInput) {
        if self.closed {
            return;
        }
        match input {
            ContextInput::Transport(event) => self.on_transport(event),
            ContextInput::Relay(message) => self.on_relay(message),
            ContextInput::Shutdown => self.close_local(),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkAttached {
                link,
                remote_source,
                remote_target,
                ..
            } => self.on_link_attached(link, remote_source, remote_target),
            TransportEvent::LinkOpened {
                link,
                direction,
                address,
                ..
            } => self.on_link_opened(link, direction, &address),
            TransportEvent::LinkDetached { link, .. } => {
                if let Some(attach) = self.attach.as_mut() {
                    attach.on_detached(link);
                }
                self.close_leg(link);
            }
            TransportEvent::Flow { link, credit, .. } => self.on_flow(link, credit),
            TransportEvent::Transfer {
                link,
                delivery,
                payload,
                ..
            } => self.on_transfer(link, delivery, payload),
            TransportEvent::Disposition {
                link,
                delivery,
                outcome,
                ..
            } => self.on_disposition(link, delivery, outcome),
            TransportEvent::ConnectionClosed { .. } | TransportEvent::ConnectFailed { .. } => {
                self.close_local()
            }
            TransportEvent::ConnectionEstablished { .. }
            | TransportEvent::ConnectionAccepted { .. } => {}
        }
    }

    fn on_link_attached(
        &mut self,
        link: LinkId,
        remote_source: Option<String>,
        remote_target: Option<String>,
    ) {
        let Some(attach) = self.attach.as_mut() else {
            tracing::debug!(
                target: "attach",
                connection = %self.connection,
                link = %link,
                "unexpected_attach_response"
            );
            return;
        };

        match attach.on_remote_attach(link, remote_source.as_deref(), remote_target.as_deref()) {
            Some(AttachOutcome::Attached(attachment)) => {
                self.legs.insert(
                    link,
                    Leg::new(
                        attachment.spec.key(),
                        attachment.spec.leg_direction(),
                        LegSide::Autolink,
                    ),
                );
                self.register(link);
            }
            Some(AttachOutcome::Mismatch(_)) | None => {}
        }
    }

    fn on_link_opened(&mut self, link: LinkId, direction: LegDirection, address: &str) {
        let key = AddressKey::parse(address);
        if !self.shared.registry.handles(&key.address) {
            tracing::debug!(
                target: "router",
                connection = %self.connection,
                link = %link,
                address = %address,
                "link_not_waypoint_address"
            );
            return;
        }
        if self.legs.contains_key(&link) {
            return;
        }

        self.legs
            .insert(link, Leg::new(key, direction, LegSide::Normal));
        self.register(link);
    }

    fn register(&mut self, link: LinkId) {
        let Some(leg) = self.legs.get(&link) else {
            return;
        };
        let key = leg.key.clone();
        let leg_ref = LegRef {
            link,
            connection: self.connection,
            direction: leg.direction,
            side: leg.side,
            mailbox: self.handle.clone(),
        };

        if let Registration::Rejected = self.shared.bindings.register(key.clone(), leg_ref) {
            self.legs.remove(&link);
            self.shared.transport.submit(TransportCommand::Detach {
                connection: self.connection,
                link,
                condition: Some(ErrorCondition::PairingRejected {
                    address: key.qualified(),
                }),
            });
        }
    }

    fn close_leg(&mut self, link: LinkId) {
        let Some(leg) = self.legs.remove(&link) else {
            return;
        };
        self.shared.bindings.unregister(link);

        if let Some(LegRelay::Egress { relayed, .. }) = leg.relay
            && (relayed.in_flight() > 0 || relayed.backlog_len() > 0)
        {
            tracing::debug!(
                target: "relay",
                connection = %self.connection,
                link = %link,
                in_flight = relayed.in_flight(),
                backlog = relayed.backlog_len(),
                "egress_leg_closed_with_deliveries"
            );
        }
    }

    fn close_local(&mut self) {
        if self.closed {
            return;
        }
        let links: Vec<_> = self.legs.keys().copied().collect();
        for link in links {
            self.close_leg(link);
        }
        if let Some(attach) = self.attach.as_mut() {
            attach.cancel_all();
        }
        self.closed = true;
        tracing::debug!(
            target: "router",
            connection = %self.connection,
            "connection_context_closed"
        );
    }

    fn violation(&mut self, link: Option<LinkId>, err: AutolinkError) {
        self.shared.transport.submit(TransportCommand::Close {
            connection: self.connection,
            condition: Some(ErrorCondition::ProtocolViolation {
                detail: err.message.clone(),
            }),
        });
        self.shared.sink.on_event(AutolinkEvent::ProtocolViolation {
            connection: self.connection,
            link,
            detail: err.message,
        });
        self.close_local();
    }

    fn flow(&self, link: LinkId, credit: u32) {
        self.shared.transport.submit(TransportCommand::Flow {
            connection: self.connection,
            link,
            credit,
        });
    }

    fn on_flow(&mut self, link: LinkId, credit: i64) {
        let Some(leg) = self.legs.get_mut(&link) else {
            return;
        };
        if leg.direction == LegDirection::Ingress {
            self.violation(
                Some(link),
                protocol_violation("flow received on a receiving link"),
            );
            return;
        }
        if let Err(err) = leg.peer_credit.on_flow(credit) {
            self.violation(Some(link), err);
            return;
        }

        let connection = self.connection;
        let mut transfers = Vec::new();
        let mut report = None;
        if let Some(LegRelay::Egress {
            binding,
            relayed,
            delivered,
        }) = leg.relay.as_mut()
        {
            while relayed.backlog_len() > 0 && leg.peer_credit.try_consume() {
                let Some((origin, payload)) = relayed.pop_backlog() else {
                    break;
                };
                let outbound = self.shared.ids.delivery();
                relayed.insert(outbound, origin);
                transfers.push(TransportCommand::Transfer {
                    connection,
                    link,
                    delivery: outbound,
                    payload,
                });
            }
            report = Some((
                Arc::clone(binding),
                RelayMessage::CreditReport {
                    binding: binding.id,
                    credit: leg.peer_credit.available(),
                    delivered: *delivered,
                },
            ));
        }

        for transfer in transfers {
            self.shared.transport.submit(transfer);
        }
        if let Some((binding, message)) = report {
            binding.ingress.mailbox.post_relay(message);
        }
    }

    fn on_transfer(&mut self, link: LinkId, delivery: DeliveryId, payload: Vec<u8>) {
        let Some(leg) = self.legs.get_mut(&link) else {
            return;
        };
        if leg.direction == LegDirection::Egress {
            self.violation(
                Some(link),
                protocol_violation("transfer received on a sending link"),
            );
            return;
        }

        let Some(LegRelay::Ingress {
            binding,
            credit,
            settlement,
        }) = leg.relay.as_mut()
        else {
            if leg.grace > 0 {
                leg.grace -= 1;
                self.shared.transport.submit(TransportCommand::Settle {
                    connection: self.connection,
                    link,
                    delivery,
                    outcome: Outcome::Released,
                });
                return;
            }
            self.violation(
                Some(link),
                protocol_violation(
                    "transfer received on an unbound link",
                ),
            );
            return;
        };

        let flow = match credit.on_transfer() {
            Ok(flow) => flow,
            Err(err) => {
                self.violation(Some(link), err);
                return;
            }
        };
        settlement.track(delivery);
        let binding = Arc::clone(binding);

        binding.egress.mailbox.post_relay(RelayMessage::Deliver {
            binding: binding.id,
            origin: delivery,
            payload,
        });
        if let Some(credit) = flow {
            self.flow(link, credit);
        }
    }

    fn on_disposition(&mut self, link: LinkId, delivery: DeliveryId, outcome: Outcome) {
        let Some(leg) = self.legs.get_mut(&link) else {
            return;
        };

        let origin = match leg.relay.as_mut() {
            Some(LegRelay::Egress {
                binding, relayed, ..
            }) => relayed
                .remove(delivery)
                .map(|origin| (Arc::clone(binding), origin)),
            _ => None,
        };

        if let Some((binding, origin)) = origin {
            self.settle(link, delivery, outcome);
            binding.ingress.mailbox.post_relay(RelayMessage::Settle {
                binding: binding.id,
                origin,
                outcome,
            });
        } else if leg.orphaned.remove(&delivery) {
            self.settle(link, delivery, outcome);
            self.shared.sink.on_event(AutolinkEvent::DeliveryDropped {
                link,
                delivery: Some(delivery),
                reason: "origin_closed",
            });
        } else {
            tracing::debug!(
                target: "relay",
                connection = %self.connection,
                link = %link,
                delivery = %delivery,
                "disposition_for_unknown_delivery"
            );
        }
    }

    fn settle(&self, link: LinkId, delivery: DeliveryId, outcome: Outcome) {
        self.shared.transport.submit(TransportCommand::Settle {
            connection: self.connection,
            link,
            delivery,
            outcome,
        });
    }

    fn on_relay(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::BindingFormed(binding) => self.on_binding_formed(binding),
            RelayMessage::BindingTorn { binding, closed } => self.on_binding_torn(binding, closed),
            RelayMessage::Deliver {
                binding,
                origin,
                payload,
            } => self.on_deliver(binding, origin, payload),
            RelayMessage::CreditReport {
                binding,
                credit,
                delivered,
            } => self.on_credit_report(binding, credit, delivered),
            RelayMessage::CreditRequest { binding } => self.on_credit_request(binding),
            RelayMessage::Settle {
                binding,
                origin,
                outcome,
            } => self.on_settle(binding, origin, outcome),
        }
    }

    fn on_binding_formed(&mut self, binding: Arc<RouteBinding>) {
        let capacity = self.shared.link_capacity;
        let ours = [binding.ingress.clone(), binding.egress.clone()]
            .into_iter()
            .find(|leg| leg.connection == self.connection && self.legs.contains_key(&leg.link));
        let Some(ours) = ours else {
            return;
        };
        let Some(leg) = self.legs.get_mut(&ours.link) else {
            return;
        };

        match ours.direction {
            LegDirection::Ingress => {
                let grace = std::mem::take(&mut leg.grace);
                leg.relay = Some(LegRelay::Ingress {
                    binding: Arc::clone(&binding),
                    credit: CreditRelay::with_grace(capacity, grace),
                    settlement: SettlementPropagator::new(),
                });
                binding
                    .egress
                    .mailbox
                    .post_relay(RelayMessage::CreditRequest { binding: binding.id });
            }
            LegDirection::Egress => {
                let credit = leg.peer_credit.available();
                leg.relay = Some(LegRelay::Egress {
                    binding: Arc::clone(&binding),
                    relayed: RelayedDeliveries::default(),
                    delivered: 0,
                });
                binding.ingress.mailbox.post_relay(RelayMessage::CreditReport {
                    binding: binding.id,
                    credit,
                    delivered: 0,
                });
            }
        }
        tracing::debug!(
            target: "relay",
            connection = %self.connection,
            link = %ours.link,
            binding = %binding.id,
            "leg_bound"
        );
    }

    fn on_binding_torn(&mut self, binding: Arc<RouteBinding>, closed: LinkId) {
        let Some(survivor) = binding.peer_of(closed) else {
            return;
        };
        let link = survivor.link;
        let connection = self.connection;
        let Some(leg) = self.legs.get_mut(&link) else {
            return;
        };
        if !leg.bound_to(binding.id) {
            return;
        }

        let mut commands = Vec::new();
        let mut events = Vec::new();
        match leg.relay.take() {
            Some(LegRelay::Ingress {
                mut credit,
                mut settlement,
                ..
            }) => {
                if let Some(zero) = credit.revoke() {
                    commands.push(TransportCommand::Flow {
                        connection,
                        link,
                        credit: zero,
                    });
                }
                leg.grace = leg.grace.saturating_add(credit.grace());

                for (delivery, state) in settlement.abandon() {
                    let outcome = match state.outcome() {
                        Some(outcome) => outcome,
                        None => {
                            events.push(AutolinkEvent::DeliveryReleased {
                                binding: binding.id,
                                link,
                                delivery,
                            });
                            Outcome::Released
                        }
                    };
                    commands.push(TransportCommand::Settle {
                        connection,
                        link,
                        delivery,
                        outcome,
                    });
                }
            }
            Some(LegRelay::Egress { mut relayed, .. }) => {
                let (outbound, unsent) = relayed.orphan();
                leg.orphaned.extend(outbound);
                for origin in unsent {
                    events.push(AutolinkEvent::DeliveryDropped {
                        link,
                        delivery: Some(origin),
                        reason: "origin_closed",
                    });
                }
            }
            None => {}
        }

        tracing::debug!(
            target: "relay",
            connection = %connection,
            link = %link,
            binding = %binding.id,
            closed = %closed,
            "leg_unbound"
        );
        for command in commands {
            self.shared.transport.submit(command);
        }
        for event in events {
            self.shared.sink.on_event(event);
        }
    }

    fn on_deliver(&mut self, binding: BindingId, origin: DeliveryId, payload: Vec<u8>) {
        let connection = self.connection;
        let Some((link, leg)) = self
            .legs
            .iter_mut()
            .find(|(_, leg)| leg.bound_to(binding))
        else {
            return;
        };
        let link = *link;
        let Some(LegRelay::Egress {
            relayed, delivered, ..
        }) = leg.relay.as_mut()
        else {
            return;
        };

        *delivered += 1;
        if relayed.backlog_len() == 0 && leg.peer_credit.try_consume() {
            let outbound = self.shared.ids.delivery();
            relayed.insert(outbound, origin);
            self.shared.transport.submit(TransportCommand::Transfer {
                connection,
                link,
                delivery: outbound,
                payload,
            });
        } else {
            relayed.push_backlog(origin, payload);
        }
    }

    fn on_credit_report(&mut self, binding: BindingId, egress_credit: u32, delivered: u64) {
        let Some((link, leg)) = self
            .legs
            .iter_mut()
            .find(|(_, leg)| leg.bound_to(binding))
        else {
            return;
        };
        let link = *link;
        let Some(LegRelay::Ingress { credit, .. }) = leg.relay.as_mut() else {
            return;
        };

        if let Some(advertised) = credit.on_egress_report(egress_credit, delivered) {
            tracing::trace!(
                target: "relay",
                link = %link,
                credit = advertised,
                "ingress_credit_updated"
            );
            self.flow(link, advertised);
        }
    }

    fn on_credit_request(&mut self, binding: BindingId) {
        let Some(leg) = self.legs.values().find(|leg| leg.bound_to(binding)) else {
            return;
        };
        let Some(LegRelay::Egress {
            binding, delivered, ..
        }) = leg.relay.as_ref()
        else {
            return;
        };

        binding.ingress.mailbox.post_relay(RelayMessage::CreditReport {
            binding: binding.id,
            credit: leg.peer_credit.available(),
            delivered: *delivered,
        });
    }

    fn on_settle(&mut self, binding: BindingId, origin: DeliveryId, outcome: Outcome) {
        let connection = self.connection;
        let Some((link, leg)) = self
            .legs
            .iter_mut()
            .find(|(_, leg)| leg.bound_to(binding))
        else {
            return;
        };
        let link = *link;
        let Some(LegRelay::Ingress {
            credit, settlement, ..
        }) = leg.relay.as_mut()
        else {
            return;
        };

        let ready = settlement.record(origin, outcome);
        let settled = u32::try_from(ready.len()).unwrap_or(u32::MAX);
        let flow = if settled > 0 {
            credit.on_settled(settled)
        } else {
            None
        };

        for (delivery, outcome) in ready {
            self.shared.transport.submit(TransportCommand::Settle {
                connection,
                link,
                delivery,
                outcome,
            });
        }
        if let Some(credit) = flow {
            self.flow(link, credit);
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection", &self.connection)
            .field("kind", &self.kind)
            .field("legs", &self.legs.len())
            .field("closed", &self.closed)
            .finish()
    }
}
