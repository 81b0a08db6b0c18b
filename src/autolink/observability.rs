use std::time::Duration;

use crate::autolink::{
    ports::ObservabilitySink,
    types::{AddressKey, BindingId, ContainerId, ConnectionId, DeliveryId, Direction, LinkId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutolinkEvent {
    AttachSucceeded {
        container_id: ContainerId,
        address: AddressKey,
        direction: Direction,
        link: LinkId,
    },
    AttachFailed {
        container_id: ContainerId,
        address: AddressKey,
        direction: Direction,
        link: LinkId,
        reason: String,
    },
    ConnectionLost {
        container_id: ContainerId,
        connection: ConnectionId,
    },
    ReconnectScheduled {
        container_id: ContainerId,
        attempt: u32,
        delay: Duration,
    },
    BindingFormed {
        binding: BindingId,
        address: AddressKey,
        ingress: LinkId,
        egress: LinkId,
    },
    BindingTorn {
        binding: BindingId,
        address: AddressKey,
        closed: LinkId,
    },
    PairingRejected {
        address: AddressKey,
        link: LinkId,
    },
    DeliveryReleased {
        binding: BindingId,
        link: LinkId,
        delivery: DeliveryId,
    },
    DeliveryDropped {
        link: LinkId,
        delivery: Option<DeliveryId>,
        reason: &'static str,
    },
    ProtocolViolation {
        connection: ConnectionId,
        link: Option<LinkId>,
        detail: String,
    },
}

/// Renders observability events as `tracing` events under the `autolink` target.
#[derive(Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn on_event(&self, event: AutolinkEvent) {
        match event {
            AutolinkEvent::AttachSucceeded {
                container_id,
                address,
                direction,
                link,
            } => {
                tracing::info!(
                    target: "autolink",
                    container_id = %container_id,
                    address = %address,
                    direction = %direction,
                    link = %link,
                    "autolink_attached"
                );
            }
            AutolinkEvent::AttachFailed {
                container_id,
                address,
                direction,
                link,
                reason,
            } => {
                tracing::warn!(
                    target: "autolink",
                    container_id = %container_id,
                    address = %address,
                    direction = %direction,
                    link = %link,
                    reason = %reason,
                    "autolink_attach_failed"
                );
            }
            AutolinkEvent::ConnectionLost {
                container_id,
                connection,
            } => {
                tracing::warn!(
                    target: "autolink",
                    container_id = %container_id,
                    connection = %connection,
                    "container_connection_lost"
                );
            }
            AutolinkEvent::ReconnectScheduled {
                container_id,
                attempt,
                delay,
            } => {
                tracing::info!(
                    target: "autolink",
                    container_id = %container_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "container_reconnect_scheduled"
                );
            }
            AutolinkEvent::BindingFormed {
                binding,
                address,
                ingress,
                egress,
            } => {
                tracing::info!(
                    target: "autolink",
                    binding = %binding,
                    address = %address,
                    ingress = %ingress,
                    egress = %egress,
                    "route_binding_formed"
                );
            }
            AutolinkEvent::BindingTorn {
                binding,
                address,
                closed,
            } => {
                tracing::info!(
                    target: "autolink",
                    binding = %binding,
                    address = %address,
                    closed = %closed,
                    "route_binding_torn"
                );
            }
            AutolinkEvent::PairingRejected { address, link } => {
                tracing::warn!(
                    target: "autolink",
                    address = %address,
                    link = %link,
                    "route_pairing_rejected"
                );
            }
            AutolinkEvent::DeliveryReleased {
                binding,
                link,
                delivery,
            } => {
                tracing::debug!(
                    target: "autolink",
                    binding = %binding,
                    link = %link,
                    delivery = %delivery,
                    "delivery_released"
                );
            }
            AutolinkEvent::DeliveryDropped {
                link,
                delivery,
                reason,
            } => {
                tracing::warn!(
                    target: "autolink",
                    link = %link,
                    delivery = ?delivery,
                    reason,
                    "delivery_dropped"
                );
            }
            AutolinkEvent::ProtocolViolation {
                connection,
                link,
                detail,
            } => {
                tracing::warn!(
                    target: "autolink",
                    connection = %connection,
                    link = ?link,
                    detail = %detail,
                    "protocol_violation"
                );
            }
        }
    }
}
