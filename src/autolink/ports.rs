use std::time::Duration;

use crate::autolink::{
    context::ConnectionContext,
    observability::AutolinkEvent,
    types::{
        AttachRequest, ContainerId, ConnectionId, DeliveryId, ErrorCondition, LegDirection,
        LinkId, Outcome,
    },
};

/// Commands the router emits toward the protocol library. Submission is
/// fire-and-forget; failures come back as [`TransportEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect {
        connection: ConnectionId,
        container_id: ContainerId,
    },
    Attach {
        connection: ConnectionId,
        link: LinkId,
        request: AttachRequest,
    },
    Detach {
        connection: ConnectionId,
        link: LinkId,
        condition: Option<ErrorCondition>,
    },
    /// Sets the absolute credit the remote sender may use on an ingress link.
    Flow {
        connection: ConnectionId,
        link: LinkId,
        credit: u32,
    },
    Transfer {
        connection: ConnectionId,
        link: LinkId,
        delivery: DeliveryId,
        payload: Vec<u8>,
    },
    Settle {
        connection: ConnectionId,
        link: LinkId,
        delivery: DeliveryId,
        outcome: Outcome,
    },
    Close {
        connection: ConnectionId,
        condition: Option<ErrorCondition>,
    },
}

impl TransportCommand {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportCommand::Connect { connection, .. }
            | TransportCommand::Attach { connection, .. }
            | TransportCommand::Detach { connection, .. }
            | TransportCommand::Flow { connection, .. }
            | TransportCommand::Transfer { connection, .. }
            | TransportCommand::Settle { connection, .. }
            | TransportCommand::Close { connection, .. } => *connection,
        }
    }
}

/// Protocol events consumed by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An outbound route-container connection requested with
    /// [`TransportCommand::Connect`] is open.
    ConnectionEstablished { connection: ConnectionId },
    ConnectionAccepted { connection: ConnectionId },
    ConnectFailed {
        connection: ConnectionId,
        reason: String,
    },
    ConnectionClosed { connection: ConnectionId },
    LinkAttached {
        connection: ConnectionId,
        link: LinkId,
        remote_source: Option<String>,
        remote_target: Option<String>,
    },
    /// The remote opened a link. `direction` is the router's side of it and
    /// `address` is the terminus address the remote declared.
    LinkOpened {
        connection: ConnectionId,
        link: LinkId,
        direction: LegDirection,
        address: String,
    },
    LinkDetached {
        connection: ConnectionId,
        link: LinkId,
    },
    /// Credit granted by the remote receiver of an egress link, absolute.
    Flow {
        connection: ConnectionId,
        link: LinkId,
        credit: i64,
    },
    Transfer {
        connection: ConnectionId,
        link: LinkId,
        delivery: DeliveryId,
        payload: Vec<u8>,
    },
    Disposition {
        connection: ConnectionId,
        link: LinkId,
        delivery: DeliveryId,
        outcome: Outcome,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::ConnectionEstablished { connection }
            | TransportEvent::ConnectionAccepted { connection }
            | TransportEvent::ConnectFailed { connection, .. }
            | TransportEvent::ConnectionClosed { connection }
            | TransportEvent::LinkAttached { connection, .. }
            | TransportEvent::LinkOpened { connection, .. }
            | TransportEvent::LinkDetached { connection, .. }
            | TransportEvent::Flow { connection, .. }
            | TransportEvent::Transfer { connection, .. }
            | TransportEvent::Disposition { connection, .. } => *connection,
        }
    }
}

pub trait TransportPort: Send + Sync {
    fn submit(&self, command: TransportCommand);
}

pub trait ObservabilitySink: Send + Sync {
    fn on_event(&self, event: AutolinkEvent);
}

pub trait RetryStrategy: Send + Sync {
    /// Delay before reconnect attempt number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Starts the execution context of a freshly opened connection.
pub trait ContextExecutor: Send + Sync {
    fn launch(&self, context: ConnectionContext);
}
