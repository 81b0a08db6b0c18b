use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

pub type ContainerId = String;
pub type Phase = u32;

macro_rules! id_newtype {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

id_newtype!(ConnectionId, "conn");
id_newtype!(LinkId, "link");
id_newtype!(DeliveryId, "dlv");
id_newtype!(BindingId, "binding");

/// Process-wide allocator shared by the router and its transport so that
/// connection, link and delivery handles never collide.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection(&self) -> ConnectionId {
        ConnectionId(self.allocate())
    }

    pub fn link(&self) -> LinkId {
        LinkId(self.allocate())
    }

    pub fn delivery(&self) -> DeliveryId {
        DeliveryId(self.allocate())
    }
}

/// Configured direction of an autolink, as seen from the route-container's
/// address: `in` flows from the container into the router, `out` flows from
/// the router to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn leg_direction(self) -> LegDirection {
        match self {
            Direction::In => LegDirection::Ingress,
            Direction::Out => LegDirection::Egress,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a leg from the router's point of view. Messages arrive on an
/// ingress leg (the router is the receiver) and leave on an egress leg (the
/// router is the sender).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegDirection {
    Ingress,
    Egress,
}

impl LegDirection {
    pub fn opposite(self) -> Self {
        match self {
            LegDirection::Ingress => LegDirection::Egress,
            LegDirection::Egress => LegDirection::Ingress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegSide {
    Normal,
    Autolink,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressKey {
    pub address: String,
    pub phase: Phase,
}

impl AddressKey {
    pub fn new(address: impl Into<String>, phase: Phase) -> Self {
        Self {
            address: address.into(),
            phase,
        }
    }

    /// `"node.1"` for phase 0, `"node.1#4"` otherwise.
    pub fn qualified(&self) -> String {
        if self.phase == 0 {
            self.address.clone()
        } else {
            format!("{}#{}", self.address, self.phase)
        }
    }

    pub fn parse(text: &str) -> Self {
        if let Some((base, suffix)) = text.rsplit_once('#')
            && !base.is_empty()
            && let Ok(phase) = suffix.parse::<Phase>()
        {
            return Self::new(base, phase);
        }

        Self::new(text, 0)
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutolinkSpec {
    pub address: String,
    pub container_id: ContainerId,
    pub direction: Direction,
    #[serde(default)]
    pub phase: Phase,
}

impl AutolinkSpec {
    pub fn new(
        address: impl Into<String>,
        container_id: impl Into<String>,
        direction: Direction,
        phase: Phase,
    ) -> Self {
        Self {
            address: address.into(),
            container_id: container_id.into(),
            direction,
            phase,
        }
    }

    pub fn key(&self) -> AddressKey {
        AddressKey::new(self.address.clone(), self.phase)
    }

    pub fn leg_direction(&self) -> LegDirection {
        self.direction.leg_direction()
    }

    pub fn link_name(&self) -> String {
        format!(
            "autolink:{}:{}:{}",
            self.container_id,
            self.key().qualified(),
            self.direction
        )
    }
}

/// Marks addresses starting with `prefix` as waypoint addresses handled by the
/// autolink subsystem (or explicitly not, when `waypoint` is false).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaypointDeclaration {
    pub prefix: String,
    #[serde(default = "default_waypoint")]
    pub waypoint: bool,
}

fn default_waypoint() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Accepted,
    Rejected,
    Released,
}

impl DeliveryState {
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            DeliveryState::Pending => None,
            DeliveryState::Accepted => Some(Outcome::Accepted),
            DeliveryState::Rejected => Some(Outcome::Rejected),
            DeliveryState::Released => Some(Outcome::Released),
        }
    }
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Accepted => DeliveryState::Accepted,
            Outcome::Rejected => DeliveryState::Rejected,
            Outcome::Released => DeliveryState::Released,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Pending,
    Attached,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    #[default]
    Queue,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub name: String,
    pub direction: LegDirection,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    AddressMismatch {
        expected: String,
        actual: Option<String>,
    },
    PairingRejected {
        address: String,
    },
    ProtocolViolation {
        detail: String,
    },
    Shutdown,
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCondition::AddressMismatch { expected, actual } => write!(
                f,
                "address mismatch: expected '{}', remote declared '{}'",
                expected,
                actual.as_deref().unwrap_or("<none>")
            ),
            ErrorCondition::PairingRejected { address } => {
                write!(f, "address '{}' already has an active pairing", address)
            }
            ErrorCondition::ProtocolViolation { detail } => {
                write!(f, "protocol violation: {}", detail)
            }
            ErrorCondition::Shutdown => f.write_str("router shutting down"),
        }
    }
}
