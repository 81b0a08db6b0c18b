pub mod adapters;
pub mod attach;
pub mod binding;
pub mod context;
pub mod credit;
pub mod error;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod settlement;
pub mod supervisor;
pub mod testing;
pub mod types;

pub use error::{AutolinkError, AutolinkErrorKind};
pub use observability::{AutolinkEvent, TracingSink};
pub use ports::{
    ContextExecutor, ObservabilitySink, RetryStrategy, TransportCommand, TransportEvent,
    TransportPort,
};
pub use registry::{AutolinkRegistry, SpecId};
pub use retry::{ExponentialBackoff, ImmediateRetry};
pub use router::{DEFAULT_LINK_CAPACITY, Router, RouterOptions};
pub use runtime::{RouterRuntime, TokioExecutor};
pub use types::{
    AddressKey, AutolinkSpec, ConnectionId, DeliveryId, Direction, IdAllocator, LinkId, Outcome,
    PairingPolicy, WaypointDeclaration,
};
