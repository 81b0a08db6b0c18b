use std::{collections::BTreeMap, sync::Arc};

use crate::autolink::{
    binding::SharedBindings,
    context::{ConnectionContext, ContextHandle, ContextInput, ContextKind},
    error::{AutolinkError, unknown_connection},
    ports::{ContextExecutor, ObservabilitySink, RetryStrategy, TransportEvent, TransportPort},
    registry::AutolinkRegistry,
    supervisor::{ConnectionSupervisor, ScheduledReconnect},
    types::{ConnectionId, IdAllocator, PairingPolicy},
};

pub const DEFAULT_LINK_CAPACITY: u32 = 250;

/// Consecutive connect failures between two warnings for the same container.
const CONNECT_FAILURE_WARN_EVERY: u32 = 50;

fn reports_connect_failure(attempt: u32) -> bool {
    attempt <= 1 || attempt % CONNECT_FAILURE_WARN_EVERY == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterOptions {
    pub link_capacity: u32,
    pub pairing_policy: PairingPolicy,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            link_capacity: DEFAULT_LINK_CAPACITY,
            pairing_policy: PairingPolicy::Queue,
        }
    }
}

/// State every connection context reads. The binding table is the only
/// mutable part.
pub struct RouterShared {
    pub registry: Arc<AutolinkRegistry>,
    pub bindings: SharedBindings,
    pub transport: Arc<dyn TransportPort>,
    pub sink: Arc<dyn ObservabilitySink>,
    pub ids: Arc<IdAllocator>,
    pub link_capacity: u32,
}

/// Owns the supervisor and the directory of connection contexts, and
/// dispatches transport events to the context of their connection.
pub struct Router {
    shared: Arc<RouterShared>,
    supervisor: ConnectionSupervisor,
    contexts: BTreeMap<ConnectionId, ContextHandle>,
    executor: Arc<dyn ContextExecutor>,
}

impl Router {
    pub fn new(
        registry: Arc<AutolinkRegistry>,
        options: RouterOptions,
        ids: Arc<IdAllocator>,
        transport: Arc<dyn TransportPort>,
        sink: Arc<dyn ObservabilitySink>,
        retry: Arc<dyn RetryStrategy>,
        executor: Arc<dyn ContextExecutor>,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(
            &registry,
            retry,
            Arc::clone(&transport),
            Arc::clone(&sink),
            Arc::clone(&ids),
        );
        let shared = Arc::new(RouterShared {
            registry,
            bindings: SharedBindings::new(options.pairing_policy, Arc::clone(&sink)),
            transport,
            sink,
            ids,
            link_capacity: options.link_capacity.max(1),
        });

        Self {
            shared,
            supervisor,
            contexts: BTreeMap::new(),
            executor,
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn bindings(&self) -> &SharedBindings {
        &self.shared.bindings
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn start(&mut self) {
        tracing::info!(
            target: "router",
            autolinks = self.shared.registry.specs().len(),
            containers = self.shared.registry.container_ids().len(),
            link_capacity = self.shared.link_capacity,
            "router_starting"
        );
        self.supervisor.start_all();
    }

    pub fn handle(&mut self, event: TransportEvent) -> Result<(), AutolinkError> {
        let connection = event.connection();
        match event {
            TransportEvent::ConnectionEstablished { .. } => {
                let Some(container_id) = self.supervisor.on_connected(connection) else {
                    return Err(unknown_connection(format!(
                        "{connection} is not a pending route-container connection"
                    )));
                };
                self.open_context(connection, ContextKind::Container { container_id });
                Ok(())
            }
            TransportEvent::ConnectionAccepted { .. } => {
                self.open_context(connection, ContextKind::Normal);
                Ok(())
            }
            TransportEvent::ConnectionClosed { .. } | TransportEvent::ConnectFailed { .. } => {
                let failure = match &event {
                    TransportEvent::ConnectFailed { reason, .. } => Some(reason.clone()),
                    _ => None,
                };
                let known_context = match self.contexts.remove(&connection) {
                    Some(handle) => {
                        handle.post_transport(event);
                        true
                    }
                    None => false,
                };
                let container = self.supervisor.on_disconnected(connection);
                if let (Some(reason), Some(container_id)) = (failure, container.as_deref()) {
                    let attempt = self
                        .supervisor
                        .state(container_id)
                        .map_or(0, |entry| entry.attempts);
                    if reports_connect_failure(attempt) {
                        tracing::warn!(
                            target: "router",
                            connection = %connection,
                            container_id = %container_id,
                            attempt = attempt,
                            reason = %reason,
                            "connect_failed"
                        );
                    } else {
                        tracing::debug!(
                            target: "router",
                            connection = %connection,
                            container_id = %container_id,
                            attempt = attempt,
                            reason = %reason,
                            "connect_failed"
                        );
                    }
                }
                if !known_context && container.is_none() {
                    return Err(unknown_connection(format!(
                        "close for unknown connection {connection}"
                    )));
                }
                Ok(())
            }
            other => {
                let Some(handle) = self.contexts.get(&connection) else {
                    return Err(unknown_connection(format!(
                        "event for unknown connection {connection}"
                    )));
                };
                handle.post_transport(other);
                Ok(())
            }
        }
    }

    pub fn reconnect_due(&mut self, container_id: &str) -> Option<ConnectionId> {
        self.supervisor.reconnect_due(container_id)
    }

    pub fn take_scheduled_reconnects(&mut self) -> Vec<ScheduledReconnect> {
        self.supervisor.take_scheduled()
    }

    pub fn shutdown(&mut self) {
        self.supervisor.shutdown();
        for (_, handle) in std::mem::take(&mut self.contexts) {
            handle.post(ContextInput::Shutdown);
        }
        tracing::info!(target: "router", "router_stopped");
    }

    fn open_context(&mut self, connection: ConnectionId, kind: ContextKind) {
        if self.contexts.contains_key(&connection) {
            return;
        }
        tracing::info!(
            target: "router",
            connection = %connection,
            kind = ?kind,
            "connection_context_opened"
        );

        let mut context = ConnectionContext::new(connection, kind, Arc::clone(&self.shared));
        context.start();
        self.contexts.insert(connection, context.handle());
        self.executor.launch(context);
    }
}
