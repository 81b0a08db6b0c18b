use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::autolink::{
    observability::AutolinkEvent,
    ports::{ObservabilitySink, RetryStrategy, TransportCommand, TransportPort},
    registry::AutolinkRegistry,
    types::{ConnectionId, ConnectionState, ContainerId, ErrorCondition, IdAllocator},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConnection {
    pub container_id: ContainerId,
    pub connection: Option<ConnectionId>,
    pub state: ConnectionState,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledReconnect {
    pub container_id: ContainerId,
    pub delay: Duration,
}

/// One connection state machine per route-container. Owns reconnection; the
/// attachments themselves are rebuilt by the new connection's context.
pub struct ConnectionSupervisor {
    connections: BTreeMap<ContainerId, ContainerConnection>,
    by_connection: BTreeMap<ConnectionId, ContainerId>,
    retry: Arc<dyn RetryStrategy>,
    transport: Arc<dyn TransportPort>,
    sink: Arc<dyn ObservabilitySink>,
    ids: Arc<IdAllocator>,
    scheduled: Vec<ScheduledReconnect>,
    shutting_down: bool,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: &AutolinkRegistry,
        retry: Arc<dyn RetryStrategy>,
        transport: Arc<dyn TransportPort>,
        sink: Arc<dyn ObservabilitySink>,
        ids: Arc<IdAllocator>,
    ) -> Self {
        let connections = registry
            .container_ids()
            .into_iter()
            .map(|container_id| {
                (
                    container_id.clone(),
                    ContainerConnection {
                        container_id,
                        connection: None,
                        state: ConnectionState::Disconnected,
                        attempts: 0,
                    },
                )
            })
            .collect();

        Self {
            connections,
            by_connection: BTreeMap::new(),
            retry,
            transport,
            sink,
            ids,
            scheduled: Vec::new(),
            shutting_down: false,
        }
    }

    pub fn start_all(&mut self) {
        let containers: Vec<_> = self.connections.keys().cloned().collect();
        for container_id in containers {
            self.ensure_connected(&container_id);
        }
    }

    /// Opens a connection unless one is live or in progress. Returns the
    /// connection handle when a new one was requested.
    pub fn ensure_connected(&mut self, container_id: &str) -> Option<ConnectionId> {
        if self.shutting_down {
            return None;
        }
        let entry = self.connections.get_mut(container_id)?;
        if entry.state != ConnectionState::Disconnected {
            return None;
        }

        let connection = self.ids.connection();
        entry.connection = Some(connection);
        entry.state = ConnectionState::Connecting;
        self.by_connection
            .insert(connection, container_id.to_string());

        tracing::info!(
            target: "supervisor",
            container_id = %container_id,
            connection = %connection,
            attempt = entry.attempts,
            "container_connect_requested"
        );
        self.transport.submit(TransportCommand::Connect {
            connection,
            container_id: container_id.to_string(),
        });
        Some(connection)
    }

    /// `Connecting -> Connected`. Returns the container served by the
    /// connection, or `None` when it is not a current container connection.
    pub fn on_connected(&mut self, connection: ConnectionId) -> Option<ContainerId> {
        let container_id = self.by_connection.get(&connection)?.clone();
        let entry = self.connections.get_mut(&container_id)?;
        if entry.connection != Some(connection) || entry.state != ConnectionState::Connecting {
            return None;
        }

        entry.state = ConnectionState::Connected;
        entry.attempts = 0;
        tracing::info!(
            target: "supervisor",
            container_id = %container_id,
            connection = %connection,
            "container_connected"
        );
        Some(container_id)
    }

    /// Handles both connection loss and connect failure. Schedules the next
    /// attempt through the retry strategy; a zero delay reconnects at once.
    pub fn on_disconnected(&mut self, connection: ConnectionId) -> Option<ContainerId> {
        let container_id = self.by_connection.remove(&connection)?;
        let entry = self.connections.get_mut(&container_id)?;
        if entry.connection != Some(connection) {
            return None;
        }

        entry.connection = None;
        entry.state = ConnectionState::Disconnected;
        entry.attempts = entry.attempts.saturating_add(1);
        let attempt = entry.attempts;

        self.sink.on_event(AutolinkEvent::ConnectionLost {
            container_id: container_id.clone(),
            connection,
        });
        if self.shutting_down {
            return Some(container_id);
        }

        let delay = self.retry.delay_for(attempt);
        self.sink.on_event(AutolinkEvent::ReconnectScheduled {
            container_id: container_id.clone(),
            attempt,
            delay,
        });

        if delay.is_zero() {
            self.ensure_connected(&container_id);
        } else {
            self.scheduled.push(ScheduledReconnect {
                container_id: container_id.clone(),
                delay,
            });
        }
        Some(container_id)
    }

    pub fn reconnect_due(&mut self, container_id: &str) -> Option<ConnectionId> {
        self.ensure_connected(container_id)
    }

    pub fn take_scheduled(&mut self) -> Vec<ScheduledReconnect> {
        std::mem::take(&mut self.scheduled)
    }

    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.scheduled.clear();
        for entry in self.connections.values_mut() {
            if let Some(connection) = entry.connection.take() {
                self.transport.submit(TransportCommand::Close {
                    connection,
                    condition: Some(ErrorCondition::Shutdown),
                });
            }
            entry.state = ConnectionState::Disconnected;
        }
        self.by_connection.clear();
    }

    pub fn state(&self, container_id: &str) -> Option<&ContainerConnection> {
        self.connections.get(container_id)
    }
}
