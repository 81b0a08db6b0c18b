//! In-process collaborators for driving a [`Router`](crate::autolink::router::Router)
//! deterministically, without sockets or a tokio runtime.

use std::sync::{Mutex, PoisonError};

use crate::autolink::{
    context::ConnectionContext,
    observability::AutolinkEvent,
    ports::{ContextExecutor, ObservabilitySink, TransportCommand, TransportPort},
    types::ConnectionId,
};

#[derive(Default)]
pub struct RecordingTransport {
    commands: Mutex<Vec<TransportCommand>>,
}

impl RecordingTransport {
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<TransportCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl TransportPort for RecordingTransport {
    fn submit(&self, command: TransportCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AutolinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AutolinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<AutolinkEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ObservabilitySink for RecordingSink {
    fn on_event(&self, event: AutolinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Keeps launched contexts in memory and runs their mailboxes on demand.
#[derive(Default)]
pub struct ManualExecutor {
    contexts: Mutex<Vec<ConnectionContext>>,
}

impl ManualExecutor {
    /// Polls every context until no mailbox has pending input. Returns the
    /// number of inputs processed.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let handled: usize = self
                .contexts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter_mut()
                .map(ConnectionContext::poll_pending)
                .sum();
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    pub fn with_context<R>(
        &self,
        connection: ConnectionId,
        f: impl FnOnce(&ConnectionContext) -> R,
    ) -> Option<R> {
        let guard = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .iter()
            .find(|context| context.connection() == connection)
            .map(f)
    }

    pub fn len(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContextExecutor for ManualExecutor {
    fn launch(&self, context: ConnectionContext) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context);
    }
}
