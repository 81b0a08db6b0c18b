use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::autolink::{
    context::ConnectionContext,
    ports::{ContextExecutor, TransportEvent},
    router::Router,
    supervisor::ScheduledReconnect,
    types::ContainerId,
};

/// Runs every connection context as its own tokio task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl ContextExecutor for TokioExecutor {
    fn launch(&self, context: ConnectionContext) {
        tokio::spawn(context.run());
    }
}

/// Drives a [`Router`] from a stream of transport events until cancelled.
/// Delayed reconnects are timed here; the router itself never sleeps.
pub struct RouterRuntime {
    task: JoinHandle<()>,
}

impl RouterRuntime {
    pub fn start(
        router: Router,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(run_router(router, events, shutdown));
        Self { task }
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(target: "router", error = %err, "router_task_join_failed");
        }
    }
}

async fn run_router(
    mut router: Router,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    let (due_tx, mut due_rx) = mpsc::unbounded_channel::<ContainerId>();

    router.start();
    schedule(router.take_scheduled_reconnects(), &due_tx, &shutdown);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(container_id) = due_rx.recv() => {
                router.reconnect_due(&container_id);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!(target: "router", "transport_event_stream_closed");
                    break;
                };
                if let Err(err) = router.handle(event) {
                    tracing::debug!(
                        target: "router",
                        kind = ?err.kind,
                        error = %err,
                        "transport_event_ignored"
                    );
                }
            }
        }
        schedule(router.take_scheduled_reconnects(), &due_tx, &shutdown);
    }

    router.shutdown();
}

fn schedule(
    reconnects: Vec<ScheduledReconnect>,
    due_tx: &mpsc::UnboundedSender<ContainerId>,
    shutdown: &CancellationToken,
) {
    for reconnect in reconnects {
        let due_tx = due_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(reconnect.delay) => {
                    let _ = due_tx.send(reconnect.container_id);
                }
            }
        });
    }
}
