use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    autolink::{
        adapters::tcp::TcpTransport,
        observability::TracingSink,
        registry::AutolinkRegistry,
        router::Router,
        runtime::{RouterRuntime, TokioExecutor},
        types::IdAllocator,
    },
    config::Config,
    logging::init_tracing,
};

pub async fn run(config: Config) -> Result<()> {
    let logging = init_tracing(&config.logging)?;

    let registry = Arc::new(
        AutolinkRegistry::from_config(&config).context("invalid autolink configuration")?,
    );
    let endpoints = config.container_endpoints()?;
    let listener = TcpListener::bind(&config.listener.bind)
        .await
        .with_context(|| format!("unable to bind listener {}", config.listener.bind))?;

    let router_shutdown = CancellationToken::new();
    let transport_shutdown = CancellationToken::new();
    let ids = Arc::new(IdAllocator::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(
        Arc::clone(&ids),
        events_tx,
        endpoints,
        transport_shutdown.clone(),
    );

    let router = Router::new(
        registry,
        config.router.options(),
        ids,
        Arc::new(transport.clone()),
        Arc::new(TracingSink),
        config.router.reconnect.strategy(),
        Arc::new(TokioExecutor),
    );
    let runtime = RouterRuntime::start(router, events_rx, router_shutdown.clone());

    let listener_task = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.serve(listener).await })
    };

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    tracing::info!(
        target: "router",
        run_id = %logging.run_id(),
        listener = %config.listener.bind,
        autolinks = config.autolinks.len(),
        "router_listening"
    );
    eprintln!(
        "autolink-router listening on {} (NDJSON), logs in {}",
        config.listener.bind,
        logging.log_dir().display()
    );

    let signal_name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    tracing::info!(target: "router", signal = signal_name, "shutdown_requested");

    // Close frames are queued by the router before the transport stops.
    router_shutdown.cancel();
    runtime.join().await;
    transport_shutdown.cancel();

    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            tracing::error!(target: "transport", error = %message, "listener_exited_with_error");
        }
        Err(err) => tracing::error!(target: "transport", error = %err, "listener_join_failed"),
    }

    eprintln!("autolink-router stopped: received {signal_name}");
    Ok(())
}
