use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::autolink::{
    adapters::wire::{Frame, Role, encode_frame, parse_frame},
    ports::{TransportCommand, TransportEvent, TransportPort},
    types::{ConnectionId, ContainerId, DeliveryId, IdAllocator, LegDirection, LinkId},
};

#[derive(Default)]
struct LinkTable {
    by_handle: HashMap<u64, LinkId>,
    handles: HashMap<LinkId, u64>,
    /// Links the router attached and the remote has not answered yet.
    pending: HashSet<LinkId>,
    /// Deliveries received from the remote: router id -> (handle, remote number).
    inbound: HashMap<DeliveryId, (u64, u64)>,
}

impl LinkTable {
    fn insert(&mut self, handle: u64, link: LinkId) {
        self.by_handle.insert(handle, link);
        self.handles.insert(link, handle);
    }

    fn remove(&mut self, link: LinkId) -> Option<u64> {
        let handle = self.handles.remove(&link)?;
        self.by_handle.remove(&handle);
        self.pending.remove(&link);
        self.inbound.retain(|_, (item, _)| *item != handle);
        Some(handle)
    }
}

struct ConnectionEntry {
    outbound: mpsc::UnboundedSender<Frame>,
    links: LinkTable,
    cancel: CancellationToken,
}

struct Inner {
    ids: Arc<IdAllocator>,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoints: BTreeMap<ContainerId, String>,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    shutdown: CancellationToken,
}

/// Demonstration transport speaking newline-delimited JSON frames over TCP.
/// Accepts normal clients on a listener and dials route-containers by the
/// address configured for their container id.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    pub fn new(
        ids: Arc<IdAllocator>,
        events: mpsc::UnboundedSender<TransportEvent>,
        endpoints: BTreeMap<ContainerId, String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ids,
                events,
                endpoints,
                connections: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Accepts normal-side clients until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .context("unable to read listener address")?;
        tracing::info!(target: "transport", address = %local, "listener_started");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let connection = self.inner.ids.connection();
                            tracing::info!(
                                target: "transport",
                                connection = %connection,
                                peer = %peer,
                                "client_accepted"
                            );
                            Inner::start_connection(
                                &self.inner,
                                connection,
                                stream,
                                TransportEvent::ConnectionAccepted { connection },
                            );
                        }
                        Err(err) => {
                            tracing::warn!(target: "transport", error = %err, "accept_failed");
                        }
                    }
                }
            }
        }

        tracing::info!(target: "transport", "listener_stopped");
        Ok(())
    }
}

impl TransportPort for TcpTransport {
    fn submit(&self, command: TransportCommand) {
        match command {
            TransportCommand::Connect {
                connection,
                container_id,
            } => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    Inner::connect(inner, connection, container_id).await;
                });
            }
            other => self.inner.send_command(other),
        }
    }
}

impl Inner {
    async fn connect(inner: Arc<Inner>, connection: ConnectionId, container_id: ContainerId) {
        let Some(address) = inner.endpoints.get(&container_id).cloned() else {
            let _ = inner.events.send(TransportEvent::ConnectFailed {
                connection,
                reason: format!("no endpoint configured for container '{container_id}'"),
            });
            return;
        };

        let stream = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            stream = TcpStream::connect(address.as_str()) => stream,
        };
        match stream {
            Ok(stream) => {
                tracing::info!(
                    target: "transport",
                    connection = %connection,
                    container_id = %container_id,
                    address = %address,
                    "container_dialed"
                );
                let opened = TransportEvent::ConnectionEstablished { connection };
                if Inner::start_connection(&inner, connection, stream, opened) {
                    inner.send_frame(
                        connection,
                        Frame::Open {
                            container_id: Some(container_id),
                        },
                    );
                }
            }
            Err(err) => {
                let _ = inner.events.send(TransportEvent::ConnectFailed {
                    connection,
                    reason: format!("connect to {address} failed: {err}"),
                });
            }
        }
    }

    /// Registers the connection and announces it with `opened` before its
    /// reader can emit any link event.
    fn start_connection(
        inner: &Arc<Inner>,
        connection: ConnectionId,
        stream: TcpStream,
        opened: TransportEvent,
    ) -> bool {
        if inner.shutdown.is_cancelled() {
            return false;
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let cancel = inner.shutdown.child_token();
        inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                connection,
                ConnectionEntry {
                    outbound: outbound_tx,
                    links: LinkTable::default(),
                    cancel: cancel.clone(),
                },
            );
        let _ = inner.events.send(opened);

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(err) = inner.run_connection(connection, stream, outbound_rx, cancel).await {
                let message = format!("{err:#}");
                tracing::warn!(
                    target: "transport",
                    connection = %connection,
                    error = %message,
                    "connection_failed"
                );
            }
            inner
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&connection);
            let _ = inner
                .events
                .send(TransportEvent::ConnectionClosed { connection });
        });
        true
    }

    async fn run_connection(
        &self,
        connection: ConnectionId,
        stream: TcpStream,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let encoded = encode_frame(&frame)?;
                write_half.write_all(encoded.as_bytes()).await?;
                write_half.flush().await?;
                if matches!(frame, Frame::Close { .. }) {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            Ok::<(), anyhow::Error>(())
        });

        let mut lines = BufReader::new(read_half).lines();
        let result = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(err) => break Err(anyhow::Error::new(err).context("read failed")),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_frame(line) {
                Ok(Frame::Close { error }) => {
                    tracing::info!(
                        target: "transport",
                        connection = %connection,
                        error = ?error,
                        "remote_closed"
                    );
                    break Ok(());
                }
                Ok(frame) => self.on_frame(connection, frame),
                Err(err) => {
                    tracing::warn!(
                        target: "transport",
                        connection = %connection,
                        error = %err,
                        "invalid_frame"
                    );
                }
            }
        };

        // Dropping the entry's sender lets the writer drain and stop.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                tracing::debug!(
                    target: "transport",
                    connection = %connection,
                    error = %message,
                    "writer_failed"
                );
            }
            Err(err) => tracing::debug!(
                target: "transport",
                connection = %connection,
                error = %err,
                "writer_join_failed"
            ),
        }
        result
    }

    fn on_frame(&self, connection: ConnectionId, frame: Frame) {
        let mut replies = Vec::new();
        let event = {
            let mut guard = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = guard.get_mut(&connection) else {
                return;
            };
            let links = &mut entry.links;

            match frame {
                Frame::Open { .. } | Frame::Close { .. } => None,
                Frame::Attach {
                    handle,
                    role,
                    name,
                    source,
                    target,
                } => match links.by_handle.get(&handle).copied() {
                    Some(link) if links.pending.remove(&link) => {
                        Some(TransportEvent::LinkAttached {
                            connection,
                            link,
                            remote_source: source,
                            remote_target: target,
                        })
                    }
                    Some(_) => None,
                    None => {
                        let (direction, address) = match role {
                            Role::Sender => (LegDirection::Ingress, target.clone()),
                            Role::Receiver => (LegDirection::Egress, source.clone()),
                        };
                        match address {
                            Some(address) => {
                                let link = self.ids.link();
                                links.insert(handle, link);
                                replies.push(Frame::Attach {
                                    handle,
                                    role: role.opposite(),
                                    name,
                                    source,
                                    target,
                                });
                                Some(TransportEvent::LinkOpened {
                                    connection,
                                    link,
                                    direction,
                                    address,
                                })
                            }
                            None => {
                                replies.push(Frame::Detach {
                                    handle,
                                    error: Some("link address is required".to_string()),
                                });
                                None
                            }
                        }
                    }
                },
                Frame::Detach { handle, .. } => {
                    let link = links.by_handle.get(&handle).copied();
                    link.map(|link| {
                        links.remove(link);
                        TransportEvent::LinkDetached { connection, link }
                    })
                }
                Frame::Flow { handle, credit } => {
                    links
                        .by_handle
                        .get(&handle)
                        .map(|link| TransportEvent::Flow {
                            connection,
                            link: *link,
                            credit,
                        })
                }
                Frame::Transfer {
                    handle,
                    delivery,
                    body,
                } => match links.by_handle.get(&handle).copied() {
                    Some(link) => {
                        let id = self.ids.delivery();
                        links.inbound.insert(id, (handle, delivery));
                        Some(TransportEvent::Transfer {
                            connection,
                            link,
                            delivery: id,
                            payload: body.into_bytes(),
                        })
                    }
                    None => None,
                },
                Frame::Disposition {
                    handle,
                    delivery,
                    outcome,
                } => links
                    .by_handle
                    .get(&handle)
                    .map(|link| TransportEvent::Disposition {
                        connection,
                        link: *link,
                        delivery: DeliveryId(delivery),
                        outcome,
                    }),
            }
        };

        for reply in replies {
            self.send_frame(connection, reply);
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn send_frame(&self, connection: ConnectionId, frame: Frame) {
        let guard = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = guard.get(&connection) {
            let _ = entry.outbound.send(frame);
        }
    }

    fn send_command(&self, command: TransportCommand) {
        let connection = command.connection();
        let mut guard = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = guard.get_mut(&connection) else {
            tracing::debug!(
                target: "transport",
                connection = %connection,
                "command_for_closed_connection"
            );
            return;
        };
        let links = &mut entry.links;

        let frame = match command {
            TransportCommand::Connect { .. } => None,
            TransportCommand::Attach { link, request, .. } => {
                let handle = link.0;
                links.insert(handle, link);
                links.pending.insert(link);
                let (role, source, target) = match request.direction {
                    LegDirection::Ingress => (Role::Receiver, Some(request.address), None),
                    LegDirection::Egress => (Role::Sender, None, Some(request.address)),
                };
                Some(Frame::Attach {
                    handle,
                    role,
                    name: Some(request.name),
                    source,
                    target,
                })
            }
            TransportCommand::Detach {
                link, condition, ..
            } => links.remove(link).map(|handle| Frame::Detach {
                handle,
                error: condition.map(|condition| condition.to_string()),
            }),
            TransportCommand::Flow { link, credit, .. } => {
                links.handles.get(&link).map(|handle| Frame::Flow {
                    handle: *handle,
                    credit: i64::from(credit),
                })
            }
            TransportCommand::Transfer {
                link,
                delivery,
                payload,
                ..
            } => links.handles.get(&link).map(|handle| Frame::Transfer {
                handle: *handle,
                delivery: delivery.0,
                body: String::from_utf8_lossy(&payload).into_owned(),
            }),
            TransportCommand::Settle {
                link,
                delivery,
                outcome,
                ..
            } => {
                let remote = links.inbound.remove(&delivery);
                links.handles.get(&link).map(|handle| {
                    let (handle, number) = remote.unwrap_or((*handle, delivery.0));
                    Frame::Disposition {
                        handle,
                        delivery: number,
                        outcome,
                    }
                })
            }
            TransportCommand::Close { condition, .. } => {
                let _ = entry.outbound.send(Frame::Close {
                    error: condition.map(|condition| condition.to_string()),
                });
                entry.cancel.cancel();
                None
            }
        };

        if let Some(frame) = frame {
            let _ = entry.outbound.send(frame);
        }
    }
}
