use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::autolink::{
    error::{AutolinkError, attach_mismatch},
    observability::AutolinkEvent,
    ports::{ObservabilitySink, TransportCommand, TransportPort},
    registry::{AutolinkRegistry, SpecId},
    types::{
        AttachRequest, AttachmentState, AutolinkSpec, ConnectionId, ContainerId, Direction,
        ErrorCondition, IdAllocator, LinkId,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutolinkAttachment {
    pub spec_id: SpecId,
    pub spec: AutolinkSpec,
    pub link: LinkId,
    pub state: AttachmentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(AutolinkAttachment),
    Mismatch(AutolinkAttachment),
}

/// The remote terminus that must name the autolink address: the source for
/// `in`, the target for `out`. Either the plain or the phase-qualified form
/// is accepted.
pub fn validate_remote_address(
    spec: &AutolinkSpec,
    remote: Option<&str>,
) -> Result<(), AutolinkError> {
    let qualified = spec.key().qualified();
    match remote {
        Some(address) if address == spec.address || address == qualified => Ok(()),
        other => Err(attach_mismatch(format!(
            "{} autolink expected remote address '{}', got '{}'",
            spec.direction,
            qualified,
            other.unwrap_or("<none>")
        ))),
    }
}

/// Attach state of every autolink served by one route-container connection.
pub struct AttachManager {
    container_id: ContainerId,
    connection: ConnectionId,
    transport: Arc<dyn TransportPort>,
    sink: Arc<dyn ObservabilitySink>,
    attachments: BTreeMap<SpecId, AutolinkAttachment>,
    by_link: HashMap<LinkId, SpecId>,
    failures: Vec<(SpecId, String)>,
}

impl AttachManager {
    pub fn new(
        container_id: ContainerId,
        connection: ConnectionId,
        transport: Arc<dyn TransportPort>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            container_id,
            connection,
            transport,
            sink,
            attachments: BTreeMap::new(),
            by_link: HashMap::new(),
            failures: Vec::new(),
        }
    }

    /// Issues one attach per spec of this container that has no live
    /// attachment yet. Safe to call repeatedly.
    pub fn start(&mut self, registry: &AutolinkRegistry, ids: &IdAllocator) {
        for (spec_id, spec) in registry.specs_for(&self.container_id) {
            let live = self
                .attachments
                .get(&spec_id)
                .is_some_and(|attachment| attachment.state != AttachmentState::Detached);
            if live {
                continue;
            }

            let link = ids.link();
            if let Some(previous) = self.attachments.remove(&spec_id) {
                self.by_link.remove(&previous.link);
            }
            self.attachments.insert(
                spec_id,
                AutolinkAttachment {
                    spec_id,
                    spec: spec.clone(),
                    link,
                    state: AttachmentState::Pending,
                },
            );
            self.by_link.insert(link, spec_id);

            tracing::debug!(
                target: "attach",
                container_id = %self.container_id,
                connection = %self.connection,
                link = %link,
                address = %spec.key(),
                direction = %spec.direction,
                "autolink_attach_requested"
            );
            self.transport.submit(TransportCommand::Attach {
                connection: self.connection,
                link,
                request: AttachRequest {
                    name: spec.link_name(),
                    direction: spec.leg_direction(),
                    address: spec.key().qualified(),
                },
            });
        }
    }

    /// Validates the remote's answer to an attach. Returns `None` for links
    /// this manager did not issue or that are no longer pending.
    pub fn on_remote_attach(
        &mut self,
        link: LinkId,
        remote_source: Option<&str>,
        remote_target: Option<&str>,
    ) -> Option<AttachOutcome> {
        let spec_id = *self.by_link.get(&link)?;
        let attachment = self.attachments.get_mut(&spec_id)?;
        if attachment.state != AttachmentState::Pending {
            return None;
        }

        let remote = match attachment.spec.direction {
            Direction::In => remote_source,
            Direction::Out => remote_target,
        };

        match validate_remote_address(&attachment.spec, remote) {
            Ok(()) => {
                attachment.state = AttachmentState::Attached;
                self.sink.on_event(AutolinkEvent::AttachSucceeded {
                    container_id: self.container_id.clone(),
                    address: attachment.spec.key(),
                    direction: attachment.spec.direction,
                    link,
                });
                Some(AttachOutcome::Attached(attachment.clone()))
            }
            Err(err) => {
                attachment.state = AttachmentState::Detached;
                self.failures.push((spec_id, err.message.clone()));
                self.transport.submit(TransportCommand::Detach {
                    connection: self.connection,
                    link,
                    condition: Some(ErrorCondition::AddressMismatch {
                        expected: attachment.spec.key().qualified(),
                        actual: remote.map(str::to_string),
                    }),
                });
                self.sink.on_event(AutolinkEvent::AttachFailed {
                    container_id: self.container_id.clone(),
                    address: attachment.spec.key(),
                    direction: attachment.spec.direction,
                    link,
                    reason: err.message,
                });
                Some(AttachOutcome::Mismatch(attachment.clone()))
            }
        }
    }

    pub fn on_detached(&mut self, link: LinkId) -> Option<&AutolinkAttachment> {
        let spec_id = *self.by_link.get(&link)?;
        let attachment = self.attachments.get_mut(&spec_id)?;
        if attachment.state != AttachmentState::Detached {
            tracing::info!(
                target: "attach",
                container_id = %self.container_id,
                link = %link,
                address = %attachment.spec.key(),
                "autolink_detached"
            );
        }
        attachment.state = AttachmentState::Detached;
        Some(attachment)
    }

    pub fn cancel_all(&mut self) {
        for attachment in self.attachments.values_mut() {
            attachment.state = AttachmentState::Detached;
        }
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AutolinkAttachment> {
        self.attachments.values()
    }

    pub fn attached_count(&self) -> usize {
        self.attachments
            .values()
            .filter(|attachment| attachment.state == AttachmentState::Attached)
            .count()
    }

    pub fn failures(&self) -> &[(SpecId, String)] {
        &self.failures
    }
}
