use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use crate::autolink::{
    context::{ContextHandle, RelayMessage},
    observability::AutolinkEvent,
    ports::ObservabilitySink,
    types::{AddressKey, BindingId, ConnectionId, LegDirection, LegSide, LinkId, PairingPolicy},
};

/// A link taking part (or waiting to take part) in a binding, together with
/// the mailbox of the context that owns it.
#[derive(Debug, Clone)]
pub struct LegRef {
    pub link: LinkId,
    pub connection: ConnectionId,
    pub direction: LegDirection,
    pub side: LegSide,
    pub mailbox: ContextHandle,
}

/// Pairing of an ingress leg with an egress leg on one address and phase.
/// Never mutated after creation.
#[derive(Debug)]
pub struct RouteBinding {
    pub id: BindingId,
    pub key: AddressKey,
    pub ingress: LegRef,
    pub egress: LegRef,
}

impl RouteBinding {
    pub fn leg(&self, link: LinkId) -> Option<&LegRef> {
        if self.ingress.link == link {
            Some(&self.ingress)
        } else if self.egress.link == link {
            Some(&self.egress)
        } else {
            None
        }
    }

    pub fn peer_of(&self, link: LinkId) -> Option<&LegRef> {
        if self.ingress.link == link {
            Some(&self.egress)
        } else if self.egress.link == link {
            Some(&self.ingress)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum Registration {
    Bound(Arc<RouteBinding>),
    Waiting,
    Rejected,
}

#[derive(Debug, Default)]
pub struct Unregistered {
    pub torn: Option<Arc<RouteBinding>>,
    pub rebound: Option<Arc<RouteBinding>>,
}

#[derive(Debug, Clone)]
struct WaitingLeg {
    seq: u64,
    leg: LegRef,
}

#[derive(Debug, Default)]
struct AddressSlot {
    waiting: Vec<WaitingLeg>,
    bindings: Vec<Arc<RouteBinding>>,
}

impl AddressSlot {
    fn is_empty(&self) -> bool {
        self.waiting.is_empty() && self.bindings.is_empty()
    }
}

pub fn compatible(lhs: &LegRef, rhs: &LegRef) -> bool {
    lhs.direction != rhs.direction
        && lhs.connection != rhs.connection
        && (lhs.side == LegSide::Autolink || rhs.side == LegSide::Autolink)
}

/// Pairing state for every address. Single-threaded; see [`SharedBindings`]
/// for the locked wrapper the contexts use.
#[derive(Debug, Default)]
pub struct RouteBindingTable {
    policy: PairingPolicy,
    slots: BTreeMap<AddressKey, AddressSlot>,
    legs: HashMap<LinkId, (AddressKey, u64)>,
    next_binding: u64,
    next_seq: u64,
}

impl RouteBindingTable {
    pub fn new(policy: PairingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn register_leg(&mut self, key: AddressKey, leg: LegRef) -> Registration {
        if let Some((existing_key, _)) = self.legs.get(&leg.link) {
            let bound = self.slots.get(existing_key).and_then(|slot| {
                slot.bindings
                    .iter()
                    .find(|binding| binding.leg(leg.link).is_some())
                    .cloned()
            });
            return match bound {
                Some(binding) => Registration::Bound(binding),
                None => Registration::Waiting,
            };
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(binding) = self.pair_with_waiting(&key, &leg) {
            self.legs.insert(leg.link, (key, seq));
            return Registration::Bound(binding);
        }

        if self.policy == PairingPolicy::Reject
            && leg.side == LegSide::Normal
            && self.slots.get(&key).is_some_and(|slot| {
                slot.bindings.iter().any(|binding| {
                    let autolink = if binding.ingress.side == LegSide::Autolink {
                        &binding.ingress
                    } else {
                        &binding.egress
                    };
                    compatible(autolink, &leg)
                })
            })
        {
            return Registration::Rejected;
        }

        self.legs.insert(leg.link, (key.clone(), seq));
        self.insert_waiting(&key, WaitingLeg { seq, leg });
        Registration::Waiting
    }

    pub fn unregister_leg(&mut self, link: LinkId) -> Unregistered {
        let Some((key, _)) = self.legs.remove(&link) else {
            return Unregistered::default();
        };
        let Some(slot) = self.slots.get_mut(&key) else {
            return Unregistered::default();
        };

        if let Some(position) = slot.waiting.iter().position(|item| item.leg.link == link) {
            slot.waiting.remove(position);
            self.drop_slot_if_empty(&key);
            return Unregistered::default();
        }

        let Some(position) = slot
            .bindings
            .iter()
            .position(|binding| binding.leg(link).is_some())
        else {
            return Unregistered::default();
        };
        let torn = slot.bindings.remove(position);

        let mut rebound = None;
        if let Some(survivor) = torn.peer_of(link).cloned()
            && let Some((_, seq)) = self.legs.get(&survivor.link).cloned()
        {
            rebound = self.pair_with_waiting(&key, &survivor);
            if rebound.is_none() {
                self.insert_waiting(&key, WaitingLeg { seq, leg: survivor });
            }
        }
        self.drop_slot_if_empty(&key);

        Unregistered {
            torn: Some(torn),
            rebound,
        }
    }

    pub fn binding_count(&self) -> usize {
        self.slots.values().map(|slot| slot.bindings.len()).sum()
    }

    pub fn waiting(&self, key: &AddressKey) -> Vec<LinkId> {
        self.slots
            .get(key)
            .map(|slot| slot.waiting.iter().map(|item| item.leg.link).collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, link: LinkId) -> bool {
        self.legs.contains_key(&link)
    }

    fn pair_with_waiting(&mut self, key: &AddressKey, leg: &LegRef) -> Option<Arc<RouteBinding>> {
        let slot = self.slots.get_mut(key)?;
        let position = slot
            .waiting
            .iter()
            .position(|candidate| compatible(&candidate.leg, leg))?;
        let partner = slot.waiting.remove(position).leg;

        let (ingress, egress) = match leg.direction {
            LegDirection::Ingress => (leg.clone(), partner),
            LegDirection::Egress => (partner, leg.clone()),
        };
        self.next_binding += 1;
        let binding = Arc::new(RouteBinding {
            id: BindingId(self.next_binding),
            key: key.clone(),
            ingress,
            egress,
        });
        slot.bindings.push(Arc::clone(&binding));
        Some(binding)
    }

    fn insert_waiting(&mut self, key: &AddressKey, item: WaitingLeg) {
        let slot = self.slots.entry(key.clone()).or_default();
        let position = slot
            .waiting
            .iter()
            .position(|existing| existing.seq > item.seq)
            .unwrap_or(slot.waiting.len());
        slot.waiting.insert(position, item);
    }

    fn drop_slot_if_empty(&mut self, key: &AddressKey) {
        if self.slots.get(key).is_some_and(AddressSlot::is_empty) {
            self.slots.remove(key);
        }
    }
}

/// The binding table shared by every connection context. Cross-context
/// notifications are posted only after the lock is released.
pub struct SharedBindings {
    table: Mutex<RouteBindingTable>,
    sink: Arc<dyn ObservabilitySink>,
}

impl SharedBindings {
    pub fn new(policy: PairingPolicy, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            table: Mutex::new(RouteBindingTable::new(policy)),
            sink,
        }
    }

    pub fn register(&self, key: AddressKey, leg: LegRef) -> Registration {
        let link = leg.link;
        let registration = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register_leg(key.clone(), leg);

        match &registration {
            Registration::Bound(binding) => self.announce(binding),
            Registration::Waiting => {
                tracing::debug!(
                    target: "binding",
                    address = %key,
                    link = %link,
                    "leg_waiting_for_peer"
                );
            }
            Registration::Rejected => {
                self.sink
                    .on_event(AutolinkEvent::PairingRejected { address: key, link });
            }
        }
        registration
    }

    pub fn unregister(&self, link: LinkId) -> Option<Arc<RouteBinding>> {
        let outcome = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister_leg(link);

        if let Some(torn) = &outcome.torn {
            if let Some(survivor) = torn.peer_of(link) {
                survivor.mailbox.post_relay(RelayMessage::BindingTorn {
                    binding: Arc::clone(torn),
                    closed: link,
                });
            }
            self.sink.on_event(AutolinkEvent::BindingTorn {
                binding: torn.id,
                address: torn.key.clone(),
                closed: link,
            });
        }
        if let Some(rebound) = &outcome.rebound {
            self.announce(rebound);
        }

        outcome.torn
    }

    pub fn with_table<R>(&self, f: impl FnOnce(&RouteBindingTable) -> R) -> R {
        f(&self.table.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn announce(&self, binding: &Arc<RouteBinding>) {
        // Ingress is told first; the egress's first credit report lands after it.
        binding
            .ingress
            .mailbox
            .post_relay(RelayMessage::BindingFormed(Arc::clone(binding)));
        binding
            .egress
            .mailbox
            .post_relay(RelayMessage::BindingFormed(Arc::clone(binding)));
        self.sink.on_event(AutolinkEvent::BindingFormed {
            binding: binding.id,
            address: binding.key.clone(),
            ingress: binding.ingress.link,
            egress: binding.egress.link,
        });
    }
}
