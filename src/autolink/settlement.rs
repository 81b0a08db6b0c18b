use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::autolink::types::{DeliveryId, DeliveryState, Outcome};

/// Ingress-side settlement state of one binding. Outcomes are applied to the
/// originating leg in the order its deliveries were accepted for relay.
#[derive(Debug, Default)]
pub struct SettlementPropagator {
    next_seq: u64,
    order: BTreeMap<u64, (DeliveryId, DeliveryState)>,
    index: HashMap<DeliveryId, u64>,
}

impl SettlementPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, delivery: DeliveryId) {
        if self.index.contains_key(&delivery) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, (delivery, DeliveryState::Pending));
        self.index.insert(delivery, seq);
    }

    /// Records the outcome of `delivery` and returns every outcome that can
    /// now be applied, oldest first. Unknown deliveries are ignored.
    pub fn record(&mut self, delivery: DeliveryId, outcome: Outcome) -> Vec<(DeliveryId, Outcome)> {
        let Some(seq) = self.index.get(&delivery).copied() else {
            return Vec::new();
        };
        if let Some(entry) = self.order.get_mut(&seq) {
            entry.1 = DeliveryState::from(outcome);
        }

        let mut ready = Vec::new();
        while let Some(entry) = self.order.first_entry() {
            let (delivery, state) = *entry.get();
            let Some(outcome) = state.outcome() else {
                break;
            };
            entry.remove();
            self.index.remove(&delivery);
            ready.push((delivery, outcome));
        }
        ready
    }

    /// Empties the propagator when the destination leg is gone. Deliveries
    /// still pending come back as [`DeliveryState::Pending`] and must be
    /// released by the caller.
    pub fn abandon(&mut self) -> Vec<(DeliveryId, DeliveryState)> {
        self.index.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }

    pub fn unsettled(&self) -> usize {
        self.order.len()
    }
}

/// Egress-side record of deliveries relayed onto the egress leg, keyed by the
/// delivery id used on that leg, plus deliveries waiting for egress credit.
#[derive(Debug, Default)]
pub struct RelayedDeliveries {
    by_outbound: HashMap<DeliveryId, DeliveryId>,
    backlog: VecDeque<(DeliveryId, Vec<u8>)>,
}

impl RelayedDeliveries {
    pub fn insert(&mut self, outbound: DeliveryId, origin: DeliveryId) {
        self.by_outbound.insert(outbound, origin);
    }

    pub fn remove(&mut self, outbound: DeliveryId) -> Option<DeliveryId> {
        self.by_outbound.remove(&outbound)
    }

    pub fn push_backlog(&mut self, origin: DeliveryId, payload: Vec<u8>) {
        self.backlog.push_back((origin, payload));
    }

    pub fn pop_backlog(&mut self) -> Option<(DeliveryId, Vec<u8>)> {
        self.backlog.pop_front()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn in_flight(&self) -> usize {
        self.by_outbound.len()
    }

    /// Splits the record when the origin leg is gone: outbound ids still
    /// awaiting an outcome, and origins that were never sent.
    pub fn orphan(&mut self) -> (Vec<DeliveryId>, Vec<DeliveryId>) {
        let outbound = self.by_outbound.drain().map(|(outbound, _)| outbound).collect();
        let unsent = self.backlog.drain(..).map(|(origin, _)| origin).collect();
        (outbound, unsent)
    }
}
