use crate::autolink::error::{AutolinkError, protocol_violation};

/// Ingress-side view of a binding's credit. Tracks what the paired egress leg
/// last reported and what has been forwarded since, and derives the credit
/// the ingress leg may advertise to its remote sender.
#[derive(Debug, Clone)]
pub struct CreditRelay {
    capacity: u32,
    advertised: u32,
    egress_credit: u32,
    egress_delivered: u64,
    forwarded: u64,
    unsettled: u32,
    grace: u32,
}

impl CreditRelay {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            advertised: 0,
            egress_credit: 0,
            egress_delivered: 0,
            forwarded: 0,
            unsettled: 0,
            grace: 0,
        }
    }

    /// Starts with transfers still owed to the remote from credit granted
    /// under an earlier binding.
    pub fn with_grace(capacity: u32, grace: u32) -> Self {
        Self {
            grace,
            ..Self::new(capacity)
        }
    }

    pub fn advertised(&self) -> u32 {
        self.advertised
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn grace(&self) -> u32 {
        self.grace
    }

    /// Egress credit minus deliveries forwarded that the egress side had not
    /// yet seen when it reported.
    pub fn egress_available(&self) -> u32 {
        let in_flight = self.forwarded.saturating_sub(self.egress_delivered);
        let in_flight = u32::try_from(in_flight).unwrap_or(u32::MAX);
        self.egress_credit.saturating_sub(in_flight)
    }

    pub fn target(&self) -> u32 {
        self.egress_available()
            .min(self.capacity.saturating_sub(self.unsettled))
    }

    /// Applies a `(credit, delivered)` report from the egress context. Returns
    /// the new credit to advertise when it changed.
    pub fn on_egress_report(&mut self, credit: u32, delivered: u64) -> Option<u32> {
        if delivered < self.egress_delivered {
            return None;
        }
        self.egress_credit = credit;
        self.egress_delivered = delivered;
        self.rebalance()
    }

    pub fn on_transfer(&mut self) -> Result<Option<u32>, AutolinkError> {
        if self.advertised > 0 {
            self.advertised -= 1;
        } else if self.grace > 0 {
            self.grace -= 1;
        } else {
            return Err(protocol_violation("transfer received without link credit"));
        }

        self.forwarded += 1;
        self.unsettled = self.unsettled.saturating_add(1);
        Ok(self.rebalance())
    }

    pub fn on_settled(&mut self, count: u32) -> Option<u32> {
        self.unsettled = self.unsettled.saturating_sub(count);
        self.rebalance()
    }

    /// Drops advertised credit to zero. Returns `Some(0)` when a flow must be
    /// sent.
    pub fn revoke(&mut self) -> Option<u32> {
        self.egress_credit = 0;
        if self.advertised == 0 {
            return None;
        }
        self.grace = self.grace.saturating_add(self.advertised);
        self.advertised = 0;
        Some(0)
    }

    fn rebalance(&mut self) -> Option<u32> {
        let target = self.target();
        if target == self.advertised {
            return None;
        }
        if target < self.advertised {
            self.grace = self.grace.saturating_add(self.advertised - target);
        }
        self.advertised = target;
        Some(target)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EgressCredit {
    available: u32,
}

impl EgressCredit {
    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn on_flow(&mut self, credit: i64) -> Result<(), AutolinkError> {
        if credit < 0 {
            return Err(protocol_violation(format!(
                "negative link credit granted: {credit}"
            )));
        }
        self.available = u32::try_from(credit).unwrap_or(u32::MAX);
        Ok(())
    }

    pub fn try_consume(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }
}
