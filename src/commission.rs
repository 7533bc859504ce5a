// 📝 Commissions - Two-phase usage changes
//
// A commission is a tagged record, not a held lock:
//   pending  -> accepted   (deltas applied, timeline appended)
//   pending  -> rejected   (reservations dropped)
// Both targets are terminal. After a crash every pending record is simply
// waiting for accept or reject.

use crate::error::{QuotaError, QuotaResult};
use crate::holding::HoldingKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// PROVISION
// ============================================================================

/// One (entity, resource, signed quantity) line of a commission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub entity: String,
    pub resource: String,
    pub quantity: i64,
}

impl Provision {
    pub fn new(entity: &str, resource: &str, quantity: i64) -> Self {
        Provision {
            entity: entity.to_string(),
            resource: resource.to_string(),
            quantity,
        }
    }

    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(&self.entity, &self.resource)
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionState {
    Pending,
    Accepted,
    Rejected,
}

impl CommissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionState::Pending => "pending",
            CommissionState::Accepted => "accepted",
            CommissionState::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommissionState::Pending),
            "accepted" => Some(CommissionState::Accepted),
            "rejected" => Some(CommissionState::Rejected),
            _ => None,
        }
    }
}

/// How to resolve a pending commission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn target_state(&self) -> CommissionState {
        match self {
            Decision::Accept => CommissionState::Accepted,
            Decision::Reject => CommissionState::Rejected,
        }
    }
}

/// One `resolve_pending_commissions` item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub serial: u64,
    pub decision: Decision,
}

impl Resolution {
    pub fn accept(serial: u64) -> Self {
        Resolution {
            serial,
            decision: Decision::Accept,
        }
    }

    pub fn reject(serial: u64) -> Self {
        Resolution {
            serial,
            decision: Decision::Reject,
        }
    }
}

// ============================================================================
// COMMISSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub serial: u64,

    /// Entity whose context issued the commission
    pub issuer: String,

    pub provisions: Vec<Provision>,
    pub state: CommissionState,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Commission {
    pub fn new(serial: u64, issuer: &str, provisions: Vec<Provision>) -> Self {
        Commission {
            serial,
            issuer: issuer.to_string(),
            provisions,
            state: CommissionState::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == CommissionState::Pending
    }

    /// Holdings touched, in lock order
    pub fn keys(&self) -> BTreeSet<HoldingKey> {
        self.provisions.iter().map(Provision::key).collect()
    }

    pub fn touches(&self, entity: &str) -> bool {
        self.provisions.iter().any(|p| p.entity == entity)
    }

    /// Copy in the resolved state; fails unless still pending
    pub fn resolved(&self, decision: Decision) -> QuotaResult<Commission> {
        if !self.is_pending() {
            return Err(QuotaError::InvalidCommission {
                serial: self.serial,
                reason: format!("already {}", self.state.as_str()),
            });
        }
        let mut next = self.clone();
        next.state = decision.target_state();
        next.resolved_at = Some(Utc::now());
        Ok(next)
    }
}

// ============================================================================
// COMMISSION BOOK
// ============================================================================

/// Every known commission plus the serial counter
#[derive(Debug, Clone)]
pub struct CommissionBook {
    commissions: BTreeMap<u64, Commission>,
    next_serial: u64,
}

impl CommissionBook {
    /// `next_serial` must exceed every serial ever handed out, including purged ones
    pub fn new(next_serial: u64) -> Self {
        CommissionBook {
            commissions: BTreeMap::new(),
            next_serial: next_serial.max(1),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    pub fn insert(&mut self, commission: Commission) {
        if commission.serial >= self.next_serial {
            self.next_serial = commission.serial + 1;
        }
        self.commissions.insert(commission.serial, commission);
    }

    pub fn get(&self, serial: u64) -> Option<&Commission> {
        self.commissions.get(&serial)
    }

    pub fn remove(&mut self, serial: u64) -> Option<Commission> {
        self.commissions.remove(&serial)
    }

    /// The commission if it exists and is still pending
    pub fn require_pending(&self, serial: u64) -> QuotaResult<&Commission> {
        match self.commissions.get(&serial) {
            None => Err(QuotaError::InvalidCommission {
                serial,
                reason: "unknown serial".to_string(),
            }),
            Some(c) if !c.is_pending() => Err(QuotaError::InvalidCommission {
                serial,
                reason: format!("already {}", c.state.as_str()),
            }),
            Some(c) => Ok(c),
        }
    }

    /// Pending serials, optionally only those issued by `issuer`
    pub fn pending(&self, issuer: Option<&str>) -> Vec<u64> {
        self.commissions
            .values()
            .filter(|c| c.is_pending())
            .filter(|c| issuer.map_or(true, |i| c.issuer == i))
            .map(|c| c.serial)
            .collect()
    }

    /// Pending commissions issued by or touching `entity`
    pub fn pending_involving(&self, entity: &str) -> Vec<u64> {
        self.commissions
            .values()
            .filter(|c| c.is_pending() && (c.issuer == entity || c.touches(entity)))
            .map(|c| c.serial)
            .collect()
    }

    /// Resolved commissions resolved strictly before `cutoff`
    pub fn resolved_before(&self, cutoff: DateTime<Utc>) -> Vec<u64> {
        self.commissions
            .values()
            .filter(|c| c.resolved_at.map_or(false, |at| at < cutoff))
            .map(|c| c.serial)
            .collect()
    }
}

impl Default for CommissionBook {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_serials_are_monotonic() {
        let mut book = CommissionBook::default();
        assert_eq!(book.next_serial(), 1);
        book.insert(Commission::new(1, "system", vec![]));
        assert_eq!(book.next_serial(), 2);

        // loading a stored commission never lets the counter go backwards
        book.insert(Commission::new(40, "system", vec![]));
        book.insert(Commission::new(7, "system", vec![]));
        assert_eq!(book.next_serial(), 41);
        assert_eq!(CommissionBook::new(0).next_serial(), 1);
    }

    #[test]
    fn test_resolve_exactly_once() {
        let commission = Commission::new(1, "system", vec![Provision::new("e1", "cpu", 3)]);
        let accepted = commission.resolved(Decision::Accept).unwrap();
        assert_eq!(accepted.state, CommissionState::Accepted);
        assert!(accepted.resolved_at.is_some());

        let again = accepted.resolved(Decision::Reject).unwrap_err();
        assert!(matches!(again, QuotaError::InvalidCommission { serial: 1, .. }));
    }

    #[test]
    fn test_require_pending() {
        let mut book = CommissionBook::default();
        let serial = book.next_serial();
        let commission = Commission::new(serial, "system", vec![]);
        book.insert(commission.resolved(Decision::Reject).unwrap());

        assert!(matches!(
            book.require_pending(serial),
            Err(QuotaError::InvalidCommission { ref reason, .. }) if reason == "already rejected"
        ));
        assert!(matches!(
            book.require_pending(999),
            Err(QuotaError::InvalidCommission { ref reason, .. }) if reason == "unknown serial"
        ));
    }

    #[test]
    fn test_pending_filters() {
        let mut book = CommissionBook::default();
        book.insert(Commission::new(1, "svc", vec![Provision::new("e1", "cpu", 1)]));
        book.insert(Commission::new(2, "system", vec![Provision::new("e2", "cpu", 1)]));
        let done = Commission::new(3, "svc", vec![Provision::new("e1", "ram", 1)]);
        book.insert(done.resolved(Decision::Accept).unwrap());

        assert_eq!(book.pending(None), vec![1, 2]);
        assert_eq!(book.pending(Some("svc")), vec![1]);
        assert_eq!(book.pending_involving("e1"), vec![1]);
        assert_eq!(book.pending_involving("svc"), vec![1]);
        assert!(book.pending_involving("e3").is_empty());
    }

    #[test]
    fn test_resolved_before() {
        let mut book = CommissionBook::default();
        book.insert(Commission::new(1, "svc", vec![]).resolved(Decision::Accept).unwrap());
        book.insert(Commission::new(2, "svc", vec![]));

        let later = Utc::now() + Duration::seconds(5);
        assert_eq!(book.resolved_before(later), vec![1]);
        assert!(book.resolved_before(Utc::now() - Duration::days(1)).is_empty());
    }

    #[test]
    fn test_commission_keys_dedup_and_sort() {
        let commission = Commission::new(
            1,
            "svc",
            vec![
                Provision::new("b", "cpu", 1),
                Provision::new("a", "cpu", 1),
                Provision::new("b", "cpu", 2),
            ],
        );
        let keys: Vec<String> = commission.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a:cpu", "b:cpu"]);
    }

    #[test]
    fn test_state_strings() {
        for state in [
            CommissionState::Pending,
            CommissionState::Accepted,
            CommissionState::Rejected,
        ] {
            assert_eq!(CommissionState::from_str(state.as_str()), Some(state));
        }
    }
}
