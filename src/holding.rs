// 📊 Holding Ledger - Usage counters per (entity, resource)
//
// Counters:
//   imported / exported   committed totals, only ever grow (except set_holding)
//   importing / exporting reserved by pending commissions, not yet committed
//
// Net usage = imported - exported. Validation always looks at committed
// usage plus every pending reservation, so two pending commissions can never
// jointly spend the same capacity.

use crate::error::{QuotaError, QuotaResult};
use crate::policy::Limits;
use crate::sync;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// HOLDING KEY
// ============================================================================

/// (entity, resource). Ordering is the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HoldingKey {
    pub entity: String,
    pub resource: String,
}

impl HoldingKey {
    pub fn new(entity: &str, resource: &str) -> Self {
        HoldingKey {
            entity: entity.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for HoldingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.resource)
    }
}

// ============================================================================
// HOLDING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub entity: String,
    pub resource: String,

    /// Active policy, looked up by name at validation time
    pub policy: String,

    pub imported: i64,
    pub exported: i64,
    pub importing: i64,
    pub exporting: i64,

    /// Bumped on every write
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn new(key: &HoldingKey, policy: &str) -> Self {
        Holding {
            entity: key.entity.clone(),
            resource: key.resource.clone(),
            policy: policy.to_string(),
            imported: 0,
            exported: 0,
            importing: 0,
            exporting: 0,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(&self.entity, &self.resource)
    }

    /// Committed net usage
    pub fn usage(&self) -> i64 {
        self.imported - self.exported
    }

    /// No pending reservations
    pub fn is_idle(&self) -> bool {
        self.importing == 0 && self.exporting == 0
    }

    /// Nothing held and nothing reserved
    pub fn is_empty(&self) -> bool {
        self.usage() == 0 && self.is_idle()
    }

    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Reserve `delta` against `limits`, counting every pending reservation.
    ///
    /// Positive deltas import, negative deltas export. The overdraft flag
    /// waives the ceiling and floor checks, never the import/export limits.
    pub fn reserve(&mut self, delta: i64, limits: &Limits) -> QuotaResult<()> {
        let overflow = || QuotaError::Validation(format!("quantity overflow on {}", self.key()));

        if delta == 0 {
            return Err(QuotaError::Validation(format!(
                "zero quantity provision on {}",
                self.key()
            )));
        }

        if delta > 0 {
            let importing = self.importing.checked_add(delta).ok_or_else(overflow)?;
            if importing > limits.import_limit {
                return Err(QuotaError::limit(
                    &self.entity,
                    &self.resource,
                    format!(
                        "pending imports {} exceed import limit {}",
                        importing, limits.import_limit
                    ),
                ));
            }

            // must also fit the committed counter once accepted
            let ceiling_side = self.imported.checked_add(importing).ok_or_else(overflow)?;
            let projected = ceiling_side.checked_sub(self.exported).ok_or_else(overflow)?;
            if !limits.flags.allows_overdraft() && projected > limits.ceiling() {
                return Err(QuotaError::limit(
                    &self.entity,
                    &self.resource,
                    format!(
                        "usage {} with pending {} would exceed limit {}",
                        self.usage(),
                        projected - self.usage(),
                        limits.ceiling()
                    ),
                ));
            }

            self.importing = importing;
        } else {
            let amount = delta.checked_neg().ok_or_else(overflow)?;
            let exporting = self.exporting.checked_add(amount).ok_or_else(overflow)?;
            if exporting > limits.export_limit {
                return Err(QuotaError::limit(
                    &self.entity,
                    &self.resource,
                    format!(
                        "pending exports {} exceed export limit {}",
                        exporting, limits.export_limit
                    ),
                ));
            }

            let floor_side = self.exported.checked_add(exporting).ok_or_else(overflow)?;
            let projected = self.imported.checked_sub(floor_side).ok_or_else(overflow)?;
            if !limits.flags.allows_overdraft() && projected < 0 {
                return Err(QuotaError::limit(
                    &self.entity,
                    &self.resource,
                    format!(
                        "usage {} with pending exports {} would drop below zero",
                        self.usage(),
                        exporting
                    ),
                ));
            }

            self.exporting = exporting;
        }

        self.touch();
        Ok(())
    }

    /// Drop a reservation made by `reserve` (commission rejected)
    pub fn release(&mut self, delta: i64) {
        if delta > 0 {
            self.importing -= delta;
        } else {
            self.exporting += delta;
        }
        self.touch();
    }

    /// Turn a reservation made by `reserve` into committed usage
    /// (commission accepted). Returns the resulting net usage.
    pub fn commit(&mut self, delta: i64) -> i64 {
        if delta > 0 {
            self.importing -= delta;
            self.imported += delta;
        } else {
            self.exporting += delta;
            self.exported -= delta;
        }
        self.touch();
        self.usage()
    }
}

// ============================================================================
// CALL ITEMS
// ============================================================================

/// One `set_holding` item: administrative override of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingUpdate {
    pub entity: String,
    pub resource: String,
    pub policy: String,
    pub imported: i64,
    pub exported: i64,
}

impl HoldingUpdate {
    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(&self.entity, &self.resource)
    }
}

/// One `set_quota` item: limits for one holding without a named policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub entity: String,
    pub resource: String,
    #[serde(flatten)]
    pub limits: Limits,
}

impl QuotaUpdate {
    pub fn new(entity: &str, resource: &str, limits: Limits) -> Self {
        QuotaUpdate {
            entity: entity.to_string(),
            resource: resource.to_string(),
            limits,
        }
    }

    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(&self.entity, &self.resource)
    }
}

/// `get_quota` reply: effective limits plus usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub entity: String,
    pub resource: String,
    pub policy: String,
    pub limits: Limits,
    pub usage: i64,
    pub importing: i64,
    pub exporting: i64,
}

// ============================================================================
// HOLDING LEDGER
// ============================================================================

/// Every holding behind its own mutex
#[derive(Debug, Default)]
pub struct HoldingLedger {
    holdings: BTreeMap<HoldingKey, Arc<Mutex<Holding>>>,
}

impl HoldingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, holding: Holding) {
        self.holdings
            .insert(holding.key(), Arc::new(Mutex::new(holding)));
    }

    pub fn remove(&mut self, key: &HoldingKey) -> bool {
        self.holdings.remove(key).is_some()
    }

    pub fn contains(&self, key: &HoldingKey) -> bool {
        self.holdings.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.holdings.len()
    }

    pub fn handle(&self, key: &HoldingKey) -> Option<Arc<Mutex<Holding>>> {
        self.holdings.get(key).cloned()
    }

    /// Keys of every holding of `entity`, sorted
    pub fn keys_for_entity(&self, entity: &str) -> Vec<HoldingKey> {
        self.holdings
            .keys()
            .filter(|k| k.entity == entity)
            .cloned()
            .collect()
    }

    /// Resource names held by `entity`, sorted
    pub fn resources(&self, entity: &str) -> Vec<String> {
        self.keys_for_entity(entity)
            .into_iter()
            .map(|k| k.resource)
            .collect()
    }

    /// Handles for `keys` in lock order; keys without a holding are skipped
    pub fn handles(&self, keys: &BTreeSet<HoldingKey>) -> HoldingHandles {
        let handles = keys
            .iter()
            .filter_map(|key| self.handle(key).map(|h| (key.clone(), h)))
            .collect();
        HoldingHandles { handles }
    }
}

/// Handles collected in lock order, ready to be locked together
pub struct HoldingHandles {
    handles: Vec<(HoldingKey, Arc<Mutex<Holding>>)>,
}

impl HoldingHandles {
    /// Lock every holding in ascending key order
    pub fn lock(&self) -> QuotaResult<LockedHoldings<'_>> {
        let mut guards = BTreeMap::new();
        for (key, handle) in &self.handles {
            guards.insert(key.clone(), sync::lock(handle, "holding")?);
        }
        Ok(LockedHoldings { guards })
    }
}

/// A set of holdings exclusively held for the rest of one call
pub struct LockedHoldings<'a> {
    guards: BTreeMap<HoldingKey, MutexGuard<'a, Holding>>,
}

impl<'a> LockedHoldings<'a> {
    pub fn contains(&self, key: &HoldingKey) -> bool {
        self.guards.contains_key(key)
    }

    /// Scratch copies to validate against without touching the real state
    pub fn scratch(&self) -> BTreeMap<HoldingKey, Holding> {
        self.guards
            .iter()
            .map(|(k, g)| (k.clone(), (**g).clone()))
            .collect()
    }

    /// Overwrite locked holdings with validated scratch copies
    pub fn store(&mut self, scratch: BTreeMap<HoldingKey, Holding>) {
        for (key, holding) in scratch {
            if let Some(guard) = self.guards.get_mut(&key) {
                **guard = holding;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Holding> {
        self.guards.values().map(|g| &**g)
    }
}

// ============================================================================
// TESTS
// ============================================================================
