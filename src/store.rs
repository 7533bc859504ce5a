// Storage seam
//
// The service keeps its working state in memory and writes every call's
// mutations through to a Store as one change batch. A batch is applied
// entirely or not at all; the in-memory state is only touched after the
// batch is durable.

use crate::commission::Commission;
use crate::entity::Entity;
use crate::error::QuotaResult;
use crate::holding::{Holding, HoldingKey};
use crate::policy::Policy;
use crate::sync;
use crate::timeline::{TimelineEntry, TimelineQuery};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One durable mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    PutEntity(Entity),
    DeleteEntity(String),
    PutPolicy(Policy),
    PutHolding(Holding),
    DeleteHolding(HoldingKey),
    PutCommission(Commission),
    DeleteCommission(u64),
    AppendTimeline(TimelineEntry),
    SetNextSerial(u64),
}

/// Everything needed to rebuild the service after a restart
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub entities: Vec<Entity>,
    pub policies: Vec<Policy>,
    pub holdings: Vec<Holding>,
    pub commissions: Vec<Commission>,
    pub next_serial: u64,
}

pub trait Store: Send + Sync {
    /// Load the full working state
    fn load(&self) -> QuotaResult<StoredState>;

    /// Apply a batch atomically
    fn apply(&self, changes: &[Change]) -> QuotaResult<()>;

    /// Timeline entries matching `query`, ascending by timestamp then append order
    fn timeline(&self, query: &TimelineQuery) -> QuotaResult<Vec<TimelineEntry>>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<String, Entity>,
    policies: BTreeMap<String, Policy>,
    holdings: BTreeMap<HoldingKey, Holding>,
    commissions: BTreeMap<u64, Commission>,
    timeline: Vec<TimelineEntry>,
    next_serial: u64,
}

/// Non-durable store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timeline entries ever appended
    pub fn timeline_len(&self) -> QuotaResult<usize> {
        Ok(sync::lock(&self.state, "memory store")?.timeline.len())
    }
}

impl Store for MemoryStore {
    fn load(&self) -> QuotaResult<StoredState> {
        let state = sync::lock(&self.state, "memory store")?;
        Ok(StoredState {
            entities: state.entities.values().cloned().collect(),
            policies: state.policies.values().cloned().collect(),
            holdings: state.holdings.values().cloned().collect(),
            commissions: state.commissions.values().cloned().collect(),
            next_serial: state.next_serial,
        })
    }

    fn apply(&self, changes: &[Change]) -> QuotaResult<()> {
        let mut state = sync::lock(&self.state, "memory store")?;
        for change in changes {
            match change {
                Change::PutEntity(e) => {
                    state.entities.insert(e.name.clone(), e.clone());
                }
                Change::DeleteEntity(name) => {
                    state.entities.remove(name);
                }
                Change::PutPolicy(p) => {
                    state.policies.insert(p.name.clone(), p.clone());
                }
                Change::PutHolding(h) => {
                    state.holdings.insert(h.key(), h.clone());
                }
                Change::DeleteHolding(key) => {
                    state.holdings.remove(key);
                }
                Change::PutCommission(c) => {
                    state.commissions.insert(c.serial, c.clone());
                }
                Change::DeleteCommission(serial) => {
                    state.commissions.remove(serial);
                }
                Change::AppendTimeline(entry) => state.timeline.push(entry.clone()),
                Change::SetNextSerial(next) => state.next_serial = *next,
            }
        }
        Ok(())
    }

    fn timeline(&self, query: &TimelineQuery) -> QuotaResult<Vec<TimelineEntry>> {
        let state = sync::lock(&self.state, "memory store")?;
        let mut entries: Vec<TimelineEntry> = state
            .timeline
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        // stable: equal timestamps keep append order
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Limits;
    use chrono::{Duration, Utc};

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let key = HoldingKey::new("e1", "cpu");
        store
            .apply(&[
                Change::PutEntity(Entity::new("e1", Some("system"), "k1")),
                Change::PutPolicy(Policy::new("gold", Limits::uniform(10))),
                Change::PutHolding(Holding::new(&key, "gold")),
                Change::PutCommission(Commission::new(3, "system", vec![])),
                Change::SetNextSerial(4),
            ])
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.entities.len(), 1);
        assert_eq!(state.policies.len(), 1);
        assert_eq!(state.holdings[0].key(), key);
        assert_eq!(state.commissions[0].serial, 3);
        assert_eq!(state.next_serial, 4);

        store
            .apply(&[Change::DeleteHolding(key), Change::DeleteEntity("e1".into())])
            .unwrap();
        let state = store.load().unwrap();
        assert!(state.entities.is_empty());
        assert!(state.holdings.is_empty());
    }

    #[test]
    fn test_memory_store_timeline_order() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let late = TimelineEntry::new("e1", "cpu", 1, 2, 2, "system", t0 + Duration::seconds(1));
        let early = TimelineEntry::new("e1", "cpu", 1, 1, 1, "system", t0);
        let other = TimelineEntry::new("e2", "cpu", 1, 1, 1, "system", t0);
        store
            .apply(&[
                Change::AppendTimeline(late),
                Change::AppendTimeline(early),
                Change::AppendTimeline(other),
            ])
            .unwrap();

        let entries = store.timeline(&TimelineQuery::entity("e1")).unwrap();
        let serials: Vec<u64> = entries.iter().map(|e| e.serial).collect();
        assert_eq!(serials, vec![1, 2]);
        assert_eq!(store.timeline_len().unwrap(), 3);
    }
}
