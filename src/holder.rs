// 🏦 Quota Holder - The service behind every call
//
// Working state lives in memory; every call writes its mutations to the
// Store as one batch and only then updates memory.
//
// Lock order, each taken at most once per call:
//   entity registry -> policies -> holding map -> holding mutexes (key order)
//   -> commission book -> store
// Structural calls take the registry for write, everything else for read.

use crate::batch::{BatchResult, IssueOutcome, Lookup, ProvisionFailure};
use crate::commission::{Commission, CommissionBook, Decision, Provision, Resolution};
use crate::config::EngineConfig;
use crate::db::SqliteStore;
use crate::entity::{
    validate_name, Authority, Context, Entity, EntityInfo, EntityRegistry, KeyRotation, ListQuery,
    NewEntity,
};
use crate::error::{QuotaError, QuotaResult};
use crate::holding::{
    Holding, HoldingKey, HoldingLedger, HoldingUpdate, LockedHoldings, QuotaSnapshot, QuotaUpdate,
};
use crate::policy::{quota_policy_name, Policy, PolicyLimits, PolicyStore};
use crate::store::{Change, MemoryStore, Store};
use crate::sync;
use crate::timeline::{TimelineEntry, TimelineQuery, OVERRIDE_SERIAL};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct QuotaHolder {
    store: Arc<dyn Store>,
    registry: RwLock<EntityRegistry>,
    policies: RwLock<PolicyStore>,
    holdings: RwLock<HoldingLedger>,
    commissions: Mutex<CommissionBook>,
    retention: Duration,
}

impl QuotaHolder {
    // ========================================================================
    // OPEN / RECOVERY
    // ========================================================================

    /// Rebuild the working state from `store`, bootstrapping the admin
    /// entity on first open. Pending commissions come back pending.
    pub fn open(config: &EngineConfig, store: Arc<dyn Store>) -> QuotaResult<Self> {
        let retention = config.retention().ok_or_else(|| {
            QuotaError::Validation(format!(
                "commission_retention_days is out of range ({})",
                config.commission_retention_days
            ))
        })?;
        let state = store.load()?;

        let mut registry = EntityRegistry::new(&config.admin_entity);
        for entity in state.entities {
            registry.insert(entity);
        }

        let mut policies = PolicyStore::new();
        for policy in state.policies {
            policies.upsert(policy);
        }

        let mut ledger = HoldingLedger::new();
        for holding in state.holdings {
            ledger.insert(holding);
        }

        let mut book = CommissionBook::new(state.next_serial);
        for commission in state.commissions {
            book.insert(commission);
        }

        if !registry.contains(&config.admin_entity) {
            let admin = Entity::new(&config.admin_entity, None, &config.admin_key);
            store.apply(&[Change::PutEntity(admin.clone())])?;
            registry.insert(admin);
            info!(admin = %config.admin_entity, "Bootstrapped administrative entity");
        }

        info!(
            entities = registry.count(),
            policies = policies.count(),
            holdings = ledger.count(),
            pending = book.pending(None).len(),
            next_serial = book.next_serial(),
            "Quota holder opened"
        );

        Ok(QuotaHolder {
            store,
            registry: RwLock::new(registry),
            policies: RwLock::new(policies),
            holdings: RwLock::new(ledger),
            commissions: Mutex::new(book),
            retention,
        })
    }

    /// Non-durable instance
    pub fn in_memory(config: &EngineConfig) -> QuotaResult<Self> {
        Self::open(config, Arc::new(MemoryStore::new()))
    }

    /// Instance over the SQLite file named in `config`
    pub fn open_sqlite(config: &EngineConfig) -> QuotaResult<Self> {
        let store = SqliteStore::open(&config.database)?;
        Self::open(config, Arc::new(store))
    }

    pub fn admin(&self) -> QuotaResult<String> {
        Ok(sync::read(&self.registry, "entity registry")?
            .admin()
            .to_string())
    }

    /// Resolved commissions older than this are purged by `purge_expired`
    pub fn retention_cutoff(&self) -> QuotaResult<DateTime<Utc>> {
        Utc::now().checked_sub_signed(self.retention).ok_or_else(|| {
            QuotaError::Validation("commission retention cutoff is out of range".to_string())
        })
    }

    fn require_admin(registry: &EntityRegistry, caller: &str) -> QuotaResult<()> {
        if registry.is_admin(caller) {
            Ok(())
        } else {
            Err(QuotaError::Authorization(format!(
                "{} is not the administrative entity",
                caller
            )))
        }
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Create entities under existing owners. Partial: returns rejected names.
    pub fn create_entity(
        &self,
        ctx: &Context,
        items: Vec<NewEntity>,
    ) -> QuotaResult<BatchResult<String>> {
        let mut registry = sync::write(&self.registry, "entity registry")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        // later items may use owners created by earlier ones
        let mut scratch = registry.clone();
        let mut result = BatchResult::new();
        let mut changes = Vec::new();

        for item in items {
            match Self::check_new_entity(&scratch, &caller, &item) {
                Ok(()) => {
                    let entity = Entity::new(&item.name, Some(&item.owner), &item.key);
                    changes.push(Change::PutEntity(entity.clone()));
                    scratch.insert(entity);
                }
                Err(e) => {
                    warn!(caller = %caller, entity = %item.name, error = %e, "Entity rejected");
                    result.reject(item.name, e);
                }
            }
        }

        self.store.apply(&changes)?;
        *registry = scratch;

        if !changes.is_empty() {
            info!(caller = %caller, created = changes.len(), "Created entities");
        }
        Ok(result)
    }

    fn check_new_entity(registry: &EntityRegistry, caller: &str, item: &NewEntity) -> QuotaResult<()> {
        validate_name("entity", &item.name)?;
        if registry.contains(&item.name) {
            return Err(QuotaError::Conflict(format!(
                "entity {} already exists",
                item.name
            )));
        }
        registry.require(&item.owner)?;
        registry.authorize(caller, &item.owner, Authority::SelfOrAncestor)
    }

    /// Rotate keys. Each item authenticates with its own old key.
    pub fn set_entity_key(&self, items: Vec<KeyRotation>) -> QuotaResult<BatchResult<String>> {
        let mut registry = sync::write(&self.registry, "entity registry")?;

        let mut scratch = registry.clone();
        let mut result = BatchResult::new();
        let mut changes = Vec::new();

        for item in items {
            let rotated = scratch
                .authenticate(&item.entity, &item.old_key)
                .map(|entity| entity.with_key(&item.new_key));
            match rotated {
                Ok(entity) => {
                    changes.push(Change::PutEntity(entity.clone()));
                    scratch.insert(entity);
                }
                Err(e) => {
                    warn!(entity = %item.entity, error = %e, "Key rotation rejected");
                    result.reject(item.entity, e);
                }
            }
        }

        self.store.apply(&changes)?;
        *registry = scratch;

        if !changes.is_empty() {
            info!(rotated = changes.len(), "Rotated entity keys");
        }
        Ok(result)
    }

    pub fn get_entity(&self, entity: &str, key: &str) -> QuotaResult<EntityInfo> {
        let registry = sync::read(&self.registry, "entity registry")?;
        Ok(registry.authenticate(entity, key)?.descriptor())
    }

    /// Entities directly owned by `entity`, sorted by name
    pub fn list_entities(&self, entity: &str, key: &str, query: &ListQuery) -> QuotaResult<Vec<String>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        registry.authenticate(entity, key)?;
        Ok(registry.list_owned(entity, query))
    }

    /// Remove an entity that holds nothing, owns nothing and has no open commissions
    pub fn release_entity(&self, ctx: &Context, entity: &str) -> QuotaResult<()> {
        let mut registry = sync::write(&self.registry, "entity registry")?;
        let mut ledger = sync::write(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        registry.require(entity)?;
        if registry.is_admin(entity) {
            return Err(QuotaError::NotEmpty {
                entity: entity.to_string(),
                reason: "the administrative entity cannot be released".to_string(),
            });
        }
        registry.authorize(&caller, entity, Authority::Ancestor)?;

        let children = registry.children(entity).len();
        if children > 0 {
            return Err(QuotaError::NotEmpty {
                entity: entity.to_string(),
                reason: format!("owns {} entities", children),
            });
        }

        let keys: BTreeSet<HoldingKey> = ledger.keys_for_entity(entity).into_iter().collect();
        let handles = ledger.handles(&keys);
        let locked = handles.lock()?;
        if let Some(holding) = locked.iter().find(|h| !h.is_empty()) {
            return Err(QuotaError::NotEmpty {
                entity: entity.to_string(),
                reason: format!(
                    "holding {} has usage {} (importing {}, exporting {})",
                    holding.key(),
                    holding.usage(),
                    holding.importing,
                    holding.exporting
                ),
            });
        }

        let book = sync::lock(&self.commissions, "commission book")?;
        let pending = book.pending_involving(entity);
        if !pending.is_empty() {
            return Err(QuotaError::NotEmpty {
                entity: entity.to_string(),
                reason: format!("pending commissions {:?}", pending),
            });
        }

        let mut changes: Vec<Change> = keys.iter().cloned().map(Change::DeleteHolding).collect();
        changes.push(Change::DeleteEntity(entity.to_string()));
        self.store.apply(&changes)?;

        drop(book);
        drop(locked);
        for key in &keys {
            ledger.remove(key);
        }
        registry.remove(entity);

        info!(caller = %caller, entity = %entity, holdings = keys.len(), "Released entity");
        Ok(())
    }

    // ========================================================================
    // POLICIES
    // ========================================================================

    /// Create or replace named policies (admin only). Partial.
    pub fn set_limits(&self, ctx: &Context, items: Vec<PolicyLimits>) -> QuotaResult<BatchResult<String>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let mut policies = sync::write(&self.policies, "policy store")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        Self::require_admin(&registry, &caller)?;

        let mut result = BatchResult::new();
        let mut staged = Vec::new();
        let now = Utc::now();

        for item in items {
            match item.validate() {
                Ok(()) => staged.push(Policy {
                    name: item.policy,
                    limits: item.limits,
                    updated_at: now,
                }),
                Err(e) => {
                    warn!(policy = %item.policy, error = %e, "Policy rejected");
                    result.reject(item.policy, e);
                }
            }
        }

        let changes: Vec<Change> = staged.iter().cloned().map(Change::PutPolicy).collect();
        self.store.apply(&changes)?;

        let count = staged.len();
        for policy in staged {
            policies.upsert(policy);
        }
        if count > 0 {
            info!(caller = %caller, policies = count, "Set policy limits");
        }
        Ok(result)
    }

    pub fn get_limits(&self, ctx: &Context, names: Vec<String>) -> QuotaResult<Lookup<Policy, String>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let policies = sync::read(&self.policies, "policy store")?;
        registry.authenticate_context(ctx)?;

        let mut lookup = Lookup::new();
        for name in names {
            match policies.require(&name) {
                Ok(policy) => lookup.found(policy.clone()),
                Err(e) => lookup.reject(name, e),
            }
        }
        Ok(lookup)
    }

    // ========================================================================
    // HOLDINGS
    // ========================================================================

    pub fn get_holding(&self, ctx: &Context, keys: Vec<HoldingKey>) -> QuotaResult<Lookup<Holding, HoldingKey>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        let mut lookup = Lookup::new();
        for key in keys {
            if let Err(e) = registry.authorize(&caller, &key.entity, Authority::SelfOrAncestor) {
                lookup.reject(key, e);
                continue;
            }
            match ledger.handle(&key) {
                Some(handle) => {
                    let holding = sync::lock(&handle, "holding")?.clone();
                    lookup.found(holding);
                }
                None => {
                    let error = QuotaError::NotFound(format!("holding {}", key));
                    lookup.reject(key, error);
                }
            }
        }
        Ok(lookup)
    }

    /// Administrative override of committed counters. Partial.
    ///
    /// Declares the resource if the holding does not exist yet. Refused while
    /// the holding has pending reservations. Net usage changes are recorded
    /// on the timeline under serial 0.
    pub fn set_holding(&self, ctx: &Context, items: Vec<HoldingUpdate>) -> QuotaResult<BatchResult<HoldingKey>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let policies = sync::read(&self.policies, "policy store")?;
        let mut ledger = sync::write(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        let keys: BTreeSet<HoldingKey> = items.iter().map(HoldingUpdate::key).collect();
        let handles = ledger.handles(&keys);
        let mut locked = handles.lock()?;
        let mut working = locked.scratch();

        let mut result = BatchResult::new();
        let mut touched = BTreeSet::new();
        let mut timeline = Vec::new();
        let now = Utc::now();

        for item in items {
            let key = item.key();
            match Self::override_holding(&registry, &policies, &caller, &item, working.get(&key)) {
                Ok((holding, delta)) => {
                    if delta != 0 {
                        timeline.push(TimelineEntry::new(
                            &key.entity,
                            &key.resource,
                            delta,
                            holding.usage(),
                            OVERRIDE_SERIAL,
                            &caller,
                            now,
                        ));
                    }
                    working.insert(key.clone(), holding);
                    touched.insert(key);
                }
                Err(e) => {
                    warn!(caller = %caller, holding = %key, error = %e, "Holding override rejected");
                    result.reject(key, e);
                }
            }
        }

        let mut changes: Vec<Change> = touched
            .iter()
            .filter_map(|key| working.get(key))
            .cloned()
            .map(Change::PutHolding)
            .collect();
        changes.extend(timeline.into_iter().map(Change::AppendTimeline));
        self.store.apply(&changes)?;

        install_holdings(&mut ledger, &mut locked, working, &touched);
        if !touched.is_empty() {
            info!(caller = %caller, holdings = touched.len(), "Overrode holdings");
        }
        Ok(result)
    }

    fn override_holding(
        registry: &EntityRegistry,
        policies: &PolicyStore,
        caller: &str,
        item: &HoldingUpdate,
        current: Option<&Holding>,
    ) -> QuotaResult<(Holding, i64)> {
        registry.require(&item.entity)?;
        registry.authorize(caller, &item.entity, Authority::Ancestor)?;
        validate_name("resource", &item.resource)?;
        policies.require(&item.policy)?;
        if item.imported < 0 || item.exported < 0 {
            return Err(QuotaError::Validation(format!(
                "counters must not be negative (imported {}, exported {})",
                item.imported, item.exported
            )));
        }

        let next = match current {
            Some(holding) if !holding.is_idle() => {
                return Err(QuotaError::Conflict(format!(
                    "holding {} has pending reservations",
                    holding.key()
                )));
            }
            Some(holding) => {
                let mut next = holding.clone();
                next.policy = item.policy.clone();
                next.imported = item.imported;
                next.exported = item.exported;
                next.touch();
                next
            }
            None => {
                let mut next = Holding::new(&item.key(), &item.policy);
                next.imported = item.imported;
                next.exported = item.exported;
                next
            }
        };

        let before = current.map_or(0, Holding::usage);
        let delta = next.usage().checked_sub(before).ok_or_else(|| {
            QuotaError::Validation(format!("usage change on {} overflows", item.key()))
        })?;
        Ok((next, delta))
    }

    /// Set limits for single holdings through their dedicated policies. Partial.
    ///
    /// Declares the resource if the holding does not exist yet.
    pub fn set_quota(&self, ctx: &Context, items: Vec<QuotaUpdate>) -> QuotaResult<BatchResult<HoldingKey>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let mut policies = sync::write(&self.policies, "policy store")?;
        let mut ledger = sync::write(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        let keys: BTreeSet<HoldingKey> = items.iter().map(QuotaUpdate::key).collect();
        let handles = ledger.handles(&keys);
        let mut locked = handles.lock()?;
        let mut working = locked.scratch();

        let mut result = BatchResult::new();
        let mut staged: BTreeMap<String, Policy> = BTreeMap::new();
        let mut touched = BTreeSet::new();
        let now = Utc::now();

        for item in items {
            let key = item.key();
            let checked = registry
                .require(&item.entity)
                .and_then(|_| registry.authorize(&caller, &item.entity, Authority::Ancestor))
                .and_then(|_| validate_name("resource", &item.resource))
                .and_then(|_| item.limits.validate());
            if let Err(e) = checked {
                warn!(caller = %caller, holding = %key, error = %e, "Quota rejected");
                result.reject(key, e);
                continue;
            }

            let name = quota_policy_name(&item.entity, &item.resource);
            staged.insert(
                name.clone(),
                Policy {
                    name: name.clone(),
                    limits: item.limits,
                    updated_at: now,
                },
            );

            let next = match working.get(&key) {
                Some(holding) if holding.policy == name => continue,
                Some(holding) => {
                    let mut next = holding.clone();
                    next.policy = name;
                    next.touch();
                    next
                }
                None => Holding::new(&key, &name),
            };
            working.insert(key.clone(), next);
            touched.insert(key);
        }

        let mut changes: Vec<Change> = staged.values().cloned().map(Change::PutPolicy).collect();
        changes.extend(
            touched
                .iter()
                .filter_map(|key| working.get(key))
                .cloned()
                .map(Change::PutHolding),
        );
        self.store.apply(&changes)?;

        let count = staged.len();
        for policy in staged.into_values() {
            policies.upsert(policy);
        }
        install_holdings(&mut ledger, &mut locked, working, &touched);

        if count > 0 {
            info!(caller = %caller, quotas = count, "Set quotas");
        }
        Ok(result)
    }

    pub fn get_quota(&self, ctx: &Context, keys: Vec<HoldingKey>) -> QuotaResult<Lookup<QuotaSnapshot, HoldingKey>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let policies = sync::read(&self.policies, "policy store")?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        let mut lookup = Lookup::new();
        for key in keys {
            if let Err(e) = registry.authorize(&caller, &key.entity, Authority::SelfOrAncestor) {
                lookup.reject(key, e);
                continue;
            }
            let Some(handle) = ledger.handle(&key) else {
                let error = QuotaError::NotFound(format!("holding {}", key));
                lookup.reject(key, error);
                continue;
            };
            let holding = sync::lock(&handle, "holding")?.clone();
            match policies.require(&holding.policy) {
                Ok(policy) => lookup.found(QuotaSnapshot {
                    entity: holding.entity.clone(),
                    resource: holding.resource.clone(),
                    policy: holding.policy.clone(),
                    limits: policy.limits,
                    usage: holding.usage(),
                    importing: holding.importing,
                    exporting: holding.exporting,
                }),
                Err(e) => lookup.reject(key, e),
            }
        }
        Ok(lookup)
    }

    /// Resources declared for `entity`, sorted
    pub fn list_resources(&self, entity: &str, key: &str) -> QuotaResult<Vec<String>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        registry.authenticate(entity, key)?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        Ok(ledger.resources(entity))
    }

    // ========================================================================
    // COMMISSIONS
    // ========================================================================

    /// Reserve every provision or none.
    ///
    /// Each provision is checked against committed usage, every pending
    /// reservation and the earlier provisions of the same commission. On
    /// failure every offending provision is reported and nothing changes.
    pub fn issue_commission(&self, ctx: &Context, provisions: Vec<Provision>) -> QuotaResult<IssueOutcome> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let policies = sync::read(&self.policies, "policy store")?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        if provisions.is_empty() {
            return Err(QuotaError::Validation(
                "commission has no provisions".to_string(),
            ));
        }

        let mut failures = Vec::new();
        let mut checked = Vec::new();
        for (index, provision) in provisions.iter().enumerate() {
            let precheck = registry
                .require(&provision.entity)
                .and_then(|_| registry.authorize(&caller, &provision.entity, Authority::SelfOrAncestor))
                .and_then(|_| {
                    if ledger.contains(&provision.key()) {
                        Ok(())
                    } else {
                        Err(QuotaError::NotFound(format!(
                            "resource {} of entity {}",
                            provision.resource, provision.entity
                        )))
                    }
                });
            match precheck {
                Ok(()) => checked.push(index),
                Err(error) => failures.push(ProvisionFailure {
                    index,
                    provision: provision.clone(),
                    error,
                }),
            }
        }

        let keys: BTreeSet<HoldingKey> = checked.iter().map(|&i| provisions[i].key()).collect();
        let handles = ledger.handles(&keys);
        let mut locked = handles.lock()?;
        let mut working = locked.scratch();

        for index in checked {
            let provision = &provisions[index];
            let reserved = match working.get_mut(&provision.key()) {
                Some(holding) => match policies.require(&holding.policy) {
                    Ok(policy) => {
                        let limits = policy.limits;
                        holding.reserve(provision.quantity, &limits)
                    }
                    Err(e) => Err(e),
                },
                None => Err(QuotaError::NotFound(format!("holding {}", provision.key()))),
            };
            if let Err(error) = reserved {
                failures.push(ProvisionFailure {
                    index,
                    provision: provision.clone(),
                    error,
                });
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|f| f.index);
            warn!(
                caller = %caller,
                provisions = provisions.len(),
                failures = failures.len(),
                "Commission rejected"
            );
            return Ok(IssueOutcome::Rejected { failures });
        }

        let mut book = sync::lock(&self.commissions, "commission book")?;
        let serial = book.next_serial();
        let commission = Commission::new(serial, &caller, provisions);

        let mut changes: Vec<Change> = working.values().cloned().map(Change::PutHolding).collect();
        changes.push(Change::PutCommission(commission.clone()));
        changes.push(Change::SetNextSerial(serial + 1));
        self.store.apply(&changes)?;

        debug!(
            serial,
            caller = %caller,
            provisions = commission.provisions.len(),
            "Commission issued"
        );
        book.insert(commission);
        locked.store(working);
        Ok(IssueOutcome::Pending { serial })
    }

    /// Apply a pending commission's deltas and append them to the timeline
    pub fn accept_commission(&self, ctx: &Context, serial: u64) -> QuotaResult<()> {
        self.resolve(ctx, serial, Decision::Accept)
    }

    /// Drop a pending commission's reservations
    pub fn reject_commission(&self, ctx: &Context, serial: u64) -> QuotaResult<()> {
        self.resolve(ctx, serial, Decision::Reject)
    }

    fn resolve(&self, ctx: &Context, serial: u64, decision: Decision) -> QuotaResult<()> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        self.resolve_one(&registry, &ledger, &caller, serial, decision)
    }

    fn resolve_one(
        &self,
        registry: &EntityRegistry,
        ledger: &HoldingLedger,
        caller: &str,
        serial: u64,
        decision: Decision,
    ) -> QuotaResult<()> {
        // peek at the keys, then take the holdings before the book
        let keys = {
            let book = sync::lock(&self.commissions, "commission book")?;
            let commission = book.require_pending(serial)?;
            if commission.issuer != caller && !registry.is_admin(caller) {
                return Err(QuotaError::Authorization(format!(
                    "{} did not issue commission {}",
                    caller, serial
                )));
            }
            commission.keys()
        };

        let handles = ledger.handles(&keys);
        let mut locked = handles.lock()?;
        let mut book = sync::lock(&self.commissions, "commission book")?;

        // another call may have resolved it in between
        let resolved = book.require_pending(serial)?.resolved(decision)?;
        let now = resolved.resolved_at.unwrap_or_else(Utc::now);

        let mut working = locked.scratch();
        let mut timeline = Vec::new();
        for provision in &resolved.provisions {
            let key = provision.key();
            let holding = working.get_mut(&key).ok_or_else(|| {
                QuotaError::Storage(format!(
                    "holding {} of pending commission {} is missing",
                    key, serial
                ))
            })?;
            match decision {
                Decision::Accept => {
                    let usage = holding.commit(provision.quantity);
                    timeline.push(TimelineEntry::new(
                        &provision.entity,
                        &provision.resource,
                        provision.quantity,
                        usage,
                        serial,
                        &resolved.issuer,
                        now,
                    ));
                }
                Decision::Reject => holding.release(provision.quantity),
            }
        }

        let mut changes: Vec<Change> = working.values().cloned().map(Change::PutHolding).collect();
        changes.push(Change::PutCommission(resolved.clone()));
        changes.extend(timeline.into_iter().map(Change::AppendTimeline));
        self.store.apply(&changes)?;

        info!(
            serial,
            caller = %caller,
            state = resolved.state.as_str(),
            "Commission resolved"
        );
        book.insert(resolved);
        locked.store(working);
        Ok(())
    }

    /// Serials still pending: the caller's own, or all of them for the admin
    pub fn get_pending_commissions(&self, ctx: &Context) -> QuotaResult<Vec<u64>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        let book = sync::lock(&self.commissions, "commission book")?;

        if registry.is_admin(&caller) {
            Ok(book.pending(None))
        } else {
            Ok(book.pending(Some(&caller)))
        }
    }

    /// Resolve each serial independently. Partial: returns failed serials.
    pub fn resolve_pending_commissions(
        &self,
        ctx: &Context,
        items: Vec<Resolution>,
    ) -> QuotaResult<BatchResult<u64>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let ledger = sync::read(&self.holdings, "holding map")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();

        let mut result = BatchResult::new();
        for item in items {
            if let Err(e) = self.resolve_one(&registry, &ledger, &caller, item.serial, item.decision) {
                warn!(caller = %caller, serial = item.serial, error = %e, "Resolution failed");
                result.reject(item.serial, e);
            }
        }
        Ok(result)
    }

    /// Drop resolved commissions resolved before `cutoff` (admin only).
    /// Pending commissions and the timeline are never purged.
    pub fn purge_commissions(&self, ctx: &Context, cutoff: DateTime<Utc>) -> QuotaResult<usize> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        Self::require_admin(&registry, &caller)?;

        let mut book = sync::lock(&self.commissions, "commission book")?;
        let serials = book.resolved_before(cutoff);
        let changes: Vec<Change> = serials.iter().copied().map(Change::DeleteCommission).collect();
        self.store.apply(&changes)?;

        for serial in &serials {
            book.remove(*serial);
        }
        if !serials.is_empty() {
            info!(purged = serials.len(), cutoff = %cutoff, "Purged resolved commissions");
        }
        Ok(serials.len())
    }

    /// `purge_commissions` with the configured retention
    pub fn purge_expired(&self, ctx: &Context) -> QuotaResult<usize> {
        self.purge_commissions(ctx, self.retention_cutoff()?)
    }

    /// Copy of a commission, for its issuer or the admin
    pub fn get_commission(&self, ctx: &Context, serial: u64) -> QuotaResult<Commission> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        let book = sync::lock(&self.commissions, "commission book")?;

        let commission = book.get(serial).ok_or_else(|| QuotaError::InvalidCommission {
            serial,
            reason: "unknown serial".to_string(),
        })?;
        if commission.issuer != caller && !registry.is_admin(&caller) {
            return Err(QuotaError::Authorization(format!(
                "{} did not issue commission {}",
                caller, serial
            )));
        }
        Ok(commission.clone())
    }

    // ========================================================================
    // TIMELINE
    // ========================================================================

    pub fn get_timeline(&self, ctx: &Context, query: &TimelineQuery) -> QuotaResult<Vec<TimelineEntry>> {
        let registry = sync::read(&self.registry, "entity registry")?;
        let caller = registry.authenticate_context(ctx)?.name.clone();
        registry.authorize(&caller, &query.entity, Authority::SelfOrAncestor)?;
        self.store.timeline(query)
    }
}

/// Write validated copies back: existing holdings in place, new ones into the map
fn install_holdings(
    ledger: &mut HoldingLedger,
    locked: &mut LockedHoldings<'_>,
    mut working: BTreeMap<HoldingKey, Holding>,
    touched: &BTreeSet<HoldingKey>,
) {
    let mut updated = BTreeMap::new();
    let mut created = Vec::new();
    for key in touched {
        if let Some(holding) = working.remove(key) {
            if locked.contains(key) {
                updated.insert(key.clone(), holding);
            } else {
                created.push(holding);
            }
        }
    }
    locked.store(updated);
    for holding in created {
        ledger.insert(holding);
    }
}

// ============================================================================
// TESTS
// ============================================================================
