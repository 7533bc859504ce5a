// 🔑 Entity Registry - Accountable identities and their keys
//
// An entity name is its identity and never changes. Keys rotate.
// Ownership forms a tree rooted at the administrative entity; authority over
// an entity flows down that tree.

use crate::error::{QuotaError, QuotaResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Longest accepted identifier (entity, resource or policy name)
pub const MAX_NAME_LEN: usize = 128;

/// Check an identifier: non-empty, bounded, `[A-Za-z0-9_.@-]` only.
/// `:` is reserved for generated per-holding policy names.
pub fn validate_name(kind: &str, name: &str) -> QuotaResult<()> {
    if name.is_empty() {
        return Err(QuotaError::Validation(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(QuotaError::Validation(format!(
            "{} name longer than {} characters",
            kind, MAX_NAME_LEN
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')))
    {
        return Err(QuotaError::Validation(format!(
            "{} name {:?} contains invalid character {:?}",
            kind, name, bad
        )));
    }
    Ok(())
}

/// SHA-256 digest of a key; only digests are ever stored
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique name (identity)
    pub name: String,

    /// Owning entity; `None` only for the administrative root
    pub owner: Option<String>,

    /// SHA-256 of the current key
    pub(crate) key_hash: String,

    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: &str, owner: Option<&str>, key: &str) -> Self {
        Entity {
            name: name.to_string(),
            owner: owner.map(str::to_string),
            key_hash: hash_key(key),
            created_at: Utc::now(),
        }
    }

    /// Rebuild from stored fields
    pub(crate) fn from_parts(
        name: String,
        owner: Option<String>,
        key_hash: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Entity {
            name,
            owner,
            key_hash,
            created_at,
        }
    }

    pub fn verify_key(&self, key: &str) -> bool {
        self.key_hash == hash_key(key)
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    /// Copy with the key replaced; the original stays valid until swapped in
    pub fn with_key(&self, key: &str) -> Entity {
        let mut next = self.clone();
        next.key_hash = hash_key(key);
        next
    }

    pub fn descriptor(&self) -> EntityInfo {
        EntityInfo {
            name: self.name.clone(),
            owner: self.owner.clone(),
            created_at: self.created_at,
        }
    }
}

/// Public view of an entity (no key material)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Authenticated caller of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub entity: String,
    pub key: String,
}

impl Context {
    pub fn new(entity: &str, key: &str) -> Self {
        Context {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }
}

/// How much authority a call needs over its target entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// The target itself, any owner up its chain, or the admin
    SelfOrAncestor,
    /// A strict owner up the chain, or the admin
    Ancestor,
}

/// One `create_entity` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    pub owner: String,
    pub key: String,
}

impl NewEntity {
    pub fn new(name: &str, owner: &str, key: &str) -> Self {
        NewEntity {
            name: name.to_string(),
            owner: owner.to_string(),
            key: key.to_string(),
        }
    }
}

/// One `set_entity_key` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotation {
    pub entity: String,
    pub old_key: String,
    pub new_key: String,
}

impl KeyRotation {
    pub fn new(entity: &str, old_key: &str, new_key: &str) -> Self {
        KeyRotation {
            entity: entity.to_string(),
            old_key: old_key.to_string(),
            new_key: new_key.to_string(),
        }
    }
}

/// Directory-style listing parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Only names starting with this
    #[serde(default)]
    pub prefix: Option<String>,

    /// Only names strictly after this
    #[serde(default)]
    pub marker: Option<String>,

    /// At most this many names
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// ENTITY REGISTRY
// ============================================================================

/// All known entities, sorted by name
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Entity>,
    admin: String,
}

impl EntityRegistry {
    pub fn new(admin: &str) -> Self {
        EntityRegistry {
            entities: BTreeMap::new(),
            admin: admin.to_string(),
        }
    }

    pub fn admin(&self) -> &str {
        &self.admin
    }

    pub fn is_admin(&self, name: &str) -> bool {
        self.admin == name
    }

    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.name.clone(), entity);
    }

    pub fn remove(&mut self, name: &str) -> Option<Entity> {
        self.entities.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.entities.len()
    }

    pub fn require(&self, name: &str) -> QuotaResult<&Entity> {
        self.entities
            .get(name)
            .ok_or_else(|| QuotaError::NotFound(format!("entity {}", name)))
    }

    /// Check `key` against the entity's current key
    pub fn authenticate(&self, name: &str, key: &str) -> QuotaResult<&Entity> {
        let entity = self.require(name)?;
        if entity.verify_key(key) {
            Ok(entity)
        } else {
            Err(QuotaError::Authorization(format!("bad key for entity {}", name)))
        }
    }

    /// Authenticate a call context; unknown callers are an authorization failure
    pub fn authenticate_context(&self, ctx: &Context) -> QuotaResult<&Entity> {
        match self.entities.get(&ctx.entity) {
            Some(entity) if entity.verify_key(&ctx.key) => Ok(entity),
            _ => Err(QuotaError::Authorization(format!(
                "cannot authenticate caller {}",
                ctx.entity
            ))),
        }
    }

    /// Owner chain of `name`, nearest first
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self.entities.get(name).and_then(|e| e.owner.as_deref());
        while let Some(owner) = current {
            // owners exist before their children, so the chain is acyclic;
            // the bound only protects against corrupted stored data
            if chain.len() > self.entities.len() {
                break;
            }
            chain.push(owner);
            current = self.entities.get(owner).and_then(|e| e.owner.as_deref());
        }
        chain
    }

    pub fn has_authority(&self, caller: &str, target: &str, authority: Authority) -> bool {
        if self.is_admin(caller) {
            return true;
        }
        if authority == Authority::SelfOrAncestor && caller == target {
            return true;
        }
        self.ancestors(target).contains(&caller)
    }

    pub fn authorize(&self, caller: &str, target: &str, authority: Authority) -> QuotaResult<()> {
        if self.has_authority(caller, target, authority) {
            Ok(())
        } else {
            Err(QuotaError::Authorization(format!(
                "{} has no authority over {}",
                caller, target
            )))
        }
    }

    /// Entities directly owned by `owner`
    pub fn children(&self, owner: &str) -> Vec<&Entity> {
        self.entities
            .values()
            .filter(|e| e.owner.as_deref() == Some(owner))
            .collect()
    }

    /// Names directly owned by `owner`, filtered and paged by `query`
    pub fn list_owned(&self, owner: &str, query: &ListQuery) -> Vec<String> {
        let prefix = query.prefix.as_deref().unwrap_or("");
        let limit = query.limit.unwrap_or(usize::MAX);

        self.entities
            .values()
            .filter(|e| e.owner.as_deref() == Some(owner))
            .filter(|e| e.name.starts_with(prefix))
            .filter(|e| match &query.marker {
                Some(marker) => e.name.as_str() > marker.as_str(),
                None => true,
            })
            .take(limit)
            .map(|e| e.name.clone())
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
