// 📏 Policy Store - Named, reusable limit templates
//
// A holding points at a policy by name. Replacing a policy only affects
// provisions validated after the replacement.

use crate::entity::validate_name;
use crate::error::{QuotaError, QuotaResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// FLAGS
// ============================================================================

/// Policy flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u32);

impl Flags {
    /// Net usage may leave `[0, ceiling]`
    pub const OVERDRAFT: u32 = 0x1;

    const KNOWN: u32 = Self::OVERDRAFT;

    pub fn none() -> Self {
        Flags(0)
    }

    pub fn overdraft() -> Self {
        Flags(Self::OVERDRAFT)
    }

    pub fn allows_overdraft(&self) -> bool {
        self.0 & Self::OVERDRAFT != 0
    }

    pub fn unknown_bits(&self) -> u32 {
        self.0 & !Self::KNOWN
    }
}

// ============================================================================
// LIMITS
// ============================================================================

/// Limit parameters of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Allocation granted to the holder
    pub quantity: i64,

    /// Hard ceiling for net usage
    pub capacity: i64,

    /// Most that may be pending on the import side at once
    pub import_limit: i64,

    /// Most that may be pending on the export side at once
    pub export_limit: i64,

    #[serde(default)]
    pub flags: Flags,
}

impl Limits {
    pub fn new(quantity: i64, capacity: i64, import_limit: i64, export_limit: i64) -> Self {
        Limits {
            quantity,
            capacity,
            import_limit,
            export_limit,
            flags: Flags::none(),
        }
    }

    /// Same limits on every axis
    pub fn uniform(limit: i64) -> Self {
        Self::new(limit, limit, limit, limit)
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Net usage may not exceed this
    pub fn ceiling(&self) -> i64 {
        self.quantity.min(self.capacity)
    }

    /// Reject negative or mutually inconsistent parameters
    pub fn validate(&self) -> QuotaResult<()> {
        let mut problems = Vec::new();

        for (field, value) in [
            ("quantity", self.quantity),
            ("capacity", self.capacity),
            ("import_limit", self.import_limit),
            ("export_limit", self.export_limit),
        ] {
            if value < 0 {
                problems.push(format!("{} is negative ({})", field, value));
            }
        }

        if self.quantity > self.capacity {
            problems.push(format!(
                "quantity {} above capacity {}",
                self.quantity, self.capacity
            ));
        }
        if self.import_limit > self.capacity {
            problems.push(format!(
                "import_limit {} above capacity {}",
                self.import_limit, self.capacity
            ));
        }
        if self.export_limit > self.capacity {
            problems.push(format!(
                "export_limit {} above capacity {}",
                self.export_limit, self.capacity
            ));
        }
        if self.flags.unknown_bits() != 0 {
            problems.push(format!("unknown flag bits {:#x}", self.flags.unknown_bits()));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(QuotaError::Validation(problems.join("; ")))
        }
    }
}

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub limits: Limits,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(name: &str, limits: Limits) -> Self {
        Policy {
            name: name.to_string(),
            limits,
            updated_at: Utc::now(),
        }
    }
}

/// One `set_limits` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub policy: String,
    #[serde(flatten)]
    pub limits: Limits,
}

impl PolicyLimits {
    pub fn new(policy: &str, limits: Limits) -> Self {
        PolicyLimits {
            policy: policy.to_string(),
            limits,
        }
    }

    pub fn validate(&self) -> QuotaResult<()> {
        validate_name("policy", &self.policy)?;
        self.limits.validate()
    }
}

/// Name of the dedicated policy that `set_quota` maintains for one holding.
/// Contains `:`, which user-chosen names never do.
pub fn quota_policy_name(entity: &str, resource: &str) -> String {
    format!("{}:{}", entity, resource)
}

// ============================================================================
// POLICY STORE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    policies: HashMap<String, Policy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(&self, name: &str) -> QuotaResult<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| QuotaError::NotFound(format!("policy {}", name)))
    }

    /// Insert or replace
    pub fn upsert(&mut self, policy: Policy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn count(&self) -> usize {
        self.policies.len()
    }
}
