// Batch result types
//
// Two call semantics live side by side and are kept apart by type:
// - BatchResult: partial. Valid items are applied, rejected items come back
//   with their reason. Never an error for a partial failure.
// - IssueOutcome: all-or-nothing. Either a serial, or every offending
//   provision with its reason and no side effects.

use crate::commission::Provision;
use crate::error::QuotaError;
use serde::{Deserialize, Serialize};

/// One rejected item of a partial batch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection<T> {
    pub item: T,
    pub error: QuotaError,
}

/// Result of a partial batch call: the rejected subset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult<T> {
    pub rejected: Vec<Rejection<T>>,
}

impl<T> BatchResult<T> {
    pub fn new() -> Self {
        BatchResult {
            rejected: Vec::new(),
        }
    }

    pub fn reject(&mut self, item: T, error: QuotaError) {
        self.rejected.push(Rejection { item, error });
    }

    /// True when every item was applied
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn rejected_items(&self) -> impl Iterator<Item = &T> {
        self.rejected.iter().map(|r| &r.item)
    }
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a multi-key read: what was found plus what was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup<T, K> {
    pub found: Vec<T>,
    pub rejected: Vec<Rejection<K>>,
}

impl<T, K> Lookup<T, K> {
    pub fn new() -> Self {
        Lookup {
            found: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn found(&mut self, value: T) {
        self.found.push(value);
    }

    pub fn reject(&mut self, key: K, error: QuotaError) {
        self.rejected.push(Rejection { item: key, error });
    }
}

impl<T, K> Default for Lookup<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A provision that failed validation during issuance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionFailure {
    /// Position of the provision in the submitted list
    pub index: usize,
    pub provision: Provision,
    pub error: QuotaError,
}

/// Result of `issue_commission`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssueOutcome {
    /// Whole commission reserved, pending resolution
    Pending { serial: u64 },
    /// Whole commission refused; nothing was reserved
    Rejected { failures: Vec<ProvisionFailure> },
}

impl IssueOutcome {
    pub fn serial(&self) -> Option<u64> {
        match self {
            IssueOutcome::Pending { serial } => Some(*serial),
            IssueOutcome::Rejected { .. } => None,
        }
    }

    pub fn failures(&self) -> &[ProvisionFailure] {
        match self {
            IssueOutcome::Pending { .. } => &[],
            IssueOutcome::Rejected { failures } => failures,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, IssueOutcome::Pending { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_result_collects_rejections() {
        let mut result: BatchResult<String> = BatchResult::new();
        assert!(result.is_clean());

        result.reject("p1".to_string(), QuotaError::Validation("negative".into()));
        assert!(!result.is_clean());
        assert_eq!(result.rejected_items().collect::<Vec<_>>(), vec!["p1"]);
    }

    #[test]
    fn test_lookup_splits_found_and_rejected() {
        let mut lookup: Lookup<u32, String> = Lookup::new();
        lookup.found(3);
        lookup.reject("p2".to_string(), QuotaError::NotFound("policy p2".into()));
        assert_eq!(lookup.found, vec![3]);
        assert_eq!(lookup.rejected[0].item, "p2");
    }

    #[test]
    fn test_issue_outcome_accessors() {
        let pending = IssueOutcome::Pending { serial: 7 };
        assert_eq!(pending.serial(), Some(7));
        assert!(pending.failures().is_empty());

        let rejected = IssueOutcome::Rejected {
            failures: vec![ProvisionFailure {
                index: 0,
                provision: Provision::new("e1", "cpu", 5),
                error: QuotaError::limit("e1", "cpu", "over"),
            }],
        };
        assert_eq!(rejected.serial(), None);
        assert_eq!(rejected.failures().len(), 1);
        assert!(!rejected.is_pending());
    }
}
