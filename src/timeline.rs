// ⏳ Timeline - Append-only audit of applied usage changes
//
// One entry per accepted provision, plus one per administrative override
// (serial 0). Entries are never updated or deleted, so summing deltas over a
// holding's timeline always reproduces its committed usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Serial recorded for changes made by `set_holding`
pub const OVERRIDE_SERIAL: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Unique entry id (UUID v4)
    pub id: String,

    pub entity: String,
    pub resource: String,

    /// Signed change of net usage
    pub delta: i64,

    /// Net usage right after the change
    pub usage: i64,

    /// Commission that caused it, or OVERRIDE_SERIAL
    pub serial: u64,

    /// Entity that issued the commission or the override
    pub issuer: String,

    pub timestamp: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(
        entity: &str,
        resource: &str,
        delta: i64,
        usage: i64,
        serial: u64,
        issuer: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TimelineEntry {
            id: uuid::Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            resource: resource.to_string(),
            delta,
            usage,
            serial,
            issuer: issuer.to_string(),
            timestamp,
        }
    }

    pub fn is_override(&self) -> bool {
        self.serial == OVERRIDE_SERIAL
    }
}

/// `get_timeline` window. Bounds are exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineQuery {
    pub entity: String,

    /// All resources of the entity when absent
    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub after: Option<DateTime<Utc>>,

    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

impl TimelineQuery {
    pub fn entity(entity: &str) -> Self {
        TimelineQuery {
            entity: entity.to_string(),
            resource: None,
            after: None,
            before: None,
        }
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn matches(&self, entry: &TimelineEntry) -> bool {
        entry.entity == self.entity
            && self.resource.as_ref().map_or(true, |r| &entry.resource == r)
            && self.after.map_or(true, |after| entry.timestamp > after)
            && self.before.map_or(true, |before| entry.timestamp < before)
    }
}

/// Write entries as CSV (header + one row per entry) for billing tools
pub fn write_csv<W: Write>(entries: &[TimelineEntry], writer: W) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for entry in entries {
        wtr.serialize(entry)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Sum of deltas per resource, in resource order
pub fn net_by_resource(entries: &[TimelineEntry]) -> Vec<(String, i64)> {
    let mut totals = std::collections::BTreeMap::new();
    for entry in entries {
        *totals.entry(entry.resource.clone()).or_insert(0i64) += entry.delta;
    }
    totals.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(resource: &str, delta: i64, usage: i64, at: DateTime<Utc>) -> TimelineEntry {
        TimelineEntry::new("e1", resource, delta, usage, 1, "system", at)
    }

    #[test]
    fn test_query_window_is_exclusive() {
        let t0 = Utc::now();
        let e = entry("cpu", 5, 5, t0);

        assert!(TimelineQuery::entity("e1").matches(&e));
        assert!(!TimelineQuery::entity("e1").after(t0).matches(&e));
        assert!(!TimelineQuery::entity("e1").before(t0).matches(&e));
        assert!(TimelineQuery::entity("e1")
            .after(t0 - Duration::seconds(1))
            .before(t0 + Duration::seconds(1))
            .matches(&e));
    }

    #[test]
    fn test_query_filters_entity_and_resource() {
        let e = entry("cpu", 5, 5, Utc::now());
        assert!(TimelineQuery::entity("e1").resource("cpu").matches(&e));
        assert!(!TimelineQuery::entity("e1").resource("ram").matches(&e));
        assert!(!TimelineQuery::entity("e2").matches(&e));
    }

    #[test]
    fn test_override_marker() {
        let e = TimelineEntry::new("e1", "cpu", 3, 3, OVERRIDE_SERIAL, "system", Utc::now());
        assert!(e.is_override());
        assert!(!entry("cpu", 1, 1, Utc::now()).is_override());
    }

    #[test]
    fn test_write_csv() {
        let entries = vec![entry("cpu", 5, 5, Utc::now()), entry("cpu", -2, 3, Utc::now())];
        let mut out = Vec::new();
        write_csv(&entries, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,entity,resource,delta,usage,serial,issuer,timestamp"));
        assert!(lines[2].contains(",cpu,-2,3,1,system,"));
    }

    #[test]
    fn test_net_by_resource() {
        let now = Utc::now();
        let entries = vec![
            entry("ram", 4, 4, now),
            entry("cpu", 5, 5, now),
            entry("cpu", -2, 3, now),
        ];
        assert_eq!(
            net_by_resource(&entries),
            vec![("cpu".to_string(), 3), ("ram".to_string(), 4)]
        );
    }
}
