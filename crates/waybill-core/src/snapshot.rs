//! Snapshot construction, hashing, and chain verification.

use crate::clock;
use crate::error::{Error, Result};
use crate::hash::content_hash;
use crate::types::{DeliveryFacts, NewSnapshot, Snapshot, SnapshotType};
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};

pub fn new_snapshot_id() -> String {
    format!("snap_{}", ulid::Ulid::new().to_string().to_lowercase())
}

impl NewSnapshot {
    pub fn new(
        delivery_id: impl Into<String>,
        snapshot_type: SnapshotType,
        triggered_by: impl Into<String>,
        triggered_event: impl Into<String>,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            snapshot_type,
            snapshot_data: serde_json::Value::Object(Default::default()),
            previous_snapshot_id: None,
            triggered_by: triggered_by.into(),
            triggered_by_user_id: None,
            triggered_event: triggered_event.into(),
            facts: DeliveryFacts::default(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.snapshot_data = data;
        self
    }

    /// Encode any serializable payload as the snapshot data.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.snapshot_data = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn with_previous(mut self, previous_snapshot_id: impl Into<String>) -> Self {
        self.previous_snapshot_id = Some(previous_snapshot_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.triggered_by_user_id = Some(user_id.into());
        self
    }

    pub fn with_facts(mut self, facts: DeliveryFacts) -> Self {
        self.facts = facts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery_id.trim().is_empty() {
            return Err(Error::Invalid("delivery_id must not be empty".into()));
        }
        if let Some(prev) = &self.previous_snapshot_id {
            if prev.trim().is_empty() {
                return Err(Error::Invalid(
                    "previous_snapshot_id must not be empty when given".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Turn a validated submission into a stored snapshot.
///
/// `previous_snapshot_id` must already be resolved by the caller; the value
/// passed here is what gets hashed and stored.
pub fn seal(
    new: NewSnapshot,
    previous_snapshot_id: Option<String>,
    created_at: OffsetDateTime,
    business_offset: UtcOffset,
) -> Result<Snapshot> {
    new.validate()?;
    let created_at = clock::truncate_micros(created_at);
    let mut snapshot = Snapshot {
        id: new_snapshot_id(),
        delivery_id: new.delivery_id,
        snapshot_type: new.snapshot_type,
        snapshot_data: new.snapshot_data,
        previous_snapshot_id,
        triggered_by: new.triggered_by,
        triggered_by_user_id: new.triggered_by_user_id,
        triggered_event: new.triggered_event,
        facts: new.facts,
        created_at,
        business_date: clock::business_date(created_at, business_offset),
        hash: String::new(),
        archived_at: None,
    };
    snapshot.hash = audit_hash(&snapshot)?;
    Ok(snapshot)
}

/// Hash of everything an auditor cares about: all fields except the hash
/// itself and archival metadata.
pub fn audit_hash(snapshot: &Snapshot) -> Result<String> {
    let mut val = serde_json::to_value(snapshot)?;
    if let Some(obj) = val.as_object_mut() {
        obj.remove("hash");
        obj.remove("archived_at");
    }
    content_hash(&val)
}

// ── Chain verification ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssue {
    /// Stored hash does not match recomputed content.
    HashMismatch { snapshot_id: String },
    /// Pointer does not name the immediate predecessor.
    BrokenLink {
        snapshot_id: String,
        expected_previous: Option<String>,
        actual_previous: Option<String>,
    },
    /// Snapshot of another delivery found in the sequence.
    ForeignDelivery { snapshot_id: String, delivery_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub delivery_id: String,
    pub checked: usize,
    pub issues: Vec<ChainIssue>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verify a delivery timeline (oldest first).
pub fn verify_chain(delivery_id: &str, timeline: &[Snapshot]) -> Result<ChainReport> {
    let mut issues = Vec::new();
    let mut expected_previous: Option<String> = None;
    for snap in timeline {
        if snap.delivery_id != delivery_id {
            issues.push(ChainIssue::ForeignDelivery {
                snapshot_id: snap.id.clone(),
                delivery_id: snap.delivery_id.clone(),
            });
            continue;
        }
        if audit_hash(snap)? != snap.hash {
            issues.push(ChainIssue::HashMismatch {
                snapshot_id: snap.id.clone(),
            });
        }
        if snap.previous_snapshot_id != expected_previous {
            issues.push(ChainIssue::BrokenLink {
                snapshot_id: snap.id.clone(),
                expected_previous: expected_previous.clone(),
                actual_previous: snap.previous_snapshot_id.clone(),
            });
        }
        expected_previous = Some(snap.id.clone());
    }
    Ok(ChainReport {
        delivery_id: delivery_id.to_string(),
        checked: timeline.len(),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use time::macros::{datetime, offset};

    fn chain(delivery: &str, types: &[SnapshotType]) -> Vec<Snapshot> {
        let mut out: Vec<Snapshot> = Vec::new();
        let mut ts = datetime!(2026-03-01 08:00:00 UTC);
        for t in types {
            let prev = out.last().map(|s| s.id.clone());
            let new = NewSnapshot::new(delivery, *t, "dispatcher", t.as_str());
            out.push(seal(new, prev, ts, UtcOffset::UTC).unwrap());
            ts += time::Duration::minutes(5);
        }
        out
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_snapshot_id();
        let b = new_snapshot_id();
        assert!(a.starts_with("snap_"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_delivery_rejected() {
        let new = NewSnapshot::new("  ", SnapshotType::Created, "system", "created");
        let err = seal(new, None, datetime!(2026-03-01 00:00 UTC), UtcOffset::UTC).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn seal_fills_generated_fields() {
        let new = NewSnapshot::new("D1", SnapshotType::Created, "pos-sync", "order_imported")
            .with_data(json!({"items": 3}))
            .with_user("u-7")
            .with_facts(DeliveryFacts {
                provider_code: Some("manual".into()),
                delivery_fee: Some(Decimal::new(4500, 2)),
                ..Default::default()
            });
        let snap = seal(new, None, datetime!(2026-03-01 23:30:00 UTC), offset!(+7)).unwrap();
        assert!(snap.id.starts_with("snap_"));
        assert_eq!(snap.business_date, time::macros::date!(2026-03-02));
        assert_eq!(snap.hash.len(), 64);
        assert_eq!(snap.previous_snapshot_id, None);
        assert_eq!(snap.triggered_by_user_id.as_deref(), Some("u-7"));
    }

    #[test]
    fn archival_does_not_change_hash() {
        let mut snaps = chain("D1", &[SnapshotType::Created]);
        let before = audit_hash(&snaps[0]).unwrap();
        snaps[0].archived_at = Some(datetime!(2027-01-01 00:00 UTC));
        assert_eq!(audit_hash(&snaps[0]).unwrap(), before);
    }

    #[test]
    fn intact_chain_verifies() {
        let snaps = chain(
            "D1",
            &[SnapshotType::Created, SnapshotType::Assigned, SnapshotType::Delivered],
        );
        let report = verify_chain("D1", &snaps).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn tampered_payload_detected() {
        let mut snaps = chain("D1", &[SnapshotType::Created, SnapshotType::Delivered]);
        snaps[1].facts.delivery_fee = Some(Decimal::new(1, 0));
        let report = verify_chain("D1", &snaps).unwrap();
        assert_eq!(
            report.issues,
            vec![ChainIssue::HashMismatch {
                snapshot_id: snaps[1].id.clone()
            }]
        );
    }

    #[test]
    fn missing_link_detected() {
        let mut snaps = chain(
            "D1",
            &[SnapshotType::Created, SnapshotType::Assigned, SnapshotType::Delivered],
        );
        snaps.remove(1);
        let report = verify_chain("D1", &snaps).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert!(matches!(
            &report.issues[0],
            ChainIssue::BrokenLink { snapshot_id, .. } if *snapshot_id == snaps[1].id
        ));
    }

    #[test]
    fn payload_encoding() {
        #[derive(Serialize)]
        struct Pickup<'a> {
            courier: &'a str,
            attempts: u8,
        }
        let new = NewSnapshot::new("D9", SnapshotType::PickedUp, "driver-app", "scan")
            .with_payload(&Pickup { courier: "K. Ito", attempts: 2 })
            .unwrap();
        assert_eq!(new.snapshot_data, json!({"courier": "K. Ito", "attempts": 2}));
    }
}
