//! Append-only snapshot log.
//!
//! Each append reads the delivery's current latest snapshot and inserts the
//! new one inside a single `BEGIN IMMEDIATE` transaction, so the
//! `previous_snapshot_id` chain stays exact under concurrent appenders.
//! Order is always materialized by `(created_at, seq)`; the pointer and the
//! content hash exist for tamper evidence.

use crate::sqlite_store::{
    opt_text, page_values, parse_opt_ts, placeholders, text, ts, SqliteStore,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};
use waybill_core::error::entity;
use waybill_core::snapshot::{seal, verify_chain};
use waybill_core::{
    clock, ArchivedFilter, ChainReport, DeliveryFacts, Error, NewSnapshot, Page, Result,
    Snapshot, SnapshotFilter, SnapshotType, SortOrder, TimeWindow,
};

const SNAPSHOT_COLUMNS: &str = "id, delivery_id, snapshot_type, snapshot_data, previous_snapshot_id,
    triggered_by, triggered_by_user_id, triggered_event, delivery_status, customer_id,
    order_id, vehicle_id, driver_name, delivery_address_province, delivery_fee,
    provider_code, created_at, business_date, hash, archived_at";

/// Grouping dimension for count aggregates. Each maps to a fixed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Type,
    Provider,
    Status,
}

impl Dimension {
    fn column(self) -> &'static str {
        match self {
            Dimension::Type => "snapshot_type",
            Dimension::Provider => "provider_code",
            Dimension::Status => "delivery_status",
        }
    }
}

pub struct SnapshotLog {
    store: SqliteStore,
    business_offset: UtcOffset,
}

impl SnapshotLog {
    pub fn new(store: SqliteStore, business_offset: UtcOffset) -> Self {
        Self {
            store,
            business_offset,
        }
    }

    pub fn business_offset(&self) -> UtcOffset {
        self.business_offset
    }

    // ── Append ──────────────────────────────────────────────────────

    /// Append a snapshot to its delivery's chain.
    ///
    /// An explicit `previous_snapshot_id` must exist (`NotFound`), belong to
    /// the same delivery (`InvalidReference`) and still be the latest
    /// snapshot of that delivery (`Conflict`). When absent, the snapshot is
    /// linked to the current latest.
    pub fn append(&self, new: NewSnapshot) -> Result<Snapshot> {
        new.validate()?;
        let conn = self.store.conn();
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(Error::store)?;

        let latest: Option<(String, String)> = tx
            .query_row(
                "SELECT id, created_at FROM snapshots WHERE delivery_id = ?1
                 ORDER BY created_at DESC, seq DESC LIMIT 1",
                params![new.delivery_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Error::store)?;

        if let Some(prev_id) = &new.previous_snapshot_id {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT delivery_id FROM snapshots WHERE id = ?1",
                    params![prev_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::store)?;
            match owner {
                None => return Err(Error::not_found(entity::SNAPSHOT, prev_id.as_str())),
                Some(owner) if owner != new.delivery_id => {
                    return Err(Error::InvalidReference {
                        snapshot_id: prev_id.clone(),
                        expected_delivery: new.delivery_id.clone(),
                        actual_delivery: owner,
                    });
                }
                Some(_) => {}
            }
            let current = latest.as_ref().map(|(id, _)| id.as_str());
            if current != Some(prev_id.as_str()) {
                debug!(
                    delivery_id = %new.delivery_id,
                    expected = %prev_id,
                    current = ?current,
                    "stale predecessor on append"
                );
                return Err(Error::conflict(
                    entity::DELIVERY,
                    new.delivery_id.as_str(),
                    format!(
                        "snapshot {prev_id} is no longer the latest (current: {})",
                        current.unwrap_or("none")
                    ),
                ));
            }
        }

        // Never let a clock step backwards reorder the chain.
        let mut created_at = clock::now_utc();
        let previous_id = match latest {
            Some((id, latest_ts)) => {
                let latest_ts = clock::parse_timestamp(&latest_ts)?;
                if latest_ts > created_at {
                    created_at = latest_ts;
                }
                Some(id)
            }
            None => None,
        };

        let snapshot = seal(new, previous_id, created_at, self.business_offset)?;
        insert_snapshot(&tx, &snapshot)?;
        tx.commit().map_err(Error::store)?;

        debug!(
            snapshot_id = %snapshot.id,
            delivery_id = %snapshot.delivery_id,
            snapshot_type = %snapshot.snapshot_type,
            previous = ?snapshot.previous_snapshot_id,
            "snapshot appended"
        );
        Ok(snapshot)
    }

    // ── Point lookups ───────────────────────────────────────────────

    pub fn get_by_id(&self, id: &str) -> Result<Snapshot> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], map_snapshot_row)
            .optional()
            .map_err(Error::store)?;
        match row {
            Some(row) => row_to_snapshot(row),
            None => Err(Error::not_found(entity::SNAPSHOT, id)),
        }
    }

    pub fn get_latest_by_delivery_id(&self, delivery_id: &str) -> Result<Snapshot> {
        let filter = SnapshotFilter::all()
            .delivery(delivery_id)
            .newest_first()
            .page(Page::first(1));
        self.search_snapshots(&filter)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(entity::DELIVERY, delivery_id))
    }

    // ── Delivery views ──────────────────────────────────────────────

    /// All snapshots of a delivery, newest first.
    pub fn get_by_delivery_id(&self, delivery_id: &str) -> Result<Vec<Snapshot>> {
        self.search_snapshots(&SnapshotFilter::all().delivery(delivery_id).newest_first())
    }

    /// All snapshots of a delivery, oldest first. The canonical audit view.
    pub fn get_delivery_timeline(&self, delivery_id: &str) -> Result<Vec<Snapshot>> {
        self.search_snapshots(&SnapshotFilter::all().delivery(delivery_id).oldest_first())
    }

    pub fn get_by_delivery_id_and_type(
        &self,
        delivery_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .delivery(delivery_id)
                .of_type(snapshot_type)
                .newest_first(),
        )
    }

    // ── Dimension views ─────────────────────────────────────────────

    pub fn get_by_type(&self, snapshot_type: SnapshotType, page: Page) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .of_type(snapshot_type)
                .newest_first()
                .page(page),
        )
    }

    pub fn get_by_business_date(&self, date: Date) -> Result<Vec<Snapshot>> {
        self.search_snapshots(&SnapshotFilter::all().on_business_date(date))
    }

    pub fn get_by_customer_id(&self, customer_id: &str, page: Page) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .customer(customer_id)
                .newest_first()
                .page(page),
        )
    }

    pub fn get_by_order_id(&self, order_id: &str) -> Result<Vec<Snapshot>> {
        self.search_snapshots(&SnapshotFilter::all().order_id(order_id))
    }

    pub fn get_by_provider_code(
        &self,
        provider_code: &str,
        window: TimeWindow,
    ) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .provider(provider_code)
                .within(window)
                .newest_first(),
        )
    }

    pub fn get_by_provider_and_status(
        &self,
        provider_code: &str,
        delivery_status: &str,
        page: Page,
    ) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .provider(provider_code)
                .status(delivery_status)
                .newest_first()
                .page(page),
        )
    }

    pub fn get_by_vehicle_id(&self, vehicle_id: &str, date: Date) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .vehicle(vehicle_id)
                .on_business_date(date),
        )
    }

    pub fn get_by_province(&self, province: &str, date: Date) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .province(province)
                .on_business_date(date),
        )
    }

    /// Business-critical snapshots (everything except `InTransit`), oldest
    /// first, optionally narrowed to one delivery and a window.
    pub fn get_business_event_snapshots(
        &self,
        delivery_id: Option<&str>,
        window: Option<TimeWindow>,
    ) -> Result<Vec<Snapshot>> {
        let mut filter = SnapshotFilter::all().of_types(&SnapshotType::BUSINESS_EVENTS);
        filter.delivery_id = delivery_id.map(str::to_string);
        filter.window = window;
        self.search_snapshots(&filter)
    }

    pub fn get_failed_delivery_snapshots(&self, window: TimeWindow) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .of_type(SnapshotType::Failed)
                .within(window)
                .newest_first(),
        )
    }

    pub fn get_successful_delivery_snapshots(&self, window: TimeWindow) -> Result<Vec<Snapshot>> {
        self.search_snapshots(
            &SnapshotFilter::all()
                .of_type(SnapshotType::Delivered)
                .within(window)
                .newest_first(),
        )
    }

    /// Run a composable filter. Every other query funnels through here.
    pub fn search_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        let (where_sql, mut values) = where_clause(filter);
        let direction = match filter.order {
            SortOrder::OldestFirst => "ASC",
            SortOrder::NewestFirst => "DESC",
        };
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots{where_sql}
             ORDER BY created_at {direction}, seq {direction} LIMIT ? OFFSET ?"
        );
        values.extend(page_values(filter.page));

        let mut stmt = self.store.conn().prepare(&sql).map_err(Error::store)?;
        let rows = stmt
            .query_map(params_from_iter(values), map_snapshot_row)
            .map_err(Error::store)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::store)?;
        rows.into_iter().map(row_to_snapshot).collect()
    }

    /// Number of snapshots matching `filter`, ignoring its page and order.
    pub fn count_snapshots(&self, filter: &SnapshotFilter) -> Result<u64> {
        let (where_sql, values) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM snapshots{where_sql}");
        let n: i64 = self
            .store
            .conn()
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .map_err(Error::store)?;
        Ok(n.max(0) as u64)
    }

    // ── Aggregates ──────────────────────────────────────────────────

    /// Snapshot counts grouped by `dimension` over a window. Rows where the
    /// dimension is null are skipped.
    pub fn count_by(
        &self,
        dimension: Dimension,
        window: TimeWindow,
    ) -> Result<BTreeMap<String, u64>> {
        let col = dimension.column();
        let sql = format!(
            "SELECT {col}, COUNT(*) FROM snapshots
             WHERE created_at >= ?1 AND created_at < ?2 AND {col} IS NOT NULL
             GROUP BY {col}"
        );
        let mut stmt = self.store.conn().prepare(&sql).map_err(Error::store)?;
        let rows = stmt
            .query_map(params![ts(window.start), ts(window.end)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(Error::store)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, count) = row.map_err(Error::store)?;
            out.insert(key, count.max(0) as u64);
        }
        Ok(out)
    }

    pub fn get_snapshot_count_by_type(&self, window: TimeWindow) -> Result<BTreeMap<String, u64>> {
        self.count_by(Dimension::Type, window)
    }

    pub fn get_snapshot_count_by_provider(
        &self,
        window: TimeWindow,
    ) -> Result<BTreeMap<String, u64>> {
        self.count_by(Dimension::Provider, window)
    }

    pub fn get_snapshot_count_by_status(
        &self,
        window: TimeWindow,
    ) -> Result<BTreeMap<String, u64>> {
        self.count_by(Dimension::Status, window)
    }

    /// Delivered snapshots divided by distinct deliveries seen in the window.
    /// Zero when the window holds no snapshots.
    pub fn get_delivery_completion_rate(&self, window: TimeWindow) -> Result<f64> {
        let (delivered, deliveries): (i64, i64) = self
            .store
            .conn()
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN snapshot_type = ?3 THEN 1 ELSE 0 END), 0),
                    COUNT(DISTINCT delivery_id)
                 FROM snapshots
                 WHERE created_at >= ?1 AND created_at < ?2",
                params![
                    ts(window.start),
                    ts(window.end),
                    SnapshotType::Delivered.as_str()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Error::store)?;
        if deliveries == 0 {
            return Ok(0.0);
        }
        Ok(delivered as f64 / deliveries as f64)
    }

    /// Sum of `delivery_fee` over Delivered snapshots, per provider.
    pub fn get_revenue_from_snapshots(
        &self,
        window: TimeWindow,
    ) -> Result<BTreeMap<String, Decimal>> {
        let mut stmt = self
            .store
            .conn()
            .prepare(
                "SELECT provider_code, delivery_fee FROM snapshots
                 WHERE snapshot_type = ?1 AND created_at >= ?2 AND created_at < ?3
                   AND provider_code IS NOT NULL AND delivery_fee IS NOT NULL",
            )
            .map_err(Error::store)?;
        let rows = stmt
            .query_map(
                params![
                    SnapshotType::Delivered.as_str(),
                    ts(window.start),
                    ts(window.end)
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(Error::store)?;
        let mut out: BTreeMap<String, Decimal> = BTreeMap::new();
        for row in rows {
            let (provider, fee) = row.map_err(Error::store)?;
            *out.entry(provider).or_default() += parse_fee(&fee)?;
        }
        Ok(out)
    }

    /// Fees collected by one provider on one business day (Delivered only).
    pub fn get_delivery_fees_from_snapshots(
        &self,
        provider_code: &str,
        business_date: Date,
    ) -> Result<Decimal> {
        let mut stmt = self
            .store
            .conn()
            .prepare(
                "SELECT delivery_fee FROM snapshots
                 WHERE snapshot_type = ?1 AND provider_code = ?2 AND business_date = ?3
                   AND delivery_fee IS NOT NULL",
            )
            .map_err(Error::store)?;
        let rows = stmt
            .query_map(
                params![
                    SnapshotType::Delivered.as_str(),
                    provider_code,
                    clock::format_date(business_date)
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(Error::store)?;
        let mut total = Decimal::ZERO;
        for fee in rows {
            total += parse_fee(&fee.map_err(Error::store)?)?;
        }
        Ok(total)
    }

    // ── Retention ───────────────────────────────────────────────────

    /// Tag snapshots created before `cutoff` as archived. Audit content and
    /// hashes are untouched. Returns the number of rows newly tagged.
    pub fn archive_snapshots_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let changed = self
            .store
            .conn()
            .execute(
                "UPDATE snapshots SET archived_at = ?1
                 WHERE created_at < ?2 AND archived_at IS NULL",
                params![ts(clock::now_utc()), ts(cutoff)],
            )
            .map_err(Error::store)?;
        info!(count = changed, cutoff = %clock::format_timestamp(cutoff), "archived snapshots");
        Ok(changed)
    }

    /// Hard-delete snapshots created before `cutoff`. Destructive; returns
    /// the number of rows removed.
    pub fn delete_snapshots_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let changed = self
            .store
            .conn()
            .execute(
                "DELETE FROM snapshots WHERE created_at < ?1",
                params![ts(cutoff)],
            )
            .map_err(Error::store)?;
        info!(count = changed, cutoff = %clock::format_timestamp(cutoff), "deleted snapshots");
        Ok(changed)
    }

    // ── Verification ────────────────────────────────────────────────

    /// Recompute hashes and pointers along a delivery's timeline.
    ///
    /// A timeline whose head was removed by retention deletion reports a
    /// broken first link; archival never does.
    pub fn verify_delivery_chain(&self, delivery_id: &str) -> Result<ChainReport> {
        let timeline = self.get_delivery_timeline(delivery_id)?;
        if timeline.is_empty() {
            return Err(Error::not_found(entity::DELIVERY, delivery_id));
        }
        let report = verify_chain(delivery_id, &timeline)?;
        if !report.is_intact() {
            warn!(
                delivery_id,
                issues = report.issues.len(),
                "snapshot chain verification failed"
            );
        }
        Ok(report)
    }
}

// ── Internal helpers ────────────────────────────────────────────────

fn where_clause(filter: &SnapshotFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let mut eq = |col: &str, v: Option<&str>| {
        if let Some(v) = v {
            clauses.push(format!("{col} = ?"));
            values.push(text(v));
        }
    };
    eq("delivery_id", filter.delivery_id.as_deref());
    eq("provider_code", filter.provider_code.as_deref());
    eq("delivery_status", filter.delivery_status.as_deref());
    eq("customer_id", filter.customer_id.as_deref());
    eq("order_id", filter.order_id.as_deref());
    eq("vehicle_id", filter.vehicle_id.as_deref());
    eq("delivery_address_province", filter.province.as_deref());

    if !filter.types.is_empty() {
        clauses.push(format!(
            "snapshot_type IN ({})",
            placeholders(filter.types.len())
        ));
        values.extend(filter.types.iter().map(|t| text(t.as_str())));
    }
    if let Some(date) = filter.business_date {
        clauses.push("business_date = ?".to_string());
        values.push(text(clock::format_date(date)));
    }
    if let Some(window) = filter.window {
        clauses.push("created_at >= ? AND created_at < ?".to_string());
        values.push(ts(window.start));
        values.push(ts(window.end));
    }
    match filter.archived {
        ArchivedFilter::Any => {}
        ArchivedFilter::Only => clauses.push("archived_at IS NOT NULL".to_string()),
        ArchivedFilter::Exclude => clauses.push("archived_at IS NULL".to_string()),
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn insert_snapshot(tx: &Transaction<'_>, s: &Snapshot) -> Result<()> {
    let data = serde_json::to_string(&s.snapshot_data)?;
    let fee = s.facts.delivery_fee.map(|d| d.to_string());
    tx.execute(
        &format!(
            "INSERT INTO snapshots ({SNAPSHOT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ),
        params_from_iter([
            text(s.id.as_str()),
            text(s.delivery_id.as_str()),
            text(s.snapshot_type.as_str()),
            text(data),
            opt_text(s.previous_snapshot_id.as_deref()),
            text(s.triggered_by.as_str()),
            opt_text(s.triggered_by_user_id.as_deref()),
            text(s.triggered_event.as_str()),
            opt_text(s.facts.delivery_status.as_deref()),
            opt_text(s.facts.customer_id.as_deref()),
            opt_text(s.facts.order_id.as_deref()),
            opt_text(s.facts.vehicle_id.as_deref()),
            opt_text(s.facts.driver_name.as_deref()),
            opt_text(s.facts.delivery_address_province.as_deref()),
            opt_text(fee.as_deref()),
            opt_text(s.facts.provider_code.as_deref()),
            ts(s.created_at),
            text(clock::format_date(s.business_date)),
            text(s.hash.as_str()),
            Value::Null,
        ]),
    )
    .map_err(Error::store)?;
    Ok(())
}

fn parse_fee(raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .map_err(|e| Error::Invalid(format!("corrupt delivery_fee {raw:?}: {e}")))
}

/// Intermediate row struct for deserialization.
struct SnapshotRow {
    id: String,
    delivery_id: String,
    snapshot_type: String,
    snapshot_data: String,
    previous_snapshot_id: Option<String>,
    triggered_by: String,
    triggered_by_user_id: Option<String>,
    triggered_event: String,
    delivery_status: Option<String>,
    customer_id: Option<String>,
    order_id: Option<String>,
    vehicle_id: Option<String>,
    driver_name: Option<String>,
    delivery_address_province: Option<String>,
    delivery_fee: Option<String>,
    provider_code: Option<String>,
    created_at: String,
    business_date: String,
    hash: String,
    archived_at: Option<String>,
}

fn map_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        delivery_id: row.get(1)?,
        snapshot_type: row.get(2)?,
        snapshot_data: row.get(3)?,
        previous_snapshot_id: row.get(4)?,
        triggered_by: row.get(5)?,
        triggered_by_user_id: row.get(6)?,
        triggered_event: row.get(7)?,
        delivery_status: row.get(8)?,
        customer_id: row.get(9)?,
        order_id: row.get(10)?,
        vehicle_id: row.get(11)?,
        driver_name: row.get(12)?,
        delivery_address_province: row.get(13)?,
        delivery_fee: row.get(14)?,
        provider_code: row.get(15)?,
        created_at: row.get(16)?,
        business_date: row.get(17)?,
        hash: row.get(18)?,
        archived_at: row.get(19)?,
    })
}

fn row_to_snapshot(row: SnapshotRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.id,
        delivery_id: row.delivery_id,
        snapshot_type: row.snapshot_type.parse()?,
        snapshot_data: serde_json::from_str(&row.snapshot_data)?,
        previous_snapshot_id: row.previous_snapshot_id,
        triggered_by: row.triggered_by,
        triggered_by_user_id: row.triggered_by_user_id,
        triggered_event: row.triggered_event,
        facts: DeliveryFacts {
            delivery_status: row.delivery_status,
            customer_id: row.customer_id,
            order_id: row.order_id,
            vehicle_id: row.vehicle_id,
            driver_name: row.driver_name,
            delivery_address_province: row.delivery_address_province,
            delivery_fee: row.delivery_fee.as_deref().map(parse_fee).transpose()?,
            provider_code: row.provider_code,
        },
        created_at: clock::parse_timestamp(&row.created_at)?,
        business_date: clock::parse_date(&row.business_date)?,
        hash: row.hash,
        archived_at: parse_opt_ts(row.archived_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::DEFAULT_BUSY_TIMEOUT;
    use serde_json::json;
    use std::sync::{Arc, Barrier};
    use waybill_core::ChainIssue;

    fn log() -> SnapshotLog {
        SnapshotLog::new(SqliteStore::open_in_memory().unwrap(), UtcOffset::UTC)
    }

    fn event(delivery: &str, t: SnapshotType) -> NewSnapshot {
        NewSnapshot::new(delivery, t, "dispatcher", t.as_str())
    }

    fn delivered(delivery: &str, provider: &str, fee: Decimal) -> NewSnapshot {
        event(delivery, SnapshotType::Delivered).with_facts(DeliveryFacts {
            provider_code: Some(provider.into()),
            delivery_fee: Some(fee),
            delivery_status: Some("delivered".into()),
            ..Default::default()
        })
    }

    /// Window covering everything appended during the test.
    fn around_now() -> TimeWindow {
        let now = clock::now_utc();
        TimeWindow::new(now - time::Duration::HOUR, now + time::Duration::HOUR).unwrap()
    }

    #[test]
    fn chain_links_each_snapshot_to_predecessor() {
        let log = log();
        let mut ids = Vec::new();
        for t in [
            SnapshotType::Created,
            SnapshotType::Assigned,
            SnapshotType::PickedUp,
            SnapshotType::InTransit,
            SnapshotType::Delivered,
        ] {
            ids.push(log.append(event("D1", t)).unwrap().id);
        }
        // Interleave another delivery; it must not disturb D1's chain.
        log.append(event("D9", SnapshotType::Created)).unwrap();

        let timeline = log.get_delivery_timeline("D1").unwrap();
        assert_eq!(timeline.len(), 5);
        assert_eq!(timeline[0].previous_snapshot_id, None);
        for i in 1..timeline.len() {
            assert_eq!(
                timeline[i].previous_snapshot_id.as_deref(),
                Some(timeline[i - 1].id.as_str())
            );
            assert!(timeline[i].created_at >= timeline[i - 1].created_at);
        }
        let got: Vec<_> = timeline.iter().map(|s| s.id.clone()).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn scenario_timeline_and_completion_rate() {
        let log = log();
        let window_start = clock::now_utc() - time::Duration::MINUTE;
        log.append(event("D2", SnapshotType::Created)).unwrap();
        log.append(event("D2", SnapshotType::Assigned)).unwrap();
        log.append(event("D2", SnapshotType::Delivered)).unwrap();
        let window =
            TimeWindow::new(window_start, clock::now_utc() + time::Duration::MINUTE).unwrap();

        let types: Vec<_> = log
            .get_delivery_timeline("D2")
            .unwrap()
            .iter()
            .map(|s| s.snapshot_type)
            .collect();
        assert_eq!(
            types,
            vec![
                SnapshotType::Created,
                SnapshotType::Assigned,
                SnapshotType::Delivered
            ]
        );
        assert_eq!(log.get_delivery_completion_rate(window).unwrap(), 1.0);
    }

    #[test]
    fn completion_rate_of_empty_window_is_zero() {
        let log = log();
        log.append(event("D1", SnapshotType::Delivered)).unwrap();
        let past = TimeWindow::new(
            time::macros::datetime!(2020-01-01 00:00 UTC),
            time::macros::datetime!(2020-01-02 00:00 UTC),
        )
        .unwrap();
        assert_eq!(log.get_delivery_completion_rate(past).unwrap(), 0.0);
    }

    #[test]
    fn completion_rate_counts_distinct_deliveries() {
        let log = log();
        log.append(event("D1", SnapshotType::Created)).unwrap();
        log.append(event("D1", SnapshotType::Delivered)).unwrap();
        log.append(event("D2", SnapshotType::Created)).unwrap();
        log.append(event("D2", SnapshotType::Failed)).unwrap();
        assert_eq!(log.get_delivery_completion_rate(around_now()).unwrap(), 0.5);
    }

    #[test]
    fn latest_is_last_appended() {
        let log = log();
        let mut last = None;
        for _ in 0..4 {
            last = Some(log.append(event("D3", SnapshotType::InTransit)).unwrap());
        }
        let latest = log.get_latest_by_delivery_id("D3").unwrap();
        assert_eq!(Some(latest), last);
        assert!(log.get_latest_by_delivery_id("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn explicit_predecessor_rules() {
        let log = log();
        let a1 = log.append(event("A", SnapshotType::Created)).unwrap();
        let b1 = log.append(event("B", SnapshotType::Created)).unwrap();

        // Unknown id.
        let err = log
            .append(event("A", SnapshotType::Assigned).with_previous("snap_missing"))
            .unwrap_err();
        assert!(err.is_not_found());

        // Another delivery's snapshot.
        let err = log
            .append(event("A", SnapshotType::Assigned).with_previous(b1.id.as_str()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReference { ref actual_delivery, .. } if actual_delivery == "B"));

        // Correct predecessor.
        let a2 = log
            .append(event("A", SnapshotType::Assigned).with_previous(a1.id.as_str()))
            .unwrap();
        assert_eq!(a2.previous_snapshot_id.as_deref(), Some(a1.id.as_str()));

        // a1 is now stale.
        let err = log
            .append(event("A", SnapshotType::PickedUp).with_previous(a1.id.as_str()))
            .unwrap_err();
        assert!(err.is_conflict());

        // Nothing was written by the rejected appends.
        assert_eq!(log.get_delivery_timeline("A").unwrap().len(), 2);
    }

    #[test]
    fn empty_delivery_id_rejected() {
        let log = log();
        let err = log.append(event("", SnapshotType::Created)).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn stored_snapshot_round_trips() {
        let log = log();
        let new = event("D1", SnapshotType::PickedUp)
            .with_data(json!({"scan": {"lat": 13.75, "lng": 100.5}, "photos": 2}))
            .with_user("U7")
            .with_facts(DeliveryFacts {
                delivery_status: Some("picked_up".into()),
                customer_id: Some("C1".into()),
                order_id: Some("O1".into()),
                vehicle_id: Some("V1".into()),
                driver_name: Some("Somchai".into()),
                delivery_address_province: Some("Bangkok".into()),
                delivery_fee: Some(Decimal::new(4550, 2)),
                provider_code: Some("manual".into()),
            });
        let appended = log.append(new).unwrap();
        let fetched = log.get_by_id(&appended.id).unwrap();
        assert_eq!(fetched, appended);
        assert!(log.get_by_id("snap_unknown").unwrap_err().is_not_found());
    }

    #[test]
    fn float_payload_survives_storage() {
        let log = log();
        let appended = log
            .append(event("DF", SnapshotType::Created).with_data(json!({
                "lat": 13.000005100086701,
                "lng": 100.50001234567891,
                "tiny": 1.0715660391465826e-75,
            })))
            .unwrap();
        assert_eq!(log.get_by_id(&appended.id).unwrap(), appended);
        assert!(log.verify_delivery_chain("DF").unwrap().is_intact());
    }

    #[test]
    fn dimension_queries() {
        let log = log();
        let facts = |vehicle: &str, province: &str, customer: &str| DeliveryFacts {
            vehicle_id: Some(vehicle.into()),
            delivery_address_province: Some(province.into()),
            customer_id: Some(customer.into()),
            order_id: Some(format!("O-{customer}")),
            provider_code: Some("manual".into()),
            delivery_status: Some("assigned".into()),
            ..Default::default()
        };
        let first = log
            .append(event("D1", SnapshotType::Assigned).with_facts(facts("V1", "Bangkok", "C1")))
            .unwrap();
        log.append(event("D2", SnapshotType::Assigned).with_facts(facts("V1", "Chiang Mai", "C2")))
            .unwrap();
        log.append(event("D3", SnapshotType::Assigned).with_facts(facts("V2", "Bangkok", "C1")))
            .unwrap();
        let today = first.business_date;

        assert_eq!(log.get_by_vehicle_id("V1", today).unwrap().len(), 2);
        assert_eq!(log.get_by_province("Bangkok", today).unwrap().len(), 2);
        assert_eq!(log.get_by_business_date(today).unwrap().len(), 3);
        assert_eq!(
            log.get_by_vehicle_id("V1", today.previous_day().unwrap())
                .unwrap()
                .len(),
            0
        );

        let c1 = log.get_by_customer_id("C1", Page::default()).unwrap();
        assert_eq!(c1.len(), 2);
        assert_eq!(c1[0].delivery_id, "D3"); // newest first
        assert_eq!(log.get_by_order_id("O-C2").unwrap()[0].delivery_id, "D2");

        let page = log
            .get_by_provider_and_status("manual", "assigned", Page::new(2, 1))
            .unwrap();
        let ids: Vec<_> = page.iter().map(|s| s.delivery_id.as_str()).collect();
        assert_eq!(ids, vec!["D2", "D1"]);

        assert_eq!(
            log.get_by_provider_code("manual", around_now()).unwrap().len(),
            3
        );
    }

    #[test]
    fn type_views() {
        let log = log();
        log.append(event("D1", SnapshotType::Created)).unwrap();
        log.append(event("D1", SnapshotType::InTransit)).unwrap();
        log.append(event("D1", SnapshotType::InTransit)).unwrap();
        log.append(event("D1", SnapshotType::Failed)).unwrap();
        log.append(event("D2", SnapshotType::Created)).unwrap();
        log.append(event("D2", SnapshotType::Delivered)).unwrap();

        let business = log.get_business_event_snapshots(Some("D1"), None).unwrap();
        assert_eq!(business.len(), 2);
        assert!(business.iter().all(|s| s.snapshot_type.is_business_event()));

        assert_eq!(
            log.get_by_delivery_id_and_type("D1", SnapshotType::InTransit)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(log.get_by_type(SnapshotType::Created, Page::first(1)).unwrap().len(), 1);
        assert_eq!(log.get_failed_delivery_snapshots(around_now()).unwrap().len(), 1);
        assert_eq!(log.get_successful_delivery_snapshots(around_now()).unwrap()[0].delivery_id, "D2");

        let newest = log.get_by_delivery_id("D1").unwrap();
        assert_eq!(newest[0].snapshot_type, SnapshotType::Failed);
    }

    #[test]
    fn grouped_counts_skip_nulls() {
        let log = log();
        log.append(delivered("D1", "manual", Decimal::new(50, 0))).unwrap();
        log.append(delivered("D2", "kerry", Decimal::new(40, 0))).unwrap();
        log.append(event("D3", SnapshotType::Created)).unwrap();

        let by_type = log.get_snapshot_count_by_type(around_now()).unwrap();
        assert_eq!(by_type.get("delivered"), Some(&2));
        assert_eq!(by_type.get("created"), Some(&1));

        let by_provider = log.get_snapshot_count_by_provider(around_now()).unwrap();
        assert_eq!(by_provider.len(), 2);
        assert_eq!(by_provider.get("manual"), Some(&1));

        let by_status = log.get_snapshot_count_by_status(around_now()).unwrap();
        assert_eq!(by_status.get("delivered"), Some(&2));
    }

    #[test]
    fn revenue_and_daily_fees() {
        let log = log();
        let first = log.append(delivered("D1", "manual", Decimal::new(4550, 2))).unwrap();
        log.append(delivered("D2", "manual", Decimal::new(1000, 2))).unwrap();
        log.append(delivered("D3", "kerry", Decimal::new(3000, 2))).unwrap();
        // Failed attempts carry a fee but are not revenue.
        log.append(event("D4", SnapshotType::Failed).with_facts(DeliveryFacts {
            provider_code: Some("manual".into()),
            delivery_fee: Some(Decimal::new(999, 0)),
            ..Default::default()
        }))
        .unwrap();

        let revenue = log.get_revenue_from_snapshots(around_now()).unwrap();
        assert_eq!(revenue.get("manual"), Some(&Decimal::new(5550, 2)));
        assert_eq!(revenue.get("kerry"), Some(&Decimal::new(3000, 2)));

        let today = first.business_date;
        assert_eq!(
            log.get_delivery_fees_from_snapshots("manual", today).unwrap(),
            Decimal::new(5550, 2)
        );
        assert_eq!(
            log.get_delivery_fees_from_snapshots("nobody", today).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn search_combines_filters() {
        let log = log();
        log.append(delivered("D1", "manual", Decimal::ONE)).unwrap();
        log.append(event("D1", SnapshotType::Created)).unwrap();
        log.append(delivered("D2", "manual", Decimal::ONE)).unwrap();

        let filter = SnapshotFilter::default()
            .delivery("D1")
            .of_type(SnapshotType::Delivered)
            .provider("manual");
        let hits = log.search_snapshots(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].delivery_id, "D1");

        let none = log
            .search_snapshots(&SnapshotFilter::default().archived(ArchivedFilter::Only))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn archive_keeps_audit_content() {
        let log = log();
        let first = log.append(event("D1", SnapshotType::Created)).unwrap();
        log.append(event("D1", SnapshotType::Delivered)).unwrap();

        let cutoff = clock::now_utc() + time::Duration::SECOND;
        assert_eq!(log.archive_snapshots_older_than(cutoff).unwrap(), 2);
        // Already archived rows are not re-tagged.
        assert_eq!(log.archive_snapshots_older_than(cutoff).unwrap(), 0);

        let again = log.get_by_id(&first.id).unwrap();
        assert!(again.archived_at.is_some());
        assert_eq!(again.hash, first.hash);
        assert!(log.verify_delivery_chain("D1").unwrap().is_intact());
        assert_eq!(
            log.search_snapshots(&SnapshotFilter::all().archived(ArchivedFilter::Exclude))
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn delete_removes_rows() {
        let log = log();
        log.append(event("D1", SnapshotType::Created)).unwrap();
        log.append(event("D2", SnapshotType::Created)).unwrap();
        let past = time::macros::datetime!(2020-01-01 00:00 UTC);
        assert_eq!(log.delete_snapshots_older_than(past).unwrap(), 0);
        let future = clock::now_utc() + time::Duration::SECOND;
        assert_eq!(log.delete_snapshots_older_than(future).unwrap(), 2);
        assert!(log.get_delivery_timeline("D1").unwrap().is_empty());
    }

    #[test]
    fn count_matches_search_without_paging() {
        let log = log();
        for d in ["D1", "D2", "D3"] {
            log.append(event(d, SnapshotType::Created)).unwrap();
        }
        log.append(delivered("D1", "manual", Decimal::new(20, 0))).unwrap();

        let filter = SnapshotFilter::all().of_type(SnapshotType::Created).page(Page::first(1));
        assert_eq!(log.count_snapshots(&filter).unwrap(), 3);
        assert_eq!(log.search_snapshots(&filter).unwrap().len(), 1);

        let future = clock::now_utc() + time::Duration::SECOND;
        let window = TimeWindow::new(OffsetDateTime::UNIX_EPOCH, future).unwrap();
        let older = SnapshotFilter::all().within(window).archived(ArchivedFilter::Exclude);
        assert_eq!(log.count_snapshots(&older).unwrap(), 4);
        log.archive_snapshots_older_than(future).unwrap();
        assert_eq!(log.count_snapshots(&older).unwrap(), 0);
        assert_eq!(
            log.count_snapshots(&SnapshotFilter::all().delivery("D1")).unwrap(),
            2
        );
        assert_eq!(
            log.count_snapshots(&SnapshotFilter::all().delivery("nope")).unwrap(),
            0
        );
    }

    #[test]
    fn audit_columns_are_write_once() {
        let log = log();
        let s = log.append(event("D1", SnapshotType::Created)).unwrap();
        let res = log.store.conn().execute(
            "UPDATE snapshots SET delivery_id = 'D2' WHERE id = ?1",
            params![s.id],
        );
        assert!(res.is_err());
    }

    #[test]
    fn verification_detects_tampering() {
        let log = log();
        log.append(delivered("D1", "manual", Decimal::new(10, 0))).unwrap();
        let s = log.get_latest_by_delivery_id("D1").unwrap();
        log.store
            .conn()
            .execute_batch("DROP TRIGGER snapshots_append_only")
            .unwrap();
        log.store
            .conn()
            .execute(
                "UPDATE snapshots SET delivery_fee = '1000' WHERE id = ?1",
                params![s.id],
            )
            .unwrap();
        let report = log.verify_delivery_chain("D1").unwrap();
        assert_eq!(
            report.issues,
            vec![ChainIssue::HashMismatch { snapshot_id: s.id }]
        );
        assert!(log.verify_delivery_chain("D404").unwrap_err().is_not_found());
    }

    #[test]
    fn concurrent_appenders_keep_chain_intact() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        drop(SqliteStore::open_or_create(&db, DEFAULT_BUSY_TIMEOUT).unwrap());

        let writers = 4;
        let per_writer = 10;
        let barrier = Arc::new(Barrier::new(writers));
        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let log = SnapshotLog::new(
                        SqliteStore::open(&db, DEFAULT_BUSY_TIMEOUT).unwrap(),
                        UtcOffset::UTC,
                    );
                    barrier.wait();
                    for i in 0..per_writer {
                        log.append(
                            event("D-shared", SnapshotType::InTransit)
                                .with_data(json!({"writer": w, "i": i})),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let log = SnapshotLog::new(
            SqliteStore::open(&db, DEFAULT_BUSY_TIMEOUT).unwrap(),
            UtcOffset::UTC,
        );
        let timeline = log.get_delivery_timeline("D-shared").unwrap();
        assert_eq!(timeline.len(), writers * per_writer);
        assert!(log.verify_delivery_chain("D-shared").unwrap().is_intact());
    }
}
