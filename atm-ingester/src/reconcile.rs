use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::warn;

use crate::error::PersistenceError;
use crate::record::{AtmRecord, NaturalKey};

const TABLE: &str = "presential_service_channels.automated_teller_machines";

/// A persisted row as returned by the batched existence lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRow {
    pub id: i64,
    pub key: NaturalKey,
}

/// The non-key attributes of a record, aimed at a specific persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub row_id: i64,
    pub record: AtmRecord,
}

/// Transient per-file output of plan building: which records update an
/// existing row and which are inserted fresh.
#[derive(Debug, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub updates: Vec<RecordUpdate>,
    pub inserts: Vec<AtmRecord>,
}

/// Row counts reported back to the ingestion loop for logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub updated: u64,
    pub inserted: u64,
}

/// Bulk persistence collaborator. One batched round trip per operation,
/// regardless of batch size.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up which of `keys` already have a persisted row. `None` means
    /// the collaborator could not produce a usable result set, which the
    /// planner treats as "insert everything" rather than as an error.
    async fn find_existing(
        &self,
        keys: &[NaturalKey],
    ) -> Result<Option<Vec<ExistingRow>>, PersistenceError>;

    async fn update_records(&self, updates: &[RecordUpdate]) -> Result<u64, PersistenceError>;

    async fn insert_records(&self, inserts: &[AtmRecord]) -> Result<u64, PersistenceError>;
}

/// Split records into update and insert sets against the lookup result.
///
/// Duplicate natural keys within one file collapse to the last record in
/// input order, so no update and no insert targets the same key twice in
/// one pass.
pub fn build_plan(records: Vec<AtmRecord>, existing: Option<&[ExistingRow]>) -> ReconciliationPlan {
    let deduped = last_write_wins(records);

    let by_key: HashMap<&NaturalKey, i64> = match existing {
        Some(rows) => rows.iter().map(|row| (&row.key, row.id)).collect(),
        None => HashMap::new(),
    };

    let mut plan = ReconciliationPlan::default();
    for record in deduped {
        match by_key.get(&record.key) {
            Some(&row_id) => plan.updates.push(RecordUpdate { row_id, record }),
            None => plan.inserts.push(record),
        }
    }
    plan
}

/// Collapse duplicate natural keys, keeping the later record for each.
fn last_write_wins(records: Vec<AtmRecord>) -> Vec<AtmRecord> {
    let mut slots: HashMap<NaturalKey, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<AtmRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.get(&record.key) {
            Some(&i) => kept[i] = record,
            None => {
                slots.insert(record.key.clone(), kept.len());
                kept.push(record);
            }
        }
    }
    kept
}

/// Reconcile one file's records against the store: one batched lookup, one
/// batched update, one batched insert. A lookup failure aborts before any
/// write; a write failure surfaces to the caller with nothing retried here.
pub async fn reconcile(
    store: &dyn RecordStore,
    records: Vec<AtmRecord>,
) -> Result<ReconcileOutcome, PersistenceError> {
    if records.is_empty() {
        return Ok(ReconcileOutcome::default());
    }

    let keys: Vec<NaturalKey> = {
        let mut seen = std::collections::HashSet::new();
        records
            .iter()
            .filter(|r| seen.insert(r.key.clone()))
            .map(|r| r.key.clone())
            .collect()
    };

    let existing = store.find_existing(&keys).await?;
    if existing.is_none() {
        warn!("existence lookup returned no usable result, inserting all records");
    }
    let plan = build_plan(records, existing.as_deref());

    let mut outcome = ReconcileOutcome::default();
    if !plan.updates.is_empty() {
        outcome.updated = store.update_records(&plan.updates).await?;
        metrics::counter!("ingest_records_updated_total").increment(outcome.updated);
    }
    if !plan.inserts.is_empty() {
        outcome.inserted = store.insert_records(&plan.inserts).await?;
        metrics::counter!("ingest_records_inserted_total").increment(outcome.inserted);
    }

    Ok(outcome)
}

/// `RecordStore` backed by PostgreSQL through sqlx. Each operation is a
/// single statement parameterized over column arrays, so a connection is
/// only held for the duration of that statement.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_existing(
        &self,
        keys: &[NaturalKey],
    ) -> Result<Option<Vec<ExistingRow>>, PersistenceError> {
        let mut identifiers = Vec::with_capacity(keys.len());
        let mut street_names = Vec::with_capacity(keys.len());
        let mut building_numbers = Vec::with_capacity(keys.len());
        let mut town_names = Vec::with_capacity(keys.len());
        let mut district_names = Vec::with_capacity(keys.len());
        let mut subdivision_names = Vec::with_capacity(keys.len());
        for key in keys {
            identifiers.push(key.identifier.clone());
            street_names.push(key.street_name.clone());
            building_numbers.push(key.building_number.clone());
            town_names.push(key.town_name.clone());
            district_names.push(key.district_name.clone());
            subdivision_names.push(key.subdivision_name.clone());
        }

        // Key columns are nullable, so plain tuple equality would never
        // match a NULL component.
        let query = format!(
            r#"
SELECT t.id, t.atmidentifier, t.atmaddress_streetname, t.atmaddress_buildingnumber,
       t.atmtownname, t.atmdistrictname, t.atmcountrysubdivisionmajorname
FROM {TABLE} AS t
JOIN UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
    AS k(identifier, street_name, building_number, town_name, district_name, subdivision_name)
ON t.atmidentifier IS NOT DISTINCT FROM k.identifier
    AND t.atmaddress_streetname IS NOT DISTINCT FROM k.street_name
    AND t.atmaddress_buildingnumber IS NOT DISTINCT FROM k.building_number
    AND t.atmtownname IS NOT DISTINCT FROM k.town_name
    AND t.atmdistrictname IS NOT DISTINCT FROM k.district_name
    AND t.atmcountrysubdivisionmajorname IS NOT DISTINCT FROM k.subdivision_name
            "#
        );

        let rows = sqlx::query(&query)
            .bind(&identifiers)
            .bind(&street_names)
            .bind(&building_numbers)
            .bind(&town_names)
            .bind(&district_names)
            .bind(&subdivision_names)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| PersistenceError::QueryError {
                command: "SELECT",
                error,
            })?;

        let existing = rows
            .iter()
            .map(|row| ExistingRow {
                id: row.get("id"),
                key: NaturalKey {
                    identifier: row.get("atmidentifier"),
                    street_name: row.get("atmaddress_streetname"),
                    building_number: row.get("atmaddress_buildingnumber"),
                    town_name: row.get("atmtownname"),
                    district_name: row.get("atmdistrictname"),
                    subdivision_name: row.get("atmcountrysubdivisionmajorname"),
                },
            })
            .collect();

        Ok(Some(existing))
    }

    async fn update_records(&self, updates: &[RecordUpdate]) -> Result<u64, PersistenceError> {
        let mut ids: Vec<i64> = Vec::with_capacity(updates.len());
        let mut from_datetimes: Vec<NaiveDateTime> = Vec::with_capacity(updates.len());
        let mut to_datetimes: Vec<NaiveDateTime> = Vec::with_capacity(updates.len());
        let mut time_types = Vec::with_capacity(updates.len());
        let mut attention_hours = Vec::with_capacity(updates.len());
        let mut service_types = Vec::with_capacity(updates.len());
        let mut access_types = Vec::with_capacity(updates.len());
        for update in updates {
            ids.push(update.row_id);
            from_datetimes.push(update.record.from_datetime);
            to_datetimes.push(update.record.to_datetime);
            time_types.push(update.record.time_type.clone());
            attention_hours.push(update.record.attention_hours.clone());
            service_types.push(update.record.service_type.clone());
            access_types.push(update.record.access_type.clone());
        }

        let query = format!(
            r#"
UPDATE {TABLE} AS t
SET atmfromdatetime = u.from_datetime,
    atmtodatetime = u.to_datetime,
    atmtimetype = u.time_type,
    atmattentionhour = u.attention_hour,
    atmservicetype = u.service_type,
    atmaccesstype = u.access_type
FROM UNNEST($1::bigint[], $2::timestamp[], $3::timestamp[], $4::text[], $5::text[], $6::text[], $7::text[])
    AS u(id, from_datetime, to_datetime, time_type, attention_hour, service_type, access_type)
WHERE t.id = u.id
            "#
        );

        let result = sqlx::query(&query)
            .bind(&ids)
            .bind(&from_datetimes)
            .bind(&to_datetimes)
            .bind(&time_types)
            .bind(&attention_hours)
            .bind(&service_types)
            .bind(&access_types)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::QueryError {
                command: "UPDATE",
                error,
            })?;

        Ok(result.rows_affected())
    }

    async fn insert_records(&self, inserts: &[AtmRecord]) -> Result<u64, PersistenceError> {
        let mut identifiers = Vec::with_capacity(inserts.len());
        let mut street_names = Vec::with_capacity(inserts.len());
        let mut building_numbers = Vec::with_capacity(inserts.len());
        let mut town_names = Vec::with_capacity(inserts.len());
        let mut district_names = Vec::with_capacity(inserts.len());
        let mut subdivision_names = Vec::with_capacity(inserts.len());
        let mut from_datetimes: Vec<NaiveDateTime> = Vec::with_capacity(inserts.len());
        let mut to_datetimes: Vec<NaiveDateTime> = Vec::with_capacity(inserts.len());
        let mut time_types = Vec::with_capacity(inserts.len());
        let mut attention_hours = Vec::with_capacity(inserts.len());
        let mut service_types = Vec::with_capacity(inserts.len());
        let mut access_types = Vec::with_capacity(inserts.len());
        for record in inserts {
            identifiers.push(record.key.identifier.clone());
            street_names.push(record.key.street_name.clone());
            building_numbers.push(record.key.building_number.clone());
            town_names.push(record.key.town_name.clone());
            district_names.push(record.key.district_name.clone());
            subdivision_names.push(record.key.subdivision_name.clone());
            from_datetimes.push(record.from_datetime);
            to_datetimes.push(record.to_datetime);
            time_types.push(record.time_type.clone());
            attention_hours.push(record.attention_hours.clone());
            service_types.push(record.service_type.clone());
            access_types.push(record.access_type.clone());
        }

        let query = format!(
            r#"
INSERT INTO {TABLE} (
    atmidentifier, atmaddress_streetname, atmaddress_buildingnumber,
    atmtownname, atmdistrictname, atmcountrysubdivisionmajorname,
    atmfromdatetime, atmtodatetime, atmtimetype,
    atmattentionhour, atmservicetype, atmaccesstype
) (SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
    $7::timestamp[], $8::timestamp[], $9::text[], $10::text[], $11::text[], $12::text[]))
            "#
        );

        let result = sqlx::query(&query)
            .bind(&identifiers)
            .bind(&street_names)
            .bind(&building_numbers)
            .bind(&town_names)
            .bind(&district_names)
            .bind(&subdivision_names)
            .bind(&from_datetimes)
            .bind(&to_datetimes)
            .bind(&time_types)
            .bind(&attention_hours)
            .bind(&service_types)
            .bind(&access_types)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::QueryError {
                command: "INSERT",
                error,
            })?;

        Ok(result.rows_affected())
    }
}
