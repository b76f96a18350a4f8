//! Core domain model for the carrier billing ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cbl-core";

/// Column names shared between the ingest pipeline and the warehouse schema.
pub mod columns {
    pub const COMPANY: &str = "company";
    pub const CARRIER: &str = "carrier";
    pub const TRACKING_NUMBER: &str = "tracking_number";
    pub const REASON: &str = "reason";
    pub const DOCUMENT_NUMBER: &str = "document_number";
    pub const AMOUNT: &str = "amount";
    pub const CURRENCY: &str = "currency";
    pub const CREDITED_AT: &str = "credited_at";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// A single tabular cell value. Batches are dynamic by design: each
/// destination table carries its own column set and the pipeline only
/// interprets the columns its policy names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical string form used for fingerprinting. Missing and null
    /// values both collapse to the `"null"` sentinel so that a column
    /// absent from one producer and explicitly null from another still
    /// dedup against each other.
    pub fn normalized(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

/// One tabular record keyed by column name. BTreeMap keeps column order
/// deterministic, which keeps generated SQL and fingerprints stable.
pub type Row = BTreeMap<String, Value>;

/// Look up a column, treating a missing column as SQL NULL.
pub fn row_value<'a>(row: &'a Row, field: &str) -> &'a Value {
    row.get(field).unwrap_or(&Value::Null)
}

/// The (company, carrier) pair every persisted-duplicate lookup is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub company: String,
    pub carrier: String,
}

/// An ordered collection of rows destined for one warehouse table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub table: String,
    pub scope: Scope,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(table: impl Into<String>, scope: Scope, rows: Vec<Row>) -> Self {
        Self {
            table: table.into(),
            scope,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Typed form of one financial line item as handed over by producers.
/// The pipeline itself works on [`Row`]s; this is the ergonomic entry
/// point for callers that build batches in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub company: String,
    pub carrier: String,
    pub tracking_number: String,
    pub reason: String,
    #[serde(default)]
    pub document_number: Option<String>,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LineItem {
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert(columns::COMPANY.into(), Value::Text(self.company));
        row.insert(columns::CARRIER.into(), Value::Text(self.carrier));
        row.insert(
            columns::TRACKING_NUMBER.into(),
            Value::Text(self.tracking_number),
        );
        row.insert(columns::REASON.into(), Value::Text(self.reason));
        row.insert(
            columns::DOCUMENT_NUMBER.into(),
            self.document_number.map(Value::Text).unwrap_or(Value::Null),
        );
        row.insert(columns::AMOUNT.into(), Value::Float(self.amount));
        row.insert(columns::CURRENCY.into(), Value::Text(self.currency));
        row.insert(
            columns::CREATED_AT.into(),
            self.created_at.map(Value::Timestamp).unwrap_or(Value::Null),
        );
        row.insert(
            columns::UPDATED_AT.into(),
            self.updated_at.map(Value::Timestamp).unwrap_or(Value::Null),
        );
        row
    }
}

/// How the uniqueness guard treats a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Header,
    Detail,
    AppendOnly,
}

/// Per-table dedup configuration, chosen at batch-construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupPolicy {
    pub table: String,
    pub kind: TableKind,
    pub grouping_fields: Vec<String>,
    /// Column holding the reason/description label the merge map applies to.
    #[serde(default)]
    pub category_field: Option<String>,
    /// Raw label -> merged dedup category.
    #[serde(default)]
    pub merge_categories: BTreeMap<String, String>,
    /// Business identifier column (header tables) or parent document
    /// column (detail tables).
    #[serde(default)]
    pub identifier_field: Option<String>,
    /// Line description column the detail guard intersects on.
    #[serde(default)]
    pub description_field: Option<String>,
}

impl DedupPolicy {
    /// Collapse a raw label into its dedup category. Labels without a
    /// mapping stand for themselves.
    pub fn merged_category(&self, raw: &str) -> String {
        self.merge_categories
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Canonical dedup identity for one record. Two persisted rows in the
/// same (company, carrier) scope must never share a fingerprint.
pub fn fingerprint(
    grouping_values: &[Value],
    raw_category: &str,
    policy: &DedupPolicy,
) -> Result<String, CoreError> {
    if grouping_values.is_empty() {
        return Err(CoreError::InvalidInput(format!(
            "policy for {} declares no grouping fields",
            policy.table
        )));
    }
    let mut parts: Vec<String> = grouping_values.iter().map(Value::normalized).collect();
    parts.push(policy.merged_category(raw_category));
    Ok(parts.join("|"))
}

/// Fingerprint a row under its policy. The category column contributes
/// its merged form; every other grouping column contributes its
/// normalized raw value.
pub fn row_fingerprint(row: &Row, policy: &DedupPolicy) -> Result<String, CoreError> {
    if policy.grouping_fields.is_empty() {
        return Err(CoreError::InvalidInput(format!(
            "policy for {} declares no grouping fields",
            policy.table
        )));
    }
    let parts: Vec<String> = policy
        .grouping_fields
        .iter()
        .map(|field| {
            let value = row_value(row, field);
            if policy.category_field.as_deref() == Some(field.as_str()) {
                policy.merged_category(&value.normalized())
            } else {
                value.normalized()
            }
        })
        .collect();
    Ok(parts.join("|"))
}

/// Stamp bookkeeping columns ahead of an insert. Insert-time survives a
/// retried submission; update-time always reflects the latest one. The
/// timestamp is passed in so stamping stays deterministic under test.
pub fn stamp_rows(rows: &mut [Row], now: DateTime<Utc>) {
    for row in rows.iter_mut() {
        if row_value(row, columns::CREATED_AT).is_null() {
            row.insert(columns::CREATED_AT.into(), Value::Timestamp(now));
        }
        row.insert(columns::UPDATED_AT.into(), Value::Timestamp(now));
    }
}

/// Refresh only the update-time column, for rows feeding UPDATE
/// statements rather than inserts.
pub fn stamp_update_time(rows: &mut [Row], now: DateTime<Utc>) {
    for row in rows.iter_mut() {
        row.insert(columns::UPDATED_AT.into(), Value::Timestamp(now));
    }
}

/// Outcome of one coordinated batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    pub attempted: usize,
    pub inserted: usize,
    pub duplicates_removed: usize,
    pub error: Option<String>,
}

impl WriteReport {
    pub fn empty() -> Self {
        Self {
            attempted: 0,
            inserted: 0,
            duplicates_removed: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lost_damaged_policy() -> DedupPolicy {
        let mut merge = BTreeMap::new();
        merge.insert("Lost".to_string(), "lost_or_damaged".to_string());
        merge.insert("Damaged".to_string(), "lost_or_damaged".to_string());
        DedupPolicy {
            table: "refund_claims".to_string(),
            kind: TableKind::AppendOnly,
            grouping_fields: vec![
                columns::TRACKING_NUMBER.to_string(),
                columns::REASON.to_string(),
            ],
            category_field: Some(columns::REASON.to_string()),
            merge_categories: merge,
            identifier_field: None,
            description_field: None,
        }
    }

    #[test]
    fn merged_categories_share_a_fingerprint() {
        let policy = lost_damaged_policy();
        let tn = vec![Value::from("TN1")];
        let lost = fingerprint(&tn, "Lost", &policy).unwrap();
        let damaged = fingerprint(&tn, "Damaged", &policy).unwrap();
        let late = fingerprint(&tn, "Late Delivery", &policy).unwrap();
        assert_eq!(lost, damaged);
        assert_ne!(lost, late);
    }

    #[test]
    fn missing_and_null_values_collapse_to_the_sentinel() {
        let policy = lost_damaged_policy();
        let fp = fingerprint(&[Value::Null, Value::from("TN1")], "Lost", &policy).unwrap();
        assert!(fp.starts_with("null|TN1|"));

        let mut row = Row::new();
        row.insert(columns::REASON.into(), Value::from("Lost"));
        // tracking_number never set on the row at all
        let row_fp = row_fingerprint(&row, &policy).unwrap();
        assert_eq!(row_fp, "null|lost_or_damaged");
    }

    #[test]
    fn empty_grouping_keys_are_rejected() {
        let mut policy = lost_damaged_policy();
        policy.grouping_fields.clear();
        assert!(matches!(
            fingerprint(&[], "Lost", &policy),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            row_fingerprint(&Row::new(), &policy),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn stamping_preserves_existing_insert_time() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap();

        let mut seeded = Row::new();
        seeded.insert(columns::CREATED_AT.into(), Value::Timestamp(earlier));
        let fresh = Row::new();

        let mut rows = vec![seeded, fresh];
        stamp_rows(&mut rows, now);

        assert_eq!(
            row_value(&rows[0], columns::CREATED_AT),
            &Value::Timestamp(earlier)
        );
        assert_eq!(
            row_value(&rows[0], columns::UPDATED_AT),
            &Value::Timestamp(now)
        );
        assert_eq!(
            row_value(&rows[1], columns::CREATED_AT),
            &Value::Timestamp(now)
        );
        assert_eq!(
            row_value(&rows[1], columns::UPDATED_AT),
            &Value::Timestamp(now)
        );
    }

    #[test]
    fn update_stamping_touches_only_the_update_column() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap();
        let mut rows = vec![Row::new()];
        stamp_update_time(&mut rows, now);
        assert!(row_value(&rows[0], columns::CREATED_AT).is_null());
        assert_eq!(
            row_value(&rows[0], columns::UPDATED_AT),
            &Value::Timestamp(now)
        );
    }

    #[test]
    fn line_item_round_trips_through_a_row() {
        let item = LineItem {
            company: "acme".to_string(),
            carrier: "dhl".to_string(),
            tracking_number: "TN42".to_string(),
            reason: "Lost".to_string(),
            document_number: None,
            amount: 12.5,
            currency: "EUR".to_string(),
            created_at: None,
            updated_at: None,
        };
        let row = item.into_row();
        assert_eq!(row_value(&row, columns::COMPANY), &Value::from("acme"));
        assert_eq!(row_value(&row, columns::AMOUNT), &Value::Float(12.5));
        assert!(row_value(&row, columns::DOCUMENT_NUMBER).is_null());
        assert!(row_value(&row, columns::CREATED_AT).is_null());
    }

    #[test]
    fn batch_json_preserves_value_types() {
        let mut row = Row::new();
        row.insert(columns::TRACKING_NUMBER.into(), Value::from("TN1"));
        row.insert(columns::AMOUNT.into(), Value::Float(3.5));
        row.insert(columns::DOCUMENT_NUMBER.into(), Value::Null);
        let batch = Batch::new(
            "refund_claims",
            Scope {
                company: "acme".to_string(),
                carrier: "dhl".to_string(),
            },
            vec![row],
        );

        let json = serde_json::to_string(&batch).unwrap();
        let back: Batch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
