//! Output records: actions build a `RecordBatch`, and the shared
//! `orderByFields`/`limit`/`offset` post-processing applies uniformly to
//! every action's output.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::SiloError;

/// One output row: field name to JSON value. `BTreeMap` keeps keys in a
/// deterministic (sorted) order for NDJSON output; field order is not
/// significant, but is deterministic.
pub type Record = BTreeMap<String, Value>;
pub type RecordBatch = Vec<Record>;

/// Serializes a batch as newline-delimited JSON, one record per line; no
/// Arrow/Parquet support in this engine.
pub fn to_ndjson(batch: &RecordBatch) -> Result<String, SiloError> {
    let mut out = String::new();
    for record in batch {
        let line = serde_json::to_string(record)
            .map_err(|e| SiloError::internal(format!("failed to serialize record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The `orderByFields` grammar: either a bare field name (ascending) or
/// `{ field, order }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OrderByField {
    Bare(String),
    Explicit { field: String, order: SortOrder },
}

impl OrderByField {
    pub fn field_name(&self) -> &str {
        match self {
            OrderByField::Bare(field) => field,
            OrderByField::Explicit { field, .. } => field,
        }
    }

    pub fn order(&self) -> SortOrder {
        match self {
            OrderByField::Bare(_) => SortOrder::Ascending,
            OrderByField::Explicit { order, .. } => *order,
        }
    }
}

/// Applies `orderByFields` (stable, multi-key), then `offset`, then
/// `limit`, in that order.
pub fn apply_order_limit_offset(
    mut batch: RecordBatch,
    order_by: &[OrderByField],
    limit: Option<usize>,
    offset: Option<usize>,
) -> RecordBatch {
    if !order_by.is_empty() {
        batch.sort_by(|a, b| {
            for field in order_by {
                let ordering = compare_json(a.get(field.field_name()), b.get(field.field_name()));
                let ordering = match field.order() {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let offset = offset.unwrap_or(0);
    if offset >= batch.len() {
        return Vec::new();
    }
    let mut batch = batch.split_off(offset);
    if let Some(limit) = limit {
        batch.truncate(limit);
    }
    batch
}

/// `null`/missing sorts first, then bools, numbers, and strings compare
/// natively. Mismatched JSON types between rows of the same field are not
/// expected in a well-formed table, so they fall back to an arbitrary but
/// stable ordering by discriminant.
fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&b.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => json_type_rank(a).cmp(&json_type_rank(b)),
    }
}

fn json_type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: &[(&str, Value)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn orders_ascending_by_default_with_nulls_first() {
        let batch = vec![
            record(&[("age", json!(30))]),
            record(&[("age", Value::Null)]),
            record(&[("age", json!(10))]),
        ];
        let ordered = apply_order_limit_offset(
            batch,
            &[OrderByField::Bare("age".to_string())],
            None,
            None,
        );
        let ages: Vec<Value> = ordered.iter().map(|r| r["age"].clone()).collect();
        assert_eq!(ages, vec![Value::Null, json!(10), json!(30)]);
    }

    #[test]
    fn descending_order_reverses_comparison() {
        let batch = vec![
            record(&[("age", json!(10))]),
            record(&[("age", json!(30))]),
        ];
        let ordered = apply_order_limit_offset(
            batch,
            &[OrderByField::Explicit { field: "age".to_string(), order: SortOrder::Descending }],
            None,
            None,
        );
        let ages: Vec<Value> = ordered.iter().map(|r| r["age"].clone()).collect();
        assert_eq!(ages, vec![json!(30), json!(10)]);
    }

    #[test]
    fn offset_and_limit_apply_after_ordering() {
        let batch = vec![
            record(&[("age", json!(1))]),
            record(&[("age", json!(2))]),
            record(&[("age", json!(3))]),
            record(&[("age", json!(4))]),
        ];
        let page = apply_order_limit_offset(
            batch,
            &[OrderByField::Bare("age".to_string())],
            Some(2),
            Some(1),
        );
        let ages: Vec<Value> = page.iter().map(|r| r["age"].clone()).collect();
        assert_eq!(ages, vec![json!(2), json!(3)]);
    }

    #[test]
    fn offset_past_the_end_yields_an_empty_batch() {
        let batch = vec![record(&[("age", json!(1))])];
        let page = apply_order_limit_offset(batch, &[], None, Some(5));
        assert!(page.is_empty());
    }

    #[test]
    fn to_ndjson_emits_one_line_per_record() {
        let batch = vec![record(&[("a", json!(1))]), record(&[("a", json!(2))])];
        let text = to_ndjson(&batch).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
