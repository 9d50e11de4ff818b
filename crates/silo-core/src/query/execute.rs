//! Query orchestration: compiles and evaluates a filter expression once per
//! partition (in parallel, via `rayon`), dispatches the matched row sets to
//! the chosen [`Action`], then applies the shared `orderByFields`/`limit`/
//! `offset` post-processing (grounded in
//! `examples/original_source/src/silo/query_engine/query_engine.cpp`).

use std::time::Instant;

use rayon::prelude::*;
use serde::Deserialize;

use crate::domain::table::Table;
use crate::error::SiloError;

use super::actions::Action;
use super::expression::{AmbiguityMode, Expression};
use super::record::{apply_order_limit_offset, RecordBatch};

/// One query: a filter expression to select rows, and an action describing
/// what to return about them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub filter_expression: Expression,
    pub action: Action,
}

/// Parses a query request from its NDJSON-adjacent JSON wire form.
/// Malformed JSON or an unrecognized `type` discriminant is a
/// [`SiloError::QueryParse`].
pub fn parse_query(json: &str) -> Result<QueryRequest, SiloError> {
    serde_json::from_str(json).map_err(|e| SiloError::query_parse(format!("invalid query JSON: {e}")))
}

/// Runs `request` against `table` with no deadline.
pub fn execute_query(table: &Table, request: &QueryRequest) -> Result<RecordBatch, SiloError> {
    execute_query_with_deadline(table, request, None)
}

/// Runs `request` against `table`, compiling and evaluating the filter
/// expression once per partition with task parallelism, then dispatching
/// the resulting row sets to `request.action`. Cooperative cancellation:
/// `deadline` is checked between partitions and again before the action
/// runs, so a query already past its deadline never starts expensive
/// action work; `deadline` is then forwarded into the action itself, which
/// for `Mutations` (the one action that walks the reference position by
/// position) re-checks it between position batches.
pub fn execute_query_with_deadline(
    table: &Table,
    request: &QueryRequest,
    deadline: Option<Instant>,
) -> Result<RecordBatch, SiloError> {
    let bitmaps = table
        .partitions()
        .par_iter()
        .map(|partition| -> Result<_, SiloError> {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(SiloError::Timeout);
                }
            }
            let operator = request.filter_expression.compile(table, partition, AmbiguityMode::None)?;
            Ok(operator.evaluate()?.into_owned())
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(deadline) = deadline {
        if Instant::now() > deadline {
            return Err(SiloError::Timeout);
        }
    }

    let batch = request.action.run(table, &bitmaps, deadline)?;
    let options = request.action.output_options();
    Ok(apply_order_limit_offset(batch, &options.order_by_fields, options.limit, options.offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alphabet::{Alphabet, Nucleotide};
    use crate::domain::schema::{ColumnMetadata, ColumnType, SequenceAlphabetKind, TableSchema};
    use crate::domain::sequence_column::{AlignedRead, SequenceColumnPartition};
    use crate::domain::table::{MetadataColumn, TablePartition};
    use std::collections::HashMap;

    fn sample_table() -> Table {
        // Reference "ACGT"; rows "ACGT", "ACCT", "ACGA".
        let reference: Vec<_> = "ACGT".chars().map(|c| Nucleotide::char_to_symbol(c).unwrap()).collect();
        let mut column: SequenceColumnPartition<Nucleotide> =
            SequenceColumnPartition::new(reference, 1024).unwrap();
        for seq in ["ACGT", "ACCT", "ACGA"] {
            column
                .append_sequence_read(Some(AlignedRead { offset: 0, sequence: seq.to_string() }))
                .unwrap();
        }
        column.finalize().unwrap();

        let mut nucleotide_columns = HashMap::new();
        nucleotide_columns.insert("main".to_string(), column);
        let metadata_columns = HashMap::new();

        let schema = TableSchema::new(vec![ColumnMetadata::sequence(
            "main",
            SequenceAlphabetKind::Nucleotide,
            "ACGT",
            true,
        )])
        .unwrap();
        let partition = TablePartition::new(nucleotide_columns, HashMap::new(), metadata_columns, 3);
        Table::new(schema, vec![partition]).unwrap()
    }

    #[test]
    fn parses_and_executes_a_has_mutation_query() {
        let table = sample_table();
        let json = r#"{
            "filterExpression": {"type": "HasNucleotideMutation", "position": 3},
            "action": {"type": "Aggregated"}
        }"#;
        let request = parse_query(json).unwrap();
        let batch = execute_query(&table, &request).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["count"], serde_json::json!(2));
    }

    #[test]
    fn query_parse_error_on_malformed_json() {
        assert!(parse_query("not json").is_err());
    }

    #[test]
    fn a_deadline_already_in_the_past_times_out() {
        let table = sample_table();
        let request = parse_query(
            r#"{"filterExpression": {"type": "True"}, "action": {"type": "Aggregated"}}"#,
        )
        .unwrap();
        let deadline = Instant::now() - std::time::Duration::from_secs(1);
        let result = execute_query_with_deadline(&table, &request, Some(deadline));
        assert!(matches!(result, Err(SiloError::Timeout)));
    }

    #[test]
    fn details_action_respects_limit_and_offset() {
        let table = sample_table();
        let json = r#"{
            "filterExpression": {"type": "True"},
            "action": {"type": "Details", "limit": 1, "offset": 1}
        }"#;
        let request = parse_query(json).unwrap();
        let batch = execute_query(&table, &request).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
