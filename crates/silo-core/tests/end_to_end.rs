//! Black-box tests exercising the public query pipeline end to end: build a
//! table through the public domain API, run a JSON query through it, and
//! check the NDJSON a caller would actually see.

use std::collections::HashMap;

use silo_core::domain::alphabet::{Alphabet, Nucleotide};
use silo_core::domain::phylo::PhyloTreeBuilder;
use silo_core::domain::schema::{ColumnMetadata, ColumnType, SequenceAlphabetKind, TableSchema};
use silo_core::domain::sequence_column::{AlignedRead, SequenceColumnPartition};
use silo_core::domain::table::{MetadataColumn, Table, TablePartition};
use silo_core::query::execute::{execute_query, parse_query};
use silo_core::query::record::to_ndjson;

/// Reference "ACGT"; three rows: "ACGT", "ACCT", "ACGA", with a "country"
/// metadata column and an insertion at position 2 on row 0.
fn sample_table() -> Table {
    let reference: Vec<_> = "ACGT".chars().map(|c| Nucleotide::char_to_symbol(c).unwrap()).collect();
    let mut column: SequenceColumnPartition<Nucleotide> =
        SequenceColumnPartition::new(reference, 16).unwrap();
    for seq in ["ACGT", "ACCT", "ACGA"] {
        column
            .append_sequence_read(Some(AlignedRead { offset: 0, sequence: seq.to_string() }))
            .unwrap();
    }
    column.append_insertion("2:AA").unwrap();
    column.finalize().unwrap();

    let mut nucleotide_columns = HashMap::new();
    nucleotide_columns.insert("main".to_string(), column);

    let mut metadata_columns = HashMap::new();
    metadata_columns.insert(
        "country".to_string(),
        MetadataColumn::IndexedString(vec![
            Some("CH".to_string()),
            Some("DE".to_string()),
            Some("CH".to_string()),
        ]),
    );

    let schema = TableSchema::new(vec![
        ColumnMetadata::sequence("main", SequenceAlphabetKind::Nucleotide, "ACGT", true),
        ColumnMetadata::scalar("country", ColumnType::IndexedString),
    ])
    .unwrap();
    let partition = TablePartition::new(nucleotide_columns, HashMap::new(), metadata_columns, 3);
    Table::new(schema, vec![partition]).unwrap()
}

#[test]
fn has_mutation_query_matches_the_rows_that_deviate_at_the_position() {
    let table = sample_table();
    let request = parse_query(
        r#"{"filterExpression": {"type": "HasNucleotideMutation", "position": 4}, "action": {"type": "Details"}}"#,
    )
    .unwrap();
    let batch = execute_query(&table, &request).unwrap();
    // Reference is "ACGT" (1-indexed); position 4 is 'T'. Row 2 ("ACGA") has 'A' there.
    assert_eq!(batch.len(), 1);
}

#[test]
fn and_of_symbol_equals_and_selection_narrows_correctly() {
    let table = sample_table();
    let request = parse_query(
        r#"{
            "filterExpression": {
                "type": "And",
                "children": [
                    {"type": "NucleotideEquals", "position": 4, "symbol": "T"},
                    {"type": "StringEquals", "column": "country", "value": "CH"}
                ]
            },
            "action": {"type": "Details"}
        }"#,
    )
    .unwrap();
    let batch = execute_query(&table, &request).unwrap();
    // Position 4 is 'T' in rows 0 and 1; of those, only row 0 is "CH".
    assert_eq!(batch.len(), 1);
}

#[test]
fn aggregated_group_by_counts_each_country() {
    let table = sample_table();
    let request = parse_query(
        r#"{
            "filterExpression": {"type": "True"},
            "action": {"type": "Aggregated", "groupByFields": ["country"]}
        }"#,
    )
    .unwrap();
    let batch = execute_query(&table, &request).unwrap();
    let ndjson = to_ndjson(&batch).unwrap();
    assert_eq!(ndjson.lines().count(), 2);
    assert!(ndjson.contains("\"count\":2"));
    assert!(ndjson.contains("\"count\":1"));
}

#[test]
fn insertion_contains_finds_the_recorded_insertion() {
    let table = sample_table();
    let request = parse_query(
        r#"{
            "filterExpression": {
                "type": "NucleotideInsertionContains",
                "position": 3,
                "value": "AA"
            },
            "action": {"type": "Details"}
        }"#,
    )
    .unwrap();
    let batch = execute_query(&table, &request).unwrap();
    assert_eq!(batch.len(), 1);
}

#[test]
fn fasta_action_reconstructs_the_aligned_sequence() {
    let table = sample_table();
    let request = parse_query(
        r#"{
            "filterExpression": {"type": "True"},
            "action": {"type": "Fasta", "sequenceName": ["main"]}
        }"#,
    )
    .unwrap();
    let batch = execute_query(&table, &request).unwrap();
    assert_eq!(batch.len(), 3);
    let sequences: Vec<String> = batch
        .iter()
        .map(|record| record["sequence"].as_str().unwrap().to_string())
        .collect();
    assert!(sequences.contains(&"ACGT".to_string()));
    assert!(sequences.contains(&"ACCT".to_string()));
    assert!(sequences.contains(&"ACGA".to_string()));
}

#[test]
fn malformed_query_json_is_a_query_parse_error() {
    assert!(parse_query("{not valid json").is_err());
}

#[test]
fn phylo_tree_actions_traverse_an_attached_tree() {
    let mut builder = PhyloTreeBuilder::new();
    builder
        .add_node("root", None)
        .add_node("a", Some("root".to_string()))
        .add_node("b", Some("root".to_string()));
    let tree = builder.build().unwrap();
    let table = sample_table().with_phylo_tree("country", tree);

    assert_eq!(table.phylo_tree("country").unwrap().root_id(), "root");
    assert!(table.phylo_tree("missing_column").is_err());
}
