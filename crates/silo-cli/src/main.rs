//! `silo-query`: a demonstration driver for `silo-core`.
//!
//! Loads a small JSON dataset description (reference sequences, metadata
//! column types, and rows) into an in-memory [`silo_core::domain::table::Table`],
//! then runs a single query against it and prints the result as NDJSON.
//!
//! Usage: silo-query <dataset.json> <query.json>
//!
//! This binary stands in for the ingestion pipeline and network-facing query
//! server that a production deployment would have around the engine (see
//! DESIGN.md); both are out of this crate's scope.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use serde_json::Value;

use silo_core::domain::alphabet::{Alphabet, AminoAcid, Nucleotide};
use silo_core::domain::phylo::PhyloTreeBuilder;
use silo_core::domain::schema::{ColumnMetadata, ColumnType, SequenceAlphabetKind, TableSchema};
use silo_core::domain::sequence_column::{AlignedRead, SequenceColumnPartition};
use silo_core::domain::table::{LineageIndex, MetadataColumn, Table, TablePartition};
use silo_core::error::SiloError;
use silo_core::query::execute::{execute_query, parse_query};
use silo_core::query::record::to_ndjson;

fn main() -> ExitCode {
    silo_core::infra::logging::init_default();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <dataset.json> <query.json>", args[0]);
        return ExitCode::FAILURE;
    }

    match run(&args[1], &args[2]) {
        Ok(ndjson) => {
            print!("{ndjson}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(dataset_path: &str, query_path: &str) -> Result<String, SiloError> {
    let dataset_json = std::fs::read_to_string(dataset_path)
        .map_err(|e| SiloError::bad_request(format!("failed to read '{dataset_path}': {e}")))?;
    let query_json = std::fs::read_to_string(query_path)
        .map_err(|e| SiloError::bad_request(format!("failed to read '{query_path}': {e}")))?;

    let table = load_dataset(&dataset_json)?;
    let request = parse_query(&query_json)?;
    let batch = execute_query(&table, &request)?;
    to_ndjson(&batch)
}

/// Parses a dataset description of the shape:
///
/// ```json
/// {
///   "nucleotideSequences": { "main": "ACGT..." },
///   "aminoAcidSequences": {},
///   "metadata": { "date": "Date", "country": "IndexedString" },
///   "lineageColumn": "lineage",
///   "phyloTreeColumn": null,
///   "rows": [
///     {
///       "metadata": { "date": "2021-03-01", "country": "CH" },
///       "nucleotideSequences": {
///         "main": { "offset": 0, "sequence": "ACGT", "insertions": ["2:AA"] }
///       },
///       "aminoAcidSequences": {},
///       "phyloParent": null
///     }
///   ]
/// }
/// ```
///
/// `phyloParent` is only read when `phyloTreeColumn` names a metadata column;
/// it holds the parent node's id for the phylogenetic tree (the root row
/// leaves it `null`).
///
/// and builds a single-partition [`Table`] from it. There is no streaming or
/// multi-partition split here - this is a demonstration loader, not the
/// full ingestion pipeline a production deployment would have.
fn load_dataset(json: &str) -> Result<Table, SiloError> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| SiloError::bad_request(format!("invalid dataset JSON: {e}")))?;

    let nucleotide_refs = string_map(&root, "nucleotideSequences")?;
    let amino_acid_refs = string_map(&root, "aminoAcidSequences")?;
    let metadata_types = string_map(&root, "metadata")?;
    let rows = root
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| SiloError::bad_request("dataset is missing a 'rows' array"))?;
    let row_count = rows.len();

    let mut columns = Vec::new();
    for (name, type_name) in &metadata_types {
        columns.push(ColumnMetadata::scalar(name, parse_column_type(type_name)?));
    }
    for (i, (name, reference)) in nucleotide_refs.iter().enumerate() {
        columns.push(ColumnMetadata::sequence(
            name,
            SequenceAlphabetKind::Nucleotide,
            reference,
            i == 0,
        ));
    }
    for (i, (name, reference)) in amino_acid_refs.iter().enumerate() {
        columns.push(ColumnMetadata::sequence(
            name,
            SequenceAlphabetKind::AminoAcid,
            reference,
            i == 0,
        ));
    }
    let schema = TableSchema::new(columns)?;

    let mut nucleotide_columns = HashMap::new();
    for (name, reference) in &nucleotide_refs {
        nucleotide_columns.insert(name.clone(), new_nucleotide_column(reference, row_count)?);
    }
    let mut amino_acid_columns = HashMap::new();
    for (name, reference) in &amino_acid_refs {
        amino_acid_columns.insert(name.clone(), new_amino_acid_column(reference, row_count)?);
    }
    let mut metadata_columns = HashMap::new();
    for (name, type_name) in &metadata_types {
        metadata_columns.insert(name.clone(), MetadataColumn::empty_of(parse_column_type(type_name)?)?);
    }

    let mut lineage_index = LineageIndex::new();
    let lineage_column = root.get("lineageColumn").and_then(Value::as_str);
    let mut phylo_builder = PhyloTreeBuilder::new();
    let phylo_column = root.get("phyloTreeColumn").and_then(Value::as_str);

    for row in rows {
        let row_metadata = row.get("metadata").and_then(Value::as_object);
        for (name, type_name) in &metadata_types {
            let value = row_metadata.and_then(|m| m.get(name));
            let column = metadata_columns.get_mut(name).expect("column created above");
            push_metadata_value(column, type_name, value)?;

            if Some(name.as_str()) == lineage_column {
                let lineage = value.and_then(Value::as_str);
                let parent = lineage.and_then(|l| parent_lineage(l));
                if let Some(lineage) = lineage {
                    lineage_index.add(lineage, parent.map(str::to_string));
                }
            }
            if Some(name.as_str()) == phylo_column {
                if let Some(node_id) = value.and_then(Value::as_str) {
                    let parent = row.get("phyloParent").and_then(Value::as_str).map(str::to_string);
                    phylo_builder.add_node(node_id, parent);
                }
            }
        }

        for (name, _) in &nucleotide_refs {
            let read = sequence_read_of(row, "nucleotideSequences", name)?;
            let column = nucleotide_columns.get_mut(name).expect("column created above");
            column.append_sequence_read(read)?;
            for insertion in insertions_of(row, "nucleotideSequences", name) {
                column.append_insertion(&insertion)?;
            }
        }
        for (name, _) in &amino_acid_refs {
            let read = sequence_read_of(row, "aminoAcidSequences", name)?;
            let column = amino_acid_columns.get_mut(name).expect("column created above");
            column.append_sequence_read(read)?;
            for insertion in insertions_of(row, "aminoAcidSequences", name) {
                column.append_insertion(&insertion)?;
            }
        }
    }

    for column in nucleotide_columns.values_mut() {
        column.finalize()?;
    }
    for column in amino_acid_columns.values_mut() {
        column.finalize()?;
    }

    let partition = TablePartition::new(
        nucleotide_columns,
        amino_acid_columns,
        metadata_columns,
        row_count as u32,
    );
    let mut table = Table::new(schema, vec![partition])?;
    if let Some(lineage_column) = lineage_column {
        table = table.with_lineage_index(lineage_column, lineage_index);
    }
    if let Some(phylo_column) = phylo_column {
        if let Ok(tree) = phylo_builder.build() {
            table = table.with_phylo_tree(phylo_column, tree);
        }
    }
    Ok(table)
}

fn string_map(root: &Value, field: &str) -> Result<Vec<(String, String)>, SiloError> {
    let Some(object) = root.get(field).and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    object
        .iter()
        .map(|(k, v)| {
            let value = v.as_str().ok_or_else(|| {
                SiloError::bad_request(format!("dataset field '{field}.{k}' must be a string"))
            })?;
            Ok((k.clone(), value.to_string()))
        })
        .collect()
}

fn parse_column_type(name: &str) -> Result<ColumnType, SiloError> {
    match name {
        "Date" => Ok(ColumnType::Date),
        "Int" => Ok(ColumnType::Int),
        "Float" => Ok(ColumnType::Float),
        "Bool" => Ok(ColumnType::Bool),
        "IndexedString" => Ok(ColumnType::IndexedString),
        other => Err(SiloError::bad_request(format!("unknown metadata column type '{other}'"))),
    }
}

fn new_nucleotide_column(
    reference: &str,
    row_count: usize,
) -> Result<SequenceColumnPartition<Nucleotide>, SiloError> {
    let symbols = parse_reference::<Nucleotide>(reference)?;
    SequenceColumnPartition::new(symbols, row_count.max(1))
}

fn new_amino_acid_column(
    reference: &str,
    row_count: usize,
) -> Result<SequenceColumnPartition<AminoAcid>, SiloError> {
    let symbols = parse_reference::<AminoAcid>(reference)?;
    SequenceColumnPartition::new(symbols, row_count.max(1))
}

fn parse_reference<A: Alphabet>(reference: &str) -> Result<Vec<A::Symbol>, SiloError> {
    reference
        .chars()
        .map(|c| {
            A::char_to_symbol(c)
                .ok_or_else(|| SiloError::preprocessing(format!("illegal reference character '{c}'")))
        })
        .collect()
}

fn sequence_read_of(row: &Value, field: &str, column: &str) -> Result<Option<AlignedRead>, SiloError> {
    let Some(entry) = row.get(field).and_then(|v| v.get(column)) else {
        return Ok(None);
    };
    let Some(sequence) = entry.get("sequence").and_then(Value::as_str) else {
        return Ok(None);
    };
    let offset = entry.get("offset").and_then(Value::as_u64).unwrap_or(0) as u32;
    Ok(Some(AlignedRead { offset, sequence: sequence.to_string() }))
}

fn insertions_of(row: &Value, field: &str, column: &str) -> Vec<String> {
    row.get(field)
        .and_then(|v| v.get(column))
        .and_then(|entry| entry.get("insertions"))
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn push_metadata_value(column: &mut MetadataColumn, type_name: &str, value: Option<&Value>) -> Result<(), SiloError> {
    let value = value.filter(|v| !v.is_null());
    match type_name {
        "Date" => {
            let date = value
                .and_then(Value::as_str)
                .map(|s| {
                    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .map_err(|e| SiloError::preprocessing(format!("invalid date '{s}': {e}")))
                })
                .transpose()?;
            column.push_date(date)
        }
        "Int" => column.push_int(value.and_then(Value::as_i64)),
        "Float" => column.push_float(value.and_then(Value::as_f64)),
        "Bool" => column.push_bool(value.and_then(Value::as_bool)),
        "IndexedString" => column.push_string(value.and_then(Value::as_str).map(str::to_string)),
        other => Err(SiloError::bad_request(format!("unknown metadata column type '{other}'"))),
    }
}

/// A lineage like "B.1.1.7" parents to "B.1.1"; a top-level lineage like
/// "B" has no parent. This is the same dotted-suffix convention Pango
/// lineages use, kept here only so the demonstration dataset can exercise
/// `Lineage`'s sublineage traversal without a real lineage hierarchy file.
fn parent_lineage(lineage: &str) -> Option<&str> {
    lineage.rfind('.').map(|i| &lineage[..i])
}
