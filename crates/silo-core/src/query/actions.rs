//! Query actions: turn a per-partition row-bitmap (the filter's result) into
//! output records (grounded in
//! `examples/original_source/include/silo/query_engine/actions/`).

use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::alphabet::{Alphabet, AminoAcid, Nucleotide};
use crate::domain::bitmap::Bitmap;
use crate::domain::schema::{ColumnType, SequenceAlphabetKind};
use crate::domain::sequence_column::SequenceColumnPartition;
use crate::domain::symbol_map::SymbolMap;
use crate::domain::table::{ColumnValue, Table, TablePartition};
use crate::error::SiloError;

use super::record::{OrderByField, Record, RecordBatch};

/// The `orderByFields`/`limit`/`offset` fields every action accepts,
/// flattened into each [`Action`] variant.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputOptions {
    #[serde(default)]
    pub order_by_fields: Vec<OrderByField>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn default_min_proportion() -> f64 {
    0.0
}

/// The action half of a query request: what to do with the row set the
/// filter expression selected.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Aggregated {
        group_by_fields: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    Details {
        fields: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    Fasta {
        sequence_name: Vec<String>,
        additional_fields: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    FastaAligned {
        sequence_name: Vec<String>,
        additional_fields: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    Mutations {
        sequence_names: Option<Vec<String>>,
        #[serde(default = "default_min_proportion")]
        min_proportion: f64,
        fields: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    MostRecentCommonAncestor {
        column_name: String,
        #[serde(flatten)]
        output: OutputOptions,
    },
    PhyloSubtree {
        column_name: String,
        print_nodes_not_in_tree: Option<bool>,
        contract_unary_nodes: Option<bool>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    PhyloParents {
        column_name: String,
        contract_unary_nodes: Option<bool>,
        #[serde(flatten)]
        output: OutputOptions,
    },
    InsertionAggregation {
        sequence_names: Option<Vec<String>>,
        #[serde(flatten)]
        output: OutputOptions,
    },
}

impl Action {
    pub fn output_options(&self) -> &OutputOptions {
        match self {
            Action::Aggregated { output, .. }
            | Action::Details { output, .. }
            | Action::Fasta { output, .. }
            | Action::FastaAligned { output, .. }
            | Action::Mutations { output, .. }
            | Action::MostRecentCommonAncestor { output, .. }
            | Action::PhyloSubtree { output, .. }
            | Action::PhyloParents { output, .. }
            | Action::InsertionAggregation { output, .. } => output,
        }
    }

    /// Builds the unsorted, unpaginated record batch for this action.
    /// `partition_bitmaps` holds one evaluated filter bitmap per entry of
    /// `table.partitions()`, in the same order. `deadline` is forwarded to
    /// [`Action::Mutations`], the one action long enough to need a check
    /// between position batches rather than just once up front.
    pub fn run(
        &self,
        table: &Table,
        partition_bitmaps: &[Bitmap],
        deadline: Option<Instant>,
    ) -> Result<RecordBatch, SiloError> {
        match self {
            Action::Aggregated { group_by_fields, .. } => {
                aggregated_action(table, partition_bitmaps, group_by_fields.as_deref())
            }
            Action::Details { fields, .. } => details_action(table, partition_bitmaps, fields.as_deref()),
            Action::Fasta { sequence_name, additional_fields, .. } => {
                fasta_action(table, partition_bitmaps, sequence_name, additional_fields.as_deref(), false)
            }
            Action::FastaAligned { sequence_name, additional_fields, .. } => {
                fasta_action(table, partition_bitmaps, sequence_name, additional_fields.as_deref(), true)
            }
            Action::Mutations { sequence_names, min_proportion, fields, .. } => {
                if !(0.0..=1.0).contains(min_proportion) {
                    return Err(SiloError::query_parse("minProportion must be within [0, 1]"));
                }
                mutations_action(
                    table,
                    partition_bitmaps,
                    sequence_names.as_deref(),
                    *min_proportion,
                    fields.as_deref(),
                    deadline,
                )
            }
            Action::MostRecentCommonAncestor { column_name, .. } => {
                mrca_action(table, partition_bitmaps, column_name)
            }
            Action::PhyloSubtree { column_name, print_nodes_not_in_tree, contract_unary_nodes, .. } => {
                phylo_subtree_action(
                    table,
                    partition_bitmaps,
                    column_name,
                    print_nodes_not_in_tree.unwrap_or(false),
                    contract_unary_nodes.unwrap_or(false),
                )
            }
            Action::PhyloParents { column_name, contract_unary_nodes, .. } => {
                phylo_parents_action(table, partition_bitmaps, column_name, contract_unary_nodes.unwrap_or(false))
            }
            Action::InsertionAggregation { sequence_names, .. } => {
                insertion_aggregation_action(table, partition_bitmaps, sequence_names.as_deref())
            }
        }
    }
}

fn column_value_to_json(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Date(Some(d)) => json!(d.to_string()),
        ColumnValue::Date(None) => Value::Null,
        ColumnValue::Int(Some(i)) => json!(i),
        ColumnValue::Int(None) => Value::Null,
        ColumnValue::Float(Some(f)) => json!(f),
        ColumnValue::Float(None) => Value::Null,
        ColumnValue::Bool(Some(b)) => json!(b),
        ColumnValue::Bool(None) => Value::Null,
        ColumnValue::IndexedString(Some(s)) => json!(s),
        ColumnValue::IndexedString(None) => Value::Null,
    }
}

/// A hashable/sortable stand-in for a [`ColumnValue`], used as a group-by key.
fn column_value_key(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Date(v) => format!("d:{v:?}"),
        ColumnValue::Int(v) => format!("i:{v:?}"),
        ColumnValue::Float(v) => format!("f:{v:?}"),
        ColumnValue::Bool(v) => format!("b:{v:?}"),
        ColumnValue::IndexedString(v) => format!("s:{v:?}"),
    }
}

fn insert_additional_fields(
    record: &mut Record,
    partition: &TablePartition,
    row: u32,
    additional_fields: Option<&[String]>,
) {
    if let Some(fields) = additional_fields {
        for field in fields {
            if let Some(column) = partition.metadata_column(field) {
                record.insert(field.clone(), column_value_to_json(&column.value(row)));
            }
        }
    }
}

// ---------------------------------------------------------------------
// Aggregated
// ---------------------------------------------------------------------

fn aggregated_action(
    table: &Table,
    bitmaps: &[Bitmap],
    group_by_fields: Option<&[String]>,
) -> Result<RecordBatch, SiloError> {
    let fields = match group_by_fields {
        None => &[][..],
        Some(fields) => fields,
    };
    if fields.is_empty() {
        let total: u64 = bitmaps.iter().map(|b| b.cardinality()).sum();
        let mut record = Record::new();
        record.insert("count".to_string(), json!(total));
        return Ok(vec![record]);
    }

    for field in fields {
        if table.schema().column(field).is_none() {
            return Err(SiloError::bad_request(format!("unknown column '{field}'")));
        }
    }

    let mut groups: FxHashMap<Vec<String>, (Record, u64)> = FxHashMap::default();
    for (idx, partition) in table.partitions().iter().enumerate() {
        for row in bitmaps[idx].iter() {
            let mut key = Vec::with_capacity(fields.len());
            let mut values = Record::new();
            for field in fields {
                let column = partition
                    .metadata_column(field)
                    .ok_or_else(|| SiloError::bad_request(format!("unknown column '{field}'")))?;
                let value = column.value(row);
                key.push(column_value_key(&value));
                values.insert(field.clone(), column_value_to_json(&value));
            }
            let entry = groups.entry(key).or_insert((values, 0));
            entry.1 += 1;
        }
    }

    Ok(groups
        .into_values()
        .map(|(mut values, count)| {
            values.insert("count".to_string(), json!(count));
            values
        })
        .collect())
}

// ---------------------------------------------------------------------
// Details
// ---------------------------------------------------------------------

fn details_action(table: &Table, bitmaps: &[Bitmap], fields: Option<&[String]>) -> Result<RecordBatch, SiloError> {
    let metadata_fields: Vec<String> = match fields {
        Some(fields) => {
            for field in fields {
                if table.schema().column(field).is_none() {
                    return Err(SiloError::bad_request(format!("unknown column '{field}'")));
                }
            }
            fields.to_vec()
        }
        None => table
            .schema()
            .columns()
            .iter()
            .filter(|c| !matches!(c.column_type, ColumnType::Sequence(_)))
            .map(|c| c.name.clone())
            .collect(),
    };

    let mut out = Vec::new();
    for (idx, partition) in table.partitions().iter().enumerate() {
        for row in bitmaps[idx].iter() {
            let mut record = Record::new();
            for name in &metadata_fields {
                if let Some(column) = partition.metadata_column(name) {
                    record.insert(name.clone(), column_value_to_json(&column.value(row)));
                }
            }
            out.push(record);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Fasta / FastaAligned
// ---------------------------------------------------------------------

fn resolved_symbol<A: Alphabet>(column: &SequenceColumnPartition<A>, position_idx: usize, row: u32) -> A::Symbol {
    if column.missing_symbol_bitmap(row).contains(position_idx as u32) {
        return A::symbol_missing();
    }
    let position = column.position(position_idx);
    for &symbol in A::SYMBOLS {
        if position.is_symbol_deleted(symbol) {
            continue;
        }
        let present = if position.is_symbol_flipped(symbol) {
            !position.get_bitmap(symbol).contains(row)
        } else {
            position.get_bitmap(symbol).contains(row)
        };
        if present {
            return symbol;
        }
    }
    position.deleted_symbol().unwrap_or_else(A::symbol_missing)
}

/// Reconstructs this row's sequence at every reference position. `aligned`
/// keeps the full reference-length string (gaps/missing included in place);
/// the unaligned form trims the leading/trailing missing-symbol run, which
/// approximates the originally covered `[offset, offset + len)` window -
/// that exact window is not retained once the column is finalized (see
/// DESIGN.md).
fn reconstruct_sequence<A: Alphabet>(column: &SequenceColumnPartition<A>, row: u32, aligned: bool) -> String {
    let reference_len = column.reference().len();
    let mut sequence = String::with_capacity(reference_len);
    for position_idx in 0..reference_len {
        sequence.push(A::symbol_to_char(resolved_symbol(column, position_idx, row)));
    }
    if aligned {
        sequence
    } else {
        let missing_char = A::symbol_to_char(A::symbol_missing());
        sequence.trim_matches(missing_char).to_string()
    }
}

fn fasta_action(
    table: &Table,
    bitmaps: &[Bitmap],
    sequence_names: &[String],
    additional_fields: Option<&[String]>,
    aligned: bool,
) -> Result<RecordBatch, SiloError> {
    for name in sequence_names {
        if table.schema().column(name).is_none() {
            return Err(SiloError::bad_request(format!("unknown sequence name '{name}'")));
        }
    }

    let mut out = Vec::new();
    for (idx, partition) in table.partitions().iter().enumerate() {
        for row in bitmaps[idx].iter() {
            for name in sequence_names {
                let sequence = if let Some(column) = partition.nucleotide_column(name) {
                    reconstruct_sequence::<Nucleotide>(column, row, aligned)
                } else if let Some(column) = partition.amino_acid_column(name) {
                    reconstruct_sequence::<AminoAcid>(column, row, aligned)
                } else {
                    return Err(SiloError::internal(format!(
                        "schema declares sequence column '{name}' but no partition carries it"
                    )));
                };
                let mut record = Record::new();
                record.insert("sequenceName".to_string(), json!(name));
                record.insert("sequence".to_string(), json!(sequence));
                insert_additional_fields(&mut record, partition, row, additional_fields);
                out.push(record);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------

fn count_missing_among<A: Alphabet>(
    column: &SequenceColumnPartition<A>,
    rows: impl Iterator<Item = u32>,
    position: u32,
) -> u64 {
    rows.filter(|&row| column.missing_symbol_bitmap(row).contains(position)).count() as u64
}

/// Position batch size for the cooperative cancellation check in
/// [`partition_mutation_counts`] - large enough that the check itself is
/// negligible overhead, small enough that a tripped deadline is noticed
/// promptly on a long reference.
const MUTATION_DEADLINE_CHECK_STRIDE: usize = 4096;

/// Per-position symbol counts for one partition, dispatched on whether the
/// filter selects every row of the partition ("full") or a strict subset
/// ("mixed") - the full case lets every count come from the
/// already-materialized position bitmaps instead of an intersection.
///
/// Checks `deadline` between position batches so long-running actions
/// observe cancellation more often than once per partition.
fn partition_mutation_counts<A: Alphabet>(
    column: &SequenceColumnPartition<A>,
    filter: &Bitmap,
    deadline: Option<Instant>,
) -> Result<Vec<SymbolMap<A, u64>>, SiloError> {
    let row_count = column.row_count();
    let is_full = filter.cardinality() == row_count as u64;
    let reference_len = column.reference().len();

    (0..reference_len)
        .map(|p| {
            if p % MUTATION_DEADLINE_CHECK_STRIDE == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        return Err(SiloError::Timeout);
                    }
                }
            }
            let position = column.position(p);
            let deleted = position.deleted_symbol();
            let mut counts: SymbolMap<A, u64> = SymbolMap::from_fn(|_| 0u64);

            let mut deleted_running = if deleted.is_some() {
                if is_full {
                    row_count as u64 - count_missing_among(column, 0..row_count, p as u32)
                } else {
                    filter.cardinality() - count_missing_among(column, filter.iter(), p as u32)
                }
            } else {
                0
            };

            for &symbol in A::SYMBOLS {
                if Some(symbol) == deleted {
                    continue;
                }
                let stored = position.get_bitmap(symbol);
                let count = if is_full {
                    if position.is_symbol_flipped(symbol) {
                        row_count as u64 - stored.cardinality()
                    } else {
                        stored.cardinality()
                    }
                } else if position.is_symbol_flipped(symbol) {
                    filter.andnot_cardinality(stored)
                } else {
                    filter.and_cardinality(stored)
                };
                counts[symbol] = count;
                if deleted.is_some() {
                    deleted_running = deleted_running.saturating_sub(count);
                }
            }
            if let Some(d) = deleted {
                counts[d] = deleted_running;
            }
            Ok(counts)
        })
        .collect()
}

fn mutations_for_column<A: Alphabet>(
    name: &str,
    table: &Table,
    bitmaps: &[Bitmap],
    min_proportion: f64,
    fields: Option<&[String]>,
    deadline: Option<Instant>,
    column_of: impl Fn(&TablePartition) -> Option<&SequenceColumnPartition<A>>,
) -> Result<RecordBatch, SiloError> {
    let first_column = table
        .partitions()
        .first()
        .and_then(&column_of)
        .ok_or_else(|| SiloError::internal(format!("no partition carries sequence column '{name}'")))?;
    let reference: Vec<A::Symbol> = first_column.reference().to_vec();
    let reference_len = reference.len();

    let mut totals: Vec<SymbolMap<A, u64>> =
        (0..reference_len).map(|_| SymbolMap::from_fn(|_| 0u64)).collect();
    let mut total_matched: u64 = 0;

    for (idx, partition) in table.partitions().iter().enumerate() {
        let column = column_of(partition)
            .ok_or_else(|| SiloError::internal(format!("partition is missing sequence column '{name}'")))?;
        let filter = &bitmaps[idx];
        total_matched += filter.cardinality();
        let counts = partition_mutation_counts(column, filter, deadline)?;
        for (p, count) in counts.into_iter().enumerate() {
            for &symbol in A::SYMBOLS {
                totals[p][symbol] += count[symbol];
            }
        }
    }

    // count > ceil(total * proportion) - 1, i.e. count >= ceil(total * proportion)
    // for integer counts; min_proportion = 0 additionally requires count > 0.
    let threshold_excl = ((total_matched as f64) * min_proportion).ceil() as i64 - 1;

    let mut out = Vec::new();
    for (p, counts) in totals.into_iter().enumerate() {
        let reference_symbol = reference[p];
        for &symbol in A::SYMBOLS {
            if symbol == reference_symbol || symbol == A::symbol_missing() {
                continue;
            }
            let count = counts[symbol];
            if count == 0 || (count as i64) <= threshold_excl {
                continue;
            }
            let proportion = if total_matched > 0 {
                count as f64 / total_matched as f64
            } else {
                0.0
            };
            let mutation = format!(
                "{}{}{}",
                A::symbol_to_char(reference_symbol),
                p + 1,
                A::symbol_to_char(symbol)
            );
            let mut record = Record::new();
            record.insert("mutation".to_string(), json!(mutation));
            record.insert(
                "mutationFrom".to_string(),
                json!(A::symbol_to_char(reference_symbol).to_string()),
            );
            record.insert("mutationTo".to_string(), json!(A::symbol_to_char(symbol).to_string()));
            record.insert("position".to_string(), json!(p + 1));
            record.insert("sequenceName".to_string(), json!(name));
            record.insert("count".to_string(), json!(count));
            record.insert("coverage".to_string(), json!(total_matched));
            record.insert("proportion".to_string(), json!(proportion));
            if let Some(fields) = fields {
                record.retain(|k, _| fields.iter().any(|f| f == k));
            }
            out.push(record);
        }
    }
    Ok(out)
}

fn mutations_action(
    table: &Table,
    bitmaps: &[Bitmap],
    sequence_names: Option<&[String]>,
    min_proportion: f64,
    fields: Option<&[String]>,
    deadline: Option<Instant>,
) -> Result<RecordBatch, SiloError> {
    if let Some(names) = sequence_names {
        for name in names {
            if table.schema().column(name).is_none() {
                return Err(SiloError::bad_request(format!("unknown sequence name '{name}'")));
            }
        }
    }

    let mut out = Vec::new();
    for column in table.schema().columns() {
        let ColumnType::Sequence(kind) = column.column_type else { continue };
        if let Some(names) = sequence_names {
            if !names.iter().any(|n| n == &column.name) {
                continue;
            }
        }
        let batch = match kind {
            SequenceAlphabetKind::Nucleotide => mutations_for_column::<Nucleotide>(
                &column.name,
                table,
                bitmaps,
                min_proportion,
                fields,
                deadline,
                |p| p.nucleotide_column(&column.name),
            )?,
            SequenceAlphabetKind::AminoAcid => mutations_for_column::<AminoAcid>(
                &column.name,
                table,
                bitmaps,
                min_proportion,
                fields,
                deadline,
                |p| p.amino_acid_column(&column.name),
            )?,
        };
        out.extend(batch);
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// InsertionAggregation
// ---------------------------------------------------------------------

fn insertion_counts_for_column<A: Alphabet>(
    name: &str,
    table: &Table,
    bitmaps: &[Bitmap],
    column_of: impl Fn(&TablePartition) -> Option<&SequenceColumnPartition<A>>,
) -> RecordBatch {
    let mut totals: FxHashMap<(u32, String), u64> = FxHashMap::default();
    for (idx, partition) in table.partitions().iter().enumerate() {
        let Some(column) = column_of(partition) else { continue };
        let filter = &bitmaps[idx];
        for (position, value, rows) in column.insertion_index().entries() {
            let count = filter.and_cardinality(rows);
            if count > 0 {
                *totals.entry((position, value.to_string())).or_insert(0) += count;
            }
        }
    }
    totals
        .into_iter()
        .map(|((position, value), count)| {
            let mut record = Record::new();
            record.insert("sequenceName".to_string(), json!(name));
            record.insert("position".to_string(), json!(position + 1));
            record.insert("insertion".to_string(), json!(value));
            record.insert("count".to_string(), json!(count));
            record
        })
        .collect()
}

fn insertion_aggregation_action(
    table: &Table,
    bitmaps: &[Bitmap],
    sequence_names: Option<&[String]>,
) -> Result<RecordBatch, SiloError> {
    if let Some(names) = sequence_names {
        for name in names {
            if table.schema().column(name).is_none() {
                return Err(SiloError::bad_request(format!("unknown sequence name '{name}'")));
            }
        }
    }

    let mut out = Vec::new();
    for column in table.schema().columns() {
        let ColumnType::Sequence(kind) = column.column_type else { continue };
        if let Some(names) = sequence_names {
            if !names.iter().any(|n| n == &column.name) {
                continue;
            }
        }
        match kind {
            SequenceAlphabetKind::Nucleotide => out.extend(insertion_counts_for_column::<Nucleotide>(
                &column.name,
                table,
                bitmaps,
                |p| p.nucleotide_column(&column.name),
            )),
            SequenceAlphabetKind::AminoAcid => out.extend(insertion_counts_for_column::<AminoAcid>(
                &column.name,
                table,
                bitmaps,
                |p| p.amino_acid_column(&column.name),
            )),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Phylogenetic tree actions
// ---------------------------------------------------------------------

fn matched_tree_node_ids(table: &Table, bitmaps: &[Bitmap], column_name: &str) -> Result<Vec<String>, SiloError> {
    let tree = table.phylo_tree(column_name)?;
    let mut ids = Vec::new();
    for (idx, partition) in table.partitions().iter().enumerate() {
        let metadata = partition
            .metadata_column(column_name)
            .ok_or_else(|| SiloError::bad_request(format!("unknown column '{column_name}'")))?;
        for row in bitmaps[idx].iter() {
            if let ColumnValue::IndexedString(Some(id)) = metadata.value(row) {
                if tree.contains(&id) {
                    ids.push(id);
                }
            }
        }
    }
    Ok(ids)
}

fn mrca_action(table: &Table, bitmaps: &[Bitmap], column_name: &str) -> Result<RecordBatch, SiloError> {
    let ids = matched_tree_node_ids(table, bitmaps, column_name)?;
    let tree = table.phylo_tree(column_name)?;
    let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    let mrca = tree.most_recent_common_ancestor(&refs)?;
    let mut record = Record::new();
    record.insert("mostRecentCommonAncestor".to_string(), json!(mrca));
    Ok(vec![record])
}

fn phylo_subtree_action(
    table: &Table,
    bitmaps: &[Bitmap],
    column_name: &str,
    print_nodes_not_in_tree: bool,
    contract_unary_nodes: bool,
) -> Result<RecordBatch, SiloError> {
    let ids = matched_tree_node_ids(table, bitmaps, column_name)?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let tree = table.phylo_tree(column_name)?;
    let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    let mrca = tree
        .most_recent_common_ancestor(&refs)?
        .expect("ids is non-empty, so a common ancestor always exists");
    let subtree_ids = tree.subtree_node_ids(&mrca)?;
    let matched: std::collections::HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();

    let mut out = Vec::new();
    for id in &subtree_ids {
        if !print_nodes_not_in_tree && !matched.contains(id.as_str()) {
            continue;
        }
        if contract_unary_nodes && id != &mrca && tree.child_count(id)? == 1 {
            continue;
        }
        let mut record = Record::new();
        record.insert("node".to_string(), json!(id));
        out.push(record);
    }
    Ok(out)
}

fn phylo_parents_action(
    table: &Table,
    bitmaps: &[Bitmap],
    column_name: &str,
    contract_unary_nodes: bool,
) -> Result<RecordBatch, SiloError> {
    let tree = table.phylo_tree(column_name)?;
    let mut out = Vec::new();
    for (idx, partition) in table.partitions().iter().enumerate() {
        let metadata = partition
            .metadata_column(column_name)
            .ok_or_else(|| SiloError::bad_request(format!("unknown column '{column_name}'")))?;
        for row in bitmaps[idx].iter() {
            let ColumnValue::IndexedString(Some(node_id)) = metadata.value(row) else { continue };
            if !tree.contains(&node_id) {
                continue;
            }
            let mut parent = tree.parent_of(&node_id)?.map(|s| s.to_string());
            if contract_unary_nodes {
                while let Some(candidate) = parent.clone() {
                    if tree.child_count(&candidate)? == 1 {
                        parent = tree.parent_of(&candidate)?.map(|s| s.to_string());
                    } else {
                        break;
                    }
                }
            }
            let mut record = Record::new();
            record.insert("node".to_string(), json!(node_id));
            record.insert("parent".to_string(), json!(parent));
            out.push(record);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alphabet::Nucleotide as NucleotideAlphabet;
    use crate::domain::phylo::PhyloTreeBuilder;
    use crate::domain::schema::{ColumnMetadata, TableSchema};
    use crate::domain::sequence_column::AlignedRead;
    use crate::domain::table::{MetadataColumn, TablePartition};
    use std::collections::HashMap;

    fn sample_table() -> Table {
        // Reference "ACGT"; rows "ACGT", "ACCT", "ACGA".
        let reference: Vec<_> = "ACGT"
            .chars()
            .map(|c| NucleotideAlphabet::char_to_symbol(c).unwrap())
            .collect();
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
        let mut metadata_columns = HashMap::new();
        metadata_columns.insert(
            "country".to_string(),
            MetadataColumn::IndexedString(vec![
                Some("CH".to_string()),
                Some("CH".to_string()),
                Some("DE".to_string()),
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
    fn aggregated_without_group_by_counts_every_matched_row() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0, 1, 2])];
        let batch = aggregated_action(&table, &bitmaps, None).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["count"], json!(3));
    }

    #[test]
    fn aggregated_groups_by_field() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0, 1, 2])];
        let batch = aggregated_action(&table, &bitmaps, Some(&["country".to_string()])).unwrap();
        assert_eq!(batch.len(), 2);
        let total: i64 = batch.iter().map(|r| r["count"].as_i64().unwrap()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn details_defaults_to_every_non_sequence_column() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0])];
        let batch = details_action(&table, &bitmaps, None).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["country"], json!("CH"));
    }

    #[test]
    fn fasta_reconstructs_the_aligned_row() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([1])];
        let batch = fasta_action(&table, &bitmaps, &["main".to_string()], None, true).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["sequence"], json!("ACCT"));
    }

    #[test]
    fn mutations_finds_the_single_mismatch_at_each_divergent_row() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0, 1, 2])];
        let batch = mutations_action(&table, &bitmaps, None, 0.0, None, None).unwrap();
        let mutations: Vec<&str> = batch.iter().map(|r| r["mutation"].as_str().unwrap()).collect();
        assert!(mutations.contains(&"G3C"));
        assert!(mutations.contains(&"T4A"));
    }

    #[test]
    fn mutations_min_proportion_filters_rare_mutations() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0, 1, 2])];
        // Each mutation only occurs in 1 of 3 rows, proportion = 1/3.
        let batch = mutations_action(&table, &bitmaps, None, 0.5, None, None).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn mutations_action_honors_an_already_past_deadline() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0, 1, 2])];
        let deadline = Instant::now() - std::time::Duration::from_secs(1);
        let result = mutations_action(&table, &bitmaps, None, 0.0, None, Some(deadline));
        assert!(matches!(result, Err(SiloError::Timeout)));
    }

    #[test]
    fn phylo_actions_require_a_configured_tree() {
        let table = sample_table();
        let bitmaps = vec![Bitmap::from_rows([0])];
        assert!(mrca_action(&table, &bitmaps, "country").is_err());
    }

    #[test]
    fn mrca_and_parents_use_the_configured_tree() {
        let reference: Vec<_> = "ACGT"
            .chars()
            .map(|c| NucleotideAlphabet::char_to_symbol(c).unwrap())
            .collect();
        let mut column: SequenceColumnPartition<Nucleotide> =
            SequenceColumnPartition::new(reference, 1024).unwrap();
        for seq in ["ACGT", "ACGT"] {
            column
                .append_sequence_read(Some(AlignedRead { offset: 0, sequence: seq.to_string() }))
                .unwrap();
        }
        column.finalize().unwrap();
        let mut nucleotide_columns = HashMap::new();
        nucleotide_columns.insert("main".to_string(), column);
        let mut metadata_columns = HashMap::new();
        metadata_columns.insert(
            "strain".to_string(),
            MetadataColumn::IndexedString(vec![Some("a1".to_string()), Some("a2".to_string())]),
        );
        let schema = TableSchema::new(vec![
            ColumnMetadata::sequence("main", SequenceAlphabetKind::Nucleotide, "ACGT", true),
            ColumnMetadata::scalar("strain", ColumnType::IndexedString),
        ])
        .unwrap();
        let partition = TablePartition::new(nucleotide_columns, HashMap::new(), metadata_columns, 2);
        let mut builder = PhyloTreeBuilder::new();
        builder
            .add_node("root", None)
            .add_node("a", Some("root".to_string()))
            .add_node("a1", Some("a".to_string()))
            .add_node("a2", Some("a".to_string()));
        let tree = builder.build().unwrap();
        let table = Table::new(schema, vec![partition]).unwrap().with_phylo_tree("strain", tree);

        let bitmaps = vec![Bitmap::from_rows([0, 1])];
        let mrca_batch = mrca_action(&table, &bitmaps, "strain").unwrap();
        assert_eq!(mrca_batch[0]["mostRecentCommonAncestor"], json!("a"));

        let parents_batch = phylo_parents_action(&table, &bitmaps, "strain", false).unwrap();
        assert_eq!(parents_batch.len(), 2);
        assert!(parents_batch.iter().all(|r| r["parent"] == json!("a")));
    }
}
