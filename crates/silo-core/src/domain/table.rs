//! `TablePartition` and `Table`: the owning containers that tie sequence
//! columns, metadata columns, and the schema together (grounded in
//! `examples/original_source/src/silo/storage/table_partition.cpp` and
//! `examples/original_source/src/silo/schema/database_schema.h`).

use std::collections::HashMap;

use chrono::NaiveDate;

use super::alphabet::{AminoAcid, Nucleotide};
use super::phylo::PhyloTree;
use super::schema::{ColumnType, SequenceAlphabetKind, TableSchema};
use super::sequence_column::SequenceColumnPartition;
use crate::error::SiloError;

/// One value read out of a [`MetadataColumn`] at a given row. `None` means
/// the value is absent for that row (the column's native "null").
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Date(Option<NaiveDate>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    IndexedString(Option<String>),
}

/// A non-sequence metadata column: one `Vec<Option<T>>` per native type,
/// indexed by row id within a partition. Minimal columnar storage - just
/// enough for `Selection`/`DateBetween`/`IntBetween`/... to operate on; no
/// on-disk format.
#[derive(Debug, Clone)]
pub enum MetadataColumn {
    Date(Vec<Option<NaiveDate>>),
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    IndexedString(Vec<Option<String>>),
}

impl MetadataColumn {
    pub fn column_type(&self) -> ColumnType {
        match self {
            MetadataColumn::Date(_) => ColumnType::Date,
            MetadataColumn::Int(_) => ColumnType::Int,
            MetadataColumn::Float(_) => ColumnType::Float,
            MetadataColumn::Bool(_) => ColumnType::Bool,
            MetadataColumn::IndexedString(_) => ColumnType::IndexedString,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetadataColumn::Date(v) => v.len(),
            MetadataColumn::Int(v) => v.len(),
            MetadataColumn::Float(v) => v.len(),
            MetadataColumn::Bool(v) => v.len(),
            MetadataColumn::IndexedString(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, row: u32) -> ColumnValue {
        let row = row as usize;
        match self {
            MetadataColumn::Date(v) => ColumnValue::Date(v[row]),
            MetadataColumn::Int(v) => ColumnValue::Int(v[row]),
            MetadataColumn::Float(v) => ColumnValue::Float(v[row]),
            MetadataColumn::Bool(v) => ColumnValue::Bool(v[row]),
            MetadataColumn::IndexedString(v) => ColumnValue::IndexedString(v[row].clone()),
        }
    }

    pub fn push_date(&mut self, value: Option<NaiveDate>) -> Result<(), SiloError> {
        match self {
            MetadataColumn::Date(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(SiloError::internal("pushed a date value into a non-date column")),
        }
    }

    pub fn push_int(&mut self, value: Option<i64>) -> Result<(), SiloError> {
        match self {
            MetadataColumn::Int(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(SiloError::internal("pushed an int value into a non-int column")),
        }
    }

    pub fn push_float(&mut self, value: Option<f64>) -> Result<(), SiloError> {
        match self {
            MetadataColumn::Float(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(SiloError::internal("pushed a float value into a non-float column")),
        }
    }

    pub fn push_bool(&mut self, value: Option<bool>) -> Result<(), SiloError> {
        match self {
            MetadataColumn::Bool(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(SiloError::internal("pushed a bool value into a non-bool column")),
        }
    }

    pub fn push_string(&mut self, value: Option<String>) -> Result<(), SiloError> {
        match self {
            MetadataColumn::IndexedString(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(SiloError::internal("pushed a string value into a non-string column")),
        }
    }

    pub fn empty_of(column_type: ColumnType) -> Result<Self, SiloError> {
        Ok(match column_type {
            ColumnType::Date => MetadataColumn::Date(Vec::new()),
            ColumnType::Int => MetadataColumn::Int(Vec::new()),
            ColumnType::Float => MetadataColumn::Float(Vec::new()),
            ColumnType::Bool => MetadataColumn::Bool(Vec::new()),
            ColumnType::IndexedString => MetadataColumn::IndexedString(Vec::new()),
            ColumnType::Sequence(_) => {
                return Err(SiloError::internal(
                    "sequence columns are not represented as metadata columns",
                ));
            }
        })
    }
}

/// One shard of rows: a sequence column partition per configured sequence
/// name and alphabet, the non-sequence metadata columns, and the row count
/// they all share.
pub struct TablePartition {
    nucleotide_columns: HashMap<String, SequenceColumnPartition<Nucleotide>>,
    amino_acid_columns: HashMap<String, SequenceColumnPartition<AminoAcid>>,
    metadata_columns: HashMap<String, MetadataColumn>,
    row_count: u32,
}

impl TablePartition {
    pub fn new(
        nucleotide_columns: HashMap<String, SequenceColumnPartition<Nucleotide>>,
        amino_acid_columns: HashMap<String, SequenceColumnPartition<AminoAcid>>,
        metadata_columns: HashMap<String, MetadataColumn>,
        row_count: u32,
    ) -> Self {
        Self {
            nucleotide_columns,
            amino_acid_columns,
            metadata_columns,
            row_count,
        }
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn nucleotide_column(&self, name: &str) -> Option<&SequenceColumnPartition<Nucleotide>> {
        self.nucleotide_columns.get(name)
    }

    pub fn amino_acid_column(&self, name: &str) -> Option<&SequenceColumnPartition<AminoAcid>> {
        self.amino_acid_columns.get(name)
    }

    pub fn metadata_column(&self, name: &str) -> Option<&MetadataColumn> {
        self.metadata_columns.get(name)
    }

    pub fn metadata_columns(&self) -> &HashMap<String, MetadataColumn> {
        &self.metadata_columns
    }
}

/// A globally immutable row identifier: which partition, and which row
/// within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub partition_id: usize,
    pub row_id: u32,
}

/// The precomputed parent/child hierarchy backing the `Lineage` filter's
/// "include sublineages" traversal: indexed-string equality with optional
/// traversal over a precomputed parent/child index.
#[derive(Debug, Clone, Default)]
pub struct LineageIndex {
    parent: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

impl LineageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, lineage: impl Into<String>, parent: Option<String>) -> &mut Self {
        let lineage = lineage.into();
        if let Some(parent) = parent {
            self.children.entry(parent.clone()).or_default().push(lineage.clone());
            self.parent.insert(lineage, parent);
        }
        self
    }

    /// `lineage` plus every descendant reachable through `children`, as a
    /// breadth-first traversal. `lineage` itself is always included even if
    /// it is not a key of the hierarchy (a leaf with no recorded children).
    pub fn descendants_inclusive(&self, lineage: &str) -> Vec<String> {
        let mut result = vec![lineage.to_string()];
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(lineage.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children.get(&current) {
                for child in children {
                    result.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        result
    }

    pub fn parent_of(&self, lineage: &str) -> Option<&str> {
        self.parent.get(lineage).map(|s| s.as_str())
    }
}

/// An ordered list of partitions sharing one schema. Build-only mutation:
/// once every partition's sequence columns are finalized the table is
/// frozen for querying.
pub struct Table {
    schema: TableSchema,
    partitions: Vec<TablePartition>,
    /// An optional phylogenetic tree, associated with the metadata column
    /// whose values are its node ids - the tree actions' supporting data
    /// structure.
    phylo_tree: Option<(String, PhyloTree)>,
    /// Lineage hierarchies, keyed by the indexed-string metadata column
    /// they describe.
    lineage_indices: HashMap<String, LineageIndex>,
}

impl Table {
    pub fn new(schema: TableSchema, partitions: Vec<TablePartition>) -> Result<Self, SiloError> {
        for partition in &partitions {
            for column in schema.columns() {
                match column.column_type {
                    ColumnType::Sequence(SequenceAlphabetKind::Nucleotide) => {
                        if partition.nucleotide_column(&column.name).is_none() {
                            return Err(SiloError::preprocessing(format!(
                                "partition is missing configured nucleotide column '{}'",
                                column.name
                            )));
                        }
                    }
                    ColumnType::Sequence(SequenceAlphabetKind::AminoAcid) => {
                        if partition.amino_acid_column(&column.name).is_none() {
                            return Err(SiloError::preprocessing(format!(
                                "partition is missing configured amino-acid column '{}'",
                                column.name
                            )));
                        }
                    }
                    _ => {
                        if partition.metadata_column(&column.name).is_none() {
                            return Err(SiloError::preprocessing(format!(
                                "partition is missing configured metadata column '{}'",
                                column.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(Self {
            schema,
            partitions,
            phylo_tree: None,
            lineage_indices: HashMap::new(),
        })
    }

    pub fn with_phylo_tree(mut self, column_name: impl Into<String>, tree: PhyloTree) -> Self {
        self.phylo_tree = Some((column_name.into(), tree));
        self
    }

    pub fn with_lineage_index(mut self, column_name: impl Into<String>, index: LineageIndex) -> Self {
        self.lineage_indices.insert(column_name.into(), index);
        self
    }

    pub fn lineage_index(&self, column_name: &str) -> Option<&LineageIndex> {
        self.lineage_indices.get(column_name)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn partitions(&self) -> &[TablePartition] {
        &self.partitions
    }

    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count() as u64).sum()
    }

    pub fn phylo_tree(&self, column_name: &str) -> Result<&PhyloTree, SiloError> {
        match &self.phylo_tree {
            Some((configured, tree)) if configured == column_name => Ok(tree),
            Some((configured, _)) => Err(SiloError::bad_request(format!(
                "this table's phylogenetic tree is keyed on column '{configured}', not '{column_name}'"
            ))),
            None => Err(SiloError::bad_request(
                "this table has no phylogenetic tree configured",
            )),
        }
    }

    /// Resolves a nucleotide sequence column name, falling back to the
    /// schema's default nucleotide column when `name` is omitted.
    pub fn resolve_nucleotide_column_name<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<&'a str, SiloError> {
        name.or_else(|| self.schema.default_nucleotide_column())
            .ok_or_else(|| {
                SiloError::query_parse(
                    "no sequence name given and the table has no default nucleotide column",
                )
            })
    }

    pub fn resolve_amino_acid_column_name<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<&'a str, SiloError> {
        name.or_else(|| self.schema.default_amino_acid_column())
            .ok_or_else(|| {
                SiloError::query_parse(
                    "no sequence name given and the table has no default amino-acid column",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alphabet::Alphabet;
    use crate::domain::schema::ColumnMetadata;

    fn build_table() -> Table {
        let schema = TableSchema::new(vec![
            ColumnMetadata::sequence(
                "main",
                SequenceAlphabetKind::Nucleotide,
                "ACGT",
                true,
            ),
            ColumnMetadata::scalar("date", ColumnType::Date),
        ])
        .unwrap();

        let mut nucleotide_columns = HashMap::new();
        nucleotide_columns.insert(
            "main".to_string(),
            SequenceColumnPartition::<Nucleotide>::new(
                "ACGT".chars().map(|c| Nucleotide::char_to_symbol(c).unwrap()).collect(),
                1024,
            )
            .unwrap(),
        );
        let mut metadata_columns = HashMap::new();
        metadata_columns.insert("date".to_string(), MetadataColumn::Date(vec![None]));

        let partition = TablePartition::new(nucleotide_columns, HashMap::new(), metadata_columns, 0);
        Table::new(schema, vec![partition]).unwrap()
    }

    #[test]
    fn resolves_default_nucleotide_column_when_omitted() {
        let table = build_table();
        assert_eq!(table.resolve_nucleotide_column_name(None).unwrap(), "main");
        assert_eq!(
            table.resolve_nucleotide_column_name(Some("main")).unwrap(),
            "main"
        );
    }

    #[test]
    fn lineage_index_descendants_are_breadth_first_and_inclusive() {
        let mut index = LineageIndex::new();
        index
            .add("B.1", None)
            .add("B.1.1", Some("B.1".to_string()))
            .add("B.1.1.7", Some("B.1.1".to_string()))
            .add("B.1.2", Some("B.1".to_string()));
        let mut descendants = index.descendants_inclusive("B.1");
        descendants.sort();
        assert_eq!(descendants, vec!["B.1", "B.1.1", "B.1.1.7", "B.1.2"]);
        assert_eq!(index.descendants_inclusive("B.1.2"), vec!["B.1.2"]);
    }

    #[test]
    fn rejects_a_partition_missing_a_configured_column() {
        let schema = TableSchema::new(vec![ColumnMetadata::sequence(
            "main",
            SequenceAlphabetKind::Nucleotide,
            "ACGT",
            true,
        )])
        .unwrap();
        let partition = TablePartition::new(HashMap::new(), HashMap::new(), HashMap::new(), 0);
        assert!(Table::new(schema, vec![partition]).is_err());
    }
}
