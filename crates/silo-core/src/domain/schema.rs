//! Table schema: the ordered set of columns a table's partitions share, and
//! which sequence column (if any) is the implicit target of queries that
//! don't name one explicitly.

use crate::error::SiloError;

/// Which alphabet a [`ColumnType::Sequence`] column is built over. Schema
/// metadata is not generic over [`super::alphabet::Alphabet`] itself - it
/// only needs to remember which one a column uses so the query layer can
/// dispatch to the right monomorphized column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceAlphabetKind {
    Nucleotide,
    AminoAcid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Date,
    Int,
    Float,
    Bool,
    IndexedString,
    Sequence(SequenceAlphabetKind),
}

/// One column's metadata. `reference_sequence` and `is_default` only apply
/// to [`ColumnType::Sequence`] columns; [`TableSchema::new`] rejects them
/// being set (or missing) anywhere else.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    pub name: String,
    pub column_type: ColumnType,
    pub reference_sequence: Option<String>,
    pub is_default: bool,
}

impl ColumnMetadata {
    pub fn scalar(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            reference_sequence: None,
            is_default: false,
        }
    }

    pub fn sequence(
        name: impl Into<String>,
        alphabet: SequenceAlphabetKind,
        reference_sequence: impl Into<String>,
        is_default: bool,
    ) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Sequence(alphabet),
            reference_sequence: Some(reference_sequence.into()),
            is_default,
        }
    }
}

/// A table's column list, validated once at construction time so every
/// later reader can assume it is well-formed.
#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: Vec<ColumnMetadata>,
    default_nucleotide_column: Option<String>,
    default_amino_acid_column: Option<String>,
}

impl TableSchema {
    /// Validates:
    /// - column names are unique,
    /// - `reference_sequence` is set iff the column is a sequence column,
    ///   and is non-empty when set,
    /// - `is_default` is only set on sequence columns,
    /// - at most one default nucleotide column and one default amino-acid
    ///   column.
    pub fn new(columns: Vec<ColumnMetadata>) -> Result<Self, SiloError> {
        let mut seen_names = std::collections::HashSet::new();
        let mut default_nucleotide_column = None;
        let mut default_amino_acid_column = None;

        for column in &columns {
            if !seen_names.insert(column.name.clone()) {
                return Err(SiloError::preprocessing(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }

            match column.column_type {
                ColumnType::Sequence(alphabet) => {
                    match &column.reference_sequence {
                        Some(reference) if !reference.is_empty() => {}
                        _ => {
                            return Err(SiloError::preprocessing(format!(
                                "sequence column '{}' must have a non-empty reference sequence",
                                column.name
                            )));
                        }
                    }
                    if column.is_default {
                        let slot = match alphabet {
                            SequenceAlphabetKind::Nucleotide => &mut default_nucleotide_column,
                            SequenceAlphabetKind::AminoAcid => &mut default_amino_acid_column,
                        };
                        if slot.is_some() {
                            return Err(SiloError::preprocessing(format!(
                                "table schema declares more than one default {alphabet:?} column"
                            )));
                        }
                        *slot = Some(column.name.clone());
                    }
                }
                _ => {
                    if column.reference_sequence.is_some() {
                        return Err(SiloError::preprocessing(format!(
                            "non-sequence column '{}' must not have a reference sequence",
                            column.name
                        )));
                    }
                    if column.is_default {
                        return Err(SiloError::preprocessing(format!(
                            "non-sequence column '{}' cannot be a default column",
                            column.name
                        )));
                    }
                }
            }
        }

        Ok(Self {
            columns,
            default_nucleotide_column,
            default_amino_acid_column,
        })
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn default_nucleotide_column(&self) -> Option<&str> {
        self.default_nucleotide_column.as_deref()
    }

    pub fn default_amino_acid_column(&self) -> Option<&str> {
        self.default_amino_acid_column.as_deref()
    }
}

impl std::fmt::Debug for SequenceAlphabetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceAlphabetKind::Nucleotide => write!(f, "nucleotide"),
            SequenceAlphabetKind::AminoAcid => write!(f, "amino-acid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_well_formed_schema() {
        let schema = TableSchema::new(vec![
            ColumnMetadata::scalar("date", ColumnType::Date),
            ColumnMetadata::sequence(
                "main",
                SequenceAlphabetKind::Nucleotide,
                "ACGT",
                true,
            ),
        ])
        .unwrap();
        assert_eq!(schema.default_nucleotide_column(), Some("main"));
        assert_eq!(schema.default_amino_acid_column(), None);
    }

    #[test]
    fn rejects_duplicate_column_names() {
        let result = TableSchema::new(vec![
            ColumnMetadata::scalar("date", ColumnType::Date),
            ColumnMetadata::scalar("date", ColumnType::Int),
        ]);
        assert!(matches!(result, Err(SiloError::Preprocessing(_))));
    }

    #[test]
    fn rejects_two_default_nucleotide_columns() {
        let result = TableSchema::new(vec![
            ColumnMetadata::sequence("a", SequenceAlphabetKind::Nucleotide, "ACGT", true),
            ColumnMetadata::sequence("b", SequenceAlphabetKind::Nucleotide, "ACGT", true),
        ]);
        assert!(matches!(result, Err(SiloError::Preprocessing(_))));
    }

    #[test]
    fn rejects_default_flag_on_non_sequence_column() {
        let mut column = ColumnMetadata::scalar("date", ColumnType::Date);
        column.is_default = true;
        assert!(matches!(
            TableSchema::new(vec![column]),
            Err(SiloError::Preprocessing(_))
        ));
    }

    #[test]
    fn rejects_sequence_column_without_reference() {
        let column = ColumnMetadata {
            name: "main".to_string(),
            column_type: ColumnType::Sequence(SequenceAlphabetKind::Nucleotide),
            reference_sequence: None,
            is_default: false,
        };
        assert!(matches!(
            TableSchema::new(vec![column]),
            Err(SiloError::Preprocessing(_))
        ));
    }
}
