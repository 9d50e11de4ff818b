//! A single aligned sequence column within one table partition: the
//! reference sequence, the per-position vertical bitmap index, the
//! horizontal "missing symbol" bitmaps, and the insertion sub-index
//! (grounded in
//! `examples/original_source/include/silo/storage/column/sequence_column.h`).

use rayon::prelude::*;
use tracing::debug;

use super::alphabet::Alphabet;
use super::bitmap::Bitmap;
use super::insertion::InsertionIndex;
use super::position::SequencePosition;
use crate::error::SiloError;

/// One buffered read, as handed to the column by the (out-of-scope) loader:
/// an aligned offset and the aligned string covering
/// `[offset, offset + sequence.len())`. `None` represents an invalid read -
/// every position is then marked missing.
#[derive(Debug, Clone)]
pub struct AlignedRead {
    pub offset: u32,
    pub sequence: String,
}

/// Diagnostic size accounting for one sequence column partition (carried
/// over from the original's `SequenceColumnInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceColumnInfo {
    pub sequence_count: u32,
    pub position_bitmaps_size: usize,
    pub missing_bitmaps_size: usize,
}

/// One sequence column (e.g. "main") within one table partition.
pub struct SequenceColumnPartition<A: Alphabet> {
    reference: Vec<A::Symbol>,
    positions: Vec<SequencePosition<A>>,
    missing_symbol_bitmaps: Vec<Bitmap>,
    insertion_index: InsertionIndex<A>,
    row_count: u32,
    buffer: Vec<Option<AlignedRead>>,
    buffer_size: usize,
    finalized: bool,
}

impl<A: Alphabet> SequenceColumnPartition<A> {
    pub fn new(reference: Vec<A::Symbol>, buffer_size: usize) -> Result<Self, SiloError> {
        if reference.is_empty() {
            return Err(SiloError::preprocessing("reference sequence must not be empty"));
        }
        let positions = (0..reference.len()).map(|_| SequencePosition::new()).collect();
        Ok(Self {
            reference,
            positions,
            missing_symbol_bitmaps: Vec::new(),
            insertion_index: InsertionIndex::new(),
            row_count: 0,
            buffer: Vec::new(),
            buffer_size,
            finalized: false,
        })
    }

    pub fn reference(&self) -> &[A::Symbol] {
        &self.reference
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn position(&self, index: usize) -> &SequencePosition<A> {
        &self.positions[index]
    }

    pub fn missing_symbol_bitmap(&self, row: u32) -> &Bitmap {
        &self.missing_symbol_bitmaps[row as usize]
    }

    pub fn missing_symbol_bitmaps(&self) -> &[Bitmap] {
        &self.missing_symbol_bitmaps
    }

    pub fn insertion_index(&self) -> &InsertionIndex<A> {
        &self.insertion_index
    }

    /// Appends one read (`None` if invalid). Flushes the build buffer first
    /// if it has reached `buffer_size`.
    pub fn append_sequence_read(&mut self, read: Option<AlignedRead>) -> Result<(), SiloError> {
        if self.buffer.len() >= self.buffer_size {
            self.flush_buffer()?;
        }
        self.buffer.push(read);
        self.row_count += 1;
        Ok(())
    }

    /// Parses `"POS:VALUE"` and records the insertion against the most
    /// recently appended row.
    pub fn append_insertion(&mut self, pos_and_value: &str) -> Result<(), SiloError> {
        let (pos_str, value) = pos_and_value.split_once(':').ok_or_else(|| {
            SiloError::insertion_format(format!(
                "expected 'POSITION:VALUE', got '{pos_and_value}'"
            ))
        })?;
        let position: u32 = pos_str
            .parse()
            .map_err(|_| SiloError::insertion_format(format!("invalid position '{pos_str}'")))?;
        if self.row_count == 0 {
            return Err(SiloError::insertion_format(
                "append_insertion called before any row was appended",
            ));
        }
        self.insertion_index
            .add_lazily(position, value, self.row_count - 1)
    }

    /// Flushes the build buffer, builds the insertion index, and applies the
    /// flip-most-numerous space optimization to every position.
    pub fn finalize(&mut self) -> Result<(), SiloError> {
        self.flush_buffer()?;
        self.insertion_index.build_index();
        self.optimize_bitmaps();
        self.finalized = true;
        debug!(
            row_count = self.row_count,
            reference_len = self.reference.len(),
            "finalized sequence column partition"
        );
        Ok(())
    }

    pub fn size_info(&self) -> SequenceColumnInfo {
        SequenceColumnInfo {
            sequence_count: self.row_count,
            position_bitmaps_size: self.positions.iter().map(|p| p.compute_size()).sum(),
            missing_bitmaps_size: self
                .missing_symbol_bitmaps
                .iter()
                .map(|b| b.size_in_bytes())
                .sum(),
        }
    }

    fn flush_buffer(&mut self) -> Result<(), SiloError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let base = self.row_count - batch.len() as u32;
        let span = batch.len() as u32;
        self.fill_indexes(&batch, base, span)?;
        self.fill_missing_bitmaps(&batch, base)?;
        Ok(())
    }

    /// Parallel over positions: for every position, scan every buffered row
    /// that covers it and bucket row ids by the symbol observed there.
    fn fill_indexes(
        &mut self,
        batch: &[Option<AlignedRead>],
        base: u32,
        span: u32,
    ) -> Result<(), SiloError> {
        let reference_len = self.reference.len();
        self.positions
            .par_iter_mut()
            .enumerate()
            .take(reference_len)
            .try_for_each(|(position_idx, position)| -> Result<(), SiloError> {
                let mut ids_per_symbol: Vec<Vec<u32>> = vec![Vec::new(); A::SYMBOLS.len()];
                for (row_offset, read) in batch.iter().enumerate() {
                    let Some(read) = read else { continue };
                    let start = read.offset as usize;
                    let end = start + read.sequence.len();
                    if position_idx < start || position_idx >= end {
                        continue;
                    }
                    let c = read.sequence.as_bytes()[position_idx - start] as char;
                    let symbol = A::char_to_symbol(c).ok_or_else(|| {
                        SiloError::preprocessing(format!(
                            "illegal character '{c}' in aligned sequence at position {position_idx}"
                        ))
                    })?;
                    if symbol != A::symbol_missing() {
                        ids_per_symbol[A::index_of(symbol)].push(base + row_offset as u32);
                    }
                }
                for &symbol in A::SYMBOLS {
                    let ids = std::mem::take(&mut ids_per_symbol[A::index_of(symbol)]);
                    if !ids.is_empty() {
                        position.add_values(symbol, ids, base, span);
                    }
                }
                Ok(())
            })
    }

    /// Parallel over buffered rows: builds each row's horizontal "missing at
    /// position p" bitmap from the parts of the reference it does not cover
    /// plus any explicit `MISSING` symbol inside the covered span.
    fn fill_missing_bitmaps(
        &mut self,
        batch: &[Option<AlignedRead>],
        base: u32,
    ) -> Result<(), SiloError> {
        let reference_len = self.reference.len() as u32;
        let computed: Result<Vec<Bitmap>, SiloError> = batch
            .par_iter()
            .enumerate()
            .map(|(row_offset, read)| -> Result<Bitmap, SiloError> {
                let _ = base + row_offset as u32;
                let mut missing = Bitmap::new();
                match read {
                    None => missing.add_range(0..reference_len),
                    Some(read) => {
                        missing.add_range(0..read.offset);
                        let covered_end = read.offset + read.sequence.len() as u32;
                        if covered_end < reference_len {
                            missing.add_range(covered_end..reference_len);
                        }
                        for (i, c) in read.sequence.chars().enumerate() {
                            let symbol = A::char_to_symbol(c).ok_or_else(|| {
                                SiloError::preprocessing(format!(
                                    "illegal character '{c}' in aligned sequence"
                                ))
                            })?;
                            if symbol == A::symbol_missing() {
                                missing.add(read.offset + i as u32);
                            }
                        }
                    }
                }
                missing.run_optimize();
                Ok(missing)
            })
            .collect();
        self.missing_symbol_bitmaps.extend(computed?);
        Ok(())
    }

    fn optimize_bitmaps(&mut self) {
        let row_count = self.row_count;
        self.positions.par_iter_mut().for_each(|position| {
            // Freshly built positions never have a deleted symbol, so this
            // can only fail if a caller already invoked the delete
            // transform explicitly; in the default build path it cannot.
            let _ = position.flip_most_numerous_bitmap(row_count);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alphabet::{Nucleotide, NucleotideSymbol as NS};

    fn reference(s: &str) -> Vec<NS> {
        s.chars().map(|c| Nucleotide::char_to_symbol(c).unwrap()).collect()
    }

    #[test]
    fn end_to_end_build_and_read_back() {
        // Reference "ACGT"; rows "ACGT", "ACCT", "ACGA".
        let mut column: SequenceColumnPartition<Nucleotide> =
            SequenceColumnPartition::new(reference("ACGT"), 1024).unwrap();
        for seq in ["ACGT", "ACCT", "ACGA"] {
            column
                .append_sequence_read(Some(AlignedRead {
                    offset: 0,
                    sequence: seq.to_string(),
                }))
                .unwrap();
        }
        column.finalize().unwrap();

        assert_eq!(column.row_count(), 3);
        assert!(column.is_finalized());

        // Position 2 (0-indexed) has C at row 1 only.
        let position = column.position(2);
        let is_flipped = position.is_symbol_flipped(NS::G);
        let bitmap = position.get_bitmap(NS::C);
        assert!(!is_flipped || bitmap.complement(3).contains(1));
        if !is_flipped {
            assert!(bitmap.contains(1));
        }
    }

    #[test]
    fn missing_read_marks_every_position_missing() {
        let mut column: SequenceColumnPartition<Nucleotide> =
            SequenceColumnPartition::new(reference("NNNN"), 1024).unwrap();
        column
            .append_sequence_read(Some(AlignedRead {
                offset: 0,
                sequence: "N".to_string(),
            }))
            .unwrap();
        column.finalize().unwrap();

        let missing = column.missing_symbol_bitmap(0);
        for position in 0..4 {
            assert!(missing.contains(position), "position {position} should be missing");
        }
    }

    #[test]
    fn illegal_character_is_a_preprocessing_error() {
        let mut column: SequenceColumnPartition<Nucleotide> =
            SequenceColumnPartition::new(reference("ACGT"), 1024).unwrap();
        column
            .append_sequence_read(Some(AlignedRead {
                offset: 0,
                sequence: "AZGT".to_string(),
            }))
            .unwrap();
        assert!(matches!(column.finalize(), Err(SiloError::Preprocessing(_))));
    }

    #[test]
    fn empty_reference_is_rejected() {
        let result: Result<SequenceColumnPartition<Nucleotide>, _> =
            SequenceColumnPartition::new(Vec::new(), 1024);
        assert!(result.is_err());
    }
}
