//! The insertion sub-index: a per-position map from insertion string to the
//! rows that carry it, pre-filtered by a 3-mer posting-list index so that
//! `InsertionContains` queries only run the (comparatively expensive) regex
//! verification against insertions that could plausibly match.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use regex::Regex;
use rustc_hash::FxHashMap;

use super::alphabet::Alphabet;
use super::bitmap::Bitmap;
use crate::error::SiloError;

type InsertionId = u32;

#[derive(Debug, Default)]
struct PositionInsertions<A: Alphabet> {
    insertions: Vec<(String, Bitmap)>,
    trimer_index: FxHashMap<[A::Symbol; 3], Vec<InsertionId>>,
}

/// Per sequence column: the set of insertions observed at each position,
/// queryable by regex via [`InsertionIndex::search`].
#[derive(Debug)]
pub struct InsertionIndex<A: Alphabet> {
    build: FxHashMap<u32, FxHashMap<String, Bitmap>>,
    finalized: FxHashMap<u32, PositionInsertions<A>>,
}

impl<A: Alphabet> Default for InsertionIndex<A> {
    fn default() -> Self {
        Self {
            build: FxHashMap::default(),
            finalized: FxHashMap::default(),
        }
    }
}

impl<A: Alphabet> InsertionIndex<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build-time accumulation. `value` must be a non-empty string of
    /// alphabet symbols (`\*` is accepted as the amino-acid STOP escape).
    pub fn add_lazily(
        &mut self,
        position: u32,
        value: &str,
        row_id: u32,
    ) -> Result<(), SiloError> {
        validate_insertion_value::<A>(value)?;
        self.build
            .entry(position)
            .or_default()
            .entry(value.to_string())
            .or_insert_with(Bitmap::new)
            .add(row_id);
        Ok(())
    }

    /// Finalizes the per-position insertion lists and builds the 3-mer
    /// posting-list pre-filter. Idempotent: subsequent calls re-derive the
    /// same finalized state from whatever has been added since.
    pub fn build_index(&mut self) {
        for (position, insertions) in self.build.drain() {
            let mut position_data = PositionInsertions::<A>::default();
            // Deterministic order: insertion ids should not depend on
            // hash-map iteration order.
            let mut entries: Vec<(String, Bitmap)> = insertions.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            for (value, rows) in entries {
                let insertion_id = position_data.insertions.len() as InsertionId;
                let symbols = parse_symbols::<A>(&value)
                    .expect("validated by add_lazily before being stored");
                for trimer in non_overlapping_trimers(&symbols) {
                    position_data
                        .trimer_index
                        .entry(trimer)
                        .or_default()
                        .push(insertion_id);
                }
                position_data.insertions.push((value, rows));
            }
            self.finalized.insert(position, position_data);
        }
    }

    /// Returns the rows whose insertion at `position` matches `pattern`,
    /// anchored as `^pattern$`. `pattern` must only use alphabet characters
    /// plus the `.*` wildcard (and `\*` for amino-acid STOP); anything else
    /// is a [`SiloError::BadRequest`].
    pub fn search(&self, position: u32, pattern: &str) -> Result<Bitmap, SiloError> {
        validate_pattern::<A>(pattern)?;
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored)
            .map_err(|e| SiloError::bad_request(format!("invalid insertion pattern: {e}")))?;

        let Some(position_data) = self.finalized.get(&position) else {
            return Ok(Bitmap::new());
        };

        let mut result = Bitmap::new();
        match extract_pattern_trimers::<A>(pattern) {
            Some(trimers) if !trimers.is_empty() => {
                let mut posting_lists: Vec<&[InsertionId]> = Vec::with_capacity(trimers.len());
                for trimer in &trimers {
                    match position_data.trimer_index.get(trimer) {
                        Some(list) => posting_lists.push(list),
                        // A required 3-mer never occurs at this position -
                        // nothing can match.
                        None => return Ok(Bitmap::new()),
                    }
                }
                for candidate in k_way_intersection(&posting_lists) {
                    let (value, rows) = &position_data.insertions[candidate as usize];
                    if regex.is_match(value) {
                        result.union_with(rows);
                    }
                }
            }
            _ => {
                for (value, rows) in &position_data.insertions {
                    if regex.is_match(value) {
                        result.union_with(rows);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Every `(position, insertion value, matching rows)` triple in this
    /// index, for actions that aggregate over the whole insertion
    /// dictionary rather than searching it.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &str, &Bitmap)> + '_ {
        self.finalized.iter().flat_map(|(&position, data)| {
            data.insertions
                .iter()
                .map(move |(value, rows)| (position, value.as_str(), rows))
        })
    }
}

fn validate_insertion_value<A: Alphabet>(value: &str) -> Result<(), SiloError> {
    if value.is_empty() {
        return Err(SiloError::insertion_format("insertion value must not be empty"));
    }
    parse_symbols::<A>(value)
        .map(|_| ())
        .ok_or_else(|| SiloError::insertion_format(format!("illegal symbol in insertion '{value}'")))
}

/// Parses an insertion value (or a `.*`-free piece of a search pattern) into
/// a run of alphabet symbols, unescaping the `\*` STOP escape first.
fn parse_symbols<A: Alphabet>(value: &str) -> Option<Vec<A::Symbol>> {
    let unescaped = value.replace("\\*", "*");
    unescaped.chars().map(A::char_to_symbol).collect()
}

fn non_overlapping_trimers<A: Alphabet>(symbols: &[A::Symbol]) -> Vec<[A::Symbol; 3]> {
    symbols
        .chunks_exact(3)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect()
}

/// Extracts the 3-mer constraints implied by a search pattern: split on the
/// literal `.*` wildcard, chunk each remaining run of alphabet symbols into
/// non-overlapping triplets, and deduplicate. Returns `None` when the
/// pattern is too complex for this prefilter (alternation) or a run cannot
/// be fully parsed as alphabet symbols - the caller should fall back to a
/// full scan in that case.
fn extract_pattern_trimers<A: Alphabet>(pattern: &str) -> Option<Vec<[A::Symbol; 3]>> {
    if pattern.contains('|') || pattern.contains('(') || pattern.contains(')') {
        return None;
    }
    let mut trimers = Vec::new();
    for run in pattern.split(".*") {
        let run = run.trim_matches(|c| c == '^' || c == '$');
        if run.is_empty() {
            continue;
        }
        let symbols = parse_symbols::<A>(run)?;
        trimers.extend(non_overlapping_trimers::<A>(&symbols));
    }
    trimers.sort();
    trimers.dedup();
    Some(trimers)
}

/// Validates a search pattern's grammar *and* that it actually compiles as
/// a regex, without touching any stored insertions. Used by the filter
/// compiler so `InsertionContains` rejects a malformed pattern at compile
/// time rather than deferring the failure into the (infallible)
/// `BitmapProducer::evaluate`.
pub fn ensure_valid_pattern<A: Alphabet>(pattern: &str) -> Result<(), SiloError> {
    validate_pattern::<A>(pattern)?;
    let anchored = format!("^(?:{pattern})$");
    Regex::new(&anchored)
        .map(|_| ())
        .map_err(|e| SiloError::bad_request(format!("invalid insertion pattern: {e}")))
}

fn validate_pattern<A: Alphabet>(pattern: &str) -> Result<(), SiloError> {
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '^' | '$' | '*' | '.' | '(' | ')' | '|' => continue,
            '\\' => {
                if chars.next() != Some('*') {
                    return Err(SiloError::bad_request(
                        "insertion pattern may only escape '*' (amino-acid STOP)",
                    ));
                }
            }
            c if A::char_to_symbol(c).is_some() => continue,
            other => {
                return Err(SiloError::bad_request(format!(
                    "insertion pattern contains a character outside the alphabet grammar: '{other}'"
                )));
            }
        }
    }
    Ok(())
}

/// Merges `k` ascending posting lists and returns the ids present in every
/// one of them, using a min-heap keyed by each list's current front id.
/// Ties (an id shared by several lists at once) are consumed together.
fn k_way_intersection(lists: &[&[InsertionId]]) -> Vec<InsertionId> {
    if lists.is_empty() {
        return Vec::new();
    }
    let k = lists.len();
    let mut cursors = vec![0usize; k];
    let mut heap: BinaryHeap<Reverse<(InsertionId, usize)>> = BinaryHeap::new();
    for (list_idx, list) in lists.iter().enumerate() {
        if let Some(&id) = list.first() {
            heap.push(Reverse((id, list_idx)));
        }
    }

    let mut result = Vec::new();
    while let Some(&Reverse((id, _))) = heap.peek() {
        let mut matching_lists = Vec::new();
        while let Some(&Reverse((top_id, list_idx))) = heap.peek() {
            if top_id != id {
                break;
            }
            heap.pop();
            matching_lists.push(list_idx);
        }
        if matching_lists.len() == k {
            result.push(id);
        }
        for list_idx in matching_lists {
            cursors[list_idx] += 1;
            if let Some(&next_id) = lists[list_idx].get(cursors[list_idx]) {
                heap.push(Reverse((next_id, list_idx)));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alphabet::Nucleotide;

    #[test]
    fn search_finds_an_exact_match() {
        let mut index: InsertionIndex<Nucleotide> = InsertionIndex::new();
        index.add_lazily(100, "AACC", 0).unwrap();
        index.add_lazily(100, "AACC", 2).unwrap();
        index.add_lazily(100, "TTGG", 1).unwrap();
        index.build_index();

        let result = index.search(100, "AA.*CC").unwrap();
        assert_eq!(result.cardinality(), 2);
        assert!(result.contains(0));
        assert!(result.contains(2));

        let result = index.search(100, "A.*G").unwrap();
        assert_eq!(result.cardinality(), 1);
        assert!(result.contains(1));
    }

    #[test]
    fn search_rejects_characters_outside_the_alphabet() {
        let mut index: InsertionIndex<Nucleotide> = InsertionIndex::new();
        index.add_lazily(100, "AACC", 0).unwrap();
        index.build_index();
        assert!(index.search(100, "ZZZ").is_err());
    }

    #[test]
    fn search_on_untouched_position_is_empty_not_an_error() {
        let index: InsertionIndex<Nucleotide> = InsertionIndex::new();
        let result = index.search(5, "AA.*").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn add_lazily_rejects_empty_value() {
        let mut index: InsertionIndex<Nucleotide> = InsertionIndex::new();
        assert!(index.add_lazily(0, "", 0).is_err());
    }

    #[test]
    fn trimer_prefilter_rejects_impossible_candidates_without_regex() {
        let mut index: InsertionIndex<Nucleotide> = InsertionIndex::new();
        index.add_lazily(1, "AAACCC", 0).unwrap();
        index.build_index();
        // No insertion at this position contains the 3-mer "GGG", so the
        // posting-list lookup should short-circuit to empty.
        let result = index.search(1, "GGG.*").unwrap();
        assert!(result.is_empty());
    }
}
