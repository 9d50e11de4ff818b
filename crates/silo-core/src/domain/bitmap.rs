//! Compressed row-id bitmaps and the copy-on-write handle operators pass
//! around. Built on `roaring::RoaringBitmap` - the corpus's
//! array/run/bitset-container compressed bitmap of choice (see
//! `other_examples/.../velesdb/column_store`, `.../netdata/journal/bitmap.rs`).

use std::ops::Range;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// A set of row indices. Thin wrapper so the rest of the engine depends on
/// this type rather than the `roaring` crate directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap(RoaringBitmap);

impl Bitmap {
    pub fn new() -> Self {
        Self(RoaringBitmap::new())
    }

    /// `[0, n)`.
    pub fn full(n: u32) -> Self {
        let mut bitmap = RoaringBitmap::new();
        bitmap.insert_range(0..n);
        Self(bitmap)
    }

    pub fn from_rows(rows: impl IntoIterator<Item = u32>) -> Self {
        Self(RoaringBitmap::from_iter(rows))
    }

    pub fn add(&mut self, row: u32) {
        self.0.insert(row);
    }

    pub fn add_many(&mut self, rows: impl IntoIterator<Item = u32>) {
        self.0.extend(rows);
    }

    pub fn add_range(&mut self, range: Range<u32>) {
        self.0.insert_range(range);
    }

    pub fn contains(&self, row: u32) -> bool {
        self.0.contains(row)
    }

    pub fn cardinality(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter()
    }

    pub fn run_optimize(&mut self) {
        self.0.run_optimize();
    }

    /// Flips every bit in `range`, in place.
    pub fn flip_range(&mut self, range: Range<u32>) {
        self.0 = self.0.flip(range);
    }

    /// The complement of this bitmap within `[0, n)`.
    pub fn complement(&self, n: u32) -> Bitmap {
        Bitmap(self.0.flip(0..n))
    }

    pub fn union_with(&mut self, other: &Bitmap) {
        self.0 |= &other.0;
    }

    pub fn intersect_with(&mut self, other: &Bitmap) {
        self.0 &= &other.0;
    }

    /// In-place set difference: removes every row present in `other`.
    pub fn subtract_assign(&mut self, other: &Bitmap) {
        self.0 -= &other.0;
    }

    pub fn union(&self, other: &Bitmap) -> Bitmap {
        Bitmap(&self.0 | &other.0)
    }

    pub fn intersect(&self, other: &Bitmap) -> Bitmap {
        Bitmap(&self.0 & &other.0)
    }

    /// `|self ∩ other|` without materializing the intersection.
    pub fn and_cardinality(&self, other: &Bitmap) -> u64 {
        self.0.and_cardinality(&other.0)
    }

    /// `|self \ other|` without materializing the difference.
    pub fn andnot_cardinality(&self, other: &Bitmap) -> u64 {
        self.0.andnot_cardinality(&other.0)
    }

    pub fn or_cardinality(&self, other: &Bitmap) -> u64 {
        self.0.or_cardinality(&other.0)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.0.serialized_size()
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Bitmap(RoaringBitmap::from_iter(iter))
    }
}

/// An owning-or-borrowing handle over a [`Bitmap`]. Operators that combine
/// two results prefer mutating an already-owned side in place; a borrowed
/// bitmap is only cloned the moment a caller asks for mutable access.
#[derive(Debug, Clone)]
pub enum CopyOnWriteBitmap<'a> {
    Borrowed(&'a Bitmap),
    Owned(Bitmap),
}

impl<'a> CopyOnWriteBitmap<'a> {
    pub fn borrowed(bitmap: &'a Bitmap) -> Self {
        Self::Borrowed(bitmap)
    }

    pub fn owned(bitmap: Bitmap) -> Self {
        Self::Owned(bitmap)
    }

    pub fn as_ref(&self) -> &Bitmap {
        match self {
            CopyOnWriteBitmap::Borrowed(b) => b,
            CopyOnWriteBitmap::Owned(b) => b,
        }
    }

    /// Clones on first mutation if currently borrowed.
    pub fn get_mut(&mut self) -> &mut Bitmap {
        if let CopyOnWriteBitmap::Borrowed(b) = self {
            *self = CopyOnWriteBitmap::Owned(b.clone());
        }
        match self {
            CopyOnWriteBitmap::Owned(b) => b,
            CopyOnWriteBitmap::Borrowed(_) => unreachable!("just converted to Owned"),
        }
    }

    pub fn into_owned(self) -> Bitmap {
        match self {
            CopyOnWriteBitmap::Borrowed(b) => b.clone(),
            CopyOnWriteBitmap::Owned(b) => b,
        }
    }

    pub fn cardinality(&self) -> u64 {
        self.as_ref().cardinality()
    }
}
