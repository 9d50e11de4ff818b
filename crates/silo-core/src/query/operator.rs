//! The bitmap operator algebra: the tagged variant `Operator` that
//! `Expression::compile` produces and that every query evaluates exactly
//! once per partition (grounded in
//! `examples/original_source/src/silo/query_engine/operators/operator.cpp`
//! and siblings).

use std::fmt;
use std::sync::Arc;

use crate::domain::bitmap::{Bitmap, CopyOnWriteBitmap};
use crate::domain::table::{ColumnValue, MetadataColumn, TablePartition};
use crate::invariant;
use crate::SiloError;

/// A single CPU predicate applied by [`Operator::Selection`]:
/// `column <op> constant`.
#[derive(Debug, Clone)]
pub struct ColumnPredicate {
    pub column: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(ColumnValue),
    Lt(ColumnValue),
    Le(ColumnValue),
    Gt(ColumnValue),
    Ge(ColumnValue),
    Ne(ColumnValue),
}

impl Predicate {
    fn matches(&self, value: &ColumnValue) -> bool {
        match self {
            Predicate::Eq(c) => compare(value, c) == Some(std::cmp::Ordering::Equal),
            Predicate::Ne(c) => compare(value, c) != Some(std::cmp::Ordering::Equal),
            Predicate::Lt(c) => compare(value, c) == Some(std::cmp::Ordering::Less),
            Predicate::Le(c) => matches!(
                compare(value, c),
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            ),
            Predicate::Gt(c) => compare(value, c) == Some(std::cmp::Ordering::Greater),
            Predicate::Ge(c) => matches!(
                compare(value, c),
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            ),
        }
    }
}

/// `None` when either side is a missing (`None`) value, or the two values
/// are of different native types - such comparisons never match.
fn compare(a: &ColumnValue, b: &ColumnValue) -> Option<std::cmp::Ordering> {
    use ColumnValue::*;
    match (a, b) {
        (Date(Some(a)), Date(Some(b))) => a.partial_cmp(b),
        (Int(Some(a)), Int(Some(b))) => a.partial_cmp(b),
        (Float(Some(a)), Float(Some(b))) => a.partial_cmp(b),
        (Bool(Some(a)), Bool(Some(b))) => a.partial_cmp(b),
        (IndexedString(Some(a)), IndexedString(Some(b))) => a.partial_cmp(b),
        _ => None,
    }
}

/// Which `CONTAINS`/`NOT_CONTAINS` test [`Operator::BitmapSelection`] runs
/// against the horizontal missing-symbol bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainsPredicate {
    Contains,
    NotContains,
}

/// Tag mirroring [`Operator`]'s variants, used by the simplifier to pattern
/// match on an already-compiled child without re-destructuring the whole
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Full,
    Empty,
    IndexScan,
    Complement,
    Intersection,
    Union,
    Threshold,
    Selection,
    BitmapSelection,
    BitmapProducer,
}

/// The compiled bitmap-operator tree for one partition. Built once by
/// [`crate::query::expression::Expression::compile`], evaluated at most
/// once.
pub enum Operator<'a> {
    Full(u32),
    Empty(u32),
    IndexScan(&'a Bitmap, u32),
    Complement(Box<Operator<'a>>, u32),
    Intersection {
        pos: Vec<Operator<'a>>,
        neg: Vec<Operator<'a>>,
        n: u32,
    },
    Union {
        children: Vec<Operator<'a>>,
        n: u32,
    },
    Threshold {
        pos: Vec<Operator<'a>>,
        neg: Vec<Operator<'a>>,
        k: u32,
        exact: bool,
        n: u32,
    },
    Selection {
        predicates: Vec<ColumnPredicate>,
        child: Option<Box<Operator<'a>>>,
        partition: &'a TablePartition,
        n: u32,
    },
    BitmapSelection {
        horizontal: &'a [Bitmap],
        predicate: ContainsPredicate,
        position: u32,
        n: u32,
    },
    BitmapProducer {
        produce: Arc<dyn Fn() -> Bitmap + Send + Sync + 'a>,
        n: u32,
    },
}

impl<'a> fmt::Debug for Operator<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_tree())
    }
}

impl<'a> Operator<'a> {
    pub fn row_count(&self) -> u32 {
        match self {
            Operator::Full(n)
            | Operator::Empty(n)
            | Operator::IndexScan(_, n)
            | Operator::Complement(_, n)
            | Operator::Intersection { n, .. }
            | Operator::Union { n, .. }
            | Operator::Threshold { n, .. }
            | Operator::Selection { n, .. }
            | Operator::BitmapSelection { n, .. }
            | Operator::BitmapProducer { n, .. } => *n,
        }
    }

    pub fn operator_type(&self) -> OperatorKind {
        match self {
            Operator::Full(_) => OperatorKind::Full,
            Operator::Empty(_) => OperatorKind::Empty,
            Operator::IndexScan(_, _) => OperatorKind::IndexScan,
            Operator::Complement(_, _) => OperatorKind::Complement,
            Operator::Intersection { .. } => OperatorKind::Intersection,
            Operator::Union { .. } => OperatorKind::Union,
            Operator::Threshold { .. } => OperatorKind::Threshold,
            Operator::Selection { .. } => OperatorKind::Selection,
            Operator::BitmapSelection { .. } => OperatorKind::BitmapSelection,
            Operator::BitmapProducer { .. } => OperatorKind::BitmapProducer,
        }
    }

    pub fn to_string_tree(&self) -> String {
        match self {
            Operator::Full(n) => format!("Full({n})"),
            Operator::Empty(n) => format!("Empty({n})"),
            Operator::IndexScan(_, n) => format!("IndexScan(n={n})"),
            Operator::Complement(child, _) => format!("Complement({})", child.to_string_tree()),
            Operator::Intersection { pos, neg, .. } => format!(
                "Intersection(pos=[{}], neg=[{}])",
                pos.iter().map(|c| c.to_string_tree()).collect::<Vec<_>>().join(", "),
                neg.iter().map(|c| c.to_string_tree()).collect::<Vec<_>>().join(", ")
            ),
            Operator::Union { children, .. } => format!(
                "Union([{}])",
                children.iter().map(|c| c.to_string_tree()).collect::<Vec<_>>().join(", ")
            ),
            Operator::Threshold { pos, neg, k, exact, .. } => format!(
                "Threshold(k={k}, exact={exact}, pos=[{}], neg=[{}])",
                pos.iter().map(|c| c.to_string_tree()).collect::<Vec<_>>().join(", "),
                neg.iter().map(|c| c.to_string_tree()).collect::<Vec<_>>().join(", ")
            ),
            Operator::Selection { predicates, child, .. } => format!(
                "Selection(predicates={}, child={})",
                predicates.len(),
                child.as_ref().map(|c| c.to_string_tree()).unwrap_or_else(|| "Full".to_string())
            ),
            Operator::BitmapSelection { position, predicate, .. } => {
                format!("BitmapSelection(position={position}, predicate={predicate:?})")
            }
            Operator::BitmapProducer { .. } => "BitmapProducer".to_string(),
        }
    }

    /// Negates this operator. Four variants have a cheap algebraic inverse;
    /// everything else wraps in [`Operator::Complement`].
    pub fn negate(self: Box<Self>) -> Box<Operator<'a>> {
        match *self {
            Operator::Full(n) => Box::new(Operator::Empty(n)),
            Operator::Empty(n) => Box::new(Operator::Full(n)),
            Operator::IndexScan(bitmap, n) => {
                Box::new(Operator::Complement(Box::new(Operator::IndexScan(bitmap, n)), n))
            }
            Operator::Complement(child, _) => child,
            other => {
                let n = other.row_count();
                Box::new(Operator::Complement(Box::new(other), n))
            }
        }
    }

    pub fn evaluate(&self) -> Result<CopyOnWriteBitmap<'a>, SiloError> {
        match self {
            Operator::Full(n) => Ok(CopyOnWriteBitmap::owned(Bitmap::full(*n))),
            Operator::Empty(_) => Ok(CopyOnWriteBitmap::owned(Bitmap::new())),
            Operator::IndexScan(bitmap, _) => Ok(CopyOnWriteBitmap::borrowed(bitmap)),
            Operator::Complement(child, n) => {
                let mut result = child.evaluate()?;
                result.get_mut().flip_range(0..*n);
                Ok(result)
            }
            Operator::Intersection { pos, neg, n } => evaluate_intersection(pos, neg, *n),
            Operator::Union { children, n } => evaluate_union(children, *n),
            Operator::Threshold { pos, neg, k, exact, n } => {
                evaluate_threshold(pos, neg, *k, *exact, *n)
            }
            Operator::Selection { predicates, child, partition, n } => {
                evaluate_selection(predicates, child.as_deref(), partition, *n)
            }
            Operator::BitmapSelection { horizontal, predicate, position, n } => {
                Ok(CopyOnWriteBitmap::owned(evaluate_bitmap_selection(
                    horizontal, *predicate, *position, *n,
                )))
            }
            Operator::BitmapProducer { produce, .. } => Ok(CopyOnWriteBitmap::owned(produce())),
        }
    }
}

/// `pos.len() + neg.len() >= 2` and `pos` non-empty is an invariant enforced
/// at construction by the compiler; evaluation asserts it rather than
/// silently producing a wrong answer.
fn evaluate_intersection<'a>(
    pos: &[Operator<'a>],
    neg: &[Operator<'a>],
    n: u32,
) -> Result<CopyOnWriteBitmap<'a>, SiloError> {
    invariant!(
        !pos.is_empty(),
        "Intersection requires at least one positive child"
    );
    invariant!(
        pos.len() + neg.len() >= 2,
        "Intersection requires at least two children in total"
    );

    let mut evaluated_pos: Vec<(u64, CopyOnWriteBitmap<'a>)> = pos
        .iter()
        .map(|op| op.evaluate().map(|b| (b.cardinality(), b)))
        .collect::<Result<_, _>>()?;
    evaluated_pos.sort_by_key(|(cardinality, _)| *cardinality);

    let mut evaluated_neg: Vec<(u64, CopyOnWriteBitmap<'a>)> = neg
        .iter()
        .map(|op| op.evaluate().map(|b| (b.cardinality(), b)))
        .collect::<Result<_, _>>()?;
    evaluated_neg.sort_by_key(|(cardinality, _)| std::cmp::Reverse(*cardinality));

    let mut iter = evaluated_pos.into_iter();
    let mut result = iter.next().map(|(_, b)| b).unwrap_or(CopyOnWriteBitmap::owned(Bitmap::full(n)));
    for (_, next) in iter {
        result.get_mut().intersect_with(next.as_ref());
    }
    for (_, next) in evaluated_neg {
        result.get_mut().subtract_assign(next.as_ref());
    }
    Ok(result)
}

fn evaluate_union<'a>(children: &[Operator<'a>], n: u32) -> Result<CopyOnWriteBitmap<'a>, SiloError> {
    if children.is_empty() {
        return Ok(CopyOnWriteBitmap::owned(Bitmap::new()));
    }
    let mut evaluated = children
        .iter()
        .map(|op| op.evaluate())
        .collect::<Result<Vec<_>, _>>()?;
    let mut iter = evaluated.drain(..);
    let mut result = iter.next().expect("checked non-empty above");
    for next in iter {
        result.get_mut().union_with(next.as_ref());
    }
    let _ = n;
    Ok(result)
}

/// Dynamic-programming threshold evaluation: `table[j]` accumulates the
/// rows matched by at least `j` of the children processed so far. When
/// `exact`, the table carries one extra slot so a final subtraction can
/// turn "at least k" into "exactly k" without a second pass over the
/// children.
fn evaluate_threshold<'a>(
    pos: &[Operator<'a>],
    neg: &[Operator<'a>],
    k: u32,
    exact: bool,
    n: u32,
) -> Result<CopyOnWriteBitmap<'a>, SiloError> {
    let total_children = pos.len() + neg.len();
    invariant!(
        k >= 1 && (k as usize) < total_children,
        "Threshold requires 1 <= k < number of children"
    );

    let mut evaluated: Vec<Bitmap> = Vec::with_capacity(total_children);
    for op in pos {
        evaluated.push(op.evaluate()?.into_owned());
    }
    for op in neg {
        let mut complement = op.evaluate()?.into_owned();
        complement.flip_range(0..n);
        evaluated.push(complement);
    }

    // table[j] = rows satisfied by >= j of the children seen so far. When
    // `exact`, the invariant above guarantees k + 1 <= total_children, so the
    // table is built one slot past k up front and the "exactly k" case falls
    // out of a single pass: at_least_k \ at_least_(k+1).
    let k = k as usize;
    let target = if exact { k + 2 } else { k + 1 }.min(total_children + 1);
    let mut table: Vec<Bitmap> = vec![Bitmap::full(n)];
    table.extend((1..target).map(|_| Bitmap::new()));

    for child in &evaluated {
        for j in (1..table.len()).rev() {
            let mut advanced = table[j - 1].intersect(child);
            advanced.union_with(&table[j]);
            table[j] = advanced;
        }
    }

    let at_least_k = table[k.min(table.len() - 1)].clone();
    if !exact {
        return Ok(CopyOnWriteBitmap::owned(at_least_k));
    }

    let mut result = at_least_k;
    result.subtract_assign(&table[k + 1]);
    Ok(CopyOnWriteBitmap::owned(result))
}

fn evaluate_selection<'a>(
    predicates: &[ColumnPredicate],
    child: Option<&Operator<'a>>,
    partition: &TablePartition,
    n: u32,
) -> Result<CopyOnWriteBitmap<'a>, SiloError> {
    let base = match child {
        Some(child) => child.evaluate()?.into_owned(),
        None => Bitmap::full(n),
    };
    if predicates.is_empty() {
        return Ok(CopyOnWriteBitmap::owned(base));
    }

    let mut columns = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        let column = partition.metadata_column(&predicate.column).ok_or_else(|| {
            SiloError::bad_request(format!("unknown column '{}'", predicate.column))
        })?;
        columns.push(column);
    }

    let mut result = Bitmap::new();
    for row in base.iter() {
        let matches = predicates.iter().zip(columns.iter()).all(|(predicate, column)| {
            row_matches(column, row, predicate)
        });
        if matches {
            result.add(row);
        }
    }
    Ok(CopyOnWriteBitmap::owned(result))
}

fn row_matches(column: &MetadataColumn, row: u32, predicate: &ColumnPredicate) -> bool {
    if row as usize >= column.len() {
        return false;
    }
    predicate.predicate.matches(&column.value(row))
}

fn evaluate_bitmap_selection(
    horizontal: &[Bitmap],
    predicate: ContainsPredicate,
    position: u32,
    n: u32,
) -> Bitmap {
    let mut result = Bitmap::new();
    for row in 0..n {
        let contains = horizontal
            .get(row as usize)
            .map(|bitmap| bitmap.contains(position))
            .unwrap_or(false);
        let matches = match predicate {
            ContainsPredicate::Contains => contains,
            ContainsPredicate::NotContains => !contains,
        };
        if matches {
            result.add(row);
        }
    }
    result
}
