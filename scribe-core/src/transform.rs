//! Inclusion transform for concurrent operations.
//!
//! Given `a` and `b` built against the same content, [`transform`] returns
//! `(a', b')` such that
//!
//! ```text
//! apply(apply(base, a), b') == apply(apply(base, b), a')
//! ```
//!
//! Every pairing of Insert, Delete, Retain and Sequence is covered. Ties
//! between insertions at the same position are broken by origin, so both
//! sides of a conversation reach the same answer without talking to each
//! other: `transform(b, a)` is always the swap of `transform(a, b)`.
//!
//! Text inserted inside a concurrently deleted range always survives. The
//! delete is split around it into a two-member sequence.

use std::cmp::Ordering;

use crate::operation::{Bias, Operation};

/// An operation tagged with the identity of whoever produced it.
#[derive(Debug, Clone, Copy)]
pub struct Tagged<'a> {
    pub op: &'a Operation,
    pub origin: &'a str,
}

impl<'a> Tagged<'a> {
    pub fn new(op: &'a Operation, origin: &'a str) -> Self {
        Self { op, origin }
    }
}

/// Transform two concurrent operations against each other.
///
/// `a_origin` and `b_origin` identify the producers; the lower origin wins
/// an insert/insert tie and is placed first.
pub fn transform(
    a: &Operation,
    a_origin: &str,
    b: &Operation,
    b_origin: &str,
) -> (Operation, Operation) {
    transform_tagged(Tagged::new(a, a_origin), Tagged::new(b, b_origin))
}

/// [`transform`] over pre-tagged operands.
pub fn transform_tagged(a: Tagged<'_>, b: Tagged<'_>) -> (Operation, Operation) {
    use Operation::*;

    match (a.op, b.op) {
        (Sequence { ops }, _) => {
            let mut other = b.op.clone();
            let mut out = Vec::with_capacity(ops.len());
            for op in ops {
                let (op2, other2) =
                    transform_tagged(Tagged::new(op, a.origin), Tagged::new(&other, b.origin));
                out.push(op2);
                other = other2;
            }
            (Sequence { ops: out }, other)
        }
        (_, Sequence { ops }) => {
            let mut other = a.op.clone();
            let mut out = Vec::with_capacity(ops.len());
            for op in ops {
                let (other2, op2) =
                    transform_tagged(Tagged::new(&other, a.origin), Tagged::new(op, b.origin));
                out.push(op2);
                other = other2;
            }
            (other, Sequence { ops: out })
        }

        // Retain changes nothing but its position still has to follow the
        // content, or a later bounds check rejects it.
        (Retain { position, length }, _) => (
            Operation::retain(b.op.transform_position(*position, Bias::Left), *length),
            b.op.clone(),
        ),
        (_, Retain { position, length }) => (
            a.op.clone(),
            Operation::retain(a.op.transform_position(*position, Bias::Left), *length),
        ),

        (
            Insert {
                position: ap,
                value: av,
            },
            Insert {
                position: bp,
                value: bv,
            },
        ) => {
            let a_first = match ap.cmp(bp) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => insert_tie_breaks_first(a.origin, av, b.origin, bv),
            };
            if a_first {
                (
                    a.op.clone(),
                    Operation::insert(bp + av.chars().count(), bv.clone()),
                )
            } else {
                (
                    Operation::insert(ap + bv.chars().count(), av.clone()),
                    b.op.clone(),
                )
            }
        }

        (
            Insert { position, value },
            Delete {
                position: dp,
                length: dl,
            },
        ) => insert_against_delete(*position, value, *dp, *dl),

        (
            Delete {
                position: dp,
                length: dl,
            },
            Insert { position, value },
        ) => {
            let (ins, del) = insert_against_delete(*position, value, *dp, *dl);
            (del, ins)
        }

        (
            Delete {
                position: ap,
                length: al,
            },
            Delete {
                position: bp,
                length: bl,
            },
        ) => {
            let overlap = (ap + al).min(bp + bl).saturating_sub(*ap.max(bp));
            (
                shrunk_delete(*ap, al - overlap, *bp, *bl),
                shrunk_delete(*bp, bl - overlap, *ap, *al),
            )
        }
    }
}

/// Total order for two insertions at the same position: lower origin first,
/// then lower value. Fully equal operands keep `a` first.
fn insert_tie_breaks_first(a_origin: &str, a_value: &str, b_origin: &str, b_value: &str) -> bool {
    match a_origin.cmp(b_origin) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a_value <= b_value,
    }
}

/// Returns `(insert', delete')`.
fn insert_against_delete(
    ins_pos: usize,
    value: &str,
    del_pos: usize,
    del_len: usize,
) -> (Operation, Operation) {
    let inserted = value.chars().count();
    let del_end = del_pos + del_len;

    if ins_pos <= del_pos {
        (
            Operation::insert(ins_pos, value),
            Operation::delete(del_pos + inserted, del_len),
        )
    } else if ins_pos >= del_end {
        (
            Operation::insert(ins_pos - del_len, value),
            Operation::delete(del_pos, del_len),
        )
    } else {
        // Strictly inside: delete around the inserted text.
        let before = ins_pos - del_pos;
        let after = del_len - before;
        (
            Operation::insert(del_pos, value),
            Operation::Sequence {
                ops: vec![
                    Operation::delete(del_pos, before),
                    Operation::delete(del_pos + inserted, after),
                ],
            },
        )
    }
}

/// A delete of `length` that started at `pos`, seen after the concurrent
/// delete `[other_pos, other_pos + other_len)` was applied.
fn shrunk_delete(pos: usize, length: usize, other_pos: usize, other_len: usize) -> Operation {
    let pos = if pos <= other_pos {
        pos
    } else if pos >= other_pos + other_len {
        pos - other_len
    } else {
        other_pos
    };
    if length == 0 {
        Operation::retain(pos, 0)
    } else {
        Operation::delete(pos, length)
    }
}

/// Transform `op` sequentially against a run of already-applied operations.
///
/// This is the server's catch-up path: `op` was built against the content
/// before `history[0]`, and the result applies after `history[last]`.
pub fn transform_against<'h, I>(op: &Operation, origin: &str, history: I) -> Operation
where
    I: IntoIterator<Item = Tagged<'h>>,
{
    history.into_iter().fold(op.clone(), |current, applied| {
        transform_tagged(Tagged::new(&current, origin), applied).0
    })
}
