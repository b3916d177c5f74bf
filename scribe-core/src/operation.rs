//! Edit primitives for a flat character sequence.
//!
//! Positions and lengths count `char`s, never bytes. An [`Operation`] is an
//! immutable value: applying it produces new content, transforming it
//! produces new operations.
//!
//! Wire shape (JSON, `type`-tagged):
//! ```text
//! {"type":"insert",   "position":3, "value":"abc"}
//! {"type":"delete",   "position":3, "length":2}
//! {"type":"retain",   "position":3, "length":0}
//! {"type":"sequence", "ops":[ ... ]}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an operation does not fit the content it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("position {position} out of bounds for content of length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("delete of {length} at {position} exceeds content of length {len}")]
    RangeOutOfBounds {
        position: usize,
        length: usize,
        len: usize,
    },
}

/// A single edit, or an ordered composition of edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Splice `value` in at `position`.
    Insert { position: usize, value: String },
    /// Remove `length` characters starting at `position`.
    Delete { position: usize, length: usize },
    /// Structural placeholder. Applies as the identity.
    Retain { position: usize, length: usize },
    /// Members applied in order, each against the result of the previous one.
    Sequence { ops: Vec<Operation> },
}

/// Which side of an insertion point a caret sticks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Stay before text inserted exactly at the caret.
    Left,
    /// Move past text inserted exactly at the caret.
    Right,
}

impl Operation {
    pub fn insert(position: usize, value: impl Into<String>) -> Self {
        Operation::Insert {
            position,
            value: value.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Operation::Delete { position, length }
    }

    pub fn retain(position: usize, length: usize) -> Self {
        Operation::Retain { position, length }
    }

    /// Compose `self` followed by `next` into one operation.
    ///
    /// Nested sequences are flattened so the result is at most one level deep.
    pub fn compose(self, next: Operation) -> Operation {
        let mut ops = Vec::new();
        for op in [self, next] {
            match op {
                Operation::Sequence { ops: inner } => ops.extend(inner),
                other => ops.push(other),
            }
        }
        Operation::Sequence { ops }
    }

    /// Characters inserted or removed (span covered, for Retain).
    ///
    /// For a sequence this is the sum over its members.
    pub fn len(&self) -> usize {
        match self {
            Operation::Insert { value, .. } => value.chars().count(),
            Operation::Delete { length, .. } | Operation::Retain { length, .. } => *length,
            Operation::Sequence { ops } => ops.iter().map(Operation::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start position of a primitive; the first member's for a sequence.
    pub fn position(&self) -> Option<usize> {
        match self {
            Operation::Insert { position, .. }
            | Operation::Delete { position, .. }
            | Operation::Retain { position, .. } => Some(*position),
            Operation::Sequence { ops } => ops.first().and_then(Operation::position),
        }
    }

    /// Whether applying this operation leaves any content unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { value, .. } => value.is_empty(),
            Operation::Delete { length, .. } => *length == 0,
            Operation::Retain { .. } => true,
            Operation::Sequence { ops } => ops.iter().all(Operation::is_noop),
        }
    }

    /// Net change in content length after applying this operation.
    pub fn len_delta(&self) -> i64 {
        match self {
            Operation::Insert { value, .. } => value.chars().count() as i64,
            Operation::Delete { length, .. } => -(*length as i64),
            Operation::Retain { .. } => 0,
            Operation::Sequence { ops } => ops.iter().map(Operation::len_delta).sum(),
        }
    }

    /// Apply to `content`, returning the edited copy.
    ///
    /// On error the input is left as it was.
    pub fn apply(&self, content: &str) -> Result<String, OperationError> {
        let mut out = content.to_owned();
        self.apply_to(&mut out)?;
        Ok(out)
    }

    fn apply_to(&self, content: &mut String) -> Result<(), OperationError> {
        match self {
            Operation::Insert { position, value } => {
                let at = byte_offset(content, *position)?;
                content.insert_str(at, value);
            }
            Operation::Delete { position, length } => {
                let len = content.chars().count();
                if position.saturating_add(*length) > len {
                    return Err(OperationError::RangeOutOfBounds {
                        position: *position,
                        length: *length,
                        len,
                    });
                }
                let start = byte_offset(content, *position)?;
                let end = byte_offset(content, position + length)?;
                content.replace_range(start..end, "");
            }
            Operation::Retain { .. } => {}
            Operation::Sequence { ops } => {
                for op in ops {
                    op.apply_to(content)?;
                }
            }
        }
        Ok(())
    }

    /// Check that the operation fits content of `len` characters.
    pub fn validate(&self, len: usize) -> Result<(), OperationError> {
        match self {
            Operation::Insert { position, .. } | Operation::Retain { position, .. } => {
                if *position > len {
                    return Err(OperationError::PositionOutOfBounds {
                        position: *position,
                        len,
                    });
                }
            }
            Operation::Delete { position, length } => {
                if position.saturating_add(*length) > len {
                    return Err(OperationError::RangeOutOfBounds {
                        position: *position,
                        length: *length,
                        len,
                    });
                }
            }
            Operation::Sequence { ops } => {
                let mut len = len as i64;
                for op in ops {
                    op.validate(len as usize)?;
                    len += op.len_delta();
                }
            }
        }
        Ok(())
    }

    /// Map a caret position through this operation.
    pub fn transform_position(&self, pos: usize, bias: Bias) -> usize {
        match self {
            Operation::Insert { position, value } => {
                let shifts = *position < pos || (*position == pos && bias == Bias::Right);
                if shifts {
                    pos + value.chars().count()
                } else {
                    pos
                }
            }
            Operation::Delete { position, length } => {
                if pos <= *position {
                    pos
                } else if pos >= position + length {
                    pos - length
                } else {
                    *position
                }
            }
            Operation::Retain { .. } => pos,
            Operation::Sequence { ops } => ops
                .iter()
                .fold(pos, |p, op| op.transform_position(p, bias)),
        }
    }

    /// Clamp positions and lengths so the operation fits content of `len`
    /// characters. Used when replaying edits against a fresh snapshot.
    pub fn clamp(&self, len: usize) -> Operation {
        match self {
            Operation::Insert { position, value } => Operation::Insert {
                position: (*position).min(len),
                value: value.clone(),
            },
            Operation::Delete { position, length } => {
                let position = (*position).min(len);
                Operation::Delete {
                    position,
                    length: (*length).min(len - position),
                }
            }
            Operation::Retain { position, length } => Operation::Retain {
                position: (*position).min(len),
                length: *length,
            },
            Operation::Sequence { ops } => {
                let mut len = len as i64;
                let ops = ops
                    .iter()
                    .map(|op| {
                        let clamped = op.clamp(len as usize);
                        len += clamped.len_delta();
                        clamped
                    })
                    .collect();
                Operation::Sequence { ops }
            }
        }
    }
}

/// Byte offset of the `index`-th char (or the end, for `index == len`).
fn byte_offset(content: &str, index: usize) -> Result<usize, OperationError> {
    if index == 0 {
        return Ok(0);
    }
    let mut count = 0;
    for (offset, _) in content.char_indices() {
        if count == index {
            return Ok(offset);
        }
        count += 1;
    }
    if count == index {
        Ok(content.len())
    } else {
        Err(OperationError::PositionOutOfBounds {
            position: index,
            len: count,
        })
    }
}
