//! Turn an old/new content pair into operations.
//!
//! Assumes the two strings differ in one contiguous region, which is what a
//! single keystroke burst, paste or cut produces. The changed region is found
//! by scanning the longest common prefix and then the longest common suffix
//! of what remains.

use crate::operation::Operation;

/// The single contiguous change between two strings, in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub start: usize,
    pub deleted_len: usize,
    pub inserted: String,
}

impl Splice {
    pub fn is_empty(&self) -> bool {
        self.deleted_len == 0 && self.inserted.is_empty()
    }

    /// A Delete (if anything was removed) followed by an Insert (if anything
    /// was added).
    pub fn into_operations(self) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(2);
        if self.deleted_len > 0 {
            ops.push(Operation::delete(self.start, self.deleted_len));
        }
        if !self.inserted.is_empty() {
            ops.push(Operation::insert(self.start, self.inserted));
        }
        ops
    }
}

/// Compute the minimal contiguous splice turning `old` into `new`.
pub fn splice(old: &str, new: &str) -> Splice {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // The suffix scan must not run back into the prefix on either side.
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Splice {
        start: prefix,
        deleted_len: old.len() - prefix - suffix,
        inserted: new[prefix..new.len() - suffix].iter().collect(),
    }
}

/// Operations that turn `old` into `new`. Empty when they are equal.
pub fn diff(old: &str, new: &str) -> Vec<Operation> {
    splice(old, new).into_operations()
}
