//! Revisioned plain-text document.

use crate::operation::{Operation, OperationError};

/// Room content plus the revision it was last committed at.
///
/// The room authority is the only writer that calls [`Document::commit`];
/// client replicas apply operations with [`Document::apply`] and adopt
/// server revisions with [`Document::advance_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    room_id: String,
    content: String,
    revision: u64,
    char_len: usize,
}

impl Document {
    /// An empty document at revision 0.
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            content: String::new(),
            revision: 0,
            char_len: 0,
        }
    }

    /// A document restored from a snapshot.
    pub fn from_snapshot(room_id: impl Into<String>, content: impl Into<String>, revision: u64) -> Self {
        let content = content.into();
        let char_len = content.chars().count();
        Self {
            room_id: room_id.into(),
            content,
            revision,
            char_len,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    /// Apply without touching the revision.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OperationError> {
        op.validate(self.char_len)?;
        self.content = op.apply(&self.content)?;
        self.char_len = (self.char_len as i64 + op.len_delta()) as usize;
        Ok(())
    }

    /// Apply and assign the next revision. Returns the new revision.
    pub fn commit(&mut self, op: &Operation) -> Result<u64, OperationError> {
        self.apply(op)?;
        self.revision += 1;
        log::trace!(
            "room {} committed revision {} ({} chars)",
            self.room_id,
            self.revision,
            self.char_len
        );
        Ok(self.revision)
    }

    /// Adopt a revision assigned elsewhere.
    pub fn advance_to(&mut self, revision: u64) {
        self.revision = revision;
    }
}
