//! # scribe-core — operational transform for plain text
//!
//! The pieces every participant in an editing session shares:
//!
//! - [`operation`] — Insert / Delete / Retain primitives and sequences of them
//! - [`diff`] — old/new content to operations (single contiguous region)
//! - [`transform`] — reconcile two concurrent operations
//! - [`document`] — content + revision
//!
//! ## Convergence
//!
//! ```text
//!            base
//!          a /  \ b
//!           /    \
//!          ●      ●
//!        b' \    / a'
//!            \  /
//!           same text
//! ```
//!
//! `(a', b') = transform(a, b)`; both paths around the diamond produce
//! identical content.

pub mod diff;
pub mod document;
pub mod operation;
pub mod transform;

pub use diff::{diff, splice, Splice};
pub use document::Document;
pub use operation::{Bias, Operation, OperationError};
pub use transform::{transform, transform_against, transform_tagged, Tagged};
