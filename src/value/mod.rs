//! Value Representation
//!
//! The scheduler treats every named variable as an opaque, serializable value.
//! This module supplies the concrete type the rest of the crate moves around:
//! a small tree of scalars, text, feature vectors, records and two-dimensional
//! grids of nested values.
//!
//! ## Operations the engine relies on
//! - **Merge**: commutative accumulation. Unset entries are filled from the
//!   other side, populated entries are never overwritten.
//! - **Slicing**: building a same-shaped grid that only carries selected rows
//!   or columns, everything else left unset.
//! - **Serialization**: `bincode` encoding for the wire and for files.

pub mod types;


pub use types::{Grid, MAX_ENCODED_BYTES, Value};
