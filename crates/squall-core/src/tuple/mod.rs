//! # Tuple Module
//!
//! Fixed-width tuple layouts and the expressions that read them.
//!
//! A tuple is a densely packed byte record: a leading i64 timestamp,
//! followed by the remaining attributes at fixed byte offsets, followed by
//! a dummy padding footer that keeps tuples 8-byte aligned. The schema is
//! immutable once built; operators address attributes through
//! [`ColumnRef`]s that consult the schema for offsets and types.

mod expression;

pub use expression::{ColumnRef, ComparisonOp, Constant, Predicate};

use std::fmt;

/// Attribute type of one tuple column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 8-byte signed integer (timestamps are always `Long`).
    Long,
    /// 4-byte signed integer.
    Int,
    /// 4-byte IEEE-754 float.
    Float,
}

impl ColumnType {
    /// Byte width of a value of this type.
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            ColumnType::Long => 8,
            ColumnType::Int | ColumnType::Float => 4,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Long => write!(f, "long"),
            ColumnType::Int => write!(f, "int"),
            ColumnType::Float => write!(f, "float"),
        }
    }
}

/// Errors raised when constructing a tuple schema.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    /// A schema needs at least the timestamp column.
    #[error("schema must have at least one column")]
    Empty,

    /// The first column carries the tuple timestamp and must be `Long`.
    #[error("first column must be a long timestamp, got {0}")]
    LeadingTimestamp(ColumnType),

    /// A column reference addressed a column of the wrong type.
    #[error("column {index} is {actual}, expected {expected}")]
    ColumnType {
        /// Index of the offending column.
        index: usize,
        /// Type the schema records for it.
        actual: ColumnType,
        /// Type the caller required.
        expected: ColumnType,
    },
}

/// Fixed-width layout of a serialized tuple.
///
/// Holds the byte offset of every attribute, the total tuple size
/// (including the padding footer) and the padding bytes themselves.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleSchema {
    types: Vec<ColumnType>,
    offsets: Vec<usize>,
    payload_size: usize,
    tuple_size: usize,
    pad: Vec<u8>,
}

impl TupleSchema {
    /// Builds a schema from ordered column types.
    ///
    /// The first column must be a `Long` timestamp at offset 0. Tuples are
    /// padded out to a multiple of 8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for an empty column list or a non-`Long`
    /// leading column.
    pub fn new(types: Vec<ColumnType>) -> Result<Self, SchemaError> {
        let Some(&first) = types.first() else {
            return Err(SchemaError::Empty);
        };
        if first != ColumnType::Long {
            return Err(SchemaError::LeadingTimestamp(first));
        }

        let mut offsets = Vec::with_capacity(types.len());
        let mut offset = 0;
        for column in &types {
            offsets.push(offset);
            offset += column.size();
        }
        let payload_size = offset;
        let tuple_size = payload_size.next_multiple_of(8);
        Ok(Self {
            types,
            offsets,
            payload_size,
            tuple_size,
            pad: vec![0u8; tuple_size - payload_size],
        })
    }

    /// Number of columns, padding excluded.
    #[inline]
    #[must_use]
    pub fn columns(&self) -> usize {
        self.types.len()
    }

    /// Byte offset of column `index` within a tuple.
    #[inline]
    #[must_use]
    pub fn offset_of(&self, index: usize) -> usize {
        self.offsets[index]
    }

    /// Type of column `index`.
    #[inline]
    #[must_use]
    pub fn column_type(&self, index: usize) -> ColumnType {
        self.types[index]
    }

    /// Total serialized tuple size in bytes, padding included.
    #[inline]
    #[must_use]
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// The dummy padding footer appended to every tuple.
    #[inline]
    #[must_use]
    pub fn pad(&self) -> &[u8] {
        &self.pad
    }

    /// Checks that column `index` has the `expected` type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnType`] on a mismatch.
    pub fn expect_type(&self, index: usize, expected: ColumnType) -> Result<(), SchemaError> {
        let actual = self.column_type(index);
        if actual == expected {
            Ok(())
        } else {
            Err(SchemaError::ColumnType {
                index,
                actual,
                expected,
            })
        }
    }
}
