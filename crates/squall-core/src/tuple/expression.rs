//! Column references and predicates over serialized tuples.

use std::fmt;

use crate::buffer::Buffer;

use super::{ColumnType, TupleSchema};

/// A reference to one column of a tuple schema.
///
/// Evaluation is typed: the caller asks for the value as a concrete type
/// and the schema is consulted for the offset.
///
/// # Panics
///
/// The typed `eval_*` accessors panic when the referenced column has a
/// different type. Operator constructors validate column types up front,
/// so a mismatch at evaluation time is a broken invariant, not user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef(
    /// Zero-based column index within the schema.
    pub usize,
);

impl ColumnRef {
    /// Reads the column as an i64.
    #[inline]
    #[must_use]
    pub fn eval_long(self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) -> i64 {
        assert_eq!(schema.column_type(self.0), ColumnType::Long, "column {} is not long", self.0);
        buffer.get_long(tuple_offset + schema.offset_of(self.0))
    }

    /// Reads the column as an i32.
    #[inline]
    #[must_use]
    pub fn eval_int(self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) -> i32 {
        assert_eq!(schema.column_type(self.0), ColumnType::Int, "column {} is not int", self.0);
        buffer.get_int(tuple_offset + schema.offset_of(self.0))
    }

    /// Reads the column as an f32.
    #[inline]
    #[must_use]
    pub fn eval_float(self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) -> f32 {
        assert_eq!(schema.column_type(self.0), ColumnType::Float, "column {} is not float", self.0);
        buffer.get_float(tuple_offset + schema.offset_of(self.0))
    }

    /// The raw bytes of the column value, used for group-key hashing.
    #[inline]
    #[must_use]
    pub fn raw_bytes<'a>(
        self,
        buffer: &'a Buffer,
        schema: &TupleSchema,
        tuple_offset: usize,
    ) -> &'a [u8] {
        let column = self.0;
        buffer.slice(
            tuple_offset + schema.offset_of(column),
            schema.column_type(column).size(),
        )
    }

    /// Appends the raw column bytes to the cursor of `dest`.
    #[inline]
    pub fn append_to(
        self,
        buffer: &Buffer,
        schema: &TupleSchema,
        tuple_offset: usize,
        dest: &mut Buffer,
    ) {
        dest.put_bytes(self.raw_bytes(buffer, schema, tuple_offset));
    }
}

/// A typed constant operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    /// i64 constant.
    Long(i64),
    /// i32 constant.
    Int(i32),
    /// f32 constant.
    Float(f32),
}

/// Comparison operators for predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than or equal.
    Ge,
    /// Strictly greater than.
    Gt,
}

impl ComparisonOp {
    #[inline]
    fn test(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            ComparisonOp::Lt => ordering == Less,
            ComparisonOp::Le => ordering != Greater,
            ComparisonOp::Eq => ordering == Equal,
            ComparisonOp::Ne => ordering != Equal,
            ComparisonOp::Ge => ordering != Less,
            ComparisonOp::Gt => ordering == Greater,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Gt => ">",
        };
        write!(f, "{symbol}")
    }
}

/// A filter predicate evaluated against one tuple.
///
/// Used both by the selection operator and as the HAVING filter of the
/// aggregation operator (evaluated there against the aggregated output
/// schema). Composite predicates are explicit variants rather than a
/// visitor hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Compares a column against a constant.
    Compare {
        /// Column on the left-hand side.
        column: ColumnRef,
        /// Comparison operator.
        op: ComparisonOp,
        /// Constant on the right-hand side.
        value: Constant,
    },
    /// Satisfied when every child is satisfied.
    And(Vec<Predicate>),
    /// Satisfied when any child is satisfied.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Shorthand for a column/constant comparison.
    #[must_use]
    pub fn compare(column: ColumnRef, op: ComparisonOp, value: Constant) -> Self {
        Predicate::Compare { column, op, value }
    }

    /// Evaluates the predicate against the tuple at `tuple_offset`.
    ///
    /// # Panics
    ///
    /// Panics when a comparison mixes a column and a constant of different
    /// types; that is a construction error, not a data error.
    #[must_use]
    pub fn satisfied(&self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) -> bool {
        match self {
            Predicate::Compare { column, op, value } => {
                let ordering = match (schema.column_type(column.0), value) {
                    (ColumnType::Long, Constant::Long(rhs)) => {
                        column.eval_long(buffer, schema, tuple_offset).cmp(rhs)
                    }
                    (ColumnType::Int, Constant::Int(rhs)) => {
                        column.eval_int(buffer, schema, tuple_offset).cmp(rhs)
                    }
                    (ColumnType::Float, Constant::Float(rhs)) => column
                        .eval_float(buffer, schema, tuple_offset)
                        .partial_cmp(rhs)
                        .unwrap_or(std::cmp::Ordering::Greater),
                    (actual, _) => {
                        panic!("predicate compares {actual} column {} to {value:?}", column.0)
                    }
                };
                op.test(ordering)
            }
            Predicate::And(children) => children
                .iter()
                .all(|child| child.satisfied(buffer, schema, tuple_offset)),
            Predicate::Or(children) => children
                .iter()
                .any(|child| child.satisfied(buffer, schema, tuple_offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TupleSchema {
        TupleSchema::new(vec![ColumnType::Long, ColumnType::Int, ColumnType::Float]).unwrap()
    }

    fn tuple(buffer: &mut Buffer, ts: i64, count: i32, value: f32) {
        buffer.put_long(ts);
        buffer.put_int(count);
        buffer.put_float(value);
    }

    #[test]
    fn test_typed_eval() {
        let schema = schema();
        let mut buffer = Buffer::with_capacity(32);
        tuple(&mut buffer, 77, -3, 1.5);

        assert_eq!(ColumnRef(0).eval_long(&buffer, &schema, 0), 77);
        assert_eq!(ColumnRef(1).eval_int(&buffer, &schema, 0), -3);
        assert!((ColumnRef(2).eval_float(&buffer, &schema, 0) - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_append_to() {
        let schema = schema();
        let mut buffer = Buffer::with_capacity(32);
        tuple(&mut buffer, 77, -3, 1.5);

        let mut dest = Buffer::with_capacity(8);
        ColumnRef(1).append_to(&buffer, &schema, 0, &mut dest);
        assert_eq!(dest.get_int(0), -3);
    }

    #[test]
    fn test_compare_predicate() {
        let schema = schema();
        let mut buffer = Buffer::with_capacity(64);
        tuple(&mut buffer, 0, 10, 0.0);
        tuple(&mut buffer, 1, 60, 0.0);

        let lt50 = Predicate::compare(ColumnRef(1), ComparisonOp::Lt, Constant::Int(50));
        assert!(lt50.satisfied(&buffer, &schema, 0));
        assert!(!lt50.satisfied(&buffer, &schema, 16));
    }

    #[test]
    fn test_composite_predicates() {
        let schema = schema();
        let mut buffer = Buffer::with_capacity(32);
        tuple(&mut buffer, 5, 10, 2.0);

        let both = Predicate::And(vec![
            Predicate::compare(ColumnRef(1), ComparisonOp::Ge, Constant::Int(10)),
            Predicate::compare(ColumnRef(2), ComparisonOp::Lt, Constant::Float(3.0)),
        ]);
        assert!(both.satisfied(&buffer, &schema, 0));

        let either = Predicate::Or(vec![
            Predicate::compare(ColumnRef(1), ComparisonOp::Gt, Constant::Int(100)),
            Predicate::compare(ColumnRef(0), ComparisonOp::Eq, Constant::Long(5)),
        ]);
        assert!(either.satisfied(&buffer, &schema, 0));
    }

    #[test]
    #[should_panic(expected = "is not float")]
    fn test_type_mismatch_is_fatal() {
        let schema = schema();
        let mut buffer = Buffer::with_capacity(32);
        tuple(&mut buffer, 0, 1, 1.0);
        let _ = ColumnRef(1).eval_float(&buffer, &schema, 0);
    }
}
