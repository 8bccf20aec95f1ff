use thiserror::Error;

use crate::value::ScalarType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("table {table} has no columns")]
    NoColumns { table: String },
    #[error("table {table} row {row}: expected {expected} values, found {found}")]
    RowWidth {
        table: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("table {table} column {column}: expected {expected}, found {found}")]
    TypeConflict {
        table: String,
        column: String,
        expected: ScalarType,
        found: ScalarType,
    },
    #[error("table {table}: {expected} column types for {found} columns")]
    TypeCount {
        table: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown scalar type: {0}")]
    UnknownType(String),
    #[error("malformed series key: {0}")]
    MalformedKey(String),
}
