use thiserror::Error;
use tscache_model::{ModelError, ScalarType};
use tscache_query::ParseError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentError {
    #[error("query parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("cannot infer type of field {field} in {measurement}")]
    UntypedField { measurement: String, field: String },
    #[error("field {field} is {left} in one series and {right} in another")]
    FieldTypeConflict {
        field: String,
        left: ScalarType,
        right: ScalarType,
    },
    #[error("malformed segment: {0}")]
    Malformed(String),
}

/// Payload could not be produced or trusted. On decode this means the cache
/// entry is corrupt and the result must be recomputed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("payload truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("malformed block header: {0}")]
    MalformedHeader(String),
    #[error("malformed row {row} of {series}: {reason}")]
    MalformedRow {
        series: String,
        row: usize,
        reason: String,
    },
    #[error("column {column}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: ScalarType,
        found: ScalarType,
    },
    #[error("series {series} has no column {column}")]
    MissingColumn { series: String, column: String },
    #[error("series {series} column {column} is not in the segment field list")]
    UnkeyedColumn { series: String, column: String },
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("unknown precision {0:?}")]
    InvalidPrecision(String),
    #[error("series {series}: columns {left:?} and {right:?} differ")]
    ColumnMismatch {
        series: String,
        left: Vec<String>,
        right: Vec<String>,
    },
    #[error("series {series} column {column}: {left} and {right} differ")]
    TypeMismatch {
        series: String,
        column: String,
        left: ScalarType,
        right: ScalarType,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}
