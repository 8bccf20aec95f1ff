use thiserror::Error;

/// Errors raised while extracting clauses from a query string.
///
/// A caller receiving one of these should run the query uncached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unexpected end of query, expected {0}")]
    UnexpectedEnd(&'static str),
    #[error("unexpected token {found:?}, expected {expected}")]
    Unexpected {
        found: String,
        expected: &'static str,
    },
    #[error("unterminated {0} literal")]
    Unterminated(&'static str),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("untyped literal: {0}")]
    UntypedLiteral(String),
    #[error("invalid regex {pattern}: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("invalid time literal: {0}")]
    InvalidTime(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("OR predicates cannot be cached")]
    Disjunction,
}
