use serde::{Deserialize, Serialize};
use tscache_model::ScalarType;
use tscache_model::escape::escape;

use crate::operator::Operator;

/// One non-time comparison from a WHERE clause.
///
/// `literal` keeps the source spelling (quotes, slashes) so that the
/// rendered predicate is stable across parses of the same query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub operator: Operator,
    pub literal: String,
    pub scalar_type: ScalarType,
}

impl Clause {
    /// Render as a `{SP}` element, e.g. `(usage_user>10[int64])`. Field and
    /// literal are escaped like series names.
    pub fn render(&self) -> String {
        format!(
            "({}{}{}[{}])",
            escape(&self.field),
            self.operator,
            escape(&self.literal),
            self.scalar_type
        )
    }
}
