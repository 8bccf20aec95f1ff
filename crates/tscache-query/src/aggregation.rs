use serde::{Deserialize, Serialize};

const EMPTY: &str = "empty";

/// Aggregate function and GROUP BY time interval of a query. Either part may
/// be absent; both absent is the "empty" aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: Option<String>,
    pub interval: Option<String>,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.function.is_none() && self.interval.is_none()
    }

    /// Render as the `{SG}` body: `max,1m`, `mean,empty` or `empty,empty`.
    pub fn render(&self) -> String {
        format!(
            "{},{}",
            self.function.as_deref().unwrap_or(EMPTY),
            self.interval.as_deref().unwrap_or(EMPTY)
        )
    }
}
