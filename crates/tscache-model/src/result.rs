use serde::Serialize;

use crate::table::Table;

/// Outcome of one query: an ordered list of series plus an optional error
/// message reported by the database.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    tables: Vec<Table>,
    error: Option<String>,
}

impl QueryResult {
    pub fn new(tables: Vec<Table>) -> Self {
        Self {
            tables,
            error: None,
        }
    }

    pub fn with_error(tables: Vec<Table>, error: impl Into<String>) -> Self {
        Self {
            tables,
            error: Some(error.into()),
        }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_tables(self) -> Vec<Table> {
        self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows().len()).sum()
    }

    /// Earliest and latest timestamp over every row of every table.
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        self.tables
            .iter()
            .filter_map(Table::time_bounds)
            .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
    }

    /// Every table restricted to rows timestamped within `start..=end`.
    /// Tables left without rows are kept.
    pub fn within(&self, start: i64, end: i64) -> Self {
        Self {
            tables: self.tables.iter().map(|t| t.within(start, end)).collect(),
            error: self.error.clone(),
        }
    }

    /// The same result with its tables in canonical order: ascending by the
    /// rendered series key.
    pub fn sorted(self) -> Self {
        let mut keyed: Vec<(String, Table)> = self
            .tables
            .into_iter()
            .map(|t| (t.key().render(), t))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            tables: keyed.into_iter().map(|(_, t)| t).collect(),
            error: self.error,
        }
    }
}

impl FromIterator<Table> for QueryResult {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn series(host: &str, times: &[i64]) -> Table {
        Table::new(
            "cpu",
            [("host", host)],
            vec!["time".into(), "usage".into()],
            times
                .iter()
                .map(|t| vec![Value::Int(*t), Value::Float(1.5)])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn time_bounds_cover_all_tables() {
        let result = QueryResult::new(vec![series("a", &[5, 9]), series("b", &[2, 7])]);
        assert_eq!(result.time_bounds(), Some((2, 9)));
        assert_eq!(result.row_count(), 4);
    }

    #[test]
    fn time_bounds_none_without_rows() {
        let result = QueryResult::new(vec![series("a", &[])]);
        assert_eq!(result.time_bounds(), None);
    }

    #[test]
    fn sorted_orders_by_series_key() {
        let result = QueryResult::new(vec![series("b", &[1]), series("a", &[1])]).sorted();
        let hosts: Vec<&str> = result
            .tables()
            .iter()
            .map(|t| t.tags()["host"].as_str())
            .collect();
        assert_eq!(hosts, vec!["a", "b"]);
    }
}
