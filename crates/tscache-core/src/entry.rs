use tscache_model::QueryResult;
use tscache_query::TimeWindow;

/// One stored payload with the window it is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub time_start: i64,
    pub time_end: i64,
    pub table_count: i64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, window: TimeWindow, table_count: i64) -> Self {
        Self {
            key: key.into(),
            value,
            time_start: window.start,
            time_end: window.end,
            table_count,
        }
    }

    /// Entry for an encoded `result`. The window spans the timestamps the
    /// result actually holds; `fallback` applies only when it holds no rows.
    pub fn from_result(
        key: impl Into<String>,
        value: Vec<u8>,
        result: &QueryResult,
        fallback: TimeWindow,
    ) -> Self {
        let window = result
            .time_bounds()
            .map_or(fallback, |(start, end)| TimeWindow::new(start, end));
        Self::new(key, value, window, result.tables().len() as i64)
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.time_start, self.time_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tscache_model::{Table, Value};

    #[test]
    fn window_comes_from_data() {
        let result = QueryResult::new(vec![
            Table::new(
                "cpu",
                [("hostname", "a")],
                vec!["time".into(), "v".into()],
                vec![
                    vec![Value::Int(150), Value::Int(1)],
                    vec![Value::Int(120), Value::Int(2)],
                ],
            )
            .unwrap(),
            Table::new(
                "cpu",
                [("hostname", "b")],
                vec!["time".into(), "v".into()],
                vec![vec![Value::Int(180), Value::Int(3)]],
            )
            .unwrap(),
        ]);
        let entry = CacheEntry::from_result("k", Vec::new(), &result, TimeWindow::new(0, 1_000));
        assert_eq!(entry.window(), TimeWindow::new(120, 180));
        assert_eq!(entry.table_count, 2);
    }

    #[test]
    fn rowless_result_uses_fallback() {
        let entry = CacheEntry::from_result(
            "k",
            Vec::new(),
            &QueryResult::default(),
            TimeWindow::new(5, 10),
        );
        assert_eq!(entry.window(), TimeWindow::new(5, 10));
        assert_eq!(entry.table_count, 0);
    }
}
