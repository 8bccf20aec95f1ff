//! Combining results that cover different time windows of one query.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tscache_model::{QueryResult, ScalarType, Table, TableKey, Value};

use crate::error::MergeError;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

// ── Precision ──────────────────────────────────────────────────

/// Largest gap between two results' time windows that still counts as
/// adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Precision {
    nanos: i64,
}

impl Precision {
    pub const NANOSECOND: Precision = Precision { nanos: 1 };
    pub const MICROSECOND: Precision = Precision { nanos: 1_000 };
    pub const MILLISECOND: Precision = Precision { nanos: 1_000_000 };
    pub const SECOND: Precision = Precision {
        nanos: NANOS_PER_SECOND,
    };
    pub const MINUTE: Precision = Precision {
        nanos: 60 * NANOS_PER_SECOND,
    };
    pub const HOUR: Precision = Precision {
        nanos: 3_600 * NANOS_PER_SECOND,
    };
    pub const DAY: Precision = Precision {
        nanos: 86_400 * NANOS_PER_SECOND,
    };

    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            nanos: nanos.max(0),
        }
    }

    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }
}

impl FromStr for Precision {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" | "n" => Ok(Self::NANOSECOND),
            "us" | "u" | "µ" | "µs" => Ok(Self::MICROSECOND),
            "ms" => Ok(Self::MILLISECOND),
            "s" => Ok(Self::SECOND),
            "m" => Ok(Self::MINUTE),
            "h" => Ok(Self::HOUR),
            "d" => Ok(Self::DAY),
            other => Err(MergeError::InvalidPrecision(other.to_string())),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

// ── Merge ──────────────────────────────────────────────────────

/// Output of [`merge_with_report`]: the merged results plus every reason a
/// result was kept apart from its neighbour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub results: Vec<QueryResult>,
    pub incompatibilities: Vec<MergeError>,
}

/// Merge `results`, logging incompatibilities.
pub fn merge(precision: Precision, results: impl IntoIterator<Item = QueryResult>) -> Vec<QueryResult> {
    let report = merge_with_report(precision, results);
    for err in &report.incompatibilities {
        tracing::warn!(error = %err, "results left unmerged");
    }
    report.results
}

/// Order results by time window and fold each run of adjacent, compatible
/// results into one. Each output result has its series in canonical order
/// and every series sorted by time.
pub fn merge_with_report(
    precision: Precision,
    results: impl IntoIterator<Item = QueryResult>,
) -> MergeReport {
    let mut ordered: Vec<(Option<(i64, i64)>, QueryResult)> = results
        .into_iter()
        .map(|r| (r.time_bounds(), r))
        .collect();
    ordered.sort_by_key(|(bounds, _)| *bounds);

    let mut report = MergeReport::default();
    let mut current: Option<Group> = None;

    for (bounds, result) in ordered {
        let Some(group) = current.as_mut() else {
            current = Some(Group::start(bounds, result));
            continue;
        };

        let adjacent = match (group.end, bounds) {
            (Some(end), Some((start, _))) => start.saturating_sub(end) <= precision.as_nanos(),
            _ => true,
        };
        if adjacent {
            match group.check(&result) {
                Ok(()) => {
                    group.absorb(bounds, result);
                    continue;
                }
                Err(err) => report.incompatibilities.push(err),
            }
        }

        if let Some(done) = current.replace(Group::start(bounds, result)) {
            done.finish(&mut report);
        }
    }

    if let Some(done) = current {
        done.finish(&mut report);
    }
    report
}

struct Series {
    columns: Vec<String>,
    types: Vec<Option<ScalarType>>,
    rows: Vec<Vec<Value>>,
}

struct Group {
    end: Option<i64>,
    series: BTreeMap<TableKey, Series>,
    errors: Vec<String>,
}

impl Group {
    fn start(bounds: Option<(i64, i64)>, result: QueryResult) -> Self {
        let mut group = Group {
            end: None,
            series: BTreeMap::new(),
            errors: Vec::new(),
        };
        group.absorb(bounds, result);
        group
    }

    /// Every series shared with the group must have the same columns and
    /// no conflicting column types.
    fn check(&self, result: &QueryResult) -> Result<(), MergeError> {
        for table in result.tables() {
            let key = table.key();
            let Some(existing) = self.series.get(&key) else {
                continue;
            };
            if existing.columns != table.columns() {
                return Err(MergeError::ColumnMismatch {
                    series: key.render(),
                    left: existing.columns.clone(),
                    right: table.columns().to_vec(),
                });
            }
            let types = existing.types.iter().zip(table.column_types());
            for (column, (left, right)) in existing.columns.iter().zip(types) {
                if let (Some(left), Some(right)) = (left, right) {
                    if left != right {
                        return Err(MergeError::TypeMismatch {
                            series: key.render(),
                            column: column.clone(),
                            left: *left,
                            right: *right,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn absorb(&mut self, bounds: Option<(i64, i64)>, result: QueryResult) {
        if let Some((_, end)) = bounds {
            self.end = Some(self.end.map_or(end, |e| e.max(end)));
        }
        if let Some(err) = result.error() {
            self.errors.push(err.to_string());
        }

        for table in result.into_tables() {
            let (key, columns, types, rows) = table.into_parts();
            match self.series.get_mut(&key) {
                Some(series) => {
                    for (known, new) in series.types.iter_mut().zip(types) {
                        if known.is_none() {
                            *known = new;
                        }
                    }
                    let existing = std::mem::take(&mut series.rows);
                    series.rows = merge_rows(existing, rows);
                }
                None => {
                    let series = Series {
                        columns,
                        types,
                        rows: merge_rows(Vec::new(), rows),
                    };
                    self.series.insert(key, series);
                }
            }
        }
    }

    fn finish(self, report: &mut MergeReport) {
        let mut tables = Vec::with_capacity(self.series.len());
        for (key, series) in self.series {
            let built = match series.types.iter().copied().collect::<Option<Vec<_>>>() {
                Some(types) => {
                    Table::with_types(key.measurement, key.tags, series.columns, types, series.rows)
                }
                None => Table::new(key.measurement, key.tags, series.columns, series.rows),
            };
            match built {
                Ok(table) => tables.push(table),
                Err(err) => report.incompatibilities.push(err.into()),
            }
        }

        let result = if self.errors.is_empty() {
            QueryResult::new(tables)
        } else {
            QueryResult::with_error(tables, self.errors.join("; "))
        };
        report.results.push(result.sorted());
    }
}

/// Concatenate two row sets, stably sort by timestamp and drop rows whose
/// timestamp repeats the previous one. The earlier row wins.
pub(crate) fn merge_rows(left: Vec<Vec<Value>>, right: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut rows = left;
    rows.extend(right);
    rows.sort_by_key(|row| Table::row_time(row));
    rows.dedup_by(|later, earlier| {
        let t = Table::row_time(later);
        t.is_some() && t == Table::row_time(earlier)
    });
    rows
}
