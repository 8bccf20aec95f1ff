use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::escape::{escape, split_once_unescaped, split_unescaped, unescape};
use crate::value::{ScalarType, Value};

/// Placeholder rendered in place of the tag list of an untagged series.
const NO_TAGS: &str = "empty";

// ── TableKey ───────────────────────────────────────────────────

/// Identity of one series: measurement plus its tag set.
///
/// Tags live in a `BTreeMap` so iteration is always sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
}

impl TableKey {
    pub fn new(measurement: impl Into<String>, tags: BTreeMap<String, String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
        }
    }

    /// Render as a `{SM}` element: `(cpu.host=a,region=eu)` or `(cpu.empty)`.
    /// Names are escaped, so `system.cpu` renders as `system\.cpu`.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.measurement.len() + 16);
        out.push('(');
        out.push_str(&escape(&self.measurement));
        out.push('.');
        if self.tags.is_empty() {
            out.push_str(NO_TAGS);
        } else {
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&escape(k));
                out.push('=');
                out.push_str(&escape(v));
            }
        }
        out.push(')');
        out
    }

    /// Parse a rendered `{SM}` element back into a key.
    pub fn parse(element: &str) -> Result<Self, ModelError> {
        let malformed = || ModelError::MalformedKey(element.to_string());
        let inner = element
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(malformed)?;
        let (measurement, tag_list) = split_once_unescaped(inner, ".").ok_or_else(malformed)?;
        let measurement = unescape(measurement).ok_or_else(malformed)?;
        if measurement.is_empty() {
            return Err(malformed());
        }

        let mut tags = BTreeMap::new();
        if tag_list != NO_TAGS {
            for pair in split_unescaped(tag_list, ",") {
                let (k, v) = split_once_unescaped(pair, "=").ok_or_else(malformed)?;
                let k = unescape(k).ok_or_else(malformed)?;
                let v = unescape(v).ok_or_else(malformed)?;
                tags.insert(k, v);
            }
        }
        Ok(Self::new(measurement, tags))
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ── Table ──────────────────────────────────────────────────────

/// One series of a query result.
///
/// Constructed through [`Table::new`] or [`Table::with_types`], which both
/// check that every row is as wide as the column list and that each column
/// holds a single scalar type. Tables are not mutated after construction.
#[derive(Debug, Clone, Serialize)]
pub struct Table {
    name: String,
    tags: BTreeMap<String, String>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    types: Vec<Option<ScalarType>>,
}

impl Table {
    /// Build a table, inferring column types from the row values.
    pub fn new<K, V>(
        name: impl Into<String>,
        tags: impl IntoIterator<Item = (K, V)>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, ModelError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let types = vec![None; columns.len()];
        Self::build(name.into(), collect_tags(tags), columns, rows, types)
    }

    /// Build a table whose column types are already known, e.g. from a
    /// cache payload header. Rows must agree with the declared types.
    pub fn with_types<K, V>(
        name: impl Into<String>,
        tags: impl IntoIterator<Item = (K, V)>,
        columns: Vec<String>,
        types: Vec<ScalarType>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, ModelError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        if types.len() != columns.len() {
            return Err(ModelError::TypeCount {
                table: name,
                expected: types.len(),
                found: columns.len(),
            });
        }
        let types = types.into_iter().map(Some).collect();
        Self::build(name, collect_tags(tags), columns, rows, types)
    }

    fn build(
        name: String,
        tags: BTreeMap<String, String>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        mut types: Vec<Option<ScalarType>>,
    ) -> Result<Self, ModelError> {
        if columns.is_empty() {
            return Err(ModelError::NoColumns { table: name });
        }

        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(ModelError::RowWidth {
                    table: name,
                    row: i,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            for (col, value) in row.iter().enumerate() {
                let found = value.scalar_type();
                match types[col] {
                    None => types[col] = Some(found),
                    Some(expected) if expected != found => {
                        return Err(ModelError::TypeConflict {
                            table: name,
                            column: columns[col].clone(),
                            expected,
                            found,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            name,
            tags,
            columns,
            rows,
            types,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Per-column type, `None` when the table has no rows and no declared types.
    pub fn column_types(&self) -> &[Option<ScalarType>] {
        &self.types
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.name.clone(), self.tags.clone())
    }

    /// Minimum and maximum of the first column when it holds integer timestamps.
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let mut bounds: Option<(i64, i64)> = None;
        for ts in self.rows.iter().filter_map(|row| row.first()?.as_i64()) {
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                None => (ts, ts),
            });
        }
        bounds
    }

    /// Timestamp of a row: its first value when that is an integer.
    pub fn row_time(row: &[Value]) -> Option<i64> {
        row.first().and_then(Value::as_i64)
    }

    /// The same series keeping only rows timestamped within `start..=end`.
    /// Rows without an integer timestamp are kept; column types carry over.
    pub fn within(&self, start: i64, end: i64) -> Table {
        let rows = self
            .rows
            .iter()
            .filter(|row| Self::row_time(row).is_none_or(|ts| start <= ts && ts <= end))
            .cloned()
            .collect();
        Table {
            name: self.name.clone(),
            tags: self.tags.clone(),
            columns: self.columns.clone(),
            rows,
            types: self.types.clone(),
        }
    }

    pub fn into_parts(self) -> (TableKey, Vec<String>, Vec<Option<ScalarType>>, Vec<Vec<Value>>) {
        (
            TableKey::new(self.name, self.tags),
            self.columns,
            self.types,
            self.rows,
        )
    }
}

// Value equality: column types are derived data and do not participate.
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tags == other.tags
            && self.columns == other.columns
            && self.rows == other.rows
    }
}

fn collect_tags<K, V>(tags: impl IntoIterator<Item = (K, V)>) -> BTreeMap<String, String>
where
    K: Into<String>,
    V: Into<String>,
{
    tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
