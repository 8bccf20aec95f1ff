//! Semantic segment keys.
//!
//! A segment is four brace-delimited parts joined by `#`:
//!
//! ```text
//! {(cpu.hostname=host_0)(cpu.hostname=host_1)}#{time[int64],usage_user[float64]}#{(usage_user>10[int64])}#{max,1m}
//!  └── SM: series ──────────────────────────┘  └── SF: fields ───────────────┘  └── SP: predicates ─┘  └ SG ┘
//! ```
//!
//! SM and SP are sorted sets. SF keeps column order, since payload rows are
//! laid out positionally against it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use tscache_model::escape::{escape, find_unescaped, split_unescaped, unescape};
use tscache_model::{QueryResult, ScalarType, TIME_COLUMN, Table};
use tscache_query::{ParsedQuery, parse_query};

use crate::error::SegmentError;
use crate::schema::{FieldTypes, NoSchema};

const PART_SEP: &str = "}#{";

// ── Segment ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    /// Rendered series keys, sorted and unique.
    pub series: Vec<String>,
    /// Column names with their types, in column order.
    pub fields: Vec<(String, ScalarType)>,
    /// Rendered non-time predicates, sorted and unique.
    pub predicates: Vec<String>,
    /// Rendered aggregation, `function,interval`.
    pub aggregation: String,
}

impl Segment {
    /// The same segment restricted to one series.
    pub fn sub_segment(&self, series: &str) -> Segment {
        Segment {
            series: vec![series.to_string()],
            fields: self.fields.clone(),
            predicates: self.predicates.clone(),
            aggregation: self.aggregation.clone(),
        }
    }

    /// One sub-segment per series, in series order.
    pub fn sub_segments(&self) -> Vec<Segment> {
        self.series.iter().map(|s| self.sub_segment(s)).collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn column_types(&self) -> Vec<ScalarType> {
        self.fields.iter().map(|(_, ty)| *ty).collect()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for s in &self.series {
            f.write_str(s)?;
        }
        f.write_str(PART_SEP)?;
        for (i, (name, ty)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}[{ty}]", escape(name))?;
        }
        f.write_str(PART_SEP)?;
        for p in &self.predicates {
            f.write_str(p)?;
        }
        f.write_str(PART_SEP)?;
        f.write_str(&self.aggregation)?;
        f.write_str("}")
    }
}

impl FromStr for Segment {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SegmentError::Malformed(s.to_string());
        let inner = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(malformed)?;

        let parts = split_unescaped(inner, PART_SEP);
        let [sm, sf, sp, sg] = parts.as_slice() else {
            return Err(malformed());
        };

        let series = split_elements(sm).ok_or_else(malformed)?;
        let predicates = split_elements(sp).ok_or_else(malformed)?;

        let mut fields = Vec::new();
        if !sf.is_empty() {
            for field in split_unescaped(sf, ",") {
                let (name, ty) = field
                    .strip_suffix(']')
                    .and_then(|f| f.rsplit_once('['))
                    .ok_or_else(malformed)?;
                let name = unescape(name).ok_or_else(malformed)?;
                let ty = ty.parse::<ScalarType>().map_err(|_| malformed())?;
                fields.push((name, ty));
            }
        }

        if !sg.contains(',') {
            return Err(malformed());
        }

        Ok(Segment {
            series,
            fields,
            predicates,
            aggregation: sg.to_string(),
        })
    }
}

/// Split a run of parenthesised elements `(a)(b)(c)`. Parens inside an
/// element are escaped, so every unescaped `)(` is a boundary.
fn split_elements(run: &str) -> Option<Vec<String>> {
    if run.is_empty() {
        return Some(Vec::new());
    }
    if !run.starts_with('(') || !run.ends_with(')') {
        return None;
    }
    let mut elements = Vec::new();
    let mut rest = run;
    while let Some(idx) = find_unescaped(rest, ")(") {
        elements.push(rest[..=idx].to_string());
        rest = &rest[idx + 1..];
    }
    elements.push(rest.to_string());
    Some(elements)
}

// ── SegmentBuilder ─────────────────────────────────────────────

/// Derives segments from a query and its result, consulting `schema` for
/// columns whose type the values do not reveal.
#[derive(Debug, Clone)]
pub struct SegmentBuilder<S = NoSchema> {
    schema: S,
}

impl Default for SegmentBuilder<NoSchema> {
    fn default() -> Self {
        Self::new(NoSchema)
    }
}

impl<S: FieldTypes> SegmentBuilder<S> {
    pub fn new(schema: S) -> Self {
        Self { schema }
    }

    pub fn build(&self, query: &str, result: &QueryResult) -> Result<Segment, SegmentError> {
        let parsed = parse_query(query)?;
        self.build_parsed(&parsed, result)
    }

    pub fn build_parsed(
        &self,
        parsed: &ParsedQuery,
        result: &QueryResult,
    ) -> Result<Segment, SegmentError> {
        let mut tables: Vec<(String, &Table)> = result
            .tables()
            .iter()
            .map(|t| (t.key().render(), t))
            .collect();
        tables.sort_by(|a, b| a.0.cmp(&b.0));

        let series: BTreeSet<String> = tables.iter().map(|(key, _)| key.clone()).collect();
        let ordered: Vec<&Table> = tables.iter().map(|(_, t)| *t).collect();
        let fields = self.common_fields(parsed, &ordered)?;
        let predicates: BTreeSet<String> = parsed.clauses.iter().map(|c| c.render()).collect();

        Ok(Segment {
            series: series.into_iter().collect(),
            fields,
            predicates: predicates.into_iter().collect(),
            aggregation: parsed.aggregation.render(),
        })
    }

    pub fn split(&self, query: &str, result: &QueryResult) -> Result<Vec<Segment>, SegmentError> {
        Ok(self.build(query, result)?.sub_segments())
    }

    /// Columns present in every table, in the column order of the first
    /// table in canonical order, each with its resolved type.
    fn common_fields(
        &self,
        parsed: &ParsedQuery,
        tables: &[&Table],
    ) -> Result<Vec<(String, ScalarType)>, SegmentError> {
        let Some(first) = tables.first() else {
            return Ok(Vec::new());
        };

        let mut fields = Vec::new();
        for column in first.columns() {
            if !tables.iter().all(|t| t.columns().contains(column)) {
                continue;
            }

            let mut resolved: Option<ScalarType> = None;
            for table in tables {
                let Some(idx) = table.columns().iter().position(|c| c == column) else {
                    continue;
                };
                match (resolved, table.column_types()[idx]) {
                    (None, found) => resolved = found,
                    (Some(left), Some(right)) if left != right => {
                        return Err(SegmentError::FieldTypeConflict {
                            field: column.clone(),
                            left,
                            right,
                        });
                    }
                    _ => {}
                }
            }

            let measurement = if first.name().is_empty() {
                parsed.measurement.as_str()
            } else {
                first.name()
            };
            let ty = resolved
                .or_else(|| self.schema.field_type(measurement, column))
                .or_else(|| (column == TIME_COLUMN).then_some(ScalarType::Int64))
                .ok_or_else(|| SegmentError::UntypedField {
                    measurement: measurement.to_string(),
                    field: column.clone(),
                })?;
            fields.push((column.clone(), ty));
        }
        Ok(fields)
    }
}

/// Full segment key for `query` and its `result`, inferring types from values.
pub fn build_segment(query: &str, result: &QueryResult) -> Result<String, SegmentError> {
    Ok(SegmentBuilder::new(NoSchema).build(query, result)?.to_string())
}

/// One segment key per series of `result`.
pub fn split_segment(query: &str, result: &QueryResult) -> Result<Vec<String>, SegmentError> {
    Ok(SegmentBuilder::new(NoSchema)
        .split(query, result)?
        .iter()
        .map(Segment::to_string)
        .collect())
}
