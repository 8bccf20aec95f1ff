//! Query-level caching with per-series partial hits.

use std::collections::HashSet;

use tscache_core::{
    CacheEntry, FieldTypes, Precision, Segment, SegmentBuilder, decode, encode_segment,
    merge_with_report,
};
use tscache_model::QueryResult;
use tscache_query::{ParsedQuery, TimeWindow, parse_duration, parse_query};

use crate::client::CacheClient;
use crate::error::{CacheError, QueryError};

/// The time-series database behind the cache.
///
/// [`FieldTypes`] supplies column types for series that come back without
/// rows.
pub trait Database: FieldTypes {
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&self, query: &str) -> Result<QueryResult, Self::Error>;

    /// Series `query` would return. Rows are optional; only names, tags and
    /// columns are used. Implementations should answer this from metadata
    /// where the database allows it.
    fn series(&self, query: &str) -> Result<QueryResult, Self::Error> {
        self.execute(query)
    }

    /// Rows of `query` restricted to `window`, which always lies inside the
    /// query's own time range. The default runs the whole query and drops
    /// the rest; databases that can push the bound down should override it.
    fn execute_window(&self, query: &str, window: TimeWindow) -> Result<QueryResult, Self::Error> {
        Ok(self.execute(query)?.within(window.start, window.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The full segment was cached and covered the requested window.
    Hit,
    /// The full segment was cached but stopped short of the requested
    /// window; `fetched` uncovered ranges were read from the database and
    /// merged in.
    Extended { fetched: usize },
    /// The full segment missed and was rebuilt from cached sub-segments plus
    /// fresh series for the rest.
    Partial { hits: usize, misses: usize },
    /// Nothing was cached; the result came from the database.
    Miss,
    /// The cache was not consulted, or was unreachable.
    Bypass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub result: QueryResult,
    pub outcome: CacheOutcome,
}

enum Lookup {
    Hit(QueryResult),
    Miss,
    Unavailable,
}

pub struct SemanticCache<D> {
    db: D,
    client: CacheClient,
    precision: Precision,
}

impl<D: Database> SemanticCache<D> {
    pub fn new(db: D, client: CacheClient) -> Self {
        Self {
            db,
            client,
            precision: Precision::NANOSECOND,
        }
    }

    /// Largest distance between a window edge and the nearest cached row
    /// that still counts as covered. Queries with `GROUP BY time(i)` allow
    /// at least `i`.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    /// Answer `query` from the cache where possible.
    ///
    /// The full segment is tried first. Cached rows are clipped to the
    /// query's window, and window edges the cached rows do not reach are
    /// fetched from the database and merged in. On a miss each sub-segment
    /// is tried; a sub-segment that does not cover the window counts as
    /// missing. The database is queried once if any series is still
    /// missing, and the fresh sub-segments plus the completed full segment
    /// are written back. Corrupt entries count as misses and an unreachable
    /// cache falls back to the database.
    pub fn query(&self, query: &str) -> Result<CachedQuery, QueryError> {
        let parsed = parse_query(query)?;
        if !parsed.is_cacheable() {
            tracing::debug!(query, "row modifiers are not keyed, bypassing cache");
            return self.bypass(query);
        }

        let layout = self.db.series(query).map_err(database_error)?;
        if layout.is_empty() {
            return self.bypass(query);
        }
        let segment = SegmentBuilder::new(&self.db).build_parsed(&parsed, &layout)?;
        let window = parsed.time;
        let tolerance = self.tolerance(&parsed);

        match self.lookup(&segment.to_string(), window) {
            Lookup::Hit(cached) => {
                let gaps = uncovered(window, cached.time_bounds(), tolerance);
                let cached = cached.within(window.start, window.end);
                if gaps.is_empty() {
                    tracing::debug!(query, "full segment hit");
                    return Ok(CachedQuery {
                        result: cached,
                        outcome: CacheOutcome::Hit,
                    });
                }
                return self.extend(query, &segment, window, cached, &gaps);
            }
            Lookup::Miss => {}
            Lookup::Unavailable => return self.bypass(query),
        }

        let mut tables = Vec::new();
        let mut hits = 0;
        let mut missing = Vec::new();
        for sub in segment.sub_segments() {
            match self.lookup(&sub.to_string(), window) {
                Lookup::Hit(cached)
                    if uncovered(window, cached.time_bounds(), tolerance).is_empty() =>
                {
                    hits += 1;
                    tables.extend(cached.within(window.start, window.end).into_tables());
                }
                Lookup::Hit(_) | Lookup::Miss => missing.push(sub),
                Lookup::Unavailable => return self.bypass(query),
            }
        }

        if !missing.is_empty() {
            let fresh = self.db.execute(query).map_err(database_error)?;
            if fresh.error().is_some() {
                // Never cache a result the database flagged as incomplete.
                return Ok(CachedQuery {
                    result: fresh,
                    outcome: CacheOutcome::Miss,
                });
            }

            let wanted: HashSet<&str> = missing.iter().map(|s| s.series[0].as_str()).collect();
            for table in fresh.into_tables() {
                let series = table.key().render();
                if !wanted.contains(series.as_str()) {
                    continue;
                }
                let single = QueryResult::new(vec![table]);
                self.store(&segment.sub_segment(&series), &single, window);
                tables.extend(single.into_tables());
            }
        }

        let result = QueryResult::new(tables).sorted();
        self.store(&segment, &result, window);

        let outcome = if hits == 0 {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Partial {
                hits,
                misses: missing.len(),
            }
        };
        tracing::debug!(query, ?outcome, "query answered");
        Ok(CachedQuery { result, outcome })
    }

    /// Fill `gaps` in a cached full-segment result from the database and
    /// write the merged result back.
    fn extend(
        &self,
        query: &str,
        segment: &Segment,
        window: TimeWindow,
        cached: QueryResult,
        gaps: &[TimeWindow],
    ) -> Result<CachedQuery, QueryError> {
        let mut parts = vec![cached];
        for gap in gaps {
            let fresh = self.db.execute_window(query, *gap).map_err(database_error)?;
            if fresh.error().is_some() {
                return self.recompute(query);
            }
            parts.push(fresh);
        }

        // Every part lies inside one window, so adjacency never splits them.
        let mut report = merge_with_report(Precision::from_nanos(i64::MAX), parts);
        if !report.incompatibilities.is_empty() || report.results.len() != 1 {
            for err in &report.incompatibilities {
                tracing::warn!(query, error = %err, "cached rows disagree with fresh rows");
            }
            return self.recompute(query);
        }
        let Some(result) = report.results.pop() else {
            return self.recompute(query);
        };

        for table in result.tables() {
            let single = QueryResult::new(vec![table.clone()]);
            self.store(&segment.sub_segment(&table.key().render()), &single, window);
        }
        self.store(segment, &result, window);

        let outcome = CacheOutcome::Extended {
            fetched: gaps.len(),
        };
        tracing::debug!(query, ?outcome, "query answered");
        Ok(CachedQuery { result, outcome })
    }

    /// Run the whole query without touching the cache.
    fn recompute(&self, query: &str) -> Result<CachedQuery, QueryError> {
        Ok(CachedQuery {
            result: self.db.execute(query).map_err(database_error)?,
            outcome: CacheOutcome::Miss,
        })
    }

    fn tolerance(&self, parsed: &ParsedQuery) -> i64 {
        let interval = parsed
            .aggregation
            .interval
            .as_deref()
            .and_then(|i| parse_duration(i).ok())
            .unwrap_or(0);
        self.precision.as_nanos().max(interval)
    }

    /// Drop the full segment and every sub-segment of `query`. Returns how
    /// many keys were removed.
    pub fn invalidate(&self, query: &str) -> Result<usize, QueryError> {
        let parsed = parse_query(query)?;
        let layout = self.db.series(query).map_err(database_error)?;
        let segment = SegmentBuilder::new(&self.db).build_parsed(&parsed, &layout)?;

        let mut removed = 0;
        let keys = std::iter::once(segment.clone()).chain(segment.sub_segments());
        for key in keys {
            match self.client.delete(&key.to_string()) {
                Ok(()) => removed += 1,
                Err(CacheError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn bypass(&self, query: &str) -> Result<CachedQuery, QueryError> {
        Ok(CachedQuery {
            result: self.db.execute(query).map_err(database_error)?,
            outcome: CacheOutcome::Bypass,
        })
    }

    fn lookup(&self, key: &str, window: TimeWindow) -> Lookup {
        match self.client.get(key, window.start, window.end) {
            Ok(payload) => match decode(&payload) {
                Ok(result) => Lookup::Hit(result),
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt cache entry, recomputing");
                    if let Err(e) = self.client.delete(key) {
                        tracing::warn!(key, error = %e, "failed to drop corrupt entry");
                    }
                    Lookup::Miss
                }
            },
            Err(CacheError::NotFound) => Lookup::Miss,
            Err(e) => {
                tracing::warn!(error = %e, "cache unavailable, querying database directly");
                Lookup::Unavailable
            }
        }
    }

    /// Best-effort write of `result` under `segment`.
    fn store(&self, segment: &Segment, result: &QueryResult, window: TimeWindow) {
        let payload = match encode_segment(segment, result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(segment = %segment, error = %e, "result not cacheable");
                return;
            }
        };
        let entry = CacheEntry::from_result(segment.to_string(), payload, result, window);
        if let Err(e) = self.client.put(&entry) {
            tracing::warn!(key = %entry.key, error = %e, "cache put failed");
        }
    }
}

/// Edges of `window` that rows spanning `bounds` leave uncovered by more
/// than `tolerance`. Holes between cached rows are not detected.
fn uncovered(window: TimeWindow, bounds: Option<(i64, i64)>, tolerance: i64) -> Vec<TimeWindow> {
    let Some((first, last)) = bounds else {
        return vec![window];
    };
    let mut gaps = Vec::new();
    if first > window.start && first.saturating_sub(window.start) > tolerance {
        gaps.push(TimeWindow::new(window.start, first - 1));
    }
    if last < window.end && window.end.saturating_sub(last) > tolerance {
        gaps.push(TimeWindow::new(last + 1, window.end));
    }
    gaps
}

fn database_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> QueryError {
    QueryError::Database(Box::new(e))
}
