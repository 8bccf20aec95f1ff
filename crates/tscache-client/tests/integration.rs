use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tscache_client::{
    CacheClient, CacheError, CacheOutcome, ClientConfig, Database, SemanticCache,
};
use tscache_core::{
    CacheEntry, FieldTypes, Precision, build_segment, decode, encode, split_segment,
};
use tscache_model::{QueryResult, ScalarType, Table, Value};
use tscache_query::{TimeWindow, parse_query};
use tscache_server::{MemoryCache, Server, ServerConfig};

const QUERY: &str = "SELECT max(usage_user) FROM cpu WHERE usage_user > 10 \
                     AND time >= 60000000000 AND time <= 120000000000 GROUP BY hostname, time(1m)";

const MINUTE: i64 = 60_000_000_000;

fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let server = Server::new(MemoryCache::new(), ServerConfig::new(&addr));
    thread::spawn(move || {
        server.serve().unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    addr
}

fn client(addr: &str) -> CacheClient {
    CacheClient::new(ClientConfig {
        pool_size: 2,
        ..ClientConfig::new(addr)
    })
}

fn host(name: &str, rows: &[(i64, f64)]) -> Table {
    Table::new(
        "cpu",
        [("hostname", name)],
        vec!["time".into(), "max".into()],
        rows.iter()
            .map(|(t, v)| vec![Value::Int(*t), Value::Float(*v)])
            .collect(),
    )
    .unwrap()
}

fn two_hosts() -> QueryResult {
    QueryResult::new(vec![
        host("host_0", &[(60_000_000_000, 12.5), (120_000_000_000, 13.0)]),
        host("host_1", &[(60_000_000_000, 40.0)]),
    ])
}

/// Database holding a fixed data set. Each query gets the rows inside its
/// time window; executions are counted.
struct FakeDb {
    data: QueryResult,
    executions: AtomicUsize,
}

impl FakeDb {
    fn new(data: QueryResult) -> Self {
        Self {
            data,
            executions: AtomicUsize::new(0),
        }
    }

    fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl FieldTypes for FakeDb {
    fn field_type(&self, _measurement: &str, field: &str) -> Option<ScalarType> {
        (field == "max").then_some(ScalarType::Float64)
    }
}

impl Database for FakeDb {
    type Error = Infallible;

    fn execute(&self, query: &str) -> Result<QueryResult, Infallible> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let window = parse_query(query).map(|q| q.time).unwrap_or_default();
        Ok(self.data.within(window.start, window.end))
    }

    fn series(&self, _query: &str) -> Result<QueryResult, Infallible> {
        let layout: QueryResult = self
            .data
            .tables()
            .iter()
            .map(|t| {
                Table::new(t.name(), t.tags().clone(), t.columns().to_vec(), Vec::new()).unwrap()
            })
            .collect();
        Ok(layout)
    }
}

// ── Adapter ─────────────────────────────────────────────────

#[test]
fn put_then_get_decodes_to_the_same_result() {
    let addr = start_server();
    let client = client(&addr);
    let result = two_hosts();

    let key = build_segment(QUERY, &result).unwrap();
    let payload = encode(QUERY, &result).unwrap();
    let entry = CacheEntry::from_result(key.clone(), payload, &result, TimeWindow::unbounded());
    client.put(&entry).unwrap();

    let fetched = client.get(&key, entry.time_start, entry.time_end).unwrap();
    assert_eq!(decode(&fetched).unwrap(), result);

    // Idempotent: a second put of the same entry changes nothing.
    client.put(&entry).unwrap();
    let again = client.get(&key, entry.time_start, entry.time_end).unwrap();
    assert_eq!(again, fetched);
}

#[test]
fn payload_with_line_breaks_survives_the_wire() {
    let addr = start_server();
    let client = client(&addr);
    let result = QueryResult::new(vec![
        Table::new(
            "logs",
            [("app", "web server")],
            vec!["time".into(), "line".into()],
            vec![
                vec![Value::Int(1), Value::from("GET /\r\nEND\r\n")],
                vec![Value::Int(10), Value::from("{(logs.app=x)}#{} ")],
            ],
        )
        .unwrap(),
    ]);
    let query = "SELECT line FROM logs GROUP BY app";
    let key = build_segment(query, &result).unwrap();
    let entry = CacheEntry::from_result(
        key.clone(),
        encode(query, &result).unwrap(),
        &result,
        TimeWindow::unbounded(),
    );
    client.put(&entry).unwrap();

    let fetched = client.get(&key, 0, 100).unwrap();
    assert_eq!(fetched, entry.value);
    assert_eq!(decode(&fetched).unwrap(), result);
}

#[test]
fn missing_key_and_window() {
    let addr = start_server();
    let client = client(&addr);
    assert!(client.get("absent", 0, 10).unwrap_err().is_not_found());

    let result = two_hosts();
    let key = build_segment(QUERY, &result).unwrap();
    let entry = CacheEntry::from_result(
        key.clone(),
        encode(QUERY, &result).unwrap(),
        &result,
        TimeWindow::unbounded(),
    );
    client.put(&entry).unwrap();
    assert!(client.get(&key, 0, 59_999_999_999).unwrap_err().is_not_found());
}

#[test]
fn delete_removes_the_entry() {
    let addr = start_server();
    let client = client(&addr);
    let entry = CacheEntry::new("k", Vec::new(), TimeWindow::new(0, 1), 0);
    client.put(&entry).unwrap();
    client.delete("k").unwrap();
    assert!(client.delete("k").unwrap_err().is_not_found());
}

#[test]
fn overlapping_entries_fold_into_one_result() {
    let addr = start_server();
    let client = client(&addr);
    let early = QueryResult::new(vec![host("host_0", &[(1, 1.0), (2, 2.0)])]);
    let late = QueryResult::new(vec![host("host_0", &[(2, 2.0), (3, 3.0)])]);
    let key = build_segment(QUERY, &early).unwrap();

    for part in [&early, &late] {
        let entry = CacheEntry::from_result(
            key.clone(),
            encode(QUERY, part).unwrap(),
            part,
            TimeWindow::unbounded(),
        );
        client.put(&entry).unwrap();
    }

    let decoded = decode(&client.get(&key, 0, 10).unwrap()).unwrap();
    assert_eq!(decoded, QueryResult::new(vec![host("host_0", &[(1, 1.0), (2, 2.0), (3, 3.0)])]));
}

#[test]
fn timed_out_connection_is_discarded() {
    // Accepts connections and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    thread::spawn(move || {
        let mut open = Vec::new();
        for stream in listener.incoming() {
            counter.fetch_add(1, Ordering::SeqCst);
            open.push(stream);
        }
    });

    let client = CacheClient::new(ClientConfig {
        pool_size: 1,
        op_timeout_ms: 100,
        ..ClientConfig::new(&addr)
    });
    assert!(matches!(client.get("k", 0, 1), Err(CacheError::Timeout)));
    assert!(matches!(client.get("k", 0, 1), Err(CacheError::Timeout)));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(client.pool().idle(), 1);
}

#[test]
fn healthy_connection_is_reused() {
    let addr = start_server();
    let client = CacheClient::new(ClientConfig {
        pool_size: 1,
        ..ClientConfig::new(&addr)
    });
    assert!(client.get("a", 0, 1).unwrap_err().is_not_found());

    // A miss leaves the connection in sync, so it went back to the pool.
    let mut slot = client.pool().get().unwrap();
    assert!(slot.is_connected());
    let missing = slot.run(|conn| conn.get("b", 0, 1));
    assert!(missing.unwrap_err().is_not_found());
    assert!(slot.is_connected());
}

// ── Semantic cache ──────────────────────────────────────────

#[test]
fn miss_then_hit() {
    let addr = start_server();
    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client(&addr));

    let first = cache.query(QUERY).unwrap();
    assert_eq!(first.outcome, CacheOutcome::Miss);
    assert_eq!(first.result, two_hosts().sorted());

    let second = cache.query(QUERY).unwrap();
    assert_eq!(second.outcome, CacheOutcome::Hit);
    assert_eq!(second.result, first.result);
    assert_eq!(cache.database().executions(), 1);
}

#[test]
fn partial_hit_combines_cached_and_fresh_series() {
    let addr = start_server();
    let client = client(&addr);

    // Only host_0's sub-segment is cached beforehand.
    let result = two_hosts();
    let subs = split_segment(QUERY, &result).unwrap();
    let cached = QueryResult::new(vec![result.tables()[0].clone()]);
    let sub: tscache_core::Segment = subs[0].parse().unwrap();
    let entry = CacheEntry::from_result(
        subs[0].clone(),
        tscache_core::encode_segment(&sub, &cached).unwrap(),
        &cached,
        TimeWindow::unbounded(),
    );
    client.put(&entry).unwrap();

    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client);
    let answered = cache.query(QUERY).unwrap();
    assert_eq!(answered.outcome, CacheOutcome::Partial { hits: 1, misses: 1 });
    assert_eq!(answered.result.tables().len(), 2);
    assert_eq!(answered.result, two_hosts().sorted());

    // The completed full segment was written back.
    let again = cache.query(QUERY).unwrap();
    assert_eq!(again.outcome, CacheOutcome::Hit);
    assert_eq!(cache.database().executions(), 1);
}

#[test]
fn unreachable_cache_falls_back_to_database() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client(&addr));
    let answered = cache.query(QUERY).unwrap();
    assert_eq!(answered.outcome, CacheOutcome::Bypass);
    assert_eq!(answered.result, two_hosts());
}

#[test]
fn modifiers_bypass_the_cache() {
    let addr = start_server();
    let query = "SELECT usage_user FROM cpu LIMIT 10";
    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client(&addr));
    assert_eq!(cache.query(query).unwrap().outcome, CacheOutcome::Bypass);
    assert_eq!(cache.query(query).unwrap().outcome, CacheOutcome::Bypass);
    assert_eq!(cache.database().executions(), 2);
}

#[test]
fn parse_errors_are_surfaced() {
    let addr = start_server();
    let query = "SELECT v FROM cpu WHERE a = 1 OR b = 2";
    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client(&addr));
    assert!(matches!(
        cache.query(query),
        Err(tscache_client::QueryError::Parse(_))
    ));
    assert_eq!(cache.database().executions(), 0);
}

#[test]
fn invalidate_forces_a_recompute() {
    let addr = start_server();
    let cache = SemanticCache::new(FakeDb::new(two_hosts()), client(&addr));
    cache.query(QUERY).unwrap();

    // Full segment plus one sub-segment per host.
    assert_eq!(cache.invalidate(QUERY).unwrap(), 3);
    assert_eq!(cache.invalidate(QUERY).unwrap(), 0);
    assert_eq!(cache.query(QUERY).unwrap().outcome, CacheOutcome::Miss);
    assert_eq!(cache.database().executions(), 2);
}

// ── Time windows ────────────────────────────────────────────

/// One series with a point every 30 minutes from 0 to 3h.
fn half_hourly() -> QueryResult {
    QueryResult::new(vec![host(
        "host_0",
        &(0..7).map(|i| (i * 30 * MINUTE, i as f64)).collect::<Vec<_>>(),
    )])
}

fn window_query(start_minutes: i64, end_minutes: i64) -> String {
    format!(
        "SELECT max FROM cpu WHERE time >= {} AND time <= {} GROUP BY hostname",
        start_minutes * MINUTE,
        end_minutes * MINUTE
    )
}

#[test]
fn wider_window_fetches_only_the_uncovered_range() {
    let addr = start_server();
    let cache = SemanticCache::new(FakeDb::new(half_hourly()), client(&addr));

    let narrow = cache.query(&window_query(0, 60)).unwrap();
    assert_eq!(narrow.outcome, CacheOutcome::Miss);
    assert_eq!(narrow.result.row_count(), 3);

    let wide = cache.query(&window_query(0, 180)).unwrap();
    assert_eq!(wide.outcome, CacheOutcome::Extended { fetched: 1 });
    assert_eq!(wide.result, half_hourly());
    assert_eq!(cache.database().executions(), 2);

    // The merged rows were written back and now cover the wide window.
    let again = cache.query(&window_query(0, 180)).unwrap();
    assert_eq!(again.outcome, CacheOutcome::Hit);
    assert_eq!(again.result, half_hourly());
    assert_eq!(cache.database().executions(), 2);
}

#[test]
fn narrower_window_is_clipped_from_the_cached_rows() {
    let addr = start_server();
    let cache = SemanticCache::new(FakeDb::new(half_hourly()), client(&addr));
    cache.query(&window_query(0, 60)).unwrap();

    let narrow = cache.query(&window_query(0, 30)).unwrap();
    assert_eq!(narrow.outcome, CacheOutcome::Hit);
    assert_eq!(narrow.result.row_count(), 2);
    assert_eq!(narrow.result.time_bounds(), Some((0, 30 * MINUTE)));
    assert_eq!(cache.database().executions(), 1);
}

#[test]
fn precision_absorbs_ragged_edges() {
    let addr = start_server();
    let db = FakeDb::new(half_hourly());
    let cache = SemanticCache::new(db, client(&addr)).with_precision(Precision::HOUR);
    cache.query(&window_query(0, 60)).unwrap();

    // Last cached row is at 60m; 90m is within an hour of it.
    let answered = cache.query(&window_query(0, 90)).unwrap();
    assert_eq!(answered.outcome, CacheOutcome::Hit);
    assert_eq!(cache.database().executions(), 1);
}

#[test]
fn stale_sub_segment_counts_as_missing() {
    let addr = start_server();
    let client = client(&addr);

    // Only the first hour of host_0 is cached, under its sub-segment.
    let cached = half_hourly().within(0, 60 * MINUTE);
    let query = window_query(0, 180);
    let sub: tscache_core::Segment = split_segment(&query, &cached).unwrap()[0].parse().unwrap();
    let entry = CacheEntry::from_result(
        sub.to_string(),
        tscache_core::encode_segment(&sub, &cached).unwrap(),
        &cached,
        TimeWindow::unbounded(),
    );
    client.put(&entry).unwrap();

    let cache = SemanticCache::new(FakeDb::new(half_hourly()), client);
    let answered = cache.query(&query).unwrap();
    assert_eq!(answered.outcome, CacheOutcome::Miss);
    assert_eq!(answered.result, half_hourly());
}
