use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tscache_server::{MemoryCache, Server, ServerConfig};

fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = ServerConfig::new(&addr);
    config.max_payload = 1024;
    let server = Server::new(MemoryCache::new(), config);
    thread::spawn(move || {
        server.serve().unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    addr
}

struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Conn {
    fn open(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    fn bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).unwrap();
        buf
    }

    fn set(&mut self, key: &str, start: i64, end: i64, payload: &[u8]) -> String {
        self.send(format!("SET {key} {} {start} {end} 1\r\n", payload.len()).as_bytes());
        self.send(payload);
        self.line()
    }
}

#[test]
fn set_then_get_returns_payload_and_end() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    let payload = b"row\r\nwith\r\nEND\r\nlookalike";
    assert_eq!(conn.set("seg", 100, 200, payload), "STORED\r\n");

    conn.send(b"GET seg 150 160\r\n");
    assert_eq!(conn.bytes(payload.len()), payload);
    assert_eq!(conn.line(), "END\r\n");
}

#[test]
fn miss_is_a_bare_end() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    conn.send(b"GET nothing 0 10\r\n");
    assert_eq!(conn.line(), "END\r\n");

    assert_eq!(conn.set("seg", 100, 200, b"x"), "STORED\r\n");
    conn.send(b"GET seg 201 300\r\n");
    assert_eq!(conn.line(), "END\r\n");
}

#[test]
fn overlapping_windows_are_concatenated() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    assert_eq!(conn.set("seg", 30, 60, b"late|"), "STORED\r\n");
    assert_eq!(conn.set("seg", 0, 29, b"early|"), "STORED\r\n");

    conn.send(b"GET seg 0 60\r\n");
    assert_eq!(conn.bytes(11), b"early|late|");
    assert_eq!(conn.line(), "END\r\n");
}

#[test]
fn delete() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    assert_eq!(conn.set("seg", 0, 1, b"x"), "STORED\r\n");
    conn.send(b"DELETE seg\r\n");
    assert_eq!(conn.line(), "DELETED\r\n");
    conn.send(b"DELETE seg\r\n");
    assert_eq!(conn.line(), "NOT_FOUND\r\n");
    conn.send(b"GET seg 0 1\r\n");
    assert_eq!(conn.line(), "END\r\n");
}

#[test]
fn bad_command_keeps_connection() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    conn.send(b"INCR seg 1\r\n");
    assert!(conn.line().starts_with("CLIENT_ERROR "));

    assert_eq!(conn.set("seg", 0, 1, b"x"), "STORED\r\n");
}

#[test]
fn oversized_set_closes_connection() {
    let addr = start_server();
    let mut conn = Conn::open(&addr);

    conn.send(b"SET seg 4096 0 1\r\n");
    assert!(conn.line().starts_with("CLIENT_ERROR "));
    assert_eq!(conn.line(), "");
}

#[test]
fn connections_share_the_cache() {
    let addr = start_server();
    let mut writer = Conn::open(&addr);
    let mut reader = Conn::open(&addr);

    assert_eq!(writer.set("shared", 0, 10, b"abc"), "STORED\r\n");
    reader.send(b"GET shared 0 10\r\n");
    assert_eq!(reader.bytes(3), b"abc");
    assert_eq!(reader.line(), "END\r\n");
}

#[test]
fn closed_connections_are_forgotten() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let server = Arc::new(Server::new(MemoryCache::new(), ServerConfig::new(&addr)));
    let serving = Arc::clone(&server);
    thread::spawn(move || {
        serving.serve().unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    for _ in 0..5 {
        let mut conn = Conn::open(&addr);
        conn.send(b"GET k 0 1\r\n");
        assert_eq!(conn.line(), "END\r\n");
    }

    // Each handler deregisters once it sees the client hang up.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.open_connections() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.open_connections(), 0);

    let mut conn = Conn::open(&addr);
    conn.send(b"GET k 0 1\r\n");
    assert_eq!(conn.line(), "END\r\n");
    assert_eq!(server.open_connections(), 1);
}
