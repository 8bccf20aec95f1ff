use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tscache_core::{CacheEntry, frame_len};

use crate::config::ClientConfig;
use crate::error::CacheError;

const END: &[u8] = b"END\r\n";
/// Longest reply line or block header accepted before the reply is
/// considered out of sync.
const MAX_LINE: usize = 1024 * 1024;

/// One cache-server connection. Commands are strictly request/reply, one in
/// flight at a time.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    op_timeout: Duration,
}

impl Connection {
    pub fn connect(config: &ClientConfig) -> Result<Self, CacheError> {
        let mut last_err = None;
        for addr in config.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    let writer = BufWriter::new(stream);
                    return Ok(Self {
                        reader,
                        writer,
                        op_timeout: config.op_timeout(),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => CacheError::Config(format!("{} resolves to no address", config.addr)),
        })
    }

    /// `SET <key> <len> <start> <end> <tables>` followed by the payload.
    pub fn set(&mut self, entry: &CacheEntry) -> Result<(), CacheError> {
        let deadline = Deadline::after(self.op_timeout);
        let head = format!(
            "SET {} {} {} {} {}\r\n",
            escape_key(&entry.key),
            entry.value.len(),
            entry.time_start,
            entry.time_end,
            entry.table_count
        );
        self.send(&deadline, &[head.as_bytes(), &entry.value])?;

        match self.read_line(&deadline)?.as_slice() {
            b"STORED\r\n" => Ok(()),
            other => Err(reply_error(other)),
        }
    }

    /// Payloads of every entry for `key` intersecting `start..=end`.
    ///
    /// The reply is pulled off the wire block by block: each block header
    /// declares its body length, so `END` is only recognised on a block
    /// boundary and row bytes are never scanned for terminators.
    pub fn get(&mut self, key: &str, start: i64, end: i64) -> Result<Vec<u8>, CacheError> {
        let deadline = Deadline::after(self.op_timeout);
        let head = format!("GET {} {start} {end}\r\n", escape_key(key));
        self.send(&deadline, &[head.as_bytes()])?;

        let mut payload = Vec::new();
        loop {
            let block_start = payload.len();
            let line = self.read_line(&deadline)?;
            if line == END {
                break;
            }
            if block_start == 0 && is_error_reply(&line) {
                return Err(reply_error(&line));
            }
            payload.extend_from_slice(&line);

            let total = loop {
                let block = &payload[block_start..];
                match frame_len(block).map_err(|e| CacheError::Protocol(e.to_string()))? {
                    Some(total) => break total,
                    None if block.len() > MAX_LINE => {
                        return Err(CacheError::Protocol("block header too long".to_string()));
                    }
                    None => {
                        let more = self.read_line(&deadline)?;
                        payload.extend_from_slice(&more);
                    }
                }
            };

            let received = payload.len() - block_start;
            if received > total {
                return Err(CacheError::Protocol(format!(
                    "block of {total} bytes overran by {}",
                    received - total
                )));
            }
            let body_at = payload.len();
            payload.resize(block_start + total, 0);
            self.read_exact(&deadline, &mut payload[body_at..])?;
        }

        if payload.is_empty() {
            Err(CacheError::NotFound)
        } else {
            Ok(payload)
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<(), CacheError> {
        let deadline = Deadline::after(self.op_timeout);
        let head = format!("DELETE {}\r\n", escape_key(key));
        self.send(&deadline, &[head.as_bytes()])?;

        match self.read_line(&deadline)?.as_slice() {
            b"DELETED\r\n" => Ok(()),
            other => Err(reply_error(other)),
        }
    }

    fn send(&mut self, deadline: &Deadline, parts: &[&[u8]]) -> Result<(), CacheError> {
        self.writer
            .get_ref()
            .set_write_timeout(Some(deadline.remaining()?))?;
        for part in parts {
            self.writer.write_all(part)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self, deadline: &Deadline) -> Result<Vec<u8>, CacheError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(deadline.remaining()?))?;
        let mut line = Vec::new();
        (&mut self.reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut line)?;
        match line.last() {
            Some(b'\n') => Ok(line),
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Some(_) if line.len() >= MAX_LINE => {
                Err(CacheError::Protocol("reply line too long".to_string()))
            }
            Some(_) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }

    fn read_exact(&mut self, deadline: &Deadline, buf: &mut [u8]) -> Result<(), CacheError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(deadline.remaining()?))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }
}

struct Deadline(Instant);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    fn remaining(&self) -> Result<Duration, CacheError> {
        match self.0.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(CacheError::Timeout),
        }
    }
}

fn is_error_reply(line: &[u8]) -> bool {
    line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR") || line.starts_with(b"ERROR")
}

fn reply_error(line: &[u8]) -> CacheError {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\r', '\n']);
    if text == "NOT_FOUND" {
        return CacheError::NotFound;
    }
    for prefix in ["CLIENT_ERROR", "SERVER_ERROR", "ERROR"] {
        if let Some(msg) = text.strip_prefix(prefix) {
            return CacheError::Server(msg.trim_start().to_string());
        }
    }
    CacheError::Protocol(format!("unexpected reply {text:?}"))
}

/// Percent-escape the bytes a key cannot carry on a command line.
pub fn escape_key(key: &str) -> Cow<'_, str> {
    let needs = |b: u8| b == b' ' || b == b'%' || b.is_ascii_control();
    if !key.bytes().any(needs) {
        return Cow::Borrowed(key);
    }
    let mut out = String::with_capacity(key.len() + 8);
    for ch in key.chars() {
        if ch.is_ascii() && needs(ch as u8) {
            out.push_str(&format!("%{:02X}", ch as u8));
        } else {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_without_specials_are_borrowed() {
        let key = "{(cpu.hostname=a)}#{time[int64]}#{}#{empty,empty}";
        assert!(matches!(escape_key(key), Cow::Borrowed(_)));
    }

    #[test]
    fn specials_are_escaped() {
        assert_eq!(
            escape_key("{(x='a b')}\r\n%é"),
            "{(x='a%20b')}%0D%0A%25é"
        );
    }

    #[test]
    fn reply_errors() {
        assert!(matches!(reply_error(b"NOT_FOUND\r\n"), CacheError::NotFound));
        assert!(matches!(
            reply_error(b"SERVER_ERROR out of memory\r\n"),
            CacheError::Server(msg) if msg == "out of memory"
        ));
        assert!(matches!(reply_error(b"WAT\r\n"), CacheError::Protocol(_)));
    }

    #[test]
    fn expired_deadline_times_out() {
        let deadline = Deadline(Instant::now());
        assert!(matches!(deadline.remaining(), Err(CacheError::Timeout)));
    }
}
