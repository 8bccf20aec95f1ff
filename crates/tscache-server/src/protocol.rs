//! Text protocol spoken by the cache.
//!
//! ```text
//! SET <key> <len> <start> <end> [<tables>]\r\n<len payload bytes>   -> STORED
//! GET <key> <start> <end>\r\n                                      -> <payloads>END
//! DELETE <key>\r\n                                                 -> DELETED | NOT_FOUND
//! ```
//!
//! Payloads are raw bytes bounded by their declared length and are never
//! followed by a terminator of their own. Errors are reported as
//! `CLIENT_ERROR <msg>` or `SERVER_ERROR <msg>` lines.

use std::io::{self, BufRead, Read, Write};

use crate::error::ServerError;

/// Longest accepted command line, keys included.
pub const MAX_LINE: usize = 1024 * 1024;

pub const END: &[u8] = b"END\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Set {
        key: String,
        start: i64,
        end: i64,
        table_count: i64,
        payload: Vec<u8>,
    },
    Get {
        key: String,
        start: i64,
        end: i64,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    Deleted,
    NotFound,
    /// Concatenated payloads, terminated by `END`. Empty on a miss.
    Values(Vec<u8>),
    ClientError(String),
    ServerError(String),
}

impl Response {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Response::Stored => w.write_all(b"STORED\r\n"),
            Response::Deleted => w.write_all(b"DELETED\r\n"),
            Response::NotFound => w.write_all(b"NOT_FOUND\r\n"),
            Response::Values(payload) => {
                w.write_all(payload)?;
                w.write_all(END)
            }
            Response::ClientError(msg) => write!(w, "CLIENT_ERROR {}\r\n", single_line(msg)),
            Response::ServerError(msg) => write!(w, "SERVER_ERROR {}\r\n", single_line(msg)),
        }
    }
}

fn single_line(msg: &str) -> String {
    msg.replace(['\r', '\n'], " ")
}

/// Read the next request. `Ok(None)` means the peer closed the connection
/// between requests.
pub fn read_request(
    reader: &mut impl BufRead,
    max_payload: usize,
) -> Result<Option<Request>, ServerError> {
    let mut line = Vec::new();
    let n = (&mut *reader).take(MAX_LINE as u64).read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(ServerError::Desync(format!(
            "command line exceeds {MAX_LINE} bytes or ends early"
        )));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let line = String::from_utf8(line)
        .map_err(|_| ServerError::BadCommand("command line is not utf-8".to_string()))?;
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let command = parts.next().unwrap_or_default().to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();

    match command.as_str() {
        "SET" => read_set(reader, &args, max_payload).map(Some),
        "GET" => {
            let [key, start, end] = args.as_slice() else {
                return Err(ServerError::BadCommand(
                    "usage: GET <key> <start> <end>".to_string(),
                ));
            };
            Ok(Some(Request::Get {
                key: key.to_string(),
                start: parse_i64("start", start)?,
                end: parse_i64("end", end)?,
            }))
        }
        "DELETE" => {
            let [key] = args.as_slice() else {
                return Err(ServerError::BadCommand("usage: DELETE <key>".to_string()));
            };
            Ok(Some(Request::Delete {
                key: key.to_string(),
            }))
        }
        "" => Err(ServerError::BadCommand("empty command".to_string())),
        other => Err(ServerError::BadCommand(format!("unknown command {other}"))),
    }
}

fn read_set(
    reader: &mut impl BufRead,
    args: &[&str],
    max_payload: usize,
) -> Result<Request, ServerError> {
    // Without a readable length the payload cannot be skipped.
    let (key, len, rest) = match args {
        [key, len, rest @ ..] => (*key, *len, rest),
        _ => {
            return Err(ServerError::Desync(
                "usage: SET <key> <len> <start> <end> [<tables>]".to_string(),
            ));
        }
    };
    let len: usize = len
        .parse()
        .map_err(|_| ServerError::Desync(format!("invalid payload length {len:?}")))?;
    if len > max_payload {
        return Err(ServerError::Desync(format!(
            "payload of {len} bytes exceeds limit of {max_payload}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let (start, end, table_count) = match rest {
        [start, end] => (start, end, None),
        [start, end, count] => (start, end, Some(count)),
        _ => {
            return Err(ServerError::BadCommand(
                "usage: SET <key> <len> <start> <end> [<tables>]".to_string(),
            ));
        }
    };
    Ok(Request::Set {
        key: key.to_string(),
        start: parse_i64("start", start)?,
        end: parse_i64("end", end)?,
        table_count: table_count.map_or(Ok(0), |c| parse_i64("tables", c))?,
        payload,
    })
}

fn parse_i64(name: &str, value: &str) -> Result<i64, ServerError> {
    value
        .parse()
        .map_err(|_| ServerError::BadCommand(format!("invalid {name} {value:?}")))
}
