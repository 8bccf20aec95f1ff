//! Cache payload format.
//!
//! A payload is a sequence of blocks, one per series:
//!
//! ```text
//! <sub-segment> <8-byte big-endian body length>\r\n
//! [v0 v1 ...]\r\n
//! [v0 v1 ...]\r\n
//! ```
//!
//! Values are laid out in the column order of the segment's field list.
//! Integers are decimal, floats use the shortest text that parses back to
//! the same bits (a non-canonical NaN is written as `NaN:<hex bits>`),
//! booleans are `true`/`false` and strings are double-quoted with `"` and
//! `\` escaped. The body length makes CR/LF inside strings harmless.

use std::collections::HashMap;

use tscache_model::{QueryResult, ScalarType, Table, TableKey, Value};

use crate::error::{CodecError, SegmentError};
use crate::merge::merge_rows;
use crate::schema::{FieldTypes, NoSchema};
use crate::segment::{Segment, SegmentBuilder};

const CRLF: &[u8] = b"\r\n";
const LEN_BYTES: usize = 8;
const NAN_BITS_PREFIX: &str = "NaN:";
/// Bytes between the end of the sub-segment and the start of the body.
const HEADER_TAIL: usize = 1 + LEN_BYTES + CRLF.len();

// ── Encode ─────────────────────────────────────────────────────

/// Encode `result` under the segment derived from `query`, inferring
/// column types from values.
pub fn encode(query: &str, result: &QueryResult) -> Result<Vec<u8>, CodecError> {
    encode_with(&SegmentBuilder::new(NoSchema), query, result)
}

pub fn encode_with<S: FieldTypes>(
    builder: &SegmentBuilder<S>,
    query: &str,
    result: &QueryResult,
) -> Result<Vec<u8>, CodecError> {
    let segment = builder.build(query, result)?;
    encode_segment(&segment, result)
}

/// Encode `result` with one block per table, in canonical series order.
/// Every table must carry exactly the segment's fields, each with a matching
/// type. A column the segment does not name would be lost, so it is an error.
pub fn encode_segment(segment: &Segment, result: &QueryResult) -> Result<Vec<u8>, CodecError> {
    if segment.fields.is_empty() && !result.is_empty() {
        return Err(SegmentError::Malformed(format!("{segment}: series share no columns")).into());
    }

    let mut tables: Vec<(String, _)> = result
        .tables()
        .iter()
        .map(|t| (t.key().render(), t))
        .collect();
    tables.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    let mut body = Vec::new();
    for (series, table) in tables {
        let mut projection = Vec::with_capacity(segment.fields.len());
        for (name, expected) in &segment.fields {
            let idx = table
                .columns()
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| CodecError::MissingColumn {
                    series: series.clone(),
                    column: name.clone(),
                })?;
            if let Some(found) = table.column_types()[idx] {
                if found != *expected {
                    return Err(CodecError::TypeMismatch {
                        column: name.clone(),
                        expected: *expected,
                        found,
                    });
                }
            }
            projection.push(idx);
        }
        if let Some(extra) = table
            .columns()
            .iter()
            .find(|c| !segment.fields.iter().any(|(name, _)| name == *c))
        {
            return Err(CodecError::UnkeyedColumn {
                series,
                column: extra.clone(),
            });
        }

        body.clear();
        for row in table.rows() {
            write_row(&mut body, projection.iter().map(|&i| &row[i]));
        }

        out.extend_from_slice(segment.sub_segment(&series).to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&body);
    }
    Ok(out)
}

fn write_row<'a>(out: &mut Vec<u8>, values: impl Iterator<Item = &'a Value>) {
    out.push(b'[');
    for (i, value) in values.enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        write_value(out, value);
    }
    out.push(b']');
    out.extend_from_slice(CRLF);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Float(v) => write_float(out, *v),
        Value::Bool(v) => out.extend_from_slice(if *v { b"true" } else { b"false" }),
        Value::String(s) => {
            out.push(b'"');
            for &b in s.as_bytes() {
                if b == b'"' || b == b'\\' {
                    out.push(b'\\');
                }
                out.push(b);
            }
            out.push(b'"');
        }
    }
}

/// Shortest round-trip text for every float except a NaN other than the
/// canonical one, which is written as `NaN:` plus its bit pattern in hex.
fn write_float(out: &mut Vec<u8>, v: f64) {
    if v.is_nan() && v.to_bits() != f64::NAN.to_bits() {
        out.extend_from_slice(format!("{NAN_BITS_PREFIX}{:016x}", v.to_bits()).as_bytes());
    } else {
        out.extend_from_slice(format!("{v:?}").as_bytes());
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.strip_prefix(NAN_BITS_PREFIX) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .map(f64::from_bits)
            .filter(|v| v.is_nan()),
        None => text.parse().ok(),
    }
}

// ── Decode ─────────────────────────────────────────────────────

/// Decode a payload produced by [`encode`]. Blocks repeating a series are
/// folded into one table, ordered by time.
pub fn decode(payload: &[u8]) -> Result<QueryResult, CodecError> {
    let mut series: Vec<Block> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut pos = 0;

    while pos < payload.len() {
        let (segment, body_start, body_len) = read_header(payload, pos)?;
        let body_end = body_start + body_len;
        if body_end > payload.len() {
            return Err(CodecError::Truncated {
                needed: body_end,
                available: payload.len(),
            });
        }

        let rendered = segment.series[0].clone();
        let types = segment.column_types();
        let rows = read_rows(&payload[body_start..body_end], &rendered, &types)?;
        pos = body_end;

        match index.get(&rendered) {
            Some(&i) => {
                let block = &mut series[i];
                if block.segment.fields != segment.fields {
                    return Err(CodecError::MalformedHeader(format!(
                        "{rendered} repeated with different fields"
                    )));
                }
                let existing = std::mem::take(&mut block.rows);
                block.rows = merge_rows(existing, rows);
            }
            None => {
                index.insert(rendered, series.len());
                series.push(Block { segment, rows });
            }
        }
    }

    let mut tables = Vec::with_capacity(series.len());
    for block in series {
        let key = TableKey::parse(&block.segment.series[0])?;
        tables.push(Table::with_types(
            key.measurement,
            key.tags,
            block.segment.column_names(),
            block.segment.column_types(),
            block.rows,
        )?);
    }
    tracing::trace!(tables = tables.len(), bytes = payload.len(), "decoded payload");
    Ok(QueryResult::new(tables).sorted())
}

struct Block {
    segment: Segment,
    rows: Vec<Vec<Value>>,
}

enum HeaderScan {
    Found {
        segment: Segment,
        body_start: usize,
        body_len: usize,
    },
    /// A candidate header runs past the end of the buffer.
    Incomplete,
    Invalid,
}

/// Locate the header starting at `pos`. The sub-segment may itself contain
/// spaces, so every `} ` followed by a CRLF at the right offset is tried
/// until the prefix parses as a single-series segment.
fn scan_header(payload: &[u8], pos: usize) -> Result<HeaderScan, CodecError> {
    if payload[pos] != b'{' {
        return Err(CodecError::MalformedHeader(preview(&payload[pos..])));
    }

    let mut incomplete = false;
    for p in pos + 1..payload.len() {
        if payload[p] != b' ' || payload[p - 1] != b'}' {
            continue;
        }
        if p + HEADER_TAIL > payload.len() {
            incomplete = true;
            continue;
        }
        if &payload[p + 1 + LEN_BYTES..p + HEADER_TAIL] != CRLF {
            continue;
        }
        let Ok(text) = std::str::from_utf8(&payload[pos..p]) else {
            continue;
        };
        let Ok(segment) = text.parse::<Segment>() else {
            continue;
        };
        if segment.series.len() != 1 {
            continue;
        }

        let mut len = [0u8; LEN_BYTES];
        len.copy_from_slice(&payload[p + 1..p + 1 + LEN_BYTES]);
        let body_len = usize::try_from(u64::from_be_bytes(len))
            .map_err(|_| CodecError::MalformedHeader(format!("{text}: length overflow")))?;
        return Ok(HeaderScan::Found {
            segment,
            body_start: p + HEADER_TAIL,
            body_len,
        });
    }

    Ok(if incomplete {
        HeaderScan::Incomplete
    } else {
        HeaderScan::Invalid
    })
}

fn read_header(payload: &[u8], pos: usize) -> Result<(Segment, usize, usize), CodecError> {
    match scan_header(payload, pos)? {
        HeaderScan::Found {
            segment,
            body_start,
            body_len,
        } => Ok((segment, body_start, body_len)),
        HeaderScan::Incomplete => Err(CodecError::Truncated {
            needed: payload.len() + 1,
            available: payload.len(),
        }),
        HeaderScan::Invalid => Err(CodecError::MalformedHeader(preview(&payload[pos..]))),
    }
}

/// Total size of the block at the front of `buf` (header plus body), or
/// `None` while its header has not been fully received. Lets a reader pull
/// blocks off a stream without interpreting row data.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    match scan_header(buf, 0)? {
        HeaderScan::Found {
            body_start,
            body_len,
            ..
        } => body_start
            .checked_add(body_len)
            .map(Some)
            .ok_or_else(|| CodecError::MalformedHeader(preview(buf))),
        HeaderScan::Incomplete | HeaderScan::Invalid => Ok(None),
    }
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(64)]).into_owned()
}

fn read_rows(
    body: &[u8],
    series: &str,
    types: &[ScalarType],
) -> Result<Vec<Vec<Value>>, CodecError> {
    let mut rows = Vec::new();
    let mut cursor = Cursor { body, pos: 0 };
    while cursor.pos < body.len() {
        let row = rows.len();
        let malformed = |reason: String| CodecError::MalformedRow {
            series: series.to_string(),
            row,
            reason,
        };
        rows.push(cursor.row(types).map_err(malformed)?);
    }
    Ok(rows)
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn expect(&mut self, bytes: &[u8]) -> Result<(), String> {
        if self.body[self.pos..].starts_with(bytes) {
            self.pos += bytes.len();
            Ok(())
        } else {
            Err(format!(
                "expected {:?} at byte {}",
                String::from_utf8_lossy(bytes),
                self.pos
            ))
        }
    }

    fn row(&mut self, types: &[ScalarType]) -> Result<Vec<Value>, String> {
        self.expect(b"[")?;
        let mut values = Vec::with_capacity(types.len());
        for (i, ty) in types.iter().enumerate() {
            if i > 0 {
                self.expect(b" ")?;
            }
            values.push(self.value(*ty)?);
        }
        self.expect(b"]")?;
        self.expect(CRLF)?;
        Ok(values)
    }

    fn value(&mut self, ty: ScalarType) -> Result<Value, String> {
        let bad = |text: &str| format!("{text:?} is not a valid {ty}");
        match ty {
            ScalarType::String => self.string().map(Value::String),
            ScalarType::Int64 => {
                let text = self.token()?;
                text.parse().map(Value::Int).map_err(|_| bad(text))
            }
            ScalarType::Float64 => {
                let text = self.token()?;
                parse_float(text).map(Value::Float).ok_or_else(|| bad(text))
            }
            ScalarType::Bool => match self.token()? {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(bad(other)),
            },
        }
    }

    /// Bare value text up to the next separator.
    fn token(&mut self) -> Result<&'a str, String> {
        let body: &'a [u8] = self.body;
        let start = self.pos;
        while self.pos < body.len() && !matches!(body[self.pos], b' ' | b']') {
            self.pos += 1;
        }
        std::str::from_utf8(&body[start..self.pos]).map_err(|e| e.to_string())
    }

    fn string(&mut self) -> Result<String, String> {
        self.expect(b"\"")?;
        let mut bytes = Vec::new();
        loop {
            let Some(&b) = self.body.get(self.pos) else {
                return Err("unterminated string".to_string());
            };
            self.pos += 1;
            match b {
                b'"' => break,
                b'\\' => {
                    let Some(&escaped) = self.body.get(self.pos) else {
                        return Err("unterminated escape".to_string());
                    };
                    self.pos += 1;
                    bytes.push(escaped);
                }
                _ => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|e| e.to_string())
    }
}
