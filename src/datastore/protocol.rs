//! RESP Wire Protocol
//!
//! Single responsibility: Encode and decode messages in the RESP2 wire format.
//!
//! # Wire Format
//!
//! ```text
//! +OK\r\n                     status
//! -ERR message\r\n            error
//! :42\r\n                     integer
//! $5\r\nhello\r\n             bulk string ($-1 = nil)
//! *2\r\n<value><value>        array (*-1 = nil)
//! ```
//!
//! Commands are always sent as an array of bulk strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{Command, Value};
use crate::error::{FailoverError, Result};

/// Largest bulk string we accept from a peer.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array we accept from a peer.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Deepest array nesting we accept from a peer.
const MAX_DEPTH: usize = 512;

/// Encode a command as an array of bulk strings.
pub fn encode_command(command: &Command, buf: &mut BytesMut) {
    write_header(buf, b'*', command.args().len() as i64);
    for arg in command.args() {
        write_bulk(buf, arg);
    }
}

/// Encode an arbitrary value. Used by servers and test fixtures.
pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Nil => buf.put_slice(b"$-1\r\n"),
        Value::Status(s) => write_line(buf, b'+', s.as_bytes()),
        Value::Error(e) => write_line(buf, b'-', e.as_bytes()),
        Value::Int(n) => write_header(buf, b':', *n),
        Value::Bulk(b) => write_bulk(buf, b),
        Value::Array(items) => {
            write_header(buf, b'*', items.len() as i64);
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}

/// Decode one complete value from the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything when more bytes are needed.
pub fn decode_value(buf: &mut BytesMut) -> Result<Option<Value>> {
    match parse(&buf[..], 0, 0)? {
        Some((value, used)) => {
            buf.advance(used);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Turn error replies into errors.
///
/// Only an unknown-command reply maps to `UnknownCommand`; callers rely on
/// that distinction to pick a fallback query.
pub(crate) fn reply_to_result(value: Value) -> Result<Value> {
    match value {
        Value::Error(message) => Err(classify_error(message)),
        other => Ok(other),
    }
}

fn classify_error(message: String) -> FailoverError {
    if message.starts_with("ERR unknown command")
        || message.starts_with("ERR unknown or disabled command")
    {
        FailoverError::UnknownCommand(message)
    } else {
        FailoverError::Server(message)
    }
}

fn write_header(buf: &mut BytesMut, kind: u8, n: i64) {
    write_line(buf, kind, n.to_string().as_bytes());
}

fn write_line(buf: &mut BytesMut, kind: u8, line: &[u8]) {
    buf.reserve(line.len() + 3);
    buf.put_u8(kind);
    buf.put_slice(line);
    buf.put_slice(b"\r\n");
}

fn write_bulk(buf: &mut BytesMut, data: &[u8]) {
    write_header(buf, b'$', data.len() as i64);
    buf.reserve(data.len() + 2);
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Parse the value starting at `pos`, returning it with the offset just past it.
/// `depth` is the number of enclosing arrays.
fn parse(data: &[u8], pos: usize, depth: usize) -> Result<Option<(Value, usize)>> {
    let Some(&kind) = data.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(data, pos + 1) else {
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((Value::Status(lossy(line)), next))),
        b'-' => Ok(Some((Value::Error(lossy(line)), next))),
        b':' => Ok(Some((Value::Int(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if len > MAX_BULK_LEN {
                return Err(FailoverError::ProtocolMismatch(format!(
                    "Bulk string too large: {} bytes",
                    len
                )));
            }
            let end = next + len as usize;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(FailoverError::ProtocolMismatch(
                    "Bulk string not terminated by CRLF".into(),
                ));
            }
            let bulk = Bytes::copy_from_slice(&data[next..end]);
            Ok(Some((Value::Bulk(bulk), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if count > MAX_ARRAY_LEN {
                return Err(FailoverError::ProtocolMismatch(format!(
                    "Array too large: {} elements",
                    count
                )));
            }
            if count > 0 && depth >= MAX_DEPTH {
                return Err(FailoverError::ProtocolMismatch(format!(
                    "Arrays nested deeper than {}",
                    MAX_DEPTH
                )));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse(data, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), cursor)))
        }
        other => Err(FailoverError::ProtocolMismatch(format!(
            "Unexpected type byte 0x{:02x}",
            other
        ))),
    }
}

fn read_line(data: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(start..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], start + end + 2))
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| FailoverError::ProtocolMismatch(format!("Invalid integer: {}", lossy(line))))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
