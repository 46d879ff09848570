//! Request and reply types passed through to data nodes

use bytes::Bytes;
use std::fmt;

/// A single command: name followed by arguments, all binary-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Build from whitespace-free tokens, e.g. CLI arguments.
    pub fn from_args<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Command name, lossily decoded.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_uppercase())
            .unwrap_or_default()
    }
}

/// A reply from a data node or monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Status(String),
    Error(String),
    Int(i64),
    Bulk(Bytes),
    Array(Vec<Value>),
}

impl Value {
    /// Textual view of status and bulk replies.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Status(s) => Some(s),
            Value::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            other => other.as_str().and_then(|s| s.parse().ok()),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("(nil)"),
            Value::Status(s) => f.write_str(s),
            Value::Error(e) => write!(f, "(error) {}", e),
            Value::Int(n) => write!(f, "(integer) {}", n),
            Value::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Value::Array(items) => {
                if items.is_empty() {
                    return f.write_str("(empty array)");
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}
