//! Portable values exchanged between execution contexts and nodes.
//!
//! A [`Value`] never holds interpreter pointers, so it can be moved across
//! threads and handed to other nodes. Script-side values are converted with
//! the functions in [`crate::codec`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::future::FutureHandle;

/// Arguments of one call, or the (possibly multi-valued) result of one future.
///
/// Order is significant and is preserved by every transformation.
pub type ArgList = Vec<Value>;

/// Mapping used by [`Value::Table`].
pub type TableMap = BTreeMap<Key, Value>;

/// Portable tagged union of everything that can cross the async boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value (`nil`).
    Empty,
    /// Double precision number.
    Number(f64),
    /// UTF-8 text. Function bytecode travels as a marked string.
    String(String),
    /// Sequence keyed by the contiguous integers `1..=n` on the script side.
    Array(Vec<Value>),
    /// Any other mapping.
    Table(TableMap),
    /// Handle to an eventual [`ArgList`].
    FutureRef(FutureHandle),
}

impl Value {
    /// Convenience constructor for strings.
    pub fn string(text: impl Into<String>) -> Self {
        Value::String(text.into())
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Table(_) => "table",
            Value::FutureRef(_) => "future",
        }
    }

    /// Return the number if this is a [`Value::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(num) => Some(*num),
            _ => None,
        }
    }

    /// Return the text if this is a [`Value::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Return the handle if this is a [`Value::FutureRef`].
    pub fn as_future(&self) -> Option<&FutureHandle> {
        match self {
            Value::FutureRef(handle) => Some(handle),
            _ => None,
        }
    }

    /// Whether this value is a [`Value::FutureRef`].
    pub fn is_future(&self) -> bool {
        matches!(self, Value::FutureRef(_))
    }
}

impl From<f64> for Value {
    fn from(num: f64) -> Self {
        Value::Number(num)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<FutureHandle> for Value {
    fn from(handle: FutureHandle) -> Self {
        Value::FutureRef(handle)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "nil"),
            Value::Number(num) => write!(f, "{}", num),
            Value::String(text) => write!(f, "{:?}", text),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Table(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                write!(f, "}}")
            }
            Value::FutureRef(handle) => write!(f, "{:?}", handle),
        }
    }
}

/// Table key: a number or a string.
///
/// Numbers compare with [`f64::total_cmp`] and sort before strings, which
/// gives tables a deterministic iteration order.
#[derive(Debug, Clone)]
pub enum Key {
    /// Numeric key
    Number(f64),
    /// String key
    String(String),
}

impl Key {
    /// Return the number if this is a numeric key.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(num) => Some(*num),
            Key::String(_) => None,
        }
    }

    /// Convert back into a [`Value`].
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(num) => Value::Number(*num),
            Key::String(text) => Value::String(text.clone()),
        }
    }
}

impl From<f64> for Key {
    fn from(num: f64) -> Self {
        Key::Number(num)
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Key::String(text.to_string())
    }
}

impl From<String> for Key {
    fn from(text: String) -> Self {
        Key::String(text)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Number(_), Key::String(_)) => Ordering::Less,
            (Key::String(_), Key::Number(_)) => Ordering::Greater,
            (Key::String(a), Key::String(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(num) => write!(f, "{}", num),
            Key::String(text) => write!(f, "{}", text),
        }
    }
}

/// Whether the keys of `keys` are exactly `1..=n` for some `n >= 0`.
pub fn is_sequence<'a>(keys: impl Iterator<Item = &'a Key>) -> bool {
    let mut expected = 1.0;
    for key in keys {
        match key {
            Key::Number(num) if *num == expected => expected += 1.0,
            _ => return false,
        }
    }
    true
}
