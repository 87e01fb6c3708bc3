use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{Expr, Interpreter, ScriptResult, runtime_error};
use crate::future::FutureHandle;
use crate::guard::Guard;
use crate::transport::Locality;
use crate::value::{Key, is_sequence};

/// Shared, mutable script table.
pub type TableRef = Rc<RefCell<Table>>;

/// Signature of host-provided native functions.
pub type NativeFn = dyn Fn(&mut Interpreter, Vec<ScriptValue>) -> ScriptResult<Vec<ScriptValue>>;

/// Interpreter-native value.
#[derive(Clone)]
pub enum ScriptValue {
    /// `nil`
    Nil,
    /// Double precision number
    Number(f64),
    /// Immutable string
    Str(Rc<str>),
    /// Mutable table shared by reference
    Table(TableRef),
    /// Script-defined function
    Function(Rc<Function>),
    /// Host-defined function
    Native(Rc<NativeFunction>),
    /// Live future handle
    Future(FutureHandle),
    /// Guard handle
    Guard(Guard),
    /// Node identifier
    Locality(Locality),
}

impl ScriptValue {
    /// Build a string value.
    pub fn string(text: impl AsRef<str>) -> Self {
        ScriptValue::Str(Rc::from(text.as_ref()))
    }

    /// Build a fresh table holding `items` at keys `1..=n`.
    pub fn sequence(items: impl IntoIterator<Item = ScriptValue>) -> Self {
        ScriptValue::Table(Rc::new(RefCell::new(Table::from_sequence(items))))
    }

    /// `1` for true, `nil` for false.
    pub fn truth(flag: bool) -> Self {
        if flag {
            ScriptValue::Number(1.0)
        } else {
            ScriptValue::Nil
        }
    }

    /// Name of the value's type as reported by the `type` builtin.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Number(_) => "number",
            ScriptValue::Str(_) => "string",
            ScriptValue::Table(_) => "table",
            ScriptValue::Function(_) | ScriptValue::Native(_) => "function",
            ScriptValue::Future(_) => "future",
            ScriptValue::Guard(_) => "guard",
            ScriptValue::Locality(_) => "locality",
        }
    }

    /// Only `nil` is false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil)
    }

    /// Whether the value is `nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Whether the value can be called.
    pub fn is_callable(&self) -> bool {
        matches!(self, ScriptValue::Function(_) | ScriptValue::Native(_))
    }

    /// Return the number, if any.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(num) => Some(*num),
            _ => None,
        }
    }

    /// Return the string, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Convert to a table key. Only numbers and strings are valid keys.
    pub fn to_key(&self) -> ScriptResult<Key> {
        match self {
            ScriptValue::Number(num) if num.is_nan() => Err(runtime_error("table index is NaN")),
            ScriptValue::Number(num) => Ok(Key::Number(*num)),
            ScriptValue::Str(text) => Ok(Key::String(text.to_string())),
            other => Err(runtime_error(format!(
                "invalid table key of type {}",
                other.type_name()
            ))),
        }
    }

    /// Reference equality for aggregates, value equality for primitives.
    pub fn raw_equal(&self, other: &ScriptValue) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::Str(a), ScriptValue::Str(b)) => a == b,
            (ScriptValue::Table(a), ScriptValue::Table(b)) => Rc::ptr_eq(a, b),
            (ScriptValue::Function(a), ScriptValue::Function(b)) => Rc::ptr_eq(a, b),
            (ScriptValue::Native(a), ScriptValue::Native(b)) => Rc::ptr_eq(a, b),
            (ScriptValue::Future(a), ScriptValue::Future(b)) => a.ptr_eq(b),
            (ScriptValue::Guard(a), ScriptValue::Guard(b)) => a.id() == b.id(),
            (ScriptValue::Locality(a), ScriptValue::Locality(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for ScriptValue {
    fn from(num: f64) -> Self {
        ScriptValue::Number(num)
    }
}

impl From<&str> for ScriptValue {
    fn from(text: &str) -> Self {
        ScriptValue::string(text)
    }
}

impl From<Key> for ScriptValue {
    fn from(key: Key) -> Self {
        match key {
            Key::Number(num) => ScriptValue::Number(num),
            Key::String(text) => ScriptValue::string(text),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Number(num) => write!(f, "{}", format_number(*num)),
            ScriptValue::Str(text) => write!(f, "{}", text),
            ScriptValue::Table(table) => write!(f, "table: {:p}", Rc::as_ptr(table)),
            ScriptValue::Function(func) => match &func.name {
                Some(name) => write!(f, "function: {}", name),
                None => write!(f, "function: {:p}", Rc::as_ptr(func)),
            },
            ScriptValue::Native(native) => write!(f, "builtin: {}", native.name),
            ScriptValue::Future(handle) => write!(f, "future: #{}", handle.id()),
            ScriptValue::Guard(guard) => write!(f, "guard: {}", guard.id()),
            ScriptValue::Locality(locality) => write!(f, "{}", locality),
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Str(text) => write!(f, "{:?}", text),
            other => write!(f, "{}", other),
        }
    }
}

/// Format integers without a fractional part.
pub fn format_number(num: f64) -> String {
    if num.fract() == 0.0 && num.abs() < 1e15 {
        format!("{}", num as i64)
    } else {
        format!("{}", num)
    }
}

/// Script table. Assigning `nil` removes the key.
#[derive(Default)]
pub struct Table {
    entries: BTreeMap<Key, ScriptValue>,
}

impl Table {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding `items` at keys `1..=n`, skipping `nil`s.
    pub fn from_sequence(items: impl IntoIterator<Item = ScriptValue>) -> Self {
        let mut table = Self::new();
        for (i, item) in items.into_iter().enumerate() {
            table.set(Key::Number((i + 1) as f64), item);
        }
        table
    }

    /// Read `key`; missing keys read as `nil`.
    pub fn get(&self, key: &Key) -> ScriptValue {
        self.entries.get(key).cloned().unwrap_or(ScriptValue::Nil)
    }

    /// Write `key`; `nil` removes it.
    pub fn set(&mut self, key: Key, value: ScriptValue) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Largest `n` such that keys `1..=n` are all present.
    pub fn len(&self) -> usize {
        let mut n = 0;
        while self.entries.contains_key(&Key::Number((n + 1) as f64)) {
            n += 1;
        }
        n
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether the keys are exactly `1..=n`.
    pub fn is_sequence(&self) -> bool {
        is_sequence(self.entries.keys())
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &ScriptValue)> {
        self.entries.iter()
    }

    /// Values at keys `1..=len()`.
    pub fn sequence_values(&self) -> Vec<ScriptValue> {
        (1..=self.len())
            .map(|i| self.get(&Key::Number(i as f64)))
            .collect()
    }
}

/// Script-defined function.
///
/// Functions do not capture local variables; free names resolve against the
/// globals of whichever interpreter calls them, which is what lets a dumped
/// function run unchanged in another context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Name given by `defn`, if any.
    pub name: Option<String>,
    /// Parameter names.
    pub params: Vec<String>,
    /// Body expressions; the last one produces the results.
    pub body: Vec<Expr>,
}

/// Host-defined function exposed to scripts.
pub struct NativeFunction {
    /// Global name the function was registered under.
    pub name: String,
    /// Implementation.
    pub func: Box<NativeFn>,
}

impl NativeFunction {
    /// Wrap a closure.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Interpreter, Vec<ScriptValue>) -> ScriptResult<Vec<ScriptValue>> + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_assignment_removes_keys() {
        let mut table = Table::from_sequence([ScriptValue::from(1.0), ScriptValue::from(2.0)]);
        assert_eq!(table.len(), 2);
        table.set(Key::Number(2.0), ScriptValue::Nil);
        assert_eq!(table.len(), 1);
        assert_eq!(table.entry_count(), 1);
    }

    #[test]
    fn numbers_format_like_integers_when_whole() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-1.5), "-1.5");
    }

    #[test]
    fn only_nil_is_false() {
        assert!(!ScriptValue::Nil.is_truthy());
        assert!(ScriptValue::Number(0.0).is_truthy());
        assert!(ScriptValue::string("").is_truthy());
    }
}
