//! Marshaling between interpreter-native values and portable [`Value`]s.
//!
//! Packing copies primitives, walks tables recursively and dumps script
//! functions to bytecode so nothing that crosses a thread or node boundary
//! refers into an interpreter. Values with no portable form fail with
//! [`Error::UnsupportedType`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::script::{self, Bytecode, ScriptValue, Table, TableRef};
use crate::value::{ArgList, TableMap, Value};

/// Pack one interpreter value.
pub fn pack(value: &ScriptValue) -> Result<Value> {
    let mut visiting = Vec::new();
    pack_value(value, &mut visiting)
}

/// Pack a result list, trimming trailing `nil`s.
pub fn pack_all(values: &[ScriptValue]) -> Result<ArgList> {
    let end = values
        .iter()
        .rposition(|value| !value.is_nil())
        .map_or(0, |last| last + 1);
    values[..end].iter().map(pack).collect()
}

fn pack_value(value: &ScriptValue, visiting: &mut Vec<*const RefCell<Table>>) -> Result<Value> {
    match value {
        ScriptValue::Nil => Ok(Value::Empty),
        ScriptValue::Number(num) => Ok(Value::Number(*num)),
        ScriptValue::Str(text) => Ok(Value::String(text.to_string())),
        ScriptValue::Table(table) => pack_table(table, visiting),
        ScriptValue::Function(function) => {
            let code = script::dump(function).map_err(Error::from)?;
            Ok(Value::String(code.into_string()))
        }
        ScriptValue::Future(handle) => Ok(Value::FutureRef(handle.clone())),
        ScriptValue::Native(native) => Err(Error::UnsupportedType(format!(
            "builtin function '{}'",
            native.name
        ))),
        ScriptValue::Guard(_) => Err(Error::UnsupportedType("guard".to_string())),
        ScriptValue::Locality(_) => Err(Error::UnsupportedType("locality".to_string())),
    }
}

fn pack_table(table: &TableRef, visiting: &mut Vec<*const RefCell<Table>>) -> Result<Value> {
    let ptr = Rc::as_ptr(table);
    if visiting.contains(&ptr) {
        return Err(Error::UnsupportedType("cyclic table".to_string()));
    }
    visiting.push(ptr);

    let inner = table.borrow();
    let packed = if inner.is_sequence() {
        inner
            .iter()
            .map(|(_, item)| pack_value(item, visiting))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    } else {
        inner
            .iter()
            .map(|(key, item)| Ok((key.clone(), pack_value(item, visiting)?)))
            .collect::<Result<TableMap>>()
            .map(Value::Table)
    };

    visiting.pop();
    packed
}

/// Unpack one portable value into interpreter-native form.
///
/// Bytecode-marked strings come back as functions when they load, and as
/// plain strings otherwise.
pub fn unpack(value: &Value) -> ScriptValue {
    match value {
        Value::Empty => ScriptValue::Nil,
        Value::Number(num) => ScriptValue::Number(*num),
        Value::String(text) => {
            if script::is_bytecode(text) {
                let code = Bytecode::from_raw(text.clone());
                if let Ok(function) = script::load(&code, None) {
                    return ScriptValue::Function(Rc::new(function));
                }
            }
            ScriptValue::string(text)
        }
        Value::Array(items) => ScriptValue::sequence(items.iter().map(unpack)),
        Value::Table(map) => {
            let mut table = Table::new();
            for (key, item) in map {
                table.set(key.clone(), unpack(item));
            }
            ScriptValue::Table(Rc::new(RefCell::new(table)))
        }
        Value::FutureRef(handle) => ScriptValue::Future(handle.clone()),
    }
}

/// Unpack every value of a list.
pub fn unpack_all(values: &[Value]) -> Vec<ScriptValue> {
    values.iter().map(unpack).collect()
}
