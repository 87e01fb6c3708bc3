//! Core library installed into every interpreter.

use std::cmp::Ordering;

use super::{Interpreter, ScriptResult, ScriptValue, Table, runtime_error};

/// Register the core library on `interp`.
pub fn install(interp: &mut Interpreter) {
    interp.register_native("+", |_, args| fold_numbers("+", args, 0.0, |a, b| a + b));
    interp.register_native("*", |_, args| fold_numbers("*", args, 1.0, |a, b| a * b));
    interp.register_native("-", |_, args| {
        if args.len() == 1 {
            return Ok(vec![ScriptValue::Number(-number("-", &args[0])?)]);
        }
        fold_first("-", args, |a, b| a - b)
    });
    interp.register_native("/", |_, args| fold_first("/", args, |a, b| a / b));
    interp.register_native("%", |_, args| {
        fold_first("%", args, |a, b| a - (a / b).floor() * b)
    });

    interp.register_native("=", |_, args| {
        let (a, b) = two("=", &args)?;
        Ok(vec![ScriptValue::truth(a.raw_equal(b))])
    });
    interp.register_native("~=", |_, args| {
        let (a, b) = two("~=", &args)?;
        Ok(vec![ScriptValue::truth(!a.raw_equal(b))])
    });
    interp.register_native("<", |_, args| compare("<", &args, Ordering::is_lt));
    interp.register_native("<=", |_, args| compare("<=", &args, Ordering::is_le));
    interp.register_native(">", |_, args| compare(">", &args, Ordering::is_gt));
    interp.register_native(">=", |_, args| compare(">=", &args, Ordering::is_ge));
    interp.register_native("not", |_, args| {
        let value = args.first().cloned().unwrap_or(ScriptValue::Nil);
        Ok(vec![ScriptValue::truth(!value.is_truthy())])
    });

    interp.register_native("list", |_, args| Ok(vec![ScriptValue::sequence(args)]));
    interp.register_native("table", |_, args| {
        if args.len() % 2 != 0 {
            return Err(runtime_error("table expects key/value pairs"));
        }
        let mut table = Table::new();
        for pair in args.chunks(2) {
            table.set(pair[0].to_key()?, pair[1].clone());
        }
        Ok(vec![ScriptValue::Table(std::rc::Rc::new(
            std::cell::RefCell::new(table),
        ))])
    });
    interp.register_native("index", |_, args| {
        let (table, key) = two("index", &args)?;
        let ScriptValue::Table(table) = table else {
            return Err(runtime_error(format!(
                "attempt to index a {} value",
                table.type_name()
            )));
        };
        let value = table.borrow().get(&key.to_key()?);
        Ok(vec![value])
    });
    interp.register_native("put", |_, args| {
        let [table, key, value] = args.as_slice() else {
            return Err(runtime_error("put expects a table, a key and a value"));
        };
        let ScriptValue::Table(inner) = table else {
            return Err(runtime_error(format!(
                "attempt to index a {} value",
                table.type_name()
            )));
        };
        inner.borrow_mut().set(key.to_key()?, value.clone());
        Ok(vec![table.clone()])
    });
    interp.register_native("len", |_, args| {
        let len = match args.first() {
            Some(ScriptValue::Table(table)) => table.borrow().len(),
            Some(ScriptValue::Str(text)) => text.len(),
            Some(other) => {
                return Err(runtime_error(format!(
                    "attempt to get length of a {} value",
                    other.type_name()
                )));
            }
            None => return Err(runtime_error("len expects an argument")),
        };
        Ok(vec![ScriptValue::Number(len as f64)])
    });

    interp.register_native("str", |_, args| {
        let text: String = args.iter().map(|arg| arg.to_string()).collect();
        Ok(vec![ScriptValue::string(text)])
    });
    interp.register_native("type", |_, args| {
        let value = args.first().cloned().unwrap_or(ScriptValue::Nil);
        Ok(vec![ScriptValue::string(value.type_name())])
    });
    interp.register_native("values", |_, args| Ok(args));
    interp.register_native("print", |_, args| {
        let line: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        println!("{}", line.join("\t"));
        Ok(Vec::new())
    });
    interp.register_native("error", |_, args| {
        let message = args
            .first()
            .map(|arg| arg.to_string())
            .unwrap_or_else(|| "error".to_string());
        Err(runtime_error(message))
    });
}

fn number(op: &str, value: &ScriptValue) -> ScriptResult<f64> {
    value.as_number().ok_or_else(|| {
        runtime_error(format!(
            "attempt to perform arithmetic ({}) on a {} value",
            op,
            value.type_name()
        ))
    })
}

fn fold_numbers(
    op: &str,
    args: Vec<ScriptValue>,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> ScriptResult<Vec<ScriptValue>> {
    let mut acc = init;
    for arg in &args {
        acc = f(acc, number(op, arg)?);
    }
    Ok(vec![ScriptValue::Number(acc)])
}

fn fold_first(
    op: &str,
    args: Vec<ScriptValue>,
    f: impl Fn(f64, f64) -> f64,
) -> ScriptResult<Vec<ScriptValue>> {
    let Some((first, rest)) = args.split_first() else {
        return Err(runtime_error(format!("{} expects at least one argument", op)));
    };
    let mut acc = number(op, first)?;
    for arg in rest {
        acc = f(acc, number(op, arg)?);
    }
    Ok(vec![ScriptValue::Number(acc)])
}

fn two<'a>(op: &str, args: &'a [ScriptValue]) -> ScriptResult<(&'a ScriptValue, &'a ScriptValue)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(runtime_error(format!("{} expects two arguments", op))),
    }
}

fn compare(
    op: &str,
    args: &[ScriptValue],
    accept: fn(Ordering) -> bool,
) -> ScriptResult<Vec<ScriptValue>> {
    let (a, b) = two(op, args)?;
    let ordering = match (a, b) {
        (ScriptValue::Number(x), ScriptValue::Number(y)) => x.partial_cmp(y),
        (ScriptValue::Str(x), ScriptValue::Str(y)) => Some(x.cmp(y)),
        _ => {
            return Err(runtime_error(format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            )));
        }
    };
    Ok(vec![ScriptValue::truth(ordering.is_some_and(accept))])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Vec<ScriptValue> {
        Interpreter::new().eval_source(source).expect("eval")
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("(+ 1 2 3)")[0].as_number(), Some(6.0));
        assert_eq!(eval("(- 10 4 1)")[0].as_number(), Some(5.0));
        assert_eq!(eval("(- 3)")[0].as_number(), Some(-3.0));
        assert_eq!(eval("(% -1 3)")[0].as_number(), Some(2.0));
        assert!(Interpreter::new().eval_source("(+ 1 \"a\")").is_err());
    }

    #[test]
    fn comparisons_return_one_or_nil() {
        assert_eq!(eval("(< 1 2)")[0].as_number(), Some(1.0));
        assert!(eval("(> 1 2)")[0].is_nil());
        assert_eq!(eval("(= \"a\" \"a\")")[0].as_number(), Some(1.0));
    }

    #[test]
    fn tables() {
        let values = eval("(let ((t (list 10 20))) (put t 3 30) (values (len t) (index t 2)))");
        assert_eq!(values[0].as_number(), Some(3.0));
        assert_eq!(values[1].as_number(), Some(20.0));

        let values = eval("(index (table :name \"x\" 2 \"y\") \"name\")");
        assert_eq!(values[0].as_str(), Some("x"));
    }

    #[test]
    fn error_builtin_raises() {
        let err = Interpreter::new()
            .eval_source("(error \"bad thing\")")
            .unwrap_err();
        assert_eq!(err.to_string(), "bad thing");
    }
}
