use std::collections::HashMap;
use std::rc::Rc;

use super::value::format_number;
use super::{
    Bytecode, Expr, Function, NativeFunction, ScriptError, ScriptResult, ScriptValue, builtins,
    chunk, parse_program, runtime_error,
};

/// Default bound on nested script calls.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Local variables of one call frame, innermost binding last.
type Frame = Vec<(String, ScriptValue)>;

/// One interpreter instance: a global table plus the evaluator.
///
/// Not reentrant across threads: it is `!Send` and is only reached through
/// an execution-context lease.
pub struct Interpreter {
    globals: HashMap<String, ScriptValue>,
    depth: usize,
    max_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Interpreter with the core library installed.
    pub fn new() -> Self {
        Self::with_call_depth(DEFAULT_MAX_CALL_DEPTH)
    }

    /// Interpreter with a custom call-depth bound.
    pub fn with_call_depth(max_depth: usize) -> Self {
        let mut interp = Self {
            globals: HashMap::new(),
            depth: 0,
            max_depth,
        };
        builtins::install(&mut interp);
        interp
    }

    /// Read a global; `nil` globals are reported as absent.
    pub fn global(&self, name: &str) -> Option<ScriptValue> {
        self.globals.get(name).filter(|v| !v.is_nil()).cloned()
    }

    /// Assign a global; assigning `nil` removes it.
    pub fn set_global(&mut self, name: impl Into<String>, value: ScriptValue) {
        let name = name.into();
        if value.is_nil() {
            self.globals.remove(&name);
        } else {
            self.globals.insert(name, value);
        }
    }

    /// Remove a global, returning its previous value.
    pub fn remove_global(&mut self, name: &str) -> Option<ScriptValue> {
        self.globals.remove(name)
    }

    /// Expose a host function as a global.
    pub fn register_native<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut Interpreter, Vec<ScriptValue>) -> ScriptResult<Vec<ScriptValue>> + 'static,
    {
        self.globals.insert(
            name.to_string(),
            ScriptValue::Native(Rc::new(NativeFunction::new(name, func))),
        );
    }

    /// Serialize the global function `name`.
    pub fn dump_global(&self, name: &str) -> ScriptResult<Bytecode> {
        match self.global(name) {
            Some(ScriptValue::Function(function)) => chunk::dump(&function),
            Some(other) => Err(runtime_error(format!(
                "global '{}' is a {}, not a script function",
                name,
                other.type_name()
            ))),
            None => Err(runtime_error(format!("global '{}' is not defined", name))),
        }
    }

    /// Load bytecode as a function value.
    pub fn load(&self, bytecode: &Bytecode, name: Option<&str>) -> ScriptResult<ScriptValue> {
        let function = chunk::load(bytecode, name)?;
        Ok(ScriptValue::Function(Rc::new(function)))
    }

    /// Parse and evaluate `source`, returning the values of the last form.
    pub fn eval_source(&mut self, source: &str) -> ScriptResult<Vec<ScriptValue>> {
        let program = parse_program(source)?;
        let mut frame = Frame::new();
        let mut last = Vec::new();
        for form in &program.forms {
            last = self.eval_multi(form, &mut frame)?;
        }
        Ok(last)
    }

    /// Call a function value with `args`.
    pub fn call(
        &mut self,
        callee: &ScriptValue,
        args: Vec<ScriptValue>,
    ) -> ScriptResult<Vec<ScriptValue>> {
        match callee {
            ScriptValue::Function(function) => {
                if self.depth >= self.max_depth {
                    return Err(ScriptError::StackOverflow(self.max_depth));
                }
                let function = function.clone();
                let mut args = args.into_iter();
                let mut frame: Frame = function
                    .params
                    .iter()
                    .map(|param| (param.clone(), args.next().unwrap_or(ScriptValue::Nil)))
                    .collect();

                self.depth += 1;
                let result = self.eval_body(&function.body, &mut frame);
                self.depth -= 1;
                result
            }
            ScriptValue::Native(native) => {
                let native = native.clone();
                (native.func)(self, args)
            }
            other => Err(ScriptError::NotCallable(other.type_name().to_string())),
        }
    }

    fn eval_body(&mut self, body: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let mut last = vec![ScriptValue::Nil];
        for expr in body {
            last = self.eval_multi(expr, frame)?;
        }
        Ok(last)
    }

    fn eval(&mut self, expr: &Expr, frame: &mut Frame) -> ScriptResult<ScriptValue> {
        Ok(self
            .eval_multi(expr, frame)?
            .into_iter()
            .next()
            .unwrap_or(ScriptValue::Nil))
    }

    fn eval_multi(&mut self, expr: &Expr, frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        match expr {
            Expr::Nil => Ok(vec![ScriptValue::Nil]),
            Expr::Number(num) => Ok(vec![ScriptValue::Number(*num)]),
            Expr::String(text) | Expr::Keyword(text) => Ok(vec![ScriptValue::string(text)]),
            Expr::Symbol(name) => Ok(vec![self.lookup(name, frame)]),
            Expr::List(items) => self.eval_list(items, frame),
        }
    }

    fn lookup(&self, name: &str, frame: &Frame) -> ScriptValue {
        frame
            .iter()
            .rev()
            .find(|(local, _)| local == name)
            .map(|(_, value)| value.clone())
            .or_else(|| self.globals.get(name).cloned())
            .unwrap_or(ScriptValue::Nil)
    }

    fn eval_list(&mut self, items: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let Some(head) = items.first() else {
            return Ok(vec![ScriptValue::Nil]);
        };
        let rest = &items[1..];

        if let Expr::Symbol(form) = head {
            match form.as_str() {
                "define" => return self.eval_define(rest, frame),
                "defn" => return self.eval_defn(rest),
                "fn" => return Ok(vec![ScriptValue::Function(Rc::new(make_function(None, rest)?))]),
                "let" => return self.eval_let(rest, frame),
                "if" => return self.eval_if(rest, frame),
                "do" => return self.eval_body(rest, frame),
                "and" => return self.eval_and_or(rest, frame, true),
                "or" => return self.eval_and_or(rest, frame, false),
                "set!" => return self.eval_set(rest, frame),
                _ => {}
            }
        }

        let callee = self.eval(head, frame)?;
        let mut args = Vec::with_capacity(rest.len());
        for (i, arg) in rest.iter().enumerate() {
            if i + 1 == rest.len() {
                args.extend(self.eval_multi(arg, frame)?);
            } else {
                args.push(self.eval(arg, frame)?);
            }
        }
        self.call(&callee, args).map_err(|err| match err {
            ScriptError::NotCallable(kind) => ScriptError::NotCallable(format!(
                "{} ('{}')",
                kind,
                describe(head)
            )),
            other => other,
        })
    }

    fn eval_define(&mut self, rest: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let [Expr::Symbol(name), value] = rest else {
            return Err(runtime_error("define expects a name and a value"));
        };
        let mut value = self.eval(value, frame)?;
        if let ScriptValue::Function(function) = &value {
            if function.name.is_none() {
                let mut named = (**function).clone();
                named.name = Some(name.clone());
                value = ScriptValue::Function(Rc::new(named));
            }
        }
        self.set_global(name.clone(), value.clone());
        Ok(vec![value])
    }

    fn eval_defn(&mut self, rest: &[Expr]) -> ScriptResult<Vec<ScriptValue>> {
        let Some(Expr::Symbol(name)) = rest.first() else {
            return Err(runtime_error("defn expects a name"));
        };
        let function = ScriptValue::Function(Rc::new(make_function(Some(name), &rest[1..])?));
        self.set_global(name.clone(), function.clone());
        Ok(vec![function])
    }

    fn eval_let(&mut self, rest: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let Some(Expr::List(bindings)) = rest.first() else {
            return Err(runtime_error("let expects a binding list"));
        };
        let mark = frame.len();
        for binding in bindings {
            let Expr::List(pair) = binding else {
                frame.truncate(mark);
                return Err(runtime_error("let binding must be (name value)"));
            };
            let [Expr::Symbol(name), value] = pair.as_slice() else {
                frame.truncate(mark);
                return Err(runtime_error("let binding must be (name value)"));
            };
            let value = match self.eval(value, frame) {
                Ok(value) => value,
                Err(err) => {
                    frame.truncate(mark);
                    return Err(err);
                }
            };
            frame.push((name.clone(), value));
        }
        let result = self.eval_body(&rest[1..], frame);
        frame.truncate(mark);
        result
    }

    fn eval_if(&mut self, rest: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let (cond, then, otherwise) = match rest {
            [cond, then] => (cond, then, None),
            [cond, then, otherwise] => (cond, then, Some(otherwise)),
            _ => return Err(runtime_error("if expects a condition and one or two branches")),
        };
        if self.eval(cond, frame)?.is_truthy() {
            self.eval_multi(then, frame)
        } else if let Some(otherwise) = otherwise {
            self.eval_multi(otherwise, frame)
        } else {
            Ok(vec![ScriptValue::Nil])
        }
    }

    fn eval_and_or(
        &mut self,
        rest: &[Expr],
        frame: &mut Frame,
        is_and: bool,
    ) -> ScriptResult<Vec<ScriptValue>> {
        let mut last = ScriptValue::truth(is_and);
        for expr in rest {
            last = self.eval(expr, frame)?;
            if last.is_truthy() != is_and {
                break;
            }
        }
        Ok(vec![last])
    }

    fn eval_set(&mut self, rest: &[Expr], frame: &mut Frame) -> ScriptResult<Vec<ScriptValue>> {
        let [Expr::Symbol(name), value] = rest else {
            return Err(runtime_error("set! expects a name and a value"));
        };
        let value = self.eval(value, frame)?;
        match frame.iter_mut().rev().find(|(local, _)| local == name) {
            Some(slot) => slot.1 = value.clone(),
            None => self.set_global(name.clone(), value.clone()),
        }
        Ok(vec![value])
    }
}

fn make_function(name: Option<&String>, rest: &[Expr]) -> ScriptResult<Function> {
    let Some(Expr::List(params)) = rest.first() else {
        return Err(runtime_error("function definition expects a parameter list"));
    };
    let params = params
        .iter()
        .map(|param| match param {
            Expr::Symbol(name) => Ok(name.clone()),
            other => Err(runtime_error(format!(
                "parameter must be a symbol, found {}",
                describe(other)
            ))),
        })
        .collect::<ScriptResult<Vec<_>>>()?;
    Ok(Function {
        name: name.cloned(),
        params,
        body: rest[1..].to_vec(),
    })
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Nil => "nil".to_string(),
        Expr::Symbol(name) => name.clone(),
        Expr::Keyword(name) => format!(":{}", name),
        Expr::String(text) => format!("{:?}", text),
        Expr::Number(num) => format_number(*num),
        Expr::List(_) => "(...)".to_string(),
    }
}
