use serde::{Deserialize, Serialize};

/// S-expression nodes of the script language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Expr {
    /// The `nil` literal.
    Nil,
    /// A bare symbol.
    Symbol(String),
    /// Keyword tokens (leading colon); evaluate to their name as a string.
    Keyword(String),
    /// String literal.
    String(String),
    /// Number literal.
    Number(f64),
    /// Nested list: a special form or a call.
    List(Vec<Expr>),
}

/// Parsed source unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Top-level forms in source order.
    pub forms: Vec<Expr>,
    /// Original source text, retained for error reporting.
    pub source: String,
}

impl Program {
    /// Construct a program from parsed forms.
    pub fn new(source: impl Into<String>, forms: Vec<Expr>) -> Self {
        Self {
            source: source.into(),
            forms,
        }
    }

    /// Names bound by top-level `define` / `defn` forms, in source order.
    pub fn defined_names(&self) -> Vec<String> {
        self.forms
            .iter()
            .filter_map(|form| match form {
                Expr::List(items) => match (items.first(), items.get(1)) {
                    (Some(Expr::Symbol(head)), Some(Expr::Symbol(name)))
                        if head == "define" || head == "defn" =>
                    {
                        Some(name.clone())
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }
}
