use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Function, ScriptError, ScriptResult};

/// Marker prefix of every dumped function.
pub const BYTECODE_SIGNATURE: &str = "\u{1b}XSC";

/// Serialized function.
///
/// The text is the signature followed by a deterministic JSON encoding of the
/// function's parameters and body; it carries no interpreter pointers and can
/// be sent to any thread or node.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bytecode(String);

impl Bytecode {
    /// Wrap raw text without validating it.
    pub fn from_raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Borrow the encoded text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwrap the encoded text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytecode({} bytes)", self.0.len())
    }
}

/// Whether `text` starts with the bytecode signature.
pub fn is_bytecode(text: &str) -> bool {
    text.len() > BYTECODE_SIGNATURE.len() && text.starts_with(BYTECODE_SIGNATURE)
}

/// Serialize a function.
pub fn dump(function: &Function) -> ScriptResult<Bytecode> {
    let body = serde_json::to_string(function).map_err(|e| ScriptError::Bytecode(e.to_string()))?;
    Ok(Bytecode(format!("{}{}", BYTECODE_SIGNATURE, body)))
}

/// Deserialize a function, naming it `name` when the dump carries no name.
pub fn load(bytecode: &Bytecode, name: Option<&str>) -> ScriptResult<Function> {
    let body = bytecode
        .0
        .strip_prefix(BYTECODE_SIGNATURE)
        .ok_or_else(|| ScriptError::Bytecode("missing signature".to_string()))?;
    let mut function: Function =
        serde_json::from_str(body).map_err(|e| ScriptError::Bytecode(e.to_string()))?;
    if function.name.is_none() {
        function.name = name.map(str::to_string);
    }
    Ok(function)
}
