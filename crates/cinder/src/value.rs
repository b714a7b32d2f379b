//! Script values and script-level errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An error raised inside a script.
///
/// Raised errors are ordinary values: they become the task's terminal value
/// and never unwind into the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    /// Error class name (e.g. `RuntimeError`, `ZeroDivisionError`).
    pub class: String,
    /// Human-readable message.
    pub message: String,
}

impl ScriptError {
    /// Create an error of the given class.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Create a `RuntimeError`, the class used by a bare `raise "msg"`.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    /// Check whether this error is of the given class.
    #[must_use]
    pub fn is_a(&self, class: &str) -> bool {
        self.class == class
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

/// A value produced by a script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// `nil`; also the result of a task that has not finished.
    #[default]
    Nil,
    /// `true` / `false`.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// A raised error.
    Error(ScriptError),
}

impl Value {
    /// Ruby truthiness: only `nil` and `false` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// Whether this value is `nil`.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// The error carried by this value, if it is one.
    #[must_use]
    pub fn as_error(&self) -> Option<&ScriptError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Class name of the value as a script would see it.
    #[must_use]
    pub fn class_name(&self) -> &str {
        match self {
            Self::Nil => "NilClass",
            Self::Bool(true) => "TrueClass",
            Self::Bool(false) => "FalseClass",
            Self::Int(_) => "Integer",
            Self::Float(_) => "Float",
            Self::Str(_) => "String",
            Self::Error(err) => &err.class,
        }
    }

    /// Debug representation, as `p value` would print it.
    #[must_use]
    pub fn inspect(&self) -> String {
        match self {
            Self::Nil => "nil".to_string(),
            Self::Str(s) => format!("{s:?}"),
            Self::Error(err) => format!("#<{}: {}>", err.class, err.message),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            #[allow(clippy::cast_precision_loss)]
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) if x.is_nan() => f.write_str("NaN"),
            Self::Float(x) if x.is_infinite() => {
                f.write_str(if *x > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => f.write_str(s),
            Self::Error(err) => f.write_str(&err.message),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<ScriptError> for Value {
    fn from(err: ScriptError) -> Self {
        Self::Error(err)
    }
}
