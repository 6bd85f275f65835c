//! Builtin predicates callable from rule bodies.
//!
//! Functional builtins take their inputs in every position but the last and
//! bind the result to the last argument (`plus(x, y, z)` binds `z = x + y`).
//! Comparison and test builtins are selection conditions: the binding
//! survives only when the comparison holds.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// Mask applied to the result of bitwise complement.
const BNOT_MASK: i64 = 0xFFFF_FFFF;

/// Errors from builtin lookup and invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuiltinError {
    /// No builtin with this name is registered.
    #[error("unknown builtin: {0}")]
    Unknown(String),

    /// Wrong number of arguments.
    #[error("builtin {name} expects {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Arguments outside the builtin's domain (type mismatch, overflow,
    /// division by zero). The binding does not match.
    #[error("builtin {name}: {reason}")]
    Domain { name: String, reason: String },
}

/// Family a builtin belongs to. Engines declare support per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltinClass {
    Arithmetic,
    Bitwise,
    Comparison,
    String,
}

impl fmt::Display for BuiltinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuiltinClass::Arithmetic => "arithmetic",
            BuiltinClass::Bitwise => "bitwise",
            BuiltinClass::Comparison => "comparison",
            BuiltinClass::String => "string",
        };
        write!(f, "{}", name)
    }
}

type FunctionImpl = fn(&str, &[Value]) -> Result<Value, BuiltinError>;
type PredicateImpl = fn(&str, &[Value]) -> Result<bool, BuiltinError>;

#[derive(Clone, Copy)]
enum Implementation {
    Function(FunctionImpl),
    Predicate(PredicateImpl),
}

/// Result of invoking a builtin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A functional builtin produced this value for its output argument.
    Value(Value),
    /// A selection builtin held (or not).
    Holds(bool),
}

/// A registered builtin.
#[derive(Clone)]
pub struct Builtin {
    name: String,
    arity: usize,
    class: BuiltinClass,
    implementation: Implementation,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("class", &self.class)
            .finish()
    }
}

impl Builtin {
    /// A builtin that binds its last argument.
    pub fn function(
        name: impl Into<String>,
        arity: usize,
        class: BuiltinClass,
        f: fn(&str, &[Value]) -> Result<Value, BuiltinError>,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            class,
            implementation: Implementation::Function(f),
        }
    }

    /// A builtin that filters bindings.
    pub fn predicate(
        name: impl Into<String>,
        arity: usize,
        class: BuiltinClass,
        f: fn(&str, &[Value]) -> Result<bool, BuiltinError>,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            class,
            implementation: Implementation::Predicate(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn class(&self) -> BuiltinClass {
        self.class
    }

    /// Whether the last argument is an output.
    pub fn is_function(&self) -> bool {
        matches!(self.implementation, Implementation::Function(_))
    }

    /// Number of leading arguments that must be bound before invocation.
    pub fn input_arity(&self) -> usize {
        if self.is_function() {
            self.arity.saturating_sub(1)
        } else {
            self.arity
        }
    }

    /// Invoke with the input arguments only.
    pub fn invoke(&self, inputs: &[Value]) -> Result<Outcome, BuiltinError> {
        if inputs.len() != self.input_arity() {
            return Err(BuiltinError::Arity {
                name: self.name.clone(),
                expected: self.input_arity(),
                actual: inputs.len(),
            });
        }
        match self.implementation {
            Implementation::Function(f) => f(&self.name, inputs).map(Outcome::Value),
            Implementation::Predicate(f) => f(&self.name, inputs).map(Outcome::Holds),
        }
    }
}

/// Name → builtin mapping.
#[derive(Debug, Clone)]
pub struct BuiltinRegistry {
    builtins: BTreeMap<String, Builtin>,
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            builtins: BTreeMap::new(),
        }
    }

    /// The standard arithmetic, bitwise, comparison and string builtins.
    pub fn standard() -> Self {
        use BuiltinClass::{Arithmetic, Bitwise, Comparison, String as Text};

        let mut registry = Self::empty();
        for builtin in [
            Builtin::function("plus", 3, Arithmetic, |n, a| int_op(n, a, i64::checked_add)),
            Builtin::function("minus", 3, Arithmetic, |n, a| int_op(n, a, i64::checked_sub)),
            Builtin::function("mul", 3, Arithmetic, |n, a| int_op(n, a, i64::checked_mul)),
            Builtin::function("div", 3, Arithmetic, |n, a| int_op(n, a, i64::checked_div)),
            Builtin::function("and", 3, Bitwise, |n, a| int_op(n, a, |x, y| Some(x & y))),
            Builtin::function("or", 3, Bitwise, |n, a| int_op(n, a, |x, y| Some(x | y))),
            Builtin::function("xor", 3, Bitwise, |n, a| int_op(n, a, |x, y| Some(x ^ y))),
            Builtin::function("bnot", 2, Bitwise, |n, a| {
                Ok(Value::Int(!int_arg(n, &a[0])? & BNOT_MASK))
            }),
            Builtin::predicate("lt", 2, Comparison, |n, a| compare(n, a).map(|o| o.is_lt())),
            Builtin::predicate("lteq", 2, Comparison, |n, a| compare(n, a).map(|o| o.is_le())),
            Builtin::predicate("gt", 2, Comparison, |n, a| compare(n, a).map(|o| o.is_gt())),
            Builtin::predicate("gteq", 2, Comparison, |n, a| compare(n, a).map(|o| o.is_ge())),
            Builtin::predicate("equal", 2, Comparison, |_, a| Ok(a[0] == a[1])),
            Builtin::predicate("neq", 2, Comparison, |_, a| Ok(a[0] != a[1])),
            Builtin::function("concat", 3, Text, |_, a| {
                Ok(Value::Str(format!("{}{}", a[0], a[1])))
            }),
            Builtin::function("len", 2, Text, |n, a| {
                let len = str_arg(n, &a[0])?.chars().count();
                i64::try_from(len)
                    .map(Value::Int)
                    .map_err(|_| domain(n, "length overflow"))
            }),
            Builtin::function("lower", 2, Text, |n, a| {
                Ok(Value::Str(str_arg(n, &a[0])?.to_lowercase()))
            }),
            Builtin::function("upper", 2, Text, |n, a| {
                Ok(Value::Str(str_arg(n, &a[0])?.to_uppercase()))
            }),
            Builtin::predicate("startswith", 2, Text, |n, a| {
                Ok(str_arg(n, &a[0])?.starts_with(str_arg(n, &a[1])?))
            }),
            Builtin::predicate("endswith", 2, Text, |n, a| {
                Ok(str_arg(n, &a[0])?.ends_with(str_arg(n, &a[1])?))
            }),
        ] {
            registry.register(builtin);
        }
        registry
    }

    /// Register (or replace) a builtin.
    pub fn register(&mut self, builtin: Builtin) {
        self.builtins.insert(builtin.name.clone(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.builtins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Builtin> {
        self.builtins.values()
    }

    /// Look up and invoke a builtin by name with its input arguments.
    pub fn invoke(&self, name: &str, inputs: &[Value]) -> Result<Outcome, BuiltinError> {
        self.get(name)
            .ok_or_else(|| BuiltinError::Unknown(name.to_string()))?
            .invoke(inputs)
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn domain(name: &str, reason: impl Into<String>) -> BuiltinError {
    BuiltinError::Domain {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn int_arg(name: &str, value: &Value) -> Result<i64, BuiltinError> {
    value
        .as_int()
        .ok_or_else(|| domain(name, format!("expected integer, got {:?}", value)))
}

fn str_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, BuiltinError> {
    value
        .as_str()
        .ok_or_else(|| domain(name, format!("expected string, got {:?}", value)))
}

fn int_op(
    name: &str,
    args: &[Value],
    op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Value, BuiltinError> {
    let x = int_arg(name, &args[0])?;
    let y = int_arg(name, &args[1])?;
    op(x, y)
        .map(Value::Int)
        .ok_or_else(|| domain(name, format!("no result for {} and {}", x, y)))
}

/// Integers compare numerically, strings lexically; mixed kinds are outside
/// the domain.
fn compare(name: &str, args: &[Value]) -> Result<std::cmp::Ordering, BuiltinError> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (a, b) => Err(domain(name, format!("cannot compare {:?} with {:?}", a, b))),
    }
}
