//! Scalar values, rows and table identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar cell value.
///
/// Serializes untagged, so rows render as plain JSON arrays of strings,
/// integers and `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
}

impl Value {
    /// Normalize a JSON scalar into a cell value.
    ///
    /// Booleans become `"True"`/`"False"` and floats their decimal string, so
    /// every value stays hashable and totally ordered. Arrays and objects are
    /// stored as their compact JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(true) => Value::Str("True".to_string()),
            serde_json::Value::Bool(false) => Value::Str("False".to_string()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// An immutable tuple of values.
///
/// Serializes to the wire shape `{"data": [v0, v1, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Row {
    data: Vec<Value>,
}

impl Row {
    pub fn new(data: Vec<Value>) -> Self {
        Self { data }
    }

    pub fn values(&self) -> &[Value] {
        &self.data
    }

    pub fn arity(&self) -> usize {
        self.data.len()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.data.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.data
    }
}

impl FromIterator<Value> for Row {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Build a [`Row`] from values convertible into [`Value`].
///
/// ```
/// use accord_datalog::{row, Value};
/// let r = row!["N1", 2];
/// assert_eq!(r.values(), &[Value::from("N1"), Value::Int(2)]);
/// ```
#[macro_export]
macro_rules! row {
    ($($v:expr),* $(,)?) => {
        $crate::Row::new(vec![$($crate::Value::from($v)),*])
    };
}

/// Identity of a table: the owning datasource or policy, and the table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub owner: String,
    pub name: String,
}

impl TableId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_wire_shape() {
        let r = row!["a", 3];
        let encoded = serde_json::to_value(&r).unwrap();
        assert_eq!(encoded, json!({"data": ["a", 3]}));

        let null_row = Row::new(vec![Value::Null]);
        assert_eq!(serde_json::to_value(&null_row).unwrap(), json!({"data": [null]}));
    }

    #[test]
    fn test_row_decodes_from_wire_shape() {
        let decoded: Row = serde_json::from_value(json!({"data": [null, 7, "x"]})).unwrap();
        assert_eq!(
            decoded.values(),
            &[Value::Null, Value::Int(7), Value::Str("x".to_string())]
        );
    }

    #[test]
    fn test_from_json_normalization() {
        assert_eq!(Value::from_json(&json!(true)), Value::from("True"));
        assert_eq!(Value::from_json(&json!(1531821822)), Value::Int(1531821822));
        assert_eq!(Value::from_json(&json!(1.5)), Value::from("1.5"));
        assert_eq!(Value::from_json(&json!(null)), Value::Null);
    }

    #[test]
    fn test_table_id_display() {
        assert_eq!(TableId::new("nova", "servers").to_string(), "nova:servers");
    }
}
