//! Named-parameter rewriting and value coercion.
//!
//! Callers write `:name` placeholders. The rewrite to `@name` is a single textual regex
//! pass with no awareness of string literals, so `':word'` inside quotes is rewritten
//! too, and so is the second colon of a PostgreSQL `::type` cast (use `CAST(x AS type)`).
//! Values always travel as bound parameters and are never spliced into the SQL text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};

static NAMED_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(\w+)").expect("named placeholder pattern is valid"));

/// Scalar value handed to the backend driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Coerces a loosely typed JSON value. Integral numbers become `Int`, other numbers
    /// `Float`; arrays and objects are passed as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ParamValue::Null,
            Value::Bool(flag) => ParamValue::Bool(*flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    ParamValue::Int(int)
                } else {
                    number
                        .as_f64()
                        .map(ParamValue::Float)
                        .unwrap_or_else(|| ParamValue::Text(number.to_string()))
                }
            }
            Value::String(text) => ParamValue::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => ParamValue::Text(value.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => f.write_str("NULL"),
            ParamValue::Bool(flag) => write!(f, "{flag}"),
            ParamValue::Int(int) => write!(f, "{int}"),
            ParamValue::Float(float) => write!(f, "{float}"),
            ParamValue::Text(text) => write!(f, "'{text}'"),
        }
    }
}

impl From<&Value> for ParamValue {
    fn from(value: &Value) -> Self {
        ParamValue::from_json(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundParam {
    pub name: String,
    pub value: ParamValue,
}

/// SQL with `@name` markers plus the values to bind, ordered by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<BoundParam>,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push(BoundParam {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params
            .iter()
            .find(|param| param.name.eq_ignore_ascii_case(name))
            .map(|param| &param.value)
    }

    /// Same parameters, different statement text.
    pub fn with_sql(&self, sql: String) -> Self {
        Self {
            sql,
            params: self.params.clone(),
        }
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|param| param.name.as_str()).collect()
    }
}

pub fn rewrite_placeholders(sql: &str) -> String {
    NAMED_PLACEHOLDER.replace_all(sql, "@$1").into_owned()
}

pub fn bind(sql: &str, params: &BTreeMap<String, Value>) -> BoundQuery {
    BoundQuery {
        sql: rewrite_placeholders(sql),
        params: params
            .iter()
            .map(|(name, value)| BoundParam {
                name: name.trim_start_matches([':', '@']).to_string(),
                value: ParamValue::from_json(value),
            })
            .collect(),
    }
}
