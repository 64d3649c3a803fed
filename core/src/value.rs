//! Runtime value types
//!
//! `Val` is what flows through Waits: user input posted into a suspended
//! dialog, results returned by `done`, and arguments passed to `call`.
//! `ValType` is the shape a Wait declares it needs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Obj(HashMap<String, Val>),
    /// Output of a language-understanding service
    Intent(IntentResult),
}

impl Val {
    pub fn str(s: impl Into<String>) -> Self {
        Val::Str(s.into())
    }

    pub fn type_of(&self) -> ValType {
        match self {
            Val::Null => ValType::Null,
            Val::Bool(_) => ValType::Bool,
            Val::Num(_) => ValType::Num,
            Val::Str(_) => ValType::Str,
            Val::List(_) => ValType::List,
            Val::Obj(_) => ValType::Obj,
            Val::Intent(_) => ValType::Intent,
        }
    }

    /// Check if value is truthy (for conditionals)
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Bool(b) => *b,
            Val::Null => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_intent(&self) -> Option<&IntentResult> {
        match self {
            Val::Intent(i) => Some(i),
            _ => None,
        }
    }

    /// Build a value from any serializable record via its JSON form
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(json_to_val(&serde_json::to_value(value)?))
    }

    /// Read this value as a typed record via its JSON form
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(val_to_json(self))
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

/// The shape of value a Wait expects on resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    Any,
    Null,
    Bool,
    Num,
    Str,
    List,
    Obj,
    Intent,
}

impl ValType {
    /// Whether `val` satisfies this expectation. No coercion is attempted.
    pub fn accepts(&self, val: &Val) -> bool {
        match self {
            ValType::Any => true,
            expected => *expected == val.type_of(),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValType::Any => "any",
            ValType::Null => "null",
            ValType::Bool => "bool",
            ValType::Num => "num",
            ValType::Str => "str",
            ValType::List => "list",
            ValType::Obj => "obj",
            ValType::Intent => "intent",
        };
        f.write_str(name)
    }
}

/// Structured recognition result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    pub score: f64,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl IntentResult {
    pub fn new(intent: impl Into<String>, score: f64) -> Self {
        Self {
            intent: intent.into(),
            score,
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// First entity of the given kind
    pub fn entity(&self, kind: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/* ===================== JSON Conversion ===================== */

/// Convert a plain JSON value into a `Val`
///
/// JSON has no intent type, so objects always become `Val::Obj`.
pub fn json_to_val(json: &JsonValue) -> Val {
    match json {
        JsonValue::Null => Val::Null,
        JsonValue::Bool(b) => Val::Bool(*b),
        JsonValue::Number(n) => Val::Num(n.as_f64().unwrap_or(0.0)),
        JsonValue::String(s) => Val::Str(s.clone()),
        JsonValue::Array(items) => Val::List(items.iter().map(json_to_val).collect()),
        JsonValue::Object(obj) => Val::Obj(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_val(v)))
                .collect(),
        ),
    }
}

/// Convert a `Val` into plain JSON (for message payloads and bags)
pub fn val_to_json(val: &Val) -> JsonValue {
    match val {
        Val::Null => JsonValue::Null,
        Val::Bool(b) => JsonValue::Bool(*b),
        Val::Num(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            JsonValue::Number(Number::from(*n as i64))
        }
        Val::Num(n) => Number::from_f64(*n).map_or(JsonValue::Null, JsonValue::Number),
        Val::Str(s) => JsonValue::String(s.clone()),
        Val::List(items) => JsonValue::Array(items.iter().map(val_to_json).collect()),
        Val::Obj(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.clone(), val_to_json(v));
            }
            JsonValue::Object(map)
        }
        Val::Intent(intent) => serde_json::to_value(intent).unwrap_or(JsonValue::Null),
    }
}
