//! The value type flowing through runnables and its concatenation law.
//!
//! Every input, output and streamed partial output is a [`Chunk`]. Streams
//! are folded into final values with [`Chunk::concat`] and nothing else, so
//! sequences, fan-out maps and the tracers all agree on what "the final
//! output" of a stream is.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// A value with its own concatenation, e.g. a message chunk.
///
/// Implementations decide what combining two partial values means. The
/// operation must be associative for streams to fold the same way no
/// matter how they are split.
pub trait CustomChunk: Send + Sync + Debug {
    /// Name used in error messages and for same-kind checks.
    fn type_name(&self) -> &str;

    /// Combine `self` with a later chunk.
    fn concat(&self, other: &dyn CustomChunk) -> Result<Arc<dyn CustomChunk>>;

    /// JSON form used by logs, events and equality.
    fn to_json(&self) -> Value;

    fn as_any(&self) -> &dyn Any;
}

/// A dynamically typed value with a closed set of kinds.
#[derive(Debug, Clone, Default)]
pub enum Chunk {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Chunk>),
    Dict(IndexMap<String, Chunk>),
    Custom(Arc<dyn CustomChunk>),
}

impl Chunk {
    /// Build a dictionary chunk from key/value pairs, keeping their order.
    pub fn dict<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Chunk>,
        I: IntoIterator<Item = (K, V)>,
    {
        Chunk::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn custom(value: impl CustomChunk + 'static) -> Self {
        Chunk::Custom(Arc::new(value))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::Null => "null",
            Chunk::Bool(_) => "bool",
            Chunk::Int(_) => "int",
            Chunk::Float(_) => "float",
            Chunk::Str(_) => "string",
            Chunk::List(_) => "list",
            Chunk::Dict(_) => "dict",
            Chunk::Custom(_) => "custom",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Chunk::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Chunk::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Chunk::Int(value) => Some(*value as f64),
            Chunk::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Chunk::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Chunk]> {
        match self {
            Chunk::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Chunk>> {
        match self {
            Chunk::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key of a dictionary chunk.
    pub fn get(&self, key: &str) -> Option<&Chunk> {
        self.as_dict().and_then(|map| map.get(key))
    }

    /// Downcast a custom chunk to its concrete type.
    pub fn downcast_custom<T: 'static>(&self) -> Option<&T> {
        match self {
            Chunk::Custom(custom) => custom.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Concatenate `self` with a later chunk.
    ///
    /// `Null` is the identity. Strings and lists append, numbers add and
    /// dictionaries merge key by key, recursing on shared keys except
    /// `"type"`, which keeps its first value. Kinds that do not line up are
    /// an error rather than an overwrite.
    pub fn concat(&self, other: &Chunk) -> Result<Chunk> {
        match (self, other) {
            (Chunk::Null, right) => Ok(right.clone()),
            (left, Chunk::Null) => Ok(left.clone()),
            (Chunk::Str(left), Chunk::Str(right)) => {
                let mut joined = String::with_capacity(left.len() + right.len());
                joined.push_str(left);
                joined.push_str(right);
                Ok(Chunk::Str(joined))
            }
            (Chunk::Int(left), Chunk::Int(right)) => left
                .checked_add(*right)
                .map(Chunk::Int)
                .ok_or_else(|| Error::ChunkUnsupported(format!("{left} + {right} overflows"))),
            (Chunk::Int(_) | Chunk::Float(_), Chunk::Int(_) | Chunk::Float(_)) => {
                let left = self.as_f64().unwrap_or_default();
                let right = other.as_f64().unwrap_or_default();
                Ok(Chunk::Float(left + right))
            }
            (Chunk::Bool(left), Chunk::Bool(right)) => {
                if left == right {
                    Ok(Chunk::Bool(*left))
                } else {
                    Err(Error::ChunkUnsupported(format!(
                        "differing booleans {left} and {right}"
                    )))
                }
            }
            (Chunk::List(left), Chunk::List(right)) => {
                let mut items = Vec::with_capacity(left.len() + right.len());
                items.extend(left.iter().cloned());
                items.extend(right.iter().cloned());
                Ok(Chunk::List(items))
            }
            (Chunk::Dict(left), Chunk::Dict(right)) => merge_dicts(left, right).map(Chunk::Dict),
            (Chunk::Custom(left), Chunk::Custom(right)) => {
                if left.type_name() != right.type_name() {
                    return Err(Error::ChunkUnsupported(format!(
                        "custom chunk {} with {}",
                        left.type_name(),
                        right.type_name()
                    )));
                }
                left.concat(right.as_ref()).map(Chunk::Custom)
            }
            (left, right) => Err(Error::ChunkMismatch {
                left: left.kind(),
                right: right.kind(),
            }),
        }
    }

    /// Convert to JSON for logs and events.
    pub fn to_json(&self) -> Value {
        match self {
            Chunk::Null => Value::Null,
            Chunk::Bool(value) => Value::Bool(*value),
            Chunk::Int(value) => Value::from(*value),
            Chunk::Float(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Chunk::Str(value) => Value::String(value.clone()),
            Chunk::List(items) => Value::Array(items.iter().map(Chunk::to_json).collect()),
            Chunk::Dict(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Chunk::Custom(custom) => custom.to_json(),
        }
    }

    /// Build a chunk from JSON. Integral numbers that fit an `i64` become
    /// `Int`, every other number becomes `Float`.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Chunk::Null,
            Value::Bool(value) => Chunk::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Chunk::Int(value),
                None => Chunk::Float(number.as_f64().unwrap_or_default()),
            },
            Value::String(value) => Chunk::Str(value),
            Value::Array(items) => Chunk::List(items.into_iter().map(Chunk::from_json).collect()),
            Value::Object(map) => Chunk::Dict(
                map.into_iter()
                    .map(|(key, value)| (key, Chunk::from_json(value)))
                    .collect(),
            ),
        }
    }
}

fn merge_dicts(
    left: &IndexMap<String, Chunk>,
    right: &IndexMap<String, Chunk>,
) -> Result<IndexMap<String, Chunk>> {
    let mut merged = left.clone();
    for (key, right_value) in right {
        match merged.get_mut(key) {
            None => {
                merged.insert(key.clone(), right_value.clone());
            }
            Some(_) if key == "type" => {}
            Some(left_value) => {
                *left_value = left_value
                    .concat(right_value)
                    .map_err(|source| Error::chunk_key(key.clone(), source))?;
            }
        }
    }
    Ok(merged)
}

/// Fold chunks left to right; `None` when there are none.
pub fn concat_all<I>(chunks: I) -> Result<Option<Chunk>>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut acc: Option<Chunk> = None;
    for chunk in chunks {
        acc = Some(match acc {
            None => chunk,
            Some(prev) => prev.concat(&chunk)?,
        });
    }
    Ok(acc)
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Chunk::Null, Chunk::Null) => true,
            (Chunk::Bool(left), Chunk::Bool(right)) => left == right,
            (Chunk::Int(left), Chunk::Int(right)) => left == right,
            (Chunk::Float(left), Chunk::Float(right)) => left == right,
            (Chunk::Str(left), Chunk::Str(right)) => left == right,
            (Chunk::List(left), Chunk::List(right)) => left == right,
            (Chunk::Dict(left), Chunk::Dict(right)) => left == right,
            (Chunk::Custom(left), Chunk::Custom(right)) => {
                left.type_name() == right.type_name() && left.to_json() == right.to_json()
            }
            _ => false,
        }
    }
}

impl Serialize for Chunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<bool> for Chunk {
    fn from(value: bool) -> Self {
        Chunk::Bool(value)
    }
}

impl From<i32> for Chunk {
    fn from(value: i32) -> Self {
        Chunk::Int(i64::from(value))
    }
}

impl From<i64> for Chunk {
    fn from(value: i64) -> Self {
        Chunk::Int(value)
    }
}

impl From<u32> for Chunk {
    fn from(value: u32) -> Self {
        Chunk::Int(i64::from(value))
    }
}

impl From<f64> for Chunk {
    fn from(value: f64) -> Self {
        Chunk::Float(value)
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Chunk::Str(value.to_string())
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Chunk::Str(value)
    }
}

impl From<Vec<Chunk>> for Chunk {
    fn from(items: Vec<Chunk>) -> Self {
        Chunk::List(items)
    }
}

impl From<IndexMap<String, Chunk>> for Chunk {
    fn from(map: IndexMap<String, Chunk>) -> Self {
        Chunk::Dict(map)
    }
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Chunk::from_json(value)
    }
}
