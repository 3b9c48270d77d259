//! Field semantics.
//!
//! Every field of a model is one of three kinds: a scalar attribute, a
//! foreign key, or a many-to-many set. [`FieldKind`] is the single dispatch
//! point for equality, wire conversion, indexing, diffing and diff
//! application; the rest of the crate matches on it instead of on field
//! names.

use crate::error::{Error, Result};
use crate::id::{IdArena, ObjectRef};
use crate::value::{IndexKey, RefSet, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;

/// Scalar attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Enum,
    /// Untyped; JSON scalars map to the closest value, structures are kept.
    Any,
}

impl AttributeType {
    /// Parse a description type name. Unknown or missing names are untyped.
    pub fn parse(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return AttributeType::Any;
        };
        match name.to_ascii_lowercase().as_str() {
            "text" | "string" | "char" => AttributeType::Text,
            "integer" | "int" => AttributeType::Integer,
            "float" | "double" | "decimal" | "number" => AttributeType::Float,
            "boolean" | "bool" => AttributeType::Boolean,
            "timestamp" | "datetime" => AttributeType::Timestamp,
            "date" => AttributeType::Date,
            "enum" => AttributeType::Enum,
            _ => AttributeType::Any,
        }
    }

    /// Whether an empty string is a value of its own rather than "no value".
    pub fn keeps_empty_string(self) -> bool {
        matches!(self, AttributeType::Text | AttributeType::Any)
    }

    /// Convert an external value to its canonical internal form.
    pub fn to_internal(self, field: &str, json: &Json) -> Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        if json.as_str() == Some("") && !self.keeps_empty_string() {
            return Ok(Value::Null);
        }
        let invalid = |reason: &str| Error::InvalidValue {
            field: field.to_string(),
            reason: format!("{} ({})", reason, json),
        };

        match self {
            AttributeType::Text => match json {
                Json::String(s) => Ok(Value::Text(s.clone())),
                Json::Number(n) => Ok(Value::Text(n.to_string())),
                Json::Bool(b) => Ok(Value::Text(b.to_string())),
                _ => Err(invalid("expected text")),
            },
            AttributeType::Integer => match json {
                Json::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Value::Int)
                    .ok_or_else(|| invalid("expected an integer")),
                Json::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| invalid("expected an integer")),
                _ => Err(invalid("expected an integer")),
            },
            AttributeType::Float => match json {
                Json::Number(n) => n
                    .as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| invalid("expected a number")),
                Json::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| invalid("expected a number")),
                _ => Err(invalid("expected a number")),
            },
            AttributeType::Boolean => Ok(Value::Bool(match json {
                Json::Bool(b) => *b,
                Json::String(s) => s == "true" || s == "TRUE",
                Json::Number(n) => n.as_i64() == Some(1),
                _ => false,
            })),
            AttributeType::Timestamp => match json {
                Json::String(s) => parse_timestamp(s)
                    .map(Value::Timestamp)
                    .ok_or_else(|| invalid("expected an RFC 3339 timestamp")),
                Json::Number(n) => n
                    .as_i64()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(Value::Timestamp)
                    .ok_or_else(|| invalid("expected epoch milliseconds")),
                _ => Err(invalid("expected a timestamp")),
            },
            AttributeType::Date => match json {
                Json::String(s) => parse_date(s)
                    .map(Value::Date)
                    .ok_or_else(|| invalid("expected YYYY-MM-DD")),
                _ => Err(invalid("expected a date")),
            },
            AttributeType::Enum => match json {
                Json::String(s) => Ok(Value::Text(s.clone())),
                Json::Number(n) => Ok(Value::Text(n.to_string())),
                _ => Err(invalid("expected an enum label")),
            },
            AttributeType::Any => Ok(match json {
                Json::Bool(b) => Value::Bool(*b),
                Json::Number(n) => match n.as_i64() {
                    Some(i) => Value::Int(i),
                    None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
                },
                Json::String(s) => Value::Text(s.clone()),
                other => Value::Json(other.clone()),
            }),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::Text => "text",
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Boolean => "boolean",
            AttributeType::Timestamp => "timestamp",
            AttributeType::Date => "date",
            AttributeType::Enum => "enum",
            AttributeType::Any => "any",
        };
        f.write_str(name)
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
}

/// Closed set of field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Attribute(AttributeType),
    ForeignKey,
    ManyToMany,
}

/// Change to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDiff {
    /// Scalar or foreign-key change
    Change { from: Value, to: Value },
    /// Many-to-many membership change
    Set { removed: RefSet, added: RefSet },
}

impl FieldDiff {
    /// The value this diff leaves behind when applied in the given direction,
    /// for scalar changes.
    pub fn target(&self, reverse: bool) -> Option<&Value> {
        match self {
            FieldDiff::Change { from, to } => Some(if reverse { from } else { to }),
            FieldDiff::Set { .. } => None,
        }
    }

    pub fn map_ids(&self, mut f: impl FnMut(crate::Id) -> crate::Id) -> FieldDiff {
        match self {
            FieldDiff::Change { from, to } => FieldDiff::Change {
                from: from.map_ids(&mut f),
                to: to.map_ids(&mut f),
            },
            FieldDiff::Set { removed, added } => FieldDiff::Set {
                removed: removed.iter().map(&mut f).collect(),
                added: added.iter().map(&mut f).collect(),
            },
        }
    }
}

impl FieldKind {
    pub fn is_relationship(self) -> bool {
        !matches!(self, FieldKind::Attribute(_))
    }

    /// The "no value" value for this kind.
    pub fn empty(self) -> Value {
        match self {
            FieldKind::ManyToMany => Value::Refs(RefSet::new()),
            _ => Value::Null,
        }
    }

    pub fn equals(self, a: &Value, b: &Value) -> bool {
        match self {
            FieldKind::ManyToMany => as_set(a) == as_set(b),
            _ => a == b,
        }
    }

    /// Convert an external value. Relationship targets are interned in
    /// `arena`; they must already be `{type, id}` objects.
    pub fn to_internal(self, field: &str, json: &Json, arena: &mut IdArena) -> Result<Value> {
        match self {
            FieldKind::Attribute(ty) => ty.to_internal(field, json),
            FieldKind::ForeignKey => Ok(match parse_ref(field, json)? {
                Some(r) => Value::Ref(arena.intern(&r)),
                None => Value::Null,
            }),
            FieldKind::ManyToMany => Ok(Value::Refs(
                parse_refs(field, json)?
                    .iter()
                    .map(|r| arena.intern(r))
                    .collect(),
            )),
        }
    }

    /// Convert an internal value to its external form.
    pub fn from_internal(self, value: &Value, arena: &IdArena) -> Json {
        match value {
            Value::Null => match self {
                FieldKind::ManyToMany => Json::Array(Vec::new()),
                _ => Json::Null,
            },
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::Json(j) => j.clone(),
            Value::Ref(id) => arena.get(*id).to_json(),
            Value::Refs(set) => Json::Array(set.iter().map(|id| arena.get(id).to_json()).collect()),
        }
    }

    pub fn to_indexable(self, value: &Value) -> Vec<IndexKey> {
        match (self, value) {
            (FieldKind::ManyToMany, Value::Null) => Vec::new(),
            _ => IndexKey::of(value),
        }
    }

    /// `None` when the values are equal under this kind.
    pub fn diff(self, from: &Value, to: &Value) -> Option<FieldDiff> {
        if self.equals(from, to) {
            return None;
        }
        Some(match self {
            FieldKind::ManyToMany => {
                let (from, to) = (as_set(from), as_set(to));
                FieldDiff::Set {
                    removed: from.difference(&to),
                    added: to.difference(&from),
                }
            }
            _ => FieldDiff::Change {
                from: from.clone(),
                to: to.clone(),
            },
        })
    }

    pub fn apply_diff(self, current: &Value, diff: &FieldDiff, reverse: bool) -> Value {
        match diff {
            FieldDiff::Change { from, to } => {
                if reverse {
                    from.clone()
                } else {
                    to.clone()
                }
            }
            FieldDiff::Set { removed, added } => {
                let (removed, added) = if reverse {
                    (added, removed)
                } else {
                    (removed, added)
                };
                Value::Refs(as_set(current).difference(removed).union(added))
            }
        }
    }

    /// Whether `diff` was recorded against `current`.
    pub fn matches_origin(self, current: &Value, diff: &FieldDiff, reverse: bool) -> bool {
        match diff {
            FieldDiff::Change { from, to } => {
                let origin = if reverse { to } else { from };
                self.equals(current, origin)
            }
            FieldDiff::Set { removed, added } => {
                let removed = if reverse { added } else { removed };
                let current = as_set(current);
                removed.iter().all(|id| current.contains(id))
            }
        }
    }
}

fn as_set(value: &Value) -> RefSet {
    match value {
        Value::Refs(set) => set.clone(),
        Value::Ref(id) => std::iter::once(*id).collect(),
        _ => RefSet::new(),
    }
}

/// Parse a foreign-key value. Null and empty strings mean "no target".
pub(crate) fn parse_ref(field: &str, json: &Json) -> Result<Option<ObjectRef>> {
    match json {
        Json::Null => Ok(None),
        Json::String(s) if s.is_empty() => Ok(None),
        other => ObjectRef::from_json(other)
            .map(Some)
            .ok_or_else(|| Error::InvalidValue {
                field: field.to_string(),
                reason: format!("expected {{type, id}}, got {}", other),
            }),
    }
}

/// Parse a many-to-many value: an array of references, a single reference,
/// or nothing.
pub(crate) fn parse_refs(field: &str, json: &Json) -> Result<Vec<ObjectRef>> {
    match json {
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(r) = parse_ref(field, item)? {
                    out.push(r);
                }
            }
            Ok(out)
        }
        other => Ok(parse_ref(field, other)?.into_iter().collect()),
    }
}
