//! Index value types, capabilities and definitions.

use crate::error::{CoreError, CoreResult};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::ops::BitOr;

/// Declared type of an index's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// UTF-8 text, compared ordinally.
    Text,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float, totally ordered.
    Float,
    /// Boolean.
    Boolean,
}

impl ValueType {
    /// Returns the persisted type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
        }
    }

    /// Resolves a persisted type name.
    pub fn from_name(name: &str) -> CoreResult<Self> {
        match name {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            other => Err(CoreError::invalid_format(format!(
                "unknown index value type: {other}"
            ))),
        }
    }

    /// Converts a text form into a value of this type.
    ///
    /// Text is trimmed; `None` if the text does not parse.
    #[must_use]
    pub fn parse(self, text: &str) -> Option<IndexValue> {
        let text = text.trim();
        match self {
            Self::Text => Some(IndexValue::Text(text.to_owned())),
            Self::Integer => text.parse().ok().map(IndexValue::Integer),
            Self::Float => text
                .parse::<f64>()
                .ok()
                .filter(|f| !f.is_nan())
                .map(IndexValue::Float),
            Self::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" => Some(IndexValue::Boolean(true)),
                "false" => Some(IndexValue::Boolean(false)),
                _ => None,
            },
        }
    }

    /// Converts a value of any type into this type, normalized as
    /// [`parse`](Self::parse) would leave it.
    #[must_use]
    pub fn coerce(self, value: &IndexValue) -> Option<IndexValue> {
        match value {
            IndexValue::Text(_) => self.parse(&value.text_form()),
            _ if value.value_type() == self => Some(value.clone()),
            _ => self.parse(&value.text_form()),
        }
    }

    /// Converts a scalar JSON value into this type.
    ///
    /// Null, arrays and objects yield `None`.
    #[must_use]
    pub fn from_json(self, value: &JsonValue) -> Option<IndexValue> {
        match value {
            JsonValue::String(s) => self.parse(s),
            JsonValue::Number(n) => match self {
                Self::Integer => n.as_i64().map(IndexValue::Integer),
                Self::Float => n.as_f64().map(IndexValue::Float),
                _ => self.parse(&n.to_string()),
            },
            JsonValue::Bool(b) => match self {
                Self::Boolean => Some(IndexValue::Boolean(*b)),
                _ => self.parse(&b.to_string()),
            },
            JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed index value.
///
/// Values order by type first, then by value; floats use a total order.
#[derive(Debug, Clone)]
pub enum IndexValue {
    /// Text value.
    Text(String),
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Boolean value.
    Boolean(bool),
}

impl IndexValue {
    /// Returns the value's type.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Text(_) => ValueType::Text,
            Self::Integer(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::Boolean(_) => ValueType::Boolean,
        }
    }

    /// Returns the text form persisted in the index log.
    #[must_use]
    pub fn text_form(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }

    /// Returns the text if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Text(_) => 0,
            Self::Integer(_) => 1,
            Self::Float(_) => 2,
            Self::Boolean(_) => 3,
        }
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text_form())
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for IndexValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Capability flags of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No capabilities.
    pub const NONE: Self = Self(0);
    /// Equality and range lookup over the sorted entries.
    pub const SORTED: Self = Self(0x01);
    /// Fuzzy full-text search over text values.
    pub const FULL_TEXT: Self = Self(0x02);

    /// Creates capabilities from the raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns true if all flags of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A secondary index declared in the engine configuration.
///
/// Values are taken from the entity's JSON-shaped form by a dotted `path`.
/// Arrays along the path contribute one value per element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Name; also names the index's log file.
    pub name: String,
    /// Dotted field path, e.g. `author.name`.
    pub path: String,
    /// Declared value type.
    pub value_type: ValueType,
    /// Capability flags.
    pub capabilities: Capabilities,
}

impl IndexDefinition {
    /// Creates a sorted index definition.
    pub fn new(name: impl Into<String>, path: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            value_type,
            capabilities: Capabilities::SORTED,
        }
    }

    /// Creates a text index with sorted and full-text capabilities.
    pub fn text(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, path, ValueType::Text).with_capabilities(Capabilities::SORTED | Capabilities::FULL_TEXT)
    }

    /// Replaces the capability flags.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Checks that the definition can back an index.
    pub fn validate(&self) -> CoreResult<()> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(CoreError::invalid_operation(format!(
                "index name {:?} must be non-empty ASCII letters, digits, '_' or '-'",
                self.name
            )));
        }
        if self.path.split('.').any(str::is_empty) {
            return Err(CoreError::invalid_operation(format!(
                "index {} has an empty segment in path {:?}",
                self.name, self.path
            )));
        }
        if self.capabilities.contains(Capabilities::FULL_TEXT) && self.value_type != ValueType::Text {
            return Err(CoreError::invalid_operation(format!(
                "full-text index {} must hold text values",
                self.name
            )));
        }
        Ok(())
    }

    /// Extracts this index's values from an entity.
    #[must_use]
    pub fn extract(&self, entity: &JsonValue) -> Vec<IndexValue> {
        let mut current = vec![entity];
        for segment in self.path.split('.') {
            let mut next = Vec::new();
            for value in current {
                collect_field(value, segment, &mut next);
            }
            current = next;
        }

        let mut values = Vec::new();
        for value in current {
            match value {
                JsonValue::Array(items) => values.extend(
                    items
                        .iter()
                        .filter_map(|item| self.value_type.from_json(item)),
                ),
                scalar => values.extend(self.value_type.from_json(scalar)),
            }
        }
        values
    }
}

fn collect_field<'a>(value: &'a JsonValue, segment: &str, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Object(map) => out.extend(map.get(segment)),
        JsonValue::Array(items) => {
            for item in items {
                collect_field(item, segment, out);
            }
        }
        _ => {}
    }
}
