//! Schema-less documents as persisted by the backing store
//!
//! A document belongs to a schema class, carries an engine-assigned record
//! id and version once saved, and holds named fields. Every field records
//! its runtime type next to the value so the value can be decoded back to
//! the same shape after a round-trip through an engine that stores text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DbError;

/// Runtime type tag stored alongside a field value
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    List,
    Embedded,
}

impl FieldType {
    /// Discover the type of a value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Float,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::List,
            Value::Object(_) => FieldType::Embedded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::List => "list",
            FieldType::Embedded => "embedded",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "null" => FieldType::Null,
            "boolean" => FieldType::Boolean,
            "integer" => FieldType::Integer,
            "float" => FieldType::Float,
            "string" => FieldType::String,
            "list" => FieldType::List,
            "embedded" => FieldType::Embedded,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether a value can be stored under this type. Integers are
    /// accepted as floats.
    pub fn accepts(&self, value: &Value) -> bool {
        let actual = FieldType::of(value);
        actual == *self || (*self == FieldType::Float && actual == FieldType::Integer)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Field {
    #[serde(rename = "type")]
    ty: FieldType,
    value: Value,
}

impl Field {
    /// Create a field tagged with the value's own runtime type
    pub fn new(value: Value) -> Self {
        Self {
            ty: FieldType::of(&value),
            value,
        }
    }

    /// Create a field with an explicit type, rejecting values that do not fit
    pub fn with_type(ty: FieldType, value: Value) -> Result<Self, DbError> {
        if !ty.accepts(&value) {
            return Err(DbError::Backend(format!(
                "value of type {} cannot be stored as {}",
                FieldType::of(&value),
                ty
            )));
        }
        Ok(Self { ty, value })
    }

    pub fn field_type(&self) -> FieldType {
        self.ty
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Engine-assigned identity of a saved record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A record of a schema class
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    class: String,
    rid: Option<RecordId>,
    version: u64,
    fields: BTreeMap<String, Field>,
}

impl Document {
    /// Create a new, unsaved document of the given class
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            rid: None,
            version: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Rebuild a document read back from an engine
    pub fn from_record(
        class: impl Into<String>,
        rid: RecordId,
        version: u64,
        fields: BTreeMap<String, Field>,
    ) -> Self {
        Self {
            class: class.into(),
            rid: Some(rid),
            version,
            fields,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn rid(&self) -> Option<&RecordId> {
        self.rid.as_ref()
    }

    /// Version observed when the document was read or last saved
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True until the document has been saved once
    pub fn is_new(&self) -> bool {
        self.rid.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(Field::value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Set a field, re-tagging its type from the new value
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), Field::new(value));
    }

    pub fn set_typed_field(&mut self, name: impl Into<String>, field: Field) {
        self.fields.insert(name.into(), field);
    }

    pub fn take_field(&mut self, name: &str) -> Option<Field> {
        self.fields.remove(name)
    }

    /// Record the identity an engine assigned on save
    pub fn assign(&mut self, rid: RecordId, version: u64) {
        self.rid = Some(rid);
        self.version = version;
    }
}
