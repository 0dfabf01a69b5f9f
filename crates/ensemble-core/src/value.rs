//! Attribute storage: [`ValueId`] keys and the closed [`Value`] union.
//!
//! Every attribute a module or game object carries is a `(ValueId, Value)`
//! pair. A `ValueId` combines a variable id with the id of the plugin that
//! owns the variable, so two plugins can number their variables
//! independently.
//!
//! Typed access goes through [`ValueType`]. Reading a value as the wrong
//! variant is an error; the only implicit conversion is between the two
//! numeric variants (`Int` reads as `f32`, `Float` reads as `i32`).

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Single-precision 3D vector used for positions, velocities and axes.
pub type Vec3 = Vector3<f32>;

/// Single-precision unit quaternion used for orientations.
pub type Quat = UnitQuaternion<f32>;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Plugin-local variable number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Identifier of a concept plugin.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct PluginId(pub u32);

/// Key of one typed attribute slot: `(variable, plugin)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    pub var: VarId,
    pub plugin: PluginId,
}

impl ValueId {
    pub const fn new(var: u32, plugin: u32) -> Self {
        Self {
            var: VarId(var),
            plugin: PluginId(plugin),
        }
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueId({}@{})", self.var.0, self.plugin.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.var.0, self.plugin.0)
    }
}

// ---------------------------------------------------------------------------
// ShortString
// ---------------------------------------------------------------------------

/// UTF-8 string with a fixed maximum length of [`ShortString::CAPACITY`] bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShortString(String);

impl ShortString {
    /// Maximum length in bytes.
    pub const CAPACITY: usize = 31;

    /// Build a short string, failing if `text` exceeds the capacity.
    pub fn new(text: &str) -> Result<Self, CoreError> {
        if text.len() > Self::CAPACITY {
            return Err(CoreError::TextTooLong {
                len: text.len(),
                capacity: Self::CAPACITY,
            });
        }
        Ok(Self(text.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShortString {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ShortString> for String {
    fn from(value: ShortString) -> Self {
        value.0
    }
}

impl fmt::Debug for ShortString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Location {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// The origin with identity orientation.
    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Quat::identity())
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::identity()
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Float(f32),
    Vector(Vec3),
    Quaternion(Quat),
    Bool(bool),
    Text(ShortString),
    Location(Location),
}

impl Value {
    /// Variant name, used in error messages and debug dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Vector(_) => "vector",
            Value::Quaternion(_) => "quaternion",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Location(_) => "location",
        }
    }

    /// Read this value as `T`, applying the numeric coercion.
    pub fn get<T: ValueType>(&self) -> Option<T> {
        T::from_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Vector(v) => write!(f, "({}, {}, {})", v.x, v.y, v.z),
            Value::Quaternion(q) => {
                write!(f, "[w={} x={} y={} z={}]", q.w, q.i, q.j, q.k)
            }
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{:?}", s.as_str()),
            Value::Location(l) => write!(
                f,
                "({}, {}, {}) [w={} x={} y={} z={}]",
                l.position.x,
                l.position.y,
                l.position.z,
                l.orientation.w,
                l.orientation.i,
                l.orientation.j,
                l.orientation.k
            ),
        }
    }
}

/// Ordered attribute map. Ordered so that dumps and snapshots are stable.
pub type ValueStorage = BTreeMap<ValueId, Value>;

// ---------------------------------------------------------------------------
// ValueType
// ---------------------------------------------------------------------------

/// Rust types that can be stored in a [`Value`].
pub trait ValueType: Sized {
    /// Name of the matching variant, for error messages.
    const KIND: &'static str;

    /// Read from a value. Returns `None` on a variant mismatch.
    fn from_value(value: &Value) -> Option<Self>;

    /// Borrow the payload mutably. Only the exact variant matches; the
    /// numeric coercion does not apply here.
    fn as_mut(value: &mut Value) -> Option<&mut Self>;

    fn into_value(self) -> Value;

    /// Value used when a slot is created on first mutable access.
    fn default_value() -> Self;
}

macro_rules! plain_value_type {
    ($ty:ty, $variant:ident, $kind:literal, $default:expr) => {
        impl ValueType for $ty {
            const KIND: &'static str = $kind;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn as_mut(value: &mut Value) -> Option<&mut Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn default_value() -> Self {
                $default
            }
        }
    };
}

plain_value_type!(Vec3, Vector, "vector", Vec3::zeros());
plain_value_type!(Quat, Quaternion, "quaternion", Quat::identity());
plain_value_type!(bool, Bool, "bool", false);
plain_value_type!(ShortString, Text, "text", ShortString::default());
plain_value_type!(Location, Location, "location", Location::identity());

impl ValueType for i32 {
    const KIND: &'static str = "int";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i32),
            _ => None,
        }
    }

    fn as_mut(value: &mut Value) -> Option<&mut Self> {
        match value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Int(self)
    }

    fn default_value() -> Self {
        0
    }
}

impl ValueType for f32 {
    const KIND: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn as_mut(value: &mut Value) -> Option<&mut Self> {
        match value {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn default_value() -> Self {
        0.0
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Self {
        Value::Vector(v)
    }
}

impl From<Quat> for Value {
    fn from(v: Quat) -> Self {
        Value::Quaternion(v)
    }
}

impl From<Location> for Value {
    fn from(v: Location) -> Self {
        Value::Location(v)
    }
}

/// Read `value` (stored under `id`) as `T`, or fail with a type mismatch.
pub(crate) fn read_as<T: ValueType>(id: ValueId, value: &Value) -> Result<T, CoreError> {
    T::from_value(value).ok_or(CoreError::ValueType {
        id,
        expected: T::KIND,
        found: value.kind_name(),
    })
}

/// Mutable access to the slot `id`, creating it with `T::default_value()`
/// when absent.
pub(crate) fn slot_mut<T: ValueType>(
    storage: &mut ValueStorage,
    id: ValueId,
) -> Result<&mut T, CoreError> {
    let value = storage
        .entry(id)
        .or_insert_with(|| T::default_value().into_value());
    let found = value.kind_name();
    T::as_mut(value).ok_or(CoreError::ValueType {
        id,
        expected: T::KIND,
        found,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SPEED: ValueId = ValueId::new(3, 1);

    #[test]
    fn numeric_variants_coerce() {
        assert_eq!(Value::Int(4).get::<f32>(), Some(4.0));
        assert_eq!(Value::Float(2.9).get::<i32>(), Some(2));
        assert_eq!(Value::Float(-2.9).get::<i32>(), Some(-2));
    }

    #[test]
    fn wrong_variant_is_an_error() {
        let err = read_as::<Vec3>(SPEED, &Value::Bool(true)).unwrap_err();
        match err {
            CoreError::ValueType {
                id,
                expected,
                found,
            } => {
                assert_eq!(id, SPEED);
                assert_eq!(expected, "vector");
                assert_eq!(found, "bool");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(Value::Int(1).get::<bool>().is_none());
    }

    #[test]
    fn mutable_access_does_not_coerce() {
        let mut storage = ValueStorage::new();
        storage.insert(SPEED, Value::Int(5));
        assert!(slot_mut::<f32>(&mut storage, SPEED).is_err());
        *slot_mut::<i32>(&mut storage, SPEED).unwrap() += 1;
        assert_eq!(storage[&SPEED], Value::Int(6));
    }

    #[test]
    fn mutable_access_creates_default() {
        let mut storage = ValueStorage::new();
        let loc = slot_mut::<Location>(&mut storage, SPEED).unwrap();
        assert_eq!(*loc, Location::identity());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn short_string_capacity() {
        assert!(ShortString::new("turret").is_ok());
        let long = "x".repeat(ShortString::CAPACITY + 1);
        assert!(matches!(
            ShortString::new(&long),
            Err(CoreError::TextTooLong { len: 32, capacity: 31 })
        ));
    }

    #[test]
    fn value_json_round_trip_rejects_long_text() {
        let json = serde_json::json!({ "Text": "x".repeat(40) });
        assert!(serde_json::from_value::<Value>(json).is_err());

        let v = Value::Text(ShortString::new("ok").unwrap());
        let back: Value = serde_json::from_value(serde_json::to_value(&v).unwrap()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn value_ids_order_by_var_then_plugin() {
        let mut ids = vec![ValueId::new(2, 1), ValueId::new(1, 2), ValueId::new(1, 1)];
        ids.sort();
        assert_eq!(
            ids,
            vec![ValueId::new(1, 1), ValueId::new(1, 2), ValueId::new(2, 1)]
        );
    }
}
