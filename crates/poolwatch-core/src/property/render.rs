//! Debug rendering of property trees: a deterministic, roughly JSON layout,
//! plus a proper `serde_json::Value` conversion for machine output.

use super::{PropertyList, PropertyTree, PropertyValue};
use serde_json::{Map, Number, Value};
use std::fmt::{self, Display, Formatter, Write};

fn write_list(f: &mut Formatter<'_>, list: &PropertyList) -> fmt::Result {
    f.write_str("{\n")?;
    for (idx, (name, value)) in list.entries.iter().enumerate() {
        if idx > 0 {
            f.write_str(",\n")?;
        }
        write_string(f, name)?;
        f.write_str(": ")?;
        write_value(f, value)?;
    }
    f.write_str("\n}")
}

fn write_string(f: &mut Formatter<'_>, value: &str) -> fmt::Result {
    f.write_char('"')?;
    for ch in value.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            other => f.write_char(other)?,
        }
    }
    f.write_char('"')
}

fn write_array<T>(
    f: &mut Formatter<'_>,
    values: &[T],
    mut each: impl FnMut(&mut Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    f.write_str("[\n")?;
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            f.write_str(",\n")?;
        }
        each(f, value)?;
    }
    f.write_str("\n]")
}

fn write_byte(f: &mut Formatter<'_>, value: &u8) -> fmt::Result {
    write!(f, "0x{value:02x}")
}

fn write_value(f: &mut Formatter<'_>, value: &PropertyValue) -> fmt::Result {
    match value {
        PropertyValue::Boolean(v) => write!(f, "{v}"),
        PropertyValue::Byte(v) => write_byte(f, v),
        PropertyValue::Int8(v) => write!(f, "{v}"),
        PropertyValue::UInt8(v) => write!(f, "{v}"),
        PropertyValue::Int16(v) => write!(f, "{v}"),
        PropertyValue::UInt16(v) => write!(f, "{v}"),
        PropertyValue::Int32(v) => write!(f, "{v}"),
        PropertyValue::UInt32(v) => write!(f, "{v}"),
        PropertyValue::Int64(v) => write!(f, "{v}"),
        PropertyValue::UInt64(v) => write!(f, "{v}"),
        PropertyValue::Double(v) => write!(f, "{v}"),
        PropertyValue::HrTime(v) => write!(f, "{v}"),
        PropertyValue::String(v) => write_string(f, v),
        PropertyValue::Tree(list) => write_list(f, list),
        PropertyValue::BooleanArray(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::ByteArray(v) => write_array(f, v, write_byte),
        PropertyValue::Int8Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::UInt8Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::Int16Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::UInt16Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::Int32Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::UInt32Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::Int64Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::UInt64Array(v) => write_array(f, v, |f, x| write!(f, "{x}")),
        PropertyValue::StringArray(v) => write_array(f, v, |f, x| write_string(f, x)),
        PropertyValue::TreeArray(v) => write_array(f, v, write_list),
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_value(f, self)
    }
}

impl Display for PropertyTree<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.list() {
            Some(list) => write_list(f, list),
            None => f.write_str("null"),
        }
    }
}

fn list_to_json(list: &PropertyList) -> Value {
    let mut map = Map::new();
    for (name, value) in &list.entries {
        map.insert(name.clone(), value_to_json(value));
    }
    Value::Object(map)
}

fn numbers<T: Copy + Into<Number>>(values: &[T]) -> Value {
    Value::Array(values.iter().map(|v| Value::Number((*v).into())).collect())
}

fn value_to_json(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Boolean(v) => Value::Bool(*v),
        PropertyValue::Byte(v) | PropertyValue::UInt8(v) => Value::from(*v),
        PropertyValue::Int8(v) => Value::from(*v),
        PropertyValue::Int16(v) => Value::from(*v),
        PropertyValue::UInt16(v) => Value::from(*v),
        PropertyValue::Int32(v) => Value::from(*v),
        PropertyValue::UInt32(v) => Value::from(*v),
        PropertyValue::Int64(v) | PropertyValue::HrTime(v) => Value::from(*v),
        PropertyValue::UInt64(v) => Value::from(*v),
        PropertyValue::Double(v) => Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        PropertyValue::String(v) => Value::String(v.clone()),
        PropertyValue::Tree(list) => list_to_json(list),
        PropertyValue::BooleanArray(v) => Value::Array(v.iter().map(|b| Value::Bool(*b)).collect()),
        PropertyValue::ByteArray(v) | PropertyValue::UInt8Array(v) => numbers(v),
        PropertyValue::Int8Array(v) => numbers(v),
        PropertyValue::Int16Array(v) => numbers(v),
        PropertyValue::UInt16Array(v) => numbers(v),
        PropertyValue::Int32Array(v) => numbers(v),
        PropertyValue::UInt32Array(v) => numbers(v),
        PropertyValue::Int64Array(v) => numbers(v),
        PropertyValue::UInt64Array(v) => numbers(v),
        PropertyValue::StringArray(v) => {
            Value::Array(v.iter().map(|s| Value::String(s.clone())).collect())
        }
        PropertyValue::TreeArray(v) => Value::Array(v.iter().map(list_to_json).collect()),
    }
}

impl PropertyTree<'_> {
    /// Structured form for machine-readable output.
    pub fn to_json(&self) -> Value {
        match self.list() {
            Some(list) => list_to_json(list),
            None => Value::Null,
        }
    }
}
