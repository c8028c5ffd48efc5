//! Typed conversions between Rust values and [`PropertyValue`] variants.

use super::{PropertyList, PropertyTree, PropertyValue};

/// Types that can be read out of a property node.
///
/// Conversion is strict: each type maps to exactly one variant.
pub trait FromProperty<'a>: Sized {
    /// Variant name reported in `TypeMismatch` errors.
    const KIND: &'static str;

    fn from_property(value: &'a PropertyValue) -> Option<Self>;
}

/// Types that can be stored into an owned property tree.
pub trait IntoProperty {
    fn into_property(self) -> PropertyValue;
}

/// An opaque byte, distinct from `uint8` in the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Byte(pub u8);

/// A high resolution timestamp in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HrTime(pub i64);

macro_rules! scalar_property {
    ($ty:ty, $scalar:ident, $array:ident, $kind:literal) => {
        impl<'a> FromProperty<'a> for $ty {
            const KIND: &'static str = $kind;

            fn from_property(value: &'a PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$scalar(v) => Some(*v),
                    _ => None,
                }
            }
        }

        impl<'a> FromProperty<'a> for Vec<$ty> {
            const KIND: &'static str = concat!($kind, " array");

            fn from_property(value: &'a PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$array(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl<'a> FromProperty<'a> for &'a [$ty] {
            const KIND: &'static str = concat!($kind, " array");

            fn from_property(value: &'a PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$array(v) => Some(v.as_slice()),
                    _ => None,
                }
            }
        }

        impl IntoProperty for $ty {
            fn into_property(self) -> PropertyValue {
                PropertyValue::$scalar(self)
            }
        }

        impl IntoProperty for Vec<$ty> {
            fn into_property(self) -> PropertyValue {
                PropertyValue::$array(self)
            }
        }
    };
}

scalar_property!(bool, Boolean, BooleanArray, "boolean");
scalar_property!(i8, Int8, Int8Array, "int8");
scalar_property!(u8, UInt8, UInt8Array, "uint8");
scalar_property!(i16, Int16, Int16Array, "int16");
scalar_property!(u16, UInt16, UInt16Array, "uint16");
scalar_property!(i32, Int32, Int32Array, "int32");
scalar_property!(u32, UInt32, UInt32Array, "uint32");
scalar_property!(i64, Int64, Int64Array, "int64");
scalar_property!(u64, UInt64, UInt64Array, "uint64");

impl<'a> FromProperty<'a> for f64 {
    const KIND: &'static str = "double";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl IntoProperty for f64 {
    fn into_property(self) -> PropertyValue {
        PropertyValue::Double(self)
    }
}

impl<'a> FromProperty<'a> for HrTime {
    const KIND: &'static str = "hrtime";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::HrTime(v) => Some(HrTime(*v)),
            _ => None,
        }
    }
}

impl IntoProperty for HrTime {
    fn into_property(self) -> PropertyValue {
        PropertyValue::HrTime(self.0)
    }
}

impl<'a> FromProperty<'a> for Byte {
    const KIND: &'static str = "byte";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Byte(v) => Some(Byte(*v)),
            _ => None,
        }
    }
}

impl<'a> FromProperty<'a> for Vec<Byte> {
    const KIND: &'static str = "byte array";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::ByteArray(v) => Some(v.iter().copied().map(Byte).collect()),
            _ => None,
        }
    }
}

impl IntoProperty for Byte {
    fn into_property(self) -> PropertyValue {
        PropertyValue::Byte(self.0)
    }
}

impl IntoProperty for Vec<Byte> {
    fn into_property(self) -> PropertyValue {
        PropertyValue::ByteArray(self.into_iter().map(|b| b.0).collect())
    }
}

impl<'a> FromProperty<'a> for String {
    const KIND: &'static str = "string";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl<'a> FromProperty<'a> for &'a str {
    const KIND: &'static str = "string";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl<'a> FromProperty<'a> for Vec<String> {
    const KIND: &'static str = "string array";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::StringArray(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl<'a> FromProperty<'a> for Vec<&'a str> {
    const KIND: &'static str = "string array";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::StringArray(v) => Some(v.iter().map(String::as_str).collect()),
            _ => None,
        }
    }
}

impl IntoProperty for String {
    fn into_property(self) -> PropertyValue {
        PropertyValue::String(self)
    }
}

impl IntoProperty for &str {
    fn into_property(self) -> PropertyValue {
        PropertyValue::String(self.to_string())
    }
}

impl IntoProperty for Vec<String> {
    fn into_property(self) -> PropertyValue {
        PropertyValue::StringArray(self)
    }
}

impl IntoProperty for Vec<&str> {
    fn into_property(self) -> PropertyValue {
        PropertyValue::StringArray(self.into_iter().map(str::to_string).collect())
    }
}

impl<'a> FromProperty<'a> for PropertyTree<'a> {
    const KIND: &'static str = "tree";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Tree(list) => Some(PropertyTree::borrowed(list)),
            _ => None,
        }
    }
}

impl<'a> FromProperty<'a> for Vec<PropertyTree<'a>> {
    const KIND: &'static str = "tree array";

    fn from_property(value: &'a PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::TreeArray(lists) => {
                Some(lists.iter().map(PropertyTree::borrowed).collect())
            }
            _ => None,
        }
    }
}

impl IntoProperty for PropertyList {
    fn into_property(self) -> PropertyValue {
        PropertyValue::Tree(self)
    }
}

impl IntoProperty for Vec<PropertyList> {
    fn into_property(self) -> PropertyValue {
        PropertyValue::TreeArray(self)
    }
}

impl IntoProperty for PropertyTree<'_> {
    fn into_property(self) -> PropertyValue {
        PropertyValue::Tree(self.into_list())
    }
}

impl IntoProperty for PropertyValue {
    fn into_property(self) -> PropertyValue {
        self
    }
}
