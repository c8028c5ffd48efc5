//! Self-describing, ordered, typed property trees.
//!
//! Every piece of pool and dataset metadata exchanged with the volume manager
//! travels as a [`PropertyTree`]: an ordered list of uniquely named nodes, each
//! holding one [`PropertyValue`]. Trees are either *owned* (storage released
//! when the tree is dropped) or *borrowed* (a view whose lifetime is tied to
//! whatever owns the storage, usually a pool handle).

mod convert;
mod render;

pub use convert::{Byte, FromProperty, HrTime, IntoProperty};

use crate::error::{PoolwatchError, PoolwatchResult};
use std::mem;

/// One typed value. Arrays are homogeneous.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Boolean(bool),
    Byte(u8),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    HrTime(i64),
    String(String),
    Tree(PropertyList),
    BooleanArray(Vec<bool>),
    ByteArray(Vec<u8>),
    Int8Array(Vec<i8>),
    UInt8Array(Vec<u8>),
    Int16Array(Vec<i16>),
    UInt16Array(Vec<u16>),
    Int32Array(Vec<i32>),
    UInt32Array(Vec<u32>),
    Int64Array(Vec<i64>),
    UInt64Array(Vec<u64>),
    StringArray(Vec<String>),
    TreeArray(Vec<PropertyList>),
}

impl PropertyValue {
    /// Name of the variant, used in type mismatch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Byte(_) => "byte",
            PropertyValue::Int8(_) => "int8",
            PropertyValue::UInt8(_) => "uint8",
            PropertyValue::Int16(_) => "int16",
            PropertyValue::UInt16(_) => "uint16",
            PropertyValue::Int32(_) => "int32",
            PropertyValue::UInt32(_) => "uint32",
            PropertyValue::Int64(_) => "int64",
            PropertyValue::UInt64(_) => "uint64",
            PropertyValue::Double(_) => "double",
            PropertyValue::HrTime(_) => "hrtime",
            PropertyValue::String(_) => "string",
            PropertyValue::Tree(_) => "tree",
            PropertyValue::BooleanArray(_) => "boolean array",
            PropertyValue::ByteArray(_) => "byte array",
            PropertyValue::Int8Array(_) => "int8 array",
            PropertyValue::UInt8Array(_) => "uint8 array",
            PropertyValue::Int16Array(_) => "int16 array",
            PropertyValue::UInt16Array(_) => "uint16 array",
            PropertyValue::Int32Array(_) => "int32 array",
            PropertyValue::UInt32Array(_) => "uint32 array",
            PropertyValue::Int64Array(_) => "int64 array",
            PropertyValue::UInt64Array(_) => "uint64 array",
            PropertyValue::StringArray(_) => "string array",
            PropertyValue::TreeArray(_) => "tree array",
        }
    }
}

/// Backing storage of a tree: insertion-ordered entries with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyList {
    entries: Vec<(String, PropertyValue)>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, replacing an existing entry with the same key.
    pub fn with<V: IntoProperty>(mut self, key: &str, value: V) -> Self {
        self.insert(key, value.into_property());
        self
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(name, _)| name == key)
    }

    fn insert(&mut self, key: &str, value: PropertyValue) {
        match self.position(key) {
            Some(idx) => self.entries[idx].1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    fn get(&self, key: &str) -> Option<(&str, &PropertyValue)> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Repr<'a> {
    Null,
    Borrowed(&'a PropertyList),
    Owned(Box<PropertyList>),
}

/// A property tree with explicit ownership.
///
/// Exactly one owner releases the storage: an owned tree releases it on drop,
/// `take()` transfers it and leaves the source null, and a borrowed tree never
/// releases anything.
pub struct PropertyTree<'a> {
    repr: Repr<'a>,
}

/// A named entry yielded by lookups and iteration.
#[derive(Debug, Clone, Copy)]
pub struct PropertyNode<'a> {
    name: &'a str,
    value: &'a PropertyValue,
}

impl<'a> PropertyNode<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn value(&self) -> &'a PropertyValue {
        self.value
    }

    pub fn kind(&self) -> &'static str {
        self.value.kind()
    }

    /// Strict conversion; a different variant is a `TypeMismatch`, never a coercion.
    pub fn get<T: FromProperty<'a>>(&self) -> PoolwatchResult<T> {
        T::from_property(self.value).ok_or_else(|| PoolwatchError::TypeMismatch {
            key: self.name.to_string(),
            expected: T::KIND,
            found: self.value.kind(),
        })
    }
}

impl Default for PropertyTree<'_> {
    fn default() -> Self {
        Self { repr: Repr::Null }
    }
}

impl From<PropertyList> for PropertyTree<'static> {
    fn from(list: PropertyList) -> Self {
        Self {
            repr: Repr::Owned(Box::new(list)),
        }
    }
}

impl<'a> PropertyTree<'a> {
    /// An empty owned tree.
    pub fn new() -> PropertyTree<'static> {
        PropertyTree::from(PropertyList::new())
    }

    /// A view into storage owned elsewhere.
    pub fn borrowed(list: &'a PropertyList) -> Self {
        Self {
            repr: Repr::Borrowed(list),
        }
    }

    /// Transfer the contents out, leaving this tree null.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// A borrowed view of this tree, whatever its ownership mode.
    pub fn view(&self) -> PropertyTree<'_> {
        match self.list() {
            Some(list) => PropertyTree::borrowed(list),
            None => PropertyTree::default(),
        }
    }

    /// Detach from the producer, copying borrowed storage if necessary.
    pub fn into_owned(mut self) -> PropertyTree<'static> {
        match mem::replace(&mut self.repr, Repr::Null) {
            Repr::Null => PropertyTree::default(),
            Repr::Borrowed(list) => PropertyTree::from(list.clone()),
            Repr::Owned(list) => PropertyTree {
                repr: Repr::Owned(list),
            },
        }
    }

    /// Hand the storage over to a parent tree.
    pub(crate) fn into_list(mut self) -> PropertyList {
        match mem::replace(&mut self.repr, Repr::Null) {
            Repr::Null => PropertyList::new(),
            Repr::Borrowed(list) => list.clone(),
            Repr::Owned(list) => *list,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.repr, Repr::Null)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.repr, Repr::Owned(_))
    }

    pub fn is_empty(&self) -> bool {
        self.list().map(PropertyList::is_empty).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.list().map(PropertyList::len).unwrap_or(0)
    }

    fn list(&self) -> Option<&PropertyList> {
        match &self.repr {
            Repr::Null => None,
            Repr::Borrowed(list) => Some(list),
            Repr::Owned(list) => Some(list),
        }
    }

    fn list_mut(&mut self, action: &str) -> PoolwatchResult<&mut PropertyList> {
        match &mut self.repr {
            Repr::Owned(list) => Ok(list),
            Repr::Borrowed(_) => Err(PoolwatchError::failed(
                action,
                "property tree is a borrowed view and cannot be modified",
            )),
            Repr::Null => Err(PoolwatchError::failed(action, "property tree is null")),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.list().and_then(|list| list.get(key)).is_some()
    }

    pub fn lookup_node(&self, key: &str) -> PoolwatchResult<PropertyNode<'_>> {
        self.list()
            .and_then(|list| list.get(key))
            .map(|(name, value)| PropertyNode { name, value })
            .ok_or_else(|| PoolwatchError::NotFound(format!("property key `{key}`")))
    }

    pub fn lookup<'s, T: FromProperty<'s>>(&'s self, key: &str) -> PoolwatchResult<T> {
        self.lookup_node(key)?.get()
    }

    /// Like [`lookup`](Self::lookup) but an absent key is `Ok(None)`.
    pub fn try_lookup<'s, T: FromProperty<'s>>(&'s self, key: &str) -> PoolwatchResult<Option<T>> {
        match self.list().and_then(|list| list.get(key)) {
            Some((name, value)) => PropertyNode { name, value }.get().map(Some),
            None => Ok(None),
        }
    }

    /// Look up `path[last]` after descending through the nested trees named by
    /// the preceding keys. Values borrow from this tree, not from intermediate views.
    pub fn lookup_path<'s, T: FromProperty<'s>>(&'s self, path: &[&str]) -> PoolwatchResult<T> {
        self.try_lookup_path(path)?.ok_or_else(|| {
            PoolwatchError::NotFound(format!("property path `{}`", path.join("/")))
        })
    }

    /// Like [`lookup_path`](Self::lookup_path) but an absent key anywhere on the path is `Ok(None)`.
    pub fn try_lookup_path<'s, T: FromProperty<'s>>(
        &'s self,
        path: &[&str],
    ) -> PoolwatchResult<Option<T>> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(None);
        };
        let Some(mut list) = self.list() else {
            return Ok(None);
        };
        for key in parents {
            match list.get(key) {
                Some((_, PropertyValue::Tree(inner))) => list = inner,
                Some((name, value)) => {
                    return Err(PoolwatchError::TypeMismatch {
                        key: name.to_string(),
                        expected: "tree",
                        found: value.kind(),
                    })
                }
                None => return Ok(None),
            }
        }
        match list.get(last) {
            Some((name, value)) => PropertyNode { name, value }.get().map(Some),
            None => Ok(None),
        }
    }

    /// Entries in insertion order. Every call starts from the beginning.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.list().map(|list| list.entries.iter()),
        }
    }

    pub fn add<V: IntoProperty>(&mut self, key: &str, value: V) -> PoolwatchResult<()> {
        self.list_mut("add property")?
            .insert(key, value.into_property());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> PoolwatchResult<PropertyValue> {
        let list = self.list_mut("remove property")?;
        let idx = list
            .position(key)
            .ok_or_else(|| PoolwatchError::NotFound(format!("property key `{key}`")))?;
        Ok(list.entries.remove(idx).1)
    }
}

impl Drop for PropertyTree<'_> {
    fn drop(&mut self) {
        if let Repr::Owned(list) = &self.repr {
            log::trace!("releasing property tree with {} entries", list.len());
            #[cfg(test)]
            tests::note_release();
        }
    }
}

impl Clone for PropertyTree<'_> {
    /// Owned trees are deep-copied; borrowed views stay borrowed.
    fn clone(&self) -> Self {
        match &self.repr {
            Repr::Null => Self::default(),
            Repr::Borrowed(list) => Self {
                repr: Repr::Borrowed(list),
            },
            Repr::Owned(list) => Self {
                repr: Repr::Owned(list.clone()),
            },
        }
    }
}

impl std::fmt::Debug for PropertyTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.repr {
            Repr::Null => "null",
            Repr::Borrowed(_) => "borrowed",
            Repr::Owned(_) => "owned",
        };
        f.debug_struct("PropertyTree")
            .field("mode", &mode)
            .field("entries", &self.len())
            .finish()
    }
}

impl PartialEq for PropertyTree<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.list() == other.list()
    }
}

/// Iterator over the direct entries of a tree.
pub struct Iter<'a> {
    inner: Option<std::slice::Iter<'a, (String, PropertyValue)>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = PropertyNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, value) = self.inner.as_mut()?.next()?;
        Some(PropertyNode {
            name: name.as_str(),
            value,
        })
    }
}

impl<'a> IntoIterator for &'a PropertyTree<'_> {
    type Item = PropertyNode<'a>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static RELEASED: Cell<usize> = const { Cell::new(0) };
    }

    pub(super) fn note_release() {
        RELEASED.with(|count| count.set(count.get() + 1));
    }

    fn released() -> usize {
        RELEASED.with(Cell::get)
    }

    fn sample() -> PropertyList {
        PropertyList::new()
            .with("type", "raidz")
            .with("guid", 123456789u64)
            .with(
                "children",
                vec![PropertyList::new().with("type", "disk").with("path", "/dev/sda")],
            )
    }

    #[test]
    fn round_trips_every_supported_type() {
        let mut tree = PropertyTree::new();
        tree.add("bool", true).unwrap();
        tree.add("byte", Byte(0x2a)).unwrap();
        tree.add("i8", -8i8).unwrap();
        tree.add("u8", 8u8).unwrap();
        tree.add("i16", -16i16).unwrap();
        tree.add("u16", 16u16).unwrap();
        tree.add("i32", -32i32).unwrap();
        tree.add("u32", 32u32).unwrap();
        tree.add("i64", -64i64).unwrap();
        tree.add("u64", u64::MAX).unwrap();
        tree.add("double", 0.25f64).unwrap();
        tree.add("hrtime", HrTime(1_000_000)).unwrap();
        tree.add("string", "tank").unwrap();
        tree.add("bools", vec![true, false]).unwrap();
        tree.add("bytes", vec![Byte(1), Byte(2)]).unwrap();
        tree.add("i8s", vec![-1i8, 1]).unwrap();
        tree.add("u8s", vec![1u8, 2]).unwrap();
        tree.add("i16s", vec![-1i16, 1]).unwrap();
        tree.add("u16s", vec![1u16, 2]).unwrap();
        tree.add("i32s", vec![-1i32, 1]).unwrap();
        tree.add("u32s", vec![1u32, 2]).unwrap();
        tree.add("i64s", vec![-1i64, 1]).unwrap();
        tree.add("u64s", vec![1u64, 2]).unwrap();
        tree.add("strings", vec!["a".to_string(), "b".to_string()]).unwrap();
        tree.add("nested", sample()).unwrap();

        assert!(tree.lookup::<bool>("bool").unwrap());
        assert_eq!(tree.lookup::<Byte>("byte").unwrap(), Byte(0x2a));
        assert_eq!(tree.lookup::<i8>("i8").unwrap(), -8);
        assert_eq!(tree.lookup::<u8>("u8").unwrap(), 8);
        assert_eq!(tree.lookup::<i16>("i16").unwrap(), -16);
        assert_eq!(tree.lookup::<u16>("u16").unwrap(), 16);
        assert_eq!(tree.lookup::<i32>("i32").unwrap(), -32);
        assert_eq!(tree.lookup::<u32>("u32").unwrap(), 32);
        assert_eq!(tree.lookup::<i64>("i64").unwrap(), -64);
        assert_eq!(tree.lookup::<u64>("u64").unwrap(), u64::MAX);
        assert_eq!(tree.lookup::<f64>("double").unwrap(), 0.25);
        assert_eq!(tree.lookup::<HrTime>("hrtime").unwrap(), HrTime(1_000_000));
        assert_eq!(tree.lookup::<String>("string").unwrap(), "tank");
        assert_eq!(tree.lookup::<&str>("string").unwrap(), "tank");
        assert_eq!(tree.lookup::<Vec<bool>>("bools").unwrap(), vec![true, false]);
        assert_eq!(
            tree.lookup::<Vec<Byte>>("bytes").unwrap(),
            vec![Byte(1), Byte(2)]
        );
        assert_eq!(tree.lookup::<Vec<i8>>("i8s").unwrap(), vec![-1, 1]);
        assert_eq!(tree.lookup::<Vec<u8>>("u8s").unwrap(), vec![1, 2]);
        assert_eq!(tree.lookup::<Vec<i16>>("i16s").unwrap(), vec![-1, 1]);
        assert_eq!(tree.lookup::<Vec<u16>>("u16s").unwrap(), vec![1, 2]);
        assert_eq!(tree.lookup::<Vec<i32>>("i32s").unwrap(), vec![-1, 1]);
        assert_eq!(tree.lookup::<Vec<u32>>("u32s").unwrap(), vec![1, 2]);
        assert_eq!(tree.lookup::<Vec<i64>>("i64s").unwrap(), vec![-1, 1]);
        assert_eq!(tree.lookup::<Vec<u64>>("u64s").unwrap(), vec![1, 2]);
        assert_eq!(
            tree.lookup::<Vec<String>>("strings").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        let nested: PropertyTree<'_> = tree.lookup("nested").unwrap();
        assert!(!nested.is_owned());
        assert_eq!(nested.lookup::<&str>("type").unwrap(), "raidz");
    }

    #[test]
    fn conversion_is_strict() {
        let tree = PropertyTree::from(PropertyList::new().with("guid", 7u64));
        let err = tree.lookup::<u32>("guid").unwrap_err();
        match err {
            PoolwatchError::TypeMismatch {
                key,
                expected,
                found,
            } => {
                assert_eq!(key, "guid");
                assert_eq!(expected, "uint32");
                assert_eq!(found, "uint64");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
        assert!(matches!(
            tree.lookup::<u64>("missing").unwrap_err(),
            PoolwatchError::NotFound(_)
        ));
        assert_eq!(tree.try_lookup::<u64>("missing").unwrap(), None);
    }

    #[test]
    fn raidz_scenario_decodes() {
        let tree = PropertyTree::from(sample());
        assert_eq!(tree.lookup::<String>("type").unwrap(), "raidz");
        assert_eq!(tree.lookup::<u64>("guid").unwrap(), 123456789);
        let children: Vec<PropertyTree<'_>> = tree.lookup("children").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].lookup::<&str>("path").unwrap(), "/dev/sda");
    }

    #[test]
    fn path_lookup_descends_nested_trees() {
        let tree = PropertyTree::from(PropertyList::new().with("vdev_tree", sample()));
        let children: Vec<PropertyTree<'_>> =
            tree.lookup_path(&["vdev_tree", "children"]).unwrap();
        assert_eq!(children[0].lookup::<&str>("type").unwrap(), "disk");
        assert_eq!(
            tree.try_lookup_path::<u64>(&["vdev_tree", "missing"]).unwrap(),
            None
        );
        assert!(matches!(
            tree.lookup_path::<u64>(&["vdev_tree", "type", "x"]).unwrap_err(),
            PoolwatchError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn iteration_preserves_insertion_order_and_restarts() {
        let mut tree = PropertyTree::new();
        tree.add("b", 1u64).unwrap();
        tree.add("a", 2u64).unwrap();
        tree.add("c", 3u64).unwrap();
        tree.add("a", 4u64).unwrap();
        let names: Vec<&str> = tree.iter().map(|node| node.name()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(tree.lookup::<u64>("a").unwrap(), 4);
        let mut iter = tree.iter();
        iter.next();
        assert_eq!(tree.iter().count(), 3);
    }

    #[test]
    fn borrowed_trees_reject_mutation() {
        let list = sample();
        let mut view = PropertyTree::borrowed(&list);
        assert!(view.add("extra", 1u64).is_err());
        assert!(view.remove("type").is_err());
        let mut owned = view.into_owned();
        assert_eq!(owned.remove("type").unwrap(), PropertyValue::String("raidz".into()));
        assert!(!owned.exists("type"));
        assert!(matches!(
            owned.remove("type").unwrap_err(),
            PoolwatchError::NotFound(_)
        ));
    }

    #[test]
    fn owned_tree_is_released_exactly_once_after_moves() {
        let before = released();
        {
            let tree = PropertyTree::from(sample());
            let moved = tree;
            let mut holder = vec![moved];
            let mut taken = holder.pop().unwrap();
            let second = taken.take();
            assert!(!taken.is_valid());
            assert!(second.is_owned());
        }
        assert_eq!(released() - before, 1);
    }

    #[test]
    fn borrowed_tree_releases_nothing() {
        let list = sample();
        let before = released();
        {
            let view = PropertyTree::borrowed(&list);
            let _copy = view.clone();
            let children: Vec<PropertyTree<'_>> = view.lookup("children").unwrap();
            assert_eq!(children.len(), 1);
        }
        assert_eq!(released(), before);
        assert_eq!(list.len(), 3);
    }
}
