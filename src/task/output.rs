//! Output shapes - what a task returns, before and after persistence

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::Object;

/// Shape of a task's return value.
///
/// A callable returns `Output<Object>`; the wrapper hands back the same
/// shape as `Output<Artifact>`, every object replaced by its handle.
/// `Literal` carries plain JSON data that is recorded verbatim instead of
/// being persisted as an artifact. `Seq` and `Map` nest, so a tree may mix
/// literals and objects at any depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum Output<T> {
    /// Nothing returned.
    None,
    /// Non-artifact data, recorded verbatim.
    Literal(serde_json::Value),
    /// A single object.
    One(T),
    /// An ordered sequence of subtrees.
    Seq(Vec<Output<T>>),
    /// Subtrees by name.
    Map(BTreeMap<String, Output<T>>),
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Self::None
    }
}

impl<T> From<serde_json::Value> for Output<T> {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<Object> for Output<Object> {
    fn from(object: Object) -> Self {
        Self::One(object)
    }
}

impl<T> Output<T> {
    /// Is this `Output::None`?
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Number of objects anywhere in the tree (literals count as zero).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::None | Self::Literal(_) => 0,
            Self::One(_) => 1,
            Self::Seq(items) => items.iter().map(Self::len).sum(),
            Self::Map(items) => items.values().map(Self::len).sum(),
        }
    }

    /// True when no object is carried.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every object, depth first in shape order (map entries by key).
    pub fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        match self {
            Self::None | Self::Literal(_) => Box::new(std::iter::empty()),
            Self::One(item) => Box::new(std::iter::once(item)),
            Self::Seq(items) => Box::new(items.iter().flat_map(Self::iter)),
            Self::Map(items) => Box::new(items.values().flat_map(Self::iter)),
        }
    }

    /// The object of a `One` output.
    #[must_use]
    pub const fn one(&self) -> Option<&T> {
        match self {
            Self::One(item) => Some(item),
            _ => None,
        }
    }

    /// Subtree `index` of a `Seq` output.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<&Self> {
        match self {
            Self::Seq(items) => items.get(index),
            _ => None,
        }
    }

    /// Subtree `key` of a `Map` output.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(items) => items.get(key),
            _ => None,
        }
    }

    /// Object at `index` of a `Seq` output.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&T> {
        self.item(index).and_then(Self::one)
    }

    /// Object under `key` of a `Map` output.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entry(key).and_then(Self::one)
    }

    /// The data of a `Literal` output.
    #[must_use]
    pub const fn literal(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Convert every object, keeping the shape. Stops at the first error.
    ///
    /// # Errors
    /// Returns the first error produced by `f`.
    pub fn try_map<U, E, F>(self, mut f: F) -> Result<Output<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        self.map_owned(&mut f)
    }

    fn map_owned<U, E, F>(self, f: &mut F) -> Result<Output<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(match self {
            Self::None => Output::None,
            Self::Literal(value) => Output::Literal(value),
            Self::One(item) => Output::One(f(item)?),
            Self::Seq(items) => Output::Seq(
                items
                    .into_iter()
                    .map(|item| item.map_owned(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(items) => Output::Map(
                items
                    .into_iter()
                    .map(|(k, v)| v.map_owned(f).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Borrowing variant of [`try_map`](Self::try_map).
    ///
    /// # Errors
    /// Returns the first error produced by `f`.
    pub fn try_map_ref<U, E, F>(&self, mut f: F) -> Result<Output<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        self.map_borrowed(&mut f)
    }

    fn map_borrowed<U, E, F>(&self, f: &mut F) -> Result<Output<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        Ok(match self {
            Self::None => Output::None,
            Self::Literal(value) => Output::Literal(value.clone()),
            Self::One(item) => Output::One(f(item)?),
            Self::Seq(items) => Output::Seq(
                items
                    .iter()
                    .map(|item| item.map_borrowed(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(items) => Output::Map(
                items
                    .iter()
                    .map(|(k, v)| v.map_borrowed(f).map(|v| (k.clone(), v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl Output<Object> {
    /// A single value.
    #[must_use]
    pub fn value<V: std::any::Any + Send + Sync>(value: V) -> Self {
        Self::One(Object::new(value))
    }

    /// Subtrees by name. Entries may be objects, JSON literals or nested
    /// outputs.
    #[must_use]
    pub fn named<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Self>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Subtrees in order.
    #[must_use]
    pub fn seq<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Self>,
    {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(x: u32) -> Output<u32> {
        Output::One(x)
    }

    #[test]
    fn test_shape_accessors() {
        let out: Output<u32> = Output::Map(BTreeMap::from([("a".to_string(), leaf(1)), ("b".to_string(), leaf(2))]));
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("b"), Some(&2));
        assert_eq!(out.one(), None);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        let lit: Output<u32> = Output::Literal(serde_json::json!(3));
        assert!(lit.is_empty());
        assert_eq!(lit.literal(), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_nested_tree() {
        let out: Output<u32> = Output::Map(BTreeMap::from([
            ("k".to_string(), Output::Literal(serde_json::json!(7))),
            ("xs".to_string(), Output::Seq(vec![leaf(1), Output::Seq(vec![leaf(2), leaf(3)])])),
        ]));
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(out.entry("k").and_then(Output::literal), Some(&serde_json::json!(7)));
        assert_eq!(out.get("k"), None);
        let xs = out.entry("xs").unwrap();
        assert_eq!(xs.at(0), Some(&1));
        assert_eq!(xs.item(1).and_then(|inner| inner.at(1)), Some(&3));

        let doubled: Result<Output<u32>, ()> = out.try_map_ref(|x| Ok(x * 2));
        assert_eq!(doubled.unwrap().iter().copied().collect::<Vec<_>>(), vec![2, 4, 6]);
    }

    #[test]
    fn test_try_map_keeps_shape_and_stops_on_error() {
        let out = Output::Seq(vec![leaf(1), leaf(2), leaf(3)]);
        let doubled: Result<Output<u32>, ()> = out.clone().try_map(|x| Ok(x * 2));
        assert_eq!(doubled.unwrap(), Output::Seq(vec![leaf(2), leaf(4), leaf(6)]));

        let mut calls = 0;
        let failed: Result<Output<u32>, &str> = out.try_map(|x| {
            calls += 1;
            if x == 2 { Err("two") } else { Ok(x) }
        });
        assert_eq!(failed.unwrap_err(), "two");
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_mixed_constructors() {
        let out = Output::named([
            ("model", Output::value(1.5f64)),
            ("epochs", Output::from(serde_json::json!(10))),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.entry("epochs").and_then(Output::literal), Some(&serde_json::json!(10)));
        assert_eq!(out.get("model").unwrap().downcast_ref::<f64>(), Some(&1.5));

        let parts = Output::seq([Object::new(1u8), Object::new(2u8)]);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_serialized_shape() {
        let out: Output<u32> = Output::One(5);
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            serde_json::json!({"shape": "one", "value": 5})
        );
        let none: Output<u32> = Output::None;
        assert_eq!(serde_json::to_value(&none).unwrap(), serde_json::json!({"shape": "none"}));
        let nested: Output<u32> = Output::Seq(vec![leaf(1), Output::Literal(serde_json::json!("x"))]);
        assert_eq!(
            serde_json::to_value(&nested).unwrap(),
            serde_json::json!({"shape": "seq", "value": [
                {"shape": "one", "value": 1},
                {"shape": "literal", "value": "x"},
            ]})
        );
    }
}
