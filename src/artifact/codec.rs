//! Codec registry - capability-based serialization dispatch
//!
//! Each codec answers "can I serialize this value?" for a runtime value and
//! owns a stable tag. `put` picks the first codec that accepts the value;
//! `load` looks the codec up by the tag recorded on the artifact.

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// A type-erased in-memory value flowing into or out of a task.
pub struct Object {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Object {
    /// Wrap a value.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Rust type name of the wrapped value.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Is the wrapped value a `T`?
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the wrapped value as a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the wrapped value out as a `T`, or get the object back.
    ///
    /// # Errors
    /// Returns `self` unchanged when the value is not a `T`.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        let type_name = self.type_name;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self { value, type_name }),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object").field("type", &self.type_name).finish()
    }
}

/// Serializer for one family of runtime types.
pub trait Codec: Send + Sync {
    /// Stable identifier recorded on every artifact this codec writes.
    fn tag(&self) -> &str;

    /// File extension for artifacts written by this codec.
    fn extension(&self) -> &str;

    /// Can this codec serialize `value`?
    fn can_encode(&self, value: &Object) -> bool;

    /// Serialize `value` to bytes. Only called when `can_encode` said yes.
    ///
    /// # Errors
    /// Returns error if the value cannot be encoded after all.
    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>>;

    /// Reverse `encode`.
    ///
    /// # Errors
    /// Returns error if `bytes` is not a valid encoding.
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object>;
}

/// Ordered set of codecs. The first codec accepting a value wins.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with no codecs at all.
    #[must_use]
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// The built-in codecs: JSON values, text, raw bytes, `f64` arrays.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            codecs: vec![
                Arc::new(JsonCodec),
                Arc::new(TextCodec),
                Arc::new(BytesCodec),
                Arc::new(ArrayCodec),
            ],
        }
    }

    /// Append a codec; it is consulted after every codec already present.
    ///
    /// # Errors
    /// `InvalidInput` if another codec already uses the same tag.
    pub fn register<C: Codec + 'static>(&mut self, codec: C) -> Result<()> {
        self.check_tag(codec.tag())?;
        self.codecs.push(Arc::new(codec));
        Ok(())
    }

    /// Insert a codec ahead of every codec already present.
    ///
    /// # Errors
    /// `InvalidInput` if another codec already uses the same tag.
    pub fn register_first<C: Codec + 'static>(&mut self, codec: C) -> Result<()> {
        self.check_tag(codec.tag())?;
        self.codecs.insert(0, Arc::new(codec));
        Ok(())
    }

    fn check_tag(&self, tag: &str) -> Result<()> {
        if self.by_tag(tag).is_some() {
            return Err(Error::InvalidInput(format!(
                "codec tag '{tag}' is already registered"
            )));
        }
        Ok(())
    }

    /// First codec able to serialize `value`.
    ///
    /// # Errors
    /// `UnsupportedType` if no codec accepts it.
    pub fn select(&self, value: &Object) -> Result<&dyn Codec> {
        self.codecs
            .iter()
            .find(|c| c.can_encode(value))
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::UnsupportedType(value.type_name().to_string()))
    }

    /// Codec registered under `tag`.
    #[must_use]
    pub fn by_tag(&self, tag: &str) -> Option<&dyn Codec> {
        self.codecs
            .iter()
            .find(|c| c.tag() == tag)
            .map(AsRef::as_ref)
    }

    /// Registered tags, in dispatch order.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.codecs.iter().map(|c| c.tag().to_string()).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tags()).finish()
    }
}

fn expect<'a, T: Any>(value: &'a Object, codec: &str) -> anyhow::Result<&'a T> {
    value.downcast_ref::<T>().ok_or_else(|| {
        anyhow::anyhow!("{codec} codec cannot encode {}", value.type_name())
    })
}

/// `serde_json::Value` as pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn tag(&self) -> &str {
        "json"
    }

    fn extension(&self) -> &str {
        "json"
    }

    fn can_encode(&self, value: &Object) -> bool {
        value.is::<serde_json::Value>()
    }

    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(expect::<serde_json::Value>(
            value, "json",
        )?)?)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object> {
        Ok(Object::new(serde_json::from_slice::<serde_json::Value>(
            bytes,
        )?))
    }
}

/// `String` as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn tag(&self) -> &str {
        "text"
    }

    fn extension(&self) -> &str {
        "txt"
    }

    fn can_encode(&self, value: &Object) -> bool {
        value.is::<String>()
    }

    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>> {
        Ok(expect::<String>(value, "text")?.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object> {
        Ok(Object::new(String::from_utf8(bytes.to_vec())?))
    }
}

/// `Vec<u8>` stored verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn tag(&self) -> &str {
        "bytes"
    }

    fn extension(&self) -> &str {
        "bin"
    }

    fn can_encode(&self, value: &Object) -> bool {
        value.is::<Vec<u8>>()
    }

    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>> {
        Ok(expect::<Vec<u8>>(value, "bytes")?.clone())
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object> {
        Ok(Object::new(bytes.to_vec()))
    }
}

const ARRAY_MAGIC: &[u8; 4] = b"TLA1";

/// `Vec<f64>` as a length-prefixed little-endian array.
///
/// Layout: `TLA1` magic, element count as `u64` LE, then the elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayCodec;

impl Codec for ArrayCodec {
    fn tag(&self) -> &str {
        "f64-array"
    }

    fn extension(&self) -> &str {
        "f64"
    }

    fn can_encode(&self, value: &Object) -> bool {
        value.is::<Vec<f64>>()
    }

    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>> {
        let values = expect::<Vec<f64>>(value, "f64-array")?;
        let mut out = Vec::with_capacity(12 + values.len() * 8);
        out.extend_from_slice(ARRAY_MAGIC);
        out.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object> {
        anyhow::ensure!(
            bytes.len() >= 12 && &bytes[..4] == ARRAY_MAGIC,
            "missing f64 array header"
        );
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[4..12]);
        let len = usize::try_from(u64::from_le_bytes(len))?;
        let body = &bytes[12..];
        anyhow::ensure!(
            body.len() == len.checked_mul(8).unwrap_or(usize::MAX),
            "expected {len} elements, found {} bytes",
            body.len()
        );
        let values = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect::<Vec<f64>>();
        Ok(Object::new(values))
    }
}

/// JSON codec for any serde type, registered under a caller-chosen tag.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use trueno_lineage::artifact::{CodecRegistry, SerdeCodec};
///
/// #[derive(Serialize, Deserialize)]
/// struct Split { train: Vec<u32>, test: Vec<u32> }
///
/// let mut codecs = CodecRegistry::with_defaults();
/// codecs.register(SerdeCodec::<Split>::new("split")).unwrap();
/// ```
pub struct SerdeCodec<T> {
    tag: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    /// Codec for `T` under `tag`.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> Codec for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Any + Send + Sync,
{
    fn tag(&self) -> &str {
        &self.tag
    }

    fn extension(&self) -> &str {
        "json"
    }

    fn can_encode(&self, value: &Object) -> bool {
        value.is::<T>()
    }

    fn encode(&self, value: &Object) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(expect::<T>(value, &self.tag)?)?)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Object> {
        Ok(Object::new(serde_json::from_slice::<T>(bytes)?))
    }
}
