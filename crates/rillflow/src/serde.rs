//! Typed serialization capabilities.
//!
//! A [`Serializer`] produces bytes from a typed value; a [`Deserializer`]
//! is the inverse. Engines hold one per role (key, value) plus a
//! name-keyed [`HeaderSerdeMap`] for headers, whose deserialized values
//! are stored as [`HeaderValue`] bags the receiver downcasts.
//!
//! ## Implementations
//!
//! - [`BytesSerde`]: identity pass-through for `Bytes` and `Vec<u8>`
//! - [`StringSerde`]: UTF-8 strings
//! - [`JsonSerde`]: any `serde` type via `serde_json`

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use fxhash::FxHashMap;

use crate::error::Error;
use crate::message::HeaderValue;

/// Produces bytes from a typed value.
pub trait Serializer<T: ?Sized>: Send + Sync {
    /// Serializes `value` into bytes.
    ///
    /// # Errors
    ///
    /// Returns a `Serialization` error when the value cannot be encoded.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error>;

    /// Zero-copy fast path: returns the value's wire bytes when they can
    /// be handed through by reference count alone, `None` when the value
    /// must be encoded via [`serialize`](Self::serialize).
    ///
    /// The producer consults this under `payload.policy = passthrough`;
    /// buffered records then share the caller's storage instead of
    /// deep-copying it.
    fn as_bytes(&self, value: &T) -> Option<Bytes> {
        let _ = value;
        None
    }
}

/// Produces a typed value from bytes.
pub trait Deserializer<T>: Send + Sync {
    /// Deserializes a value from `data`.
    ///
    /// # Errors
    ///
    /// Returns a `Deserialization` error when the bytes cannot be decoded.
    fn deserialize(&self, data: &[u8]) -> Result<T, Error>;
}

/// Identity pass-through for byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerde;

impl BytesSerde {
    /// Creates a new identity serde.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Serializer<Bytes> for BytesSerde {
    fn serialize(&self, value: &Bytes) -> Result<Vec<u8>, Error> {
        Ok(value.to_vec())
    }

    fn as_bytes(&self, value: &Bytes) -> Option<Bytes> {
        Some(value.clone())
    }
}

impl Deserializer<Bytes> for BytesSerde {
    fn deserialize(&self, data: &[u8]) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(data))
    }
}

impl Serializer<Vec<u8>> for BytesSerde {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(value.clone())
    }
}

impl Deserializer<Vec<u8>> for BytesSerde {
    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(data.to_vec())
    }
}

/// UTF-8 string serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerde;

impl StringSerde {
    /// Creates a new string serde.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Serializer<String> for StringSerde {
    fn serialize(&self, value: &String) -> Result<Vec<u8>, Error> {
        Ok(value.as_bytes().to_vec())
    }
}

impl Deserializer<String> for StringSerde {
    fn deserialize(&self, data: &[u8]) -> Result<String, Error> {
        String::from_utf8(data.to_vec())
            .map_err(|e| Error::deserialization(format!("invalid UTF-8: {e}")))
    }
}

/// JSON serde for any `serde` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerde;

impl JsonSerde {
    /// Creates a new JSON serde.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<T: serde::Serialize + Send + Sync> Serializer<T> for JsonSerde {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::serialization(format!("JSON encode: {e}")))
    }
}

impl<T: serde::de::DeserializeOwned + Send + Sync> Deserializer<T> for JsonSerde {
    fn deserialize(&self, data: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(data)
            .map_err(|e| Error::deserialization(format!("JSON decode: {e}")))
    }
}

/// Serializes a type-erased header value.
pub trait HeaderSerializer: Send + Sync {
    /// Serializes `value`, which must downcast to the registered type.
    ///
    /// # Errors
    ///
    /// Returns a `Serialization` error on type mismatch or encode failure.
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Error>;
}

/// Deserializes bytes into a type-erased header value.
pub trait HeaderDeserializer: Send + Sync {
    /// Deserializes `data` into a boxed value of the registered type.
    ///
    /// # Errors
    ///
    /// Returns a `Deserialization` error on decode failure.
    fn deserialize(&self, data: &[u8]) -> Result<HeaderValue, Error>;
}

/// Lifts a typed serde into the type-erased header capability.
pub struct TypedHeaderSerde<T, S> {
    serde: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> TypedHeaderSerde<T, S> {
    /// Wraps a typed serde.
    #[must_use]
    pub fn new(serde: S) -> Self {
        Self {
            serde,
            _marker: PhantomData,
        }
    }
}

impl<T, S> HeaderSerializer for TypedHeaderSerde<T, S>
where
    T: Any + Send + Sync,
    S: Serializer<T>,
{
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Error> {
        let typed = value.downcast_ref::<T>().ok_or_else(|| {
            Error::serialization(format!(
                "header value is not a {}",
                std::any::type_name::<T>()
            ))
        })?;
        self.serde.serialize(typed)
    }
}

impl<T, S> HeaderDeserializer for TypedHeaderSerde<T, S>
where
    T: Any + Send + Sync,
    S: Deserializer<T>,
{
    fn deserialize(&self, data: &[u8]) -> Result<HeaderValue, Error> {
        Ok(Box::new(self.serde.deserialize(data)?))
    }
}

/// Per-header-name serde registry.
///
/// Headers are addressed by name; each name maps to a dispatchable serde
/// capability. Unregistered names are governed by the topic's
/// `skip.unknown.headers` policy.
#[derive(Default)]
pub struct HeaderSerdeMap {
    serializers: FxHashMap<String, Arc<dyn HeaderSerializer>>,
    deserializers: FxHashMap<String, Arc<dyn HeaderDeserializer>>,
}

impl HeaderSerdeMap {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a serializer for a header name.
    pub fn register_serializer(
        &mut self,
        name: impl Into<String>,
        serializer: Arc<dyn HeaderSerializer>,
    ) {
        self.serializers.insert(name.into(), serializer);
    }

    /// Registers a deserializer for a header name.
    pub fn register_deserializer(
        &mut self,
        name: impl Into<String>,
        deserializer: Arc<dyn HeaderDeserializer>,
    ) {
        self.deserializers.insert(name.into(), deserializer);
    }

    /// Registers a typed serde for both directions under one name.
    pub fn register<T, S>(&mut self, name: impl Into<String>, serde: S)
    where
        T: Any + Send + Sync,
        S: Serializer<T> + Deserializer<T> + Clone + 'static,
    {
        let name = name.into();
        self.serializers.insert(
            name.clone(),
            Arc::new(TypedHeaderSerde::<T, S>::new(serde.clone())),
        );
        self.deserializers
            .insert(name, Arc::new(TypedHeaderSerde::<T, S>::new(serde)));
    }

    /// Returns the serializer registered for a header name.
    #[must_use]
    pub fn serializer(&self, name: &str) -> Option<&Arc<dyn HeaderSerializer>> {
        self.serializers.get(name)
    }

    /// Returns the deserializer registered for a header name.
    #[must_use]
    pub fn deserializer(&self, name: &str) -> Option<&Arc<dyn HeaderDeserializer>> {
        self.deserializers.get(name)
    }

    /// Returns `true` if no serdes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty() && self.deserializers.is_empty()
    }
}

impl std::fmt::Debug for HeaderSerdeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderSerdeMap")
            .field("serializers", &self.serializers.len())
            .field("deserializers", &self.deserializers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_identity_roundtrip() {
        let serde = BytesSerde::new();
        let input = Bytes::from_static(b"\x00\x01payload\xff");
        let encoded = Serializer::<Bytes>::serialize(&serde, &input).unwrap();
        let decoded: Bytes = serde.deserialize(&encoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_bytes_fast_path_shares_storage() {
        let serde = BytesSerde::new();
        let input = Bytes::from(vec![1u8, 2, 3, 4]);

        let shared = Serializer::<Bytes>::as_bytes(&serde, &input).unwrap();
        assert_eq!(shared, input);
        assert_eq!(shared.as_ptr(), input.as_ptr());

        // Types without a cheap handle fall back to encoding.
        assert!(Serializer::<Vec<u8>>::as_bytes(&serde, &vec![1u8]).is_none());
        assert!(Serializer::<String>::as_bytes(&StringSerde::new(), &String::from("x")).is_none());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let serde = StringSerde::new();
        let err = Deserializer::<String>::deserialize(&serde, &[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Deserialization);
    }

    #[test]
    fn test_json_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Order {
            id: u64,
            symbol: String,
        }

        let serde = JsonSerde::new();
        let order = Order {
            id: 7,
            symbol: "AAPL".into(),
        };
        let encoded = serde.serialize(&order).unwrap();
        let decoded: Order = serde.deserialize(&encoded).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn test_header_map_typed_roundtrip() {
        let mut map = HeaderSerdeMap::new();
        map.register::<String, _>("tenant", StringSerde::new());

        let ser = map.serializer("tenant").unwrap();
        let value: Box<dyn Any + Send + Sync> = Box::new(String::from("blue"));
        let bytes = ser.serialize(value.as_ref()).unwrap();

        let deser = map.deserializer("tenant").unwrap();
        let decoded = deser.deserialize(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<String>().unwrap(), "blue");
    }

    #[test]
    fn test_header_serializer_type_mismatch() {
        let mut map = HeaderSerdeMap::new();
        map.register::<String, _>("tenant", StringSerde::new());

        let ser = map.serializer("tenant").unwrap();
        let wrong: Box<dyn Any + Send + Sync> = Box::new(42u32);
        let err = ser.serialize(wrong.as_ref()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Serialization);
    }

    #[test]
    fn test_unregistered_header_absent() {
        let map = HeaderSerdeMap::new();
        assert!(map.serializer("missing").is_none());
        assert!(map.deserializer("missing").is_none());
        assert!(map.is_empty());
    }
}
