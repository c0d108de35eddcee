//! Serializer registry keyed by the id carried in frame headers.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use strato_core::FramingError;

/// Value serializer selected by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Serialization {
    /// `serde_json`
    #[default]
    Json = 1,
    /// `rmp-serde`, with field names
    MessagePack = 2,
}

impl Serialization {
    /// Wire id.
    #[inline]
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up by wire id.
    pub fn from_id(id: u8) -> Result<Self, FramingError> {
        match id {
            1 => Ok(Self::Json),
            2 => Ok(Self::MessagePack),
            other => Err(FramingError::UnknownSerialization(other)),
        }
    }

    /// Look up by name, as used in the `serialization` address option.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "msgpack" | "messagepack" => Some(Self::MessagePack),
            _ => None,
        }
    }

    /// Short name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }

    /// Serialize a value.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, FramingError> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| FramingError::Serialization(e.to_string())),
            Self::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| FramingError::Serialization(e.to_string())),
        }
    }

    /// Deserialize a value. An empty payload reads as null.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, FramingError> {
        if bytes.is_empty() {
            return serde_json::from_slice(b"null")
                .map_err(|e| FramingError::Deserialization(e.to_string()));
        }
        match self {
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| FramingError::Deserialization(e.to_string())),
            Self::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| FramingError::Deserialization(e.to_string())),
        }
    }
}

/// Parameter-type signature of an argument type.
///
/// Consumers and providers compute it from the same Rust type, so it matches
/// across the wire without a schema.
#[must_use]
pub fn signature_of<A: ?Sized>() -> String {
    std::any::type_name::<A>().to_owned()
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Serialization {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_id(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        label: String,
    }

    #[test]
    fn test_ids() {
        assert_eq!(Serialization::Json.id(), 1);
        assert_eq!(Serialization::MessagePack.id(), 2);
        assert_eq!(Serialization::from_id(2).unwrap(), Serialization::MessagePack);
        assert_eq!(
            Serialization::from_id(9),
            Err(FramingError::UnknownSerialization(9))
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(Serialization::from_name("JSON"), Some(Serialization::Json));
        assert_eq!(Serialization::from_name("msgpack"), Some(Serialization::MessagePack));
        assert_eq!(Serialization::from_name("hessian"), None);
    }

    #[test]
    fn test_values_through_both_serializers() {
        let point = Point {
            x: -4,
            label: "a".into(),
        };
        for ser in [Serialization::Json, Serialization::MessagePack] {
            let bytes = ser.encode(&point).unwrap();
            assert_eq!(ser.decode::<Point>(&bytes).unwrap(), point);
        }
    }

    #[test]
    fn test_empty_payload_is_null() {
        let none: Option<String> = Serialization::MessagePack.decode(&[]).unwrap();
        assert_eq!(none, None);
        let unit: () = Serialization::Json.decode(&[]).unwrap();
        assert_eq!(unit, ());
    }

    #[test]
    fn test_signature_of() {
        assert_eq!(signature_of::<(String, u32)>(), "(alloc::string::String, u32)");
        assert_ne!(signature_of::<Point>(), signature_of::<String>());
    }

    #[test]
    fn test_garbage_is_deserialization_error() {
        let result = Serialization::Json.decode::<Point>(b"{nope");
        assert!(matches!(result, Err(FramingError::Deserialization(_))));
    }
}
