//! Serializer registry.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Width of the serializer identifier in the store header.
pub const SERIALIZER_ID_LEN: usize = 10;

/// Converts entities to and from payload bytes.
///
/// This is the only contract the storage engine has with payload encoding.
pub trait EntitySerializer {
    /// Serializes a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>>;

    /// Deserializes a value of type `T` from bytes.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T>;
}

/// Registered payload serializers.
///
/// A store records its serializer once, in the header, as a fixed
/// [`SERIALIZER_ID_LEN`]-byte identifier. Opening a store resolves that
/// identifier with [`Serializer::from_id`]; unknown identifiers fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serializer {
    /// CBOR via `ciborium`.
    #[default]
    Cbor,
    /// JSON via `serde_json`.
    Json,
}

impl Serializer {
    /// All registered serializers.
    pub const ALL: [Serializer; 2] = [Serializer::Cbor, Serializer::Json];

    /// Returns the short name used in identifiers and on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cbor => "cbor",
            Self::Json => "json",
        }
    }

    /// Returns the fixed-width header identifier (space padded).
    #[must_use]
    pub fn id(self) -> [u8; SERIALIZER_ID_LEN] {
        let mut id = [b' '; SERIALIZER_ID_LEN];
        let name = self.name().as_bytes();
        id[..name.len()].copy_from_slice(name);
        id
    }

    /// Resolves a header identifier.
    ///
    /// Trailing spaces and NUL bytes are ignored; matching is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownSerializer`] for unregistered identifiers.
    pub fn from_id(id: &[u8]) -> CodecResult<Self> {
        let trimmed = match id.iter().rposition(|b| *b != b' ' && *b != 0) {
            Some(last) => &id[..=last],
            None => &[][..],
        };

        Self::ALL
            .into_iter()
            .find(|s| s.name().as_bytes().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CodecError::unknown_serializer(String::from_utf8_lossy(id)))
    }
}

impl EntitySerializer for Serializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        match self {
            Self::Cbor => {
                let mut out = Vec::new();
                ciborium::into_writer(value, &mut out)
                    .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
                Ok(out)
            }
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::encoding_failed(e.to_string()))
            }
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            Self::Cbor => ciborium::from_reader(bytes)
                .map_err(|e| CodecError::decoding_failed(e.to_string())),
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
            }
        }
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serializer {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        tags: Vec<String>,
        stars: u32,
    }

    fn note() -> Note {
        Note {
            title: "groceries".into(),
            tags: vec!["home".into(), "weekly".into()],
            stars: 3,
        }
    }

    #[test]
    fn ids_are_fixed_width() {
        for s in Serializer::ALL {
            assert_eq!(s.id().len(), SERIALIZER_ID_LEN);
            assert_eq!(Serializer::from_id(&s.id()).unwrap(), s);
        }
        assert_eq!(&Serializer::Cbor.id(), b"cbor      ");
    }

    #[test]
    fn from_id_tolerates_nul_padding_and_case() {
        assert_eq!(
            Serializer::from_id(b"JSON\0\0\0\0\0\0").unwrap(),
            Serializer::Json
        );
        assert_eq!("cbor".parse::<Serializer>().unwrap(), Serializer::Cbor);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let err = Serializer::from_id(b"msgpack   ").unwrap_err();
        assert!(matches!(err, CodecError::UnknownSerializer { .. }));
        assert!(Serializer::from_id(b"          ").is_err());
    }

    #[test]
    fn cbor_and_json_roundtrip() {
        for s in Serializer::ALL {
            let bytes = s.serialize(&note()).unwrap();
            let back: Note = s.deserialize(&bytes).unwrap();
            assert_eq!(back, note());
        }
    }

    #[test]
    fn decode_garbage_fails() {
        let err = Serializer::Json.deserialize::<Note>(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::DecodingFailed { .. }));
    }

    #[test]
    fn cbor_decodes_into_json_value() {
        let bytes = Serializer::Cbor.serialize(&note()).unwrap();
        let value: serde_json::Value = Serializer::Cbor.deserialize(&bytes).unwrap();
        assert_eq!(value["title"], "groceries");
        assert_eq!(value["tags"][1], "weekly");
    }

    proptest! {
        #[test]
        fn any_string_survives_both_codecs(s in ".*") {
            for codec in Serializer::ALL {
                let bytes = codec.serialize(&s).unwrap();
                let back: String = codec.deserialize(&bytes).unwrap();
                prop_assert_eq!(&back, &s);
            }
        }
    }
}
