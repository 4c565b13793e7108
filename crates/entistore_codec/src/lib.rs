//! # EntiStore Codec
//!
//! Entity payload serializers for EntiStore.
//!
//! The storage engine treats payloads as opaque bytes. This crate supplies
//! the [`EntitySerializer`] capability that turns entities into those bytes
//! and back, and the [`Serializer`] registry that a store resolves once, at
//! open time, from the identifier recorded in its header.
//!
//! ## Usage
//!
//! ```
//! use entistore_codec::{EntitySerializer, Serializer};
//!
//! let codec = Serializer::from_id(b"cbor      ").unwrap();
//! let bytes = codec.serialize(&vec![1u32, 2, 3]).unwrap();
//! let back: Vec<u32> = codec.deserialize(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod serializer;

pub use error::{CodecError, CodecResult};
pub use serializer::{EntitySerializer, Serializer, SERIALIZER_ID_LEN};
