//! Record and store header framing.
//!
//! Every record in the entity log starts with an 8-byte prefix followed by a
//! versioned metadata block and the payload (all little-endian):
//!
//! ```text
//! u8   marker            0x01 in use, 0xFF free
//! i32  total_length      prefix + metadata + payload
//! u8   metadata_version
//! u16  metadata_length
//! ..   metadata          v1: u32 version | 16-byte key
//! ..   payload
//! ```
//!
//! Metadata version 0 is a filler: a free record with no metadata, written
//! by shrink to cover space it has vacated.

use crate::entity::{EntityId, ENTITY_ID_LEN};
use crate::error::{CoreError, CoreResult};
use entistore_codec::{Serializer, SERIALIZER_ID_LEN};
use entistore_storage::{ReadBuffer, WriteBuffer};

/// Marker of a record in use.
pub const MARKER_IN_USE: u8 = 0x01;
/// Marker of a freed record.
pub const MARKER_FREE: u8 = 0xFF;
/// Length of the fixed record prefix.
pub const PREFIX_LEN: usize = 8;

/// Metadata version of filler records.
pub const METADATA_FILLER: u8 = 0;
/// Current metadata version.
pub const METADATA_V1: u8 = 1;
const METADATA_V1_LEN: u16 = 4 + ENTITY_ID_LEN as u16;

/// Size of the store header at offset 0.
pub const STORE_HEADER_LEN: u64 = 4 + SERIALIZER_ID_LEN as u64;
/// Current store format version.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Per-record metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Entity key.
    pub key: EntityId,
    /// Version of the entity, starting at 1 and bumped on every update.
    pub version: u32,
    /// Selects the metadata layout.
    pub metadata_version: u8,
}

impl RecordMetadata {
    /// Creates current-version metadata.
    #[must_use]
    pub const fn new(key: EntityId, version: u32) -> Self {
        Self {
            key,
            version,
            metadata_version: METADATA_V1,
        }
    }

    /// Serialized length for a metadata version, `None` if unknown.
    #[must_use]
    pub const fn encoded_len(metadata_version: u8) -> Option<u16> {
        match metadata_version {
            METADATA_FILLER => Some(0),
            METADATA_V1 => Some(METADATA_V1_LEN),
            _ => None,
        }
    }

    pub(crate) fn write_to(&self, writer: &mut WriteBuffer) -> CoreResult<()> {
        writer.write_u32_le(self.version)?;
        writer.write(self.key.as_bytes())?;
        Ok(())
    }

    fn read_from(metadata_version: u8, reader: &mut ReadBuffer) -> CoreResult<Self> {
        let version = reader.read_u32_le()?;
        let key = EntityId::from_bytes(reader.read_bytes::<ENTITY_ID_LEN>()?);
        Ok(Self {
            key,
            version,
            metadata_version,
        })
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Offset of the record in the entity log.
    pub offset: u64,
    /// Raw marker byte.
    pub marker: u8,
    /// Length of the whole record.
    pub total_length: i32,
    /// Metadata layout version.
    pub metadata_version: u8,
    /// Length of the metadata block.
    pub metadata_length: u16,
    /// Metadata; `None` for fillers.
    pub metadata: Option<RecordMetadata>,
}

impl RecordHeader {
    /// Returns true if the record has been freed.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.marker == MARKER_FREE
    }

    /// Returns the header length (prefix and metadata).
    #[must_use]
    pub const fn header_len(&self) -> u64 {
        PREFIX_LEN as u64 + self.metadata_length as u64
    }

    /// Returns the payload length.
    #[must_use]
    pub const fn payload_length(&self) -> u64 {
        self.total_length as u64 - self.header_len()
    }

    /// Returns the record's size in the log.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.total_length as u64
    }

    /// Returns the entity key, if the record carries one.
    #[must_use]
    pub fn key(&self) -> Option<EntityId> {
        self.metadata.map(|m| m.key)
    }
}

/// The fixed 8-byte record prefix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordPrefix {
    pub marker: u8,
    pub total_length: i32,
    pub metadata_version: u8,
    pub metadata_length: u16,
}

impl RecordPrefix {
    pub(crate) fn read_from(reader: &mut ReadBuffer) -> CoreResult<Self> {
        Ok(Self {
            marker: reader.read_byte()?,
            total_length: reader.read_i32_le()?,
            metadata_version: reader.read_byte()?,
            metadata_length: reader.read_u16_le()?,
        })
    }

    pub(crate) fn write_to(&self, writer: &mut WriteBuffer) -> CoreResult<()> {
        writer.write_byte(self.marker)?;
        writer.write_i32_le(self.total_length)?;
        writer.write_byte(self.metadata_version)?;
        writer.write_u16_le(self.metadata_length)?;
        Ok(())
    }

    pub(crate) fn decode(bytes: &[u8; PREFIX_LEN]) -> Self {
        Self {
            marker: bytes[0],
            total_length: i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            metadata_version: bytes[5],
            metadata_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Length of the record this prefix frames, or `None` if the prefix
    /// could not have been written by the store.
    pub(crate) fn framed_len(&self) -> Option<u64> {
        let marker_ok = self.marker == MARKER_IN_USE || self.marker == MARKER_FREE;
        let metadata_ok =
            RecordMetadata::encoded_len(self.metadata_version) == Some(self.metadata_length);
        let header_len = PREFIX_LEN as i64 + i64::from(self.metadata_length);
        (marker_ok && metadata_ok && i64::from(self.total_length) >= header_len)
            .then_some(self.total_length as u64)
    }

    /// Checks the prefix and reads the metadata that follows it.
    ///
    /// On error the reader may sit anywhere inside the metadata block.
    pub(crate) fn finish(self, offset: u64, reader: &mut ReadBuffer) -> CoreResult<RecordHeader> {
        if self.marker != MARKER_IN_USE && self.marker != MARKER_FREE {
            return Err(CoreError::corrupt_record(
                offset,
                format!("unknown marker 0x{:02x}", self.marker),
            ));
        }
        let header_len = PREFIX_LEN as i64 + i64::from(self.metadata_length);
        if i64::from(self.total_length) < header_len {
            return Err(CoreError::corrupt_record(
                offset,
                format!(
                    "total length {} shorter than header length {header_len}",
                    self.total_length
                ),
            ));
        }
        match RecordMetadata::encoded_len(self.metadata_version) {
            Some(len) if len == self.metadata_length => {}
            Some(len) => {
                return Err(CoreError::corrupt_record(
                    offset,
                    format!(
                        "metadata v{} must be {len} bytes, header says {}",
                        self.metadata_version, self.metadata_length
                    ),
                ))
            }
            None => {
                return Err(CoreError::corrupt_record(
                    offset,
                    format!("unknown metadata version {}", self.metadata_version),
                ))
            }
        }

        let metadata = if self.metadata_version == METADATA_FILLER {
            None
        } else {
            Some(RecordMetadata::read_from(self.metadata_version, reader)?)
        };

        Ok(RecordHeader {
            offset,
            marker: self.marker,
            total_length: self.total_length,
            metadata_version: self.metadata_version,
            metadata_length: self.metadata_length,
            metadata,
        })
    }
}

/// Header at offset 0 of the entity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Store format version.
    pub version: u32,
    /// Serializer the payloads were written with.
    pub serializer: Serializer,
}

impl StoreHeader {
    /// Creates a header for a new store.
    #[must_use]
    pub const fn new(serializer: Serializer) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            serializer,
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; STORE_HEADER_LEN as usize] {
        let mut out = [0u8; STORE_HEADER_LEN as usize];
        out[..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..].copy_from_slice(&self.serializer.id());
        out
    }

    /// Decodes the header.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::InitializationFailed`] on a short buffer, an
    /// unsupported version or an unknown serializer.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < STORE_HEADER_LEN as usize {
            return Err(CoreError::initialization_failed(format!(
                "store header truncated: {} of {STORE_HEADER_LEN} bytes",
                data.len()
            )));
        }
        let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if version != STORE_FORMAT_VERSION {
            return Err(CoreError::initialization_failed(format!(
                "unsupported store version {version}"
            )));
        }
        let serializer = Serializer::from_id(&data[4..STORE_HEADER_LEN as usize])
            .map_err(|e| CoreError::initialization_failed(e.to_string()))?;
        Ok(Self {
            version,
            serializer,
        })
    }
}
