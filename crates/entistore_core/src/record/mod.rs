//! Record framing and the entity log.

mod header;
mod store;

pub use header::{
    RecordHeader, RecordMetadata, StoreHeader, MARKER_FREE, MARKER_IN_USE, METADATA_FILLER,
    METADATA_V1, PREFIX_LEN, STORE_FORMAT_VERSION, STORE_HEADER_LEN,
};
pub use store::{EntityStore, PayloadReader, RecordLocation, ScanSummary};
