//! Entity identity.

mod id;

pub use id::{EntityId, ENTITY_ID_LEN};
