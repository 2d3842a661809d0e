//! Bibliographic records as the index sees them.
//!
//! The index never owns records. It reads them through a [`RecordStore`] and
//! is told about edits through [`EntityChange`] notifications.

mod entity;
mod latex;
mod store;

pub use entity::{Entity, EntityChange, EntityId, FieldChange, FieldValue, LinkedFile};
pub use latex::latex_to_unicode;
pub use store::{InMemoryRecordStore, RecordStore};
