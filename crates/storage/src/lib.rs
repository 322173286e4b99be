//! Tally storage
//!
//! Disk persistence for everything the engine keeps across restarts -
//! buffered report snapshots awaiting upload, train-install records,
//! activation state, cross-restart metadata, config backups - plus the
//! narrow trait for the external restricted SQL store.
//!
//! Byte layout is uniform: every record is a length-prefixed JSON frame
//! (`codec`). Buffered reports do not survive upload; records the engine
//! owns do.

mod codec;
mod error;
mod records;
mod restricted;
mod store;

pub use codec::{decode_frame, decode_frames, encode_frame, frame_bytes};
pub use error::{Result, StorageError};
pub use records::{
    ActiveActivation, ActiveActivationState, ActiveConfig, ActiveConfigList, ActiveMetric,
    AlertMetadata, ConfigMetadata, InstallTrainInfo, MetadataList,
};
pub use restricted::{MemoryRestrictedStore, QueryRows, RestrictedStore, StoredEventRow};
pub use store::Storage;

#[cfg(test)]
mod restricted_test;
