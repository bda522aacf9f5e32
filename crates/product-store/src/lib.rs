//! Product store.
//!
//! Three steps take run products to readers:
//! - [`OutputWriter`] writes one self-contained Zarr group per store key
//!   into the run directory.
//! - [`StoreMerger`] swaps those groups into the consolidated store, one
//!   key at a time and one writer per key.
//! - [`Publisher`] uploads changed keys to object storage, each key retried
//!   on its own, and the key index last.

pub mod config;
pub mod error;
pub mod key;
pub mod merge;
pub mod output;
pub mod publish;

pub use config::{PublishConfig, StoreConfig, ZarrCompression};
pub use error::{StoreError, StoreResult};
pub use key::{ProductKind, StoreKey};
pub use merge::{
    digest_dir, IndexEntry, MergeOutcome, MergeReport, StoreIndex, StoreMerger, StoreRef,
    INDEX_FILE,
};
pub use output::{read_attributes, read_f64, read_u32, OutputWriter, RunOutput};
pub use publish::{retry_with_backoff, PublishReport, Publisher};
