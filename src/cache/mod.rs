//! Rendered-card cache.
//!
//! - [`keys`]: request ⇄ storage key codec
//! - [`store`]: object-store port and the [`CacheStore`] wrapper
//! - [`memory`]: in-process backend
//! - [`singleflight`]: per-key deduplication of concurrent renders

pub mod keys;
pub mod memory;
pub mod singleflight;
pub mod store;

pub use keys::{CacheKey, MAX_KEY_BYTES, cache_key, decode_file_segment, encode_title, request_path};
pub use memory::MemoryObjectStore;
pub use singleflight::{FlightAborted, FlightRole, SingleFlight};
pub use store::{
    CacheStore, DEFAULT_DELETE_BATCH, DeleteSummary, ListPage, ObjectStore, PurgeError, StoreError,
};
