//! Binary shader cache
//!
//! Precompiled effect binaries persisted between runs. A file that fails any
//! check is rejected as a whole; the renderer then compiles from source.

pub mod format;
pub mod loader;

pub use format::{
    fnv1a, ShaderCache, ShaderCacheEntry, CACHE_FORMAT_VERSION, CACHE_HEADER_SIZE, CACHE_MAGIC,
};
pub use loader::{load, load_async, save, CacheLoadCompletion};
