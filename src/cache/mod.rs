//! Versioned cache stores and the caching strategies that run against them.
//!
//! - Named stores (`{logical}-v{generation}`) behind a `CacheStorage` backend
//! - Route classification picking a strategy per request
//! - Cache-first, network-first with a freshness window,
//!   stale-while-revalidate and network-only
//! - Capture-time stamping used as the only staleness signal

mod layer;
mod route;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use route::{classify, RouteClass};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{
  captured_at, stamp, CacheResult, CacheSource, RevalidationHandle, CAPTURED_AT_HEADER,
};
