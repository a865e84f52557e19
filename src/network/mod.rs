//! Network access, connectivity tracking and the request-signing hook.

mod fetcher;
mod monitor;
mod signing;

pub use fetcher::{FetchError, FetchFuture, Fetcher, HttpFetcher};
pub use monitor::{spawn_probe, NetworkStatusMonitor, ReplayGuard, ReplayTrigger};
pub use signing::{NoopSigner, RequestSigner};
