//! Cache layer that runs the caching strategies against a storage backend.

use chrono::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{captured_at, stamp, CacheResult, RevalidationHandle};
use crate::clock::Clock;
use crate::http::{Request, Response};
use crate::network::{FetchError, Fetcher};

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy works against exactly one named store. Storage failures
/// never fail a request: reads degrade to a miss, writes are logged.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  clock: Arc<dyn Clock>,
  revalidations: Arc<AtomicUsize>,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      fetcher,
      clock,
      revalidations: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Background refreshes still running.
  pub fn revalidations_in_flight(&self) -> usize {
    self.revalidations.load(Ordering::SeqCst)
  }

  /// Read an entry, treating storage errors as a miss.
  pub fn lookup(&self, store: &str, key: &str) -> Option<Response> {
    match self.storage.get(store, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(store, key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Stamp and write an entry.
  pub fn capture(&self, store: &str, key: &str, response: &Response) {
    capture(&*self.storage, &*self.clock, store, key, response);
  }

  /// Cache-first.
  ///
  /// 1. Hit: return without touching the network
  /// 2. Miss: fetch, store a successful response, return it
  /// 3. Network failure: serve the `fallback_key` entry if present, else fail
  pub async fn cache_first(
    &self,
    store: &str,
    request: Request,
    fallback_key: Option<&str>,
  ) -> Result<CacheResult, FetchError> {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(store, &key) {
      debug!(store, key = %key, "cache-first hit");
      return Ok(CacheResult::from_cache(cached, false));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.capture(store, &key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        if let Some(placeholder) = fallback_key.and_then(|k| self.lookup(store, k)) {
          warn!(store, key = %key, error = %err, "network failed, serving offline placeholder");
          return Ok(CacheResult::offline(placeholder));
        }
        debug!(store, key = %key, error = %err, "cache-first miss and network failed");
        Err(err)
      }
    }
  }

  /// Network-first with bounded freshness.
  ///
  /// The network answer always wins. When the network fails, a stored entry
  /// is served only if it was captured no more than `max_age` ago; entries
  /// without a capture stamp are always acceptable. Otherwise the original
  /// failure propagates.
  pub async fn network_first(
    &self,
    store: &str,
    request: Request,
    max_age: Duration,
  ) -> Result<CacheResult, FetchError> {
    let key = request.cache_key();

    let err = match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.capture(store, &key, &response);
        }
        return Ok(CacheResult::from_network(response));
      }
      Err(err) => err,
    };

    let Some(cached) = self.lookup(store, &key) else {
      debug!(store, key = %key, error = %err, "network failed with nothing cached");
      return Err(err);
    };

    match captured_at(&cached) {
      None => {
        debug!(store, key = %key, "serving unstamped entry as fallback");
        Ok(CacheResult::from_cache(cached, true))
      }
      Some(at) => {
        let age = self.clock.now() - at;
        if age <= max_age {
          debug!(store, key = %key, age_ms = age.num_milliseconds(), "serving stale fallback");
          Ok(CacheResult::from_cache(cached, true))
        } else {
          debug!(
            store,
            key = %key,
            age_ms = age.num_milliseconds(),
            "cached entry older than freshness window"
          );
          Err(err)
        }
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A hit is returned at once while a background task refreshes the entry.
  /// A miss waits for the network.
  pub async fn stale_while_revalidate(
    &self,
    store: &str,
    request: Request,
  ) -> Result<CacheResult, FetchError> {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(store, &key) {
      debug!(store, key = %key, "serving cached entry, revalidating in background");
      let handle = self.spawn_revalidation(store.to_string(), key, request);
      return Ok(CacheResult::from_cache(cached, false).with_revalidation(handle));
    }

    let response = self.fetcher.fetch(request).await?;
    if response.is_success() {
      self.capture(store, &key, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Network-only: no store is read or written.
  pub async fn network_only(&self, request: Request) -> Result<CacheResult, FetchError> {
    self
      .fetcher
      .fetch(request)
      .await
      .map(CacheResult::from_network)
  }

  fn spawn_revalidation(&self, store: String, key: String, request: Request) -> RevalidationHandle {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let clock = Arc::clone(&self.clock);
    let in_flight = InFlight::enter(&self.revalidations);

    let task = tokio::spawn(async move {
      let _in_flight = in_flight;
      match fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
          capture(&*storage, &*clock, &store, &key, &response);
          debug!(store = %store, key = %key, "revalidated");
        }
        Ok(response) => {
          debug!(
            store = %store,
            key = %key,
            status = response.status,
            "revalidation not successful, keeping entry"
          );
        }
        Err(e) => {
          warn!(store = %store, key = %key, error = %e, "revalidation failed");
        }
      }
    });

    RevalidationHandle::new(task)
  }
}

fn capture<S: CacheStorage + ?Sized>(
  storage: &S,
  clock: &dyn Clock,
  store: &str,
  key: &str,
  response: &Response,
) {
  let stamped = stamp(response, clock.now());
  if let Err(e) = storage.put(store, key, &stamped) {
    warn!(store, key = %key, error = %e, "cache write failed");
  }
}

/// Counts a background task for as long as it lives, panics included.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
  fn enter(counter: &Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(Arc::clone(counter))
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}
