//! Core types for the caching system.

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::http::Response;

/// Synthetic header carrying the capture time (Unix milliseconds).
///
/// The only freshness signal; upstream cache-control headers are ignored.
pub const CAPTURED_AT_HEADER: &str = "x-netcache-captured-at";

/// Copy of `response` stamped with the capture time.
pub fn stamp(response: &Response, at: DateTime<Utc>) -> Response {
  let mut stamped = response.clone();
  stamped.set_header(CAPTURED_AT_HEADER, at.timestamp_millis().to_string());
  stamped
}

/// Capture time of a stored response, if it carries a readable stamp.
pub fn captured_at(response: &Response) -> Option<DateTime<Utc>> {
  let millis: i64 = response.header(CAPTURED_AT_HEADER)?.trim().parse().ok()?;
  Utc.timestamp_millis_opt(millis).single()
}

/// Result from a cache operation, including the response and where it came from.
#[derive(Debug)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was captured (if served from a store)
  pub captured_at: Option<DateTime<Utc>>,
  /// Background refresh started by stale-while-revalidate
  pub revalidation: Option<RevalidationHandle>,
}

impl CacheResult {
  /// Fresh data from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      captured_at: None,
      revalidation: None,
    }
  }

  /// Request was not intercepted.
  pub fn passthrough(response: Response) -> Self {
    Self {
      source: CacheSource::Passthrough,
      ..Self::from_network(response)
    }
  }

  /// Data from a store, either a regular hit or a fallback after a failed fetch.
  pub fn from_cache(response: Response, is_fallback: bool) -> Self {
    let captured_at = captured_at(&response);
    Self {
      response,
      source: if is_fallback {
        CacheSource::StaleFallback
      } else {
        CacheSource::Cache
      },
      captured_at,
      revalidation: None,
    }
  }

  /// The offline placeholder served in place of an unreachable asset.
  pub fn offline(response: Response) -> Self {
    let captured_at = captured_at(&response);
    Self {
      response,
      source: CacheSource::OfflinePlaceholder,
      captured_at,
      revalidation: None,
    }
  }

  pub fn with_revalidation(mut self, handle: RevalidationHandle) -> Self {
    self.revalidation = Some(handle);
    self
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Store hit, served without waiting on the network
  Cache,
  /// Store entry served because the network failed, within its freshness window
  StaleFallback,
  /// Network failed and the designated placeholder was served instead
  OfflinePlaceholder,
  /// Not intercepted; went straight to the network
  Passthrough,
}

/// Handle to a stale-while-revalidate background refresh.
///
/// Only for observation: dropping it detaches the task, it is never used to
/// cancel one.
#[derive(Debug)]
pub struct RevalidationHandle {
  task: JoinHandle<()>,
}

impl RevalidationHandle {
  pub(crate) fn new(task: JoinHandle<()>) -> Self {
    Self { task }
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for the refresh to settle. Never fails.
  pub async fn settled(self) {
    if let Err(e) = self.task.await {
      warn!(error = %e, "revalidation task did not complete");
    }
  }
}
