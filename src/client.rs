//! Client façade: reads go through the cache engine, writes are sent or
//! queued for later replay.

use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, info};

use crate::cache::{CacheResult, CacheSource, CacheStorage};
use crate::engine::CacheStrategyEngine;
use crate::http::{Request, Response};
use crate::network::{FetchError, Fetcher, NetworkStatusMonitor, RequestSigner};
use crate::offline::{
  MutationEnvelope, OfflineMutationQueue, PendingMutation, QueueRepository, QueueSummary,
  ReplayOutcome, ReplayResult,
};

/// Result of a write.
#[derive(Debug)]
pub enum WriteOutcome {
  /// Reached the server; the response is whatever it answered
  Sent(Response),
  /// Saved locally, pending sync
  Queued(PendingMutation),
}

/// Entry point for the host application.
///
/// Connectivity is inferred from traffic: a missing response marks the
/// monitor offline, any answer from the network marks it online (which in
/// turn replays the queue).
pub struct OfflineClient<S: CacheStorage, R: QueueRepository> {
  engine: Arc<CacheStrategyEngine<S>>,
  queue: Arc<OfflineMutationQueue<R>>,
  monitor: Arc<NetworkStatusMonitor>,
  fetcher: Arc<dyn Fetcher>,
  signer: Arc<dyn RequestSigner>,
}

impl<S: CacheStorage, R: QueueRepository> OfflineClient<S, R> {
  /// Wire the parts together and hand queue replay to the monitor.
  pub fn new(
    engine: Arc<CacheStrategyEngine<S>>,
    queue: Arc<OfflineMutationQueue<R>>,
    monitor: Arc<NetworkStatusMonitor>,
    fetcher: Arc<dyn Fetcher>,
    signer: Arc<dyn RequestSigner>,
  ) -> Self {
    monitor.attach_replay(Arc::new(Arc::clone(&queue)));

    Self {
      engine,
      queue,
      monitor,
      fetcher,
      signer,
    }
  }

  pub fn engine(&self) -> &CacheStrategyEngine<S> {
    &self.engine
  }

  pub fn queue(&self) -> &OfflineMutationQueue<R> {
    &self.queue
  }

  pub fn monitor(&self) -> &NetworkStatusMonitor {
    &self.monitor
  }

  pub fn is_online(&self) -> bool {
    self.monitor.is_online()
  }

  pub fn status(&self) -> QueueSummary {
    self.queue.status()
  }

  /// Manual replay trigger.
  ///
  /// Dispatches even while the monitor reads offline, so a user can recover
  /// after a transient outage without waiting for a probe. The outcomes feed
  /// connectivity back: an unreachable dispatch marks the monitor offline,
  /// any server answer marks it online.
  pub async fn replay_all(&self) -> Vec<ReplayOutcome> {
    // Held so the online transition below does not spawn a second replay
    let _slot = self.monitor.claim_replay();
    let outcomes = self.queue.replay_now().await;

    if outcomes
      .iter()
      .any(|o| matches!(o.result, ReplayResult::Offline(_)))
    {
      self.monitor.set_online(false);
    } else if outcomes.iter().any(|o| o.reached_network) {
      self.monitor.set_online(true);
    }

    outcomes
  }

  /// Read through the cache engine.
  pub async fn get(&self, request: Request) -> Result<CacheResult, FetchError> {
    let result = self.engine.handle(request).await;

    match &result {
      Ok(served) if matches!(served.source, CacheSource::Network | CacheSource::Passthrough) => {
        self.monitor.set_online(true);
      }
      Err(FetchError::Unreachable(_)) => {
        self.monitor.set_online(false);
      }
      _ => {}
    }

    result
  }

  /// Send a write, or queue it when the network is unreachable.
  ///
  /// A server rejection is returned as the response; only a missing response
  /// leads to queuing. Writes whose body cannot be captured for replay
  /// surface the network error instead.
  pub async fn send(&self, action: &str, request: Request) -> Result<WriteOutcome, FetchError> {
    if request.method == Method::GET || request.method == Method::HEAD {
      return self
        .get(request)
        .await
        .map(|served| WriteOutcome::Sent(served.response));
    }

    if !self.monitor.is_online() {
      debug!(action, "offline, queuing without attempting");
      return self.queue_write(action, &request, FetchError::Unreachable("offline".into()));
    }

    let mut signed = request.clone();
    self.signer.sign(&mut signed);

    match self.fetcher.fetch(signed).await {
      Ok(response) => {
        self.monitor.set_online(true);
        Ok(WriteOutcome::Sent(response))
      }
      Err(err @ FetchError::Unreachable(_)) => {
        self.monitor.set_online(false);
        self.queue_write(action, &request, err)
      }
      Err(err) => Err(err),
    }
  }

  // The unsigned request is queued; replay signs it afresh
  fn queue_write(
    &self,
    action: &str,
    request: &Request,
    cause: FetchError,
  ) -> Result<WriteOutcome, FetchError> {
    let envelope = match MutationEnvelope::from_request(request) {
      Ok(envelope) => envelope,
      Err(e) => {
        info!(action, error = %e, "write cannot be queued");
        return Err(cause);
      }
    };

    let mutation = self.queue.enqueue(action, envelope.to_value());
    Ok(WriteOutcome::Queued(mutation))
  }
}
