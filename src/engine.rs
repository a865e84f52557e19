//! The interception entry point: classification, strategy dispatch and the
//! install/activate lifecycle of the versioned stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{classify, CacheLayer, CacheResult, CacheStorage, RouteClass};
use crate::clock::Clock;
use crate::config::{Config, FreshnessConfig, RouteConfig, StoreConfig};
use crate::http::Request;
use crate::network::{FetchError, Fetcher};

/// Intercepts outbound requests and applies the caching discipline for their
/// route class.
///
/// Until `activate` has run every request passes straight to the network, so
/// a store from an older generation is never read.
pub struct CacheStrategyEngine<S: CacheStorage> {
  layer: CacheLayer<S>,
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  origin: Url,
  same_origin_only: bool,
  stores: StoreConfig,
  freshness: FreshnessConfig,
  routes: RouteConfig,
  precache: Vec<Url>,
  offline_fallback_key: Option<String>,
  active: AtomicBool,
}

impl<S: CacheStorage> CacheStrategyEngine<S> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;

    let precache = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let offline_fallback_key = config
      .offline_fallback
      .as_deref()
      .map(|path| config.resolve(path).map(|url| Request::get(url).cache_key()))
      .transpose()?;

    Ok(Self {
      layer: CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher), clock),
      storage,
      fetcher,
      origin,
      same_origin_only: config.same_origin_only,
      stores: config.stores.clone(),
      freshness: config.freshness.clone(),
      routes: config.routes.clone(),
      precache,
      offline_fallback_key,
      active: AtomicBool::new(false),
    })
  }

  pub fn classify(&self, request: &Request) -> RouteClass {
    classify(request, &self.routes)
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::SeqCst)
  }

  /// Background refreshes still running.
  pub fn revalidations_in_flight(&self) -> usize {
    self.layer.revalidations_in_flight()
  }

  /// Whether the request is eligible for caching at all.
  ///
  /// Only safe reads over http(s) to the application origin are.
  fn intercepts(&self, request: &Request) -> bool {
    request.method == Method::GET
      && matches!(request.url.scheme(), "http" | "https")
      && (!self.same_origin_only || request.url.origin() == self.origin.origin())
  }

  /// Single entry point for every outbound request.
  pub async fn handle(&self, request: Request) -> Result<CacheResult, FetchError> {
    if !self.is_active() || !self.intercepts(&request) {
      debug!(method = %request.method, url = %request.url, "passthrough");
      return self
        .fetcher
        .fetch(request)
        .await
        .map(CacheResult::passthrough);
    }

    if request.no_store {
      return self.layer.network_only(request).await;
    }

    let class = self.classify(&request);
    debug!(url = %request.url, ?class, "intercepted");

    match class {
      RouteClass::StaticAsset => {
        let store = self.stores.static_assets.versioned_name();
        self
          .layer
          .cache_first(&store, request, self.offline_fallback_key.as_deref())
          .await
      }
      RouteClass::ApiCall => {
        let store = self.stores.api.versioned_name();
        self
          .layer
          .network_first(&store, request, self.freshness.api_max_age())
          .await
      }
      RouteClass::Document => {
        let store = self.stores.pages.versioned_name();
        self
          .layer
          .network_first(&store, request, self.freshness.document_max_age())
          .await
      }
      RouteClass::Other => {
        let store = self.stores.runtime.versioned_name();
        self.layer.stale_while_revalidate(&store, request).await
      }
    }
  }

  /// Pre-warm the critical static paths into the static store.
  ///
  /// All or nothing: every path is fetched first and nothing is written
  /// unless all of them came back successful.
  pub async fn install(&self) -> Result<usize> {
    let store = self.stores.static_assets.versioned_name();

    let fetches = self.precache.iter().map(|url| {
      let request = Request::get(url.clone());
      let key = request.cache_key();
      let fetcher = Arc::clone(&self.fetcher);
      async move { (key, url, fetcher.fetch(request).await) }
    });

    let mut captured = Vec::with_capacity(self.precache.len());
    for (key, url, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_success() => captured.push((key, response)),
        Ok(response) => {
          return Err(eyre!(
            "Install failed: precache of {} returned status {}",
            url,
            response.status
          ))
        }
        Err(e) => return Err(eyre!("Install failed: precache of {} failed: {}", url, e)),
      }
    }

    for (key, response) in &captured {
      self.layer.capture(&store, key, response);
    }

    info!(store = %store, count = captured.len(), "install complete");
    Ok(captured.len())
  }

  /// Delete every store outside the current generation, then start
  /// intercepting. Returns the names deleted; idempotent.
  pub fn activate(&self) -> Result<Vec<String>> {
    let expected = self.stores.expected_names();
    let mut deleted = Vec::new();

    for name in self.storage.store_names()? {
      if expected.contains(&name) {
        continue;
      }
      if self.storage.delete_store(&name)? {
        info!(store = %name, "deleted outdated cache store");
        deleted.push(name);
      } else {
        warn!(store = %name, "outdated cache store vanished before deletion");
      }
    }

    self.active.store(true, Ordering::SeqCst);
    info!(stores = ?expected, "activated");
    Ok(deleted)
  }
}
