//! Single source of truth for connectivity, and the trigger for queue replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use super::fetcher::Fetcher;
use crate::http::Request;

type Listener = Box<dyn Fn(bool) + Send + Sync>;

/// Something that can be replayed when connectivity comes back.
pub trait ReplayTrigger: Send + Sync + 'static {
  fn trigger_replay(&self) -> BoxFuture<'static, ()>;
}

#[derive(Default)]
struct ReplaySlot {
  running: AtomicBool,
  // An online transition arrived while a replay was running
  rerun: AtomicBool,
}

impl ReplaySlot {
  fn claim(self: &Arc<Self>) -> Option<ReplayGuard> {
    if self.running.swap(true, Ordering::SeqCst) {
      return None;
    }
    Some(ReplayGuard(Arc::clone(self)))
  }
}

/// Exclusive right to replay. Released on drop, including by a panic in
/// the replay it guards.
pub struct ReplayGuard(Arc<ReplaySlot>);

impl Drop for ReplayGuard {
  fn drop(&mut self) {
    self.0.running.store(false, Ordering::SeqCst);
  }
}

/// Tracks online/offline state.
///
/// Reports are edge-triggered: `set_online` with the current value is a
/// no-op, so listeners and the replay trigger only see real transitions.
pub struct NetworkStatusMonitor {
  state: watch::Sender<bool>,
  listeners: Mutex<Vec<Listener>>,
  replay: Mutex<Option<Arc<dyn ReplayTrigger>>>,
  slot: Arc<ReplaySlot>,
}

impl NetworkStatusMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (state, _) = watch::channel(initially_online);
    Self {
      state,
      listeners: Mutex::new(Vec::new()),
      replay: Mutex::new(None),
      slot: Arc::new(ReplaySlot::default()),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  /// Receiver for async consumers; always holds the latest state.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }

  /// Register a listener called on every transition.
  ///
  /// Listeners run synchronously inside `set_online` and must not report
  /// connectivity themselves.
  pub fn on_change<F>(&self, listener: F)
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Box::new(listener));
  }

  /// Attach the routine to run on each offline -> online transition.
  pub fn attach_replay(&self, trigger: Arc<dyn ReplayTrigger>) {
    *self.replay.lock().unwrap_or_else(PoisonError::into_inner) = Some(trigger);
  }

  /// Whether a replay is running, either spawned by a transition or held
  /// through [`claim_replay`](Self::claim_replay).
  pub fn is_replaying(&self) -> bool {
    self.slot.running.load(Ordering::SeqCst)
  }

  /// Take the replay slot for a caller-driven replay. `None` while another
  /// replay holds it. Transitions reported meanwhile do not spawn a second
  /// replay.
  pub fn claim_replay(&self) -> Option<ReplayGuard> {
    let guard = self.slot.claim()?;
    self.slot.rerun.store(false, Ordering::SeqCst);
    Some(guard)
  }

  /// Report the observed connectivity.
  ///
  /// Returns the replay task when this report is an offline -> online
  /// transition and a replay was started.
  pub fn set_online(&self, online: bool) -> Option<JoinHandle<()>> {
    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if !changed {
      return None;
    }

    info!(online, "connectivity changed");

    for listener in self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
    {
      listener(online);
    }

    if online {
      self.spawn_replay()
    } else {
      None
    }
  }

  fn spawn_replay(&self) -> Option<JoinHandle<()>> {
    let trigger = self
      .replay
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()?;

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!("connectivity restored outside a runtime; replay not started");
      return None;
    };

    // Flapping: one replay at a time. A transition during a run is
    // remembered and replayed once more after it.
    self.slot.rerun.store(true, Ordering::SeqCst);
    let Some(guard) = self.slot.claim() else {
      debug!("replay already in flight, queued a rerun");
      return None;
    };

    let slot = Arc::clone(&self.slot);
    Some(runtime.spawn(async move {
      let mut guard = Some(guard);
      while let Some(held) = guard.take() {
        slot.rerun.store(false, Ordering::SeqCst);
        trigger.trigger_replay().await;
        drop(held);
        // Claim again only if a transition landed after the run began;
        // a failed claim means a caller-driven replay took over
        if slot.rerun.swap(false, Ordering::SeqCst) {
          guard = slot.claim();
        }
      }
    }))
  }
}

/// Poll `url` with `HEAD` every `every` and feed the result to `monitor`.
///
/// Any answer from the server counts as online.
pub fn spawn_probe(
  monitor: Arc<NetworkStatusMonitor>,
  fetcher: Arc<dyn Fetcher>,
  url: Url,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let reachable = match fetcher.fetch(Request::head(url.clone())).await {
        Ok(_) => true,
        Err(e) => {
          debug!(error = %e, "probe failed");
          false
        }
      };
      monitor.set_online(reachable);
    }
  })
}
