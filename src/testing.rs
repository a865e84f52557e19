//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::http::{Request, Response};
use crate::network::{FetchError, FetchFuture, Fetcher};
use crate::offline::{MutationHandler, PendingMutation, ReplayError};

type Scripted = Result<Response, FetchError>;

#[derive(Default)]
struct Route {
  once: VecDeque<Scripted>,
  sticky: Option<Scripted>,
}

/// Fetcher answering from per-URL scripts and counting calls.
///
/// Unscripted URLs are unreachable.
#[derive(Default)]
pub struct ScriptedFetcher {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<Request>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedFetcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Answer every call to `url` with `response` from now on.
  pub fn respond(&self, url: &str, response: Response) {
    self.route(url, |route| route.sticky = Some(Ok(response)));
  }

  /// Fail every call to `url` as unreachable from now on.
  pub fn fail(&self, url: &str) {
    self.fail_with(url, FetchError::Unreachable("scripted outage".into()));
  }

  /// Fail every call to `url` with `err` from now on.
  pub fn fail_with(&self, url: &str, err: FetchError) {
    self.route(url, |route| route.sticky = Some(Err(err)));
  }

  /// Answer the next call to `url` with `response`, ahead of the sticky one.
  pub fn respond_once(&self, url: &str, response: Response) {
    self.route(url, |route| route.once.push_back(Ok(response)));
  }

  /// Hold every response until the returned gate is notified.
  pub fn hold(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  fn route(&self, url: &str, f: impl FnOnce(&mut Route)) {
    let mut routes = self.routes.lock().unwrap();
    f(routes.entry(url.to_string()).or_default());
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch(&self, request: Request) -> FetchFuture {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(request);

    let result = {
      let mut routes = self.routes.lock().unwrap();
      match routes.get_mut(&url) {
        Some(route) => route
          .once
          .pop_front()
          .or_else(|| route.sticky.clone())
          .unwrap_or_else(|| Err(FetchError::Unreachable(format!("no script for {}", url)))),
        None => Err(FetchError::Unreachable(format!("no script for {}", url))),
      }
    };
    let gate = self.gate.lock().unwrap().clone();

    Box::pin(async move {
      if let Some(gate) = gate {
        gate.notified().await;
      }
      result
    })
  }
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      now: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
    })
  }

  pub fn advance_ms(&self, ms: i64) {
    *self.now.lock().unwrap() += Duration::milliseconds(ms);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// Mutation handler that fails the actions it is told to and records the
/// dispatch order.
#[derive(Default)]
pub struct ScriptedHandler {
  failing: Mutex<Vec<String>>,
  unreachable: Mutex<Vec<String>>,
  dispatched: Mutex<Vec<String>>,
  on_dispatch: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl ScriptedHandler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn fail_action(&self, action: &str) {
    self.failing.lock().unwrap().push(action.to_string());
  }

  pub fn heal_action(&self, action: &str) {
    self.failing.lock().unwrap().retain(|a| a != action);
    self.unreachable.lock().unwrap().retain(|a| a != action);
  }

  /// Dispatches of `action` find no network until healed.
  pub fn drop_action(&self, action: &str) {
    self.unreachable.lock().unwrap().push(action.to_string());
  }

  /// Run `f` with the action name as each dispatch starts.
  pub fn on_dispatch(&self, f: impl Fn(&str) + Send + Sync + 'static) {
    *self.on_dispatch.lock().unwrap() = Some(Box::new(f));
  }

  pub fn dispatched(&self) -> Vec<String> {
    self.dispatched.lock().unwrap().clone()
  }
}

impl MutationHandler for ScriptedHandler {
  fn dispatch(&self, mutation: &PendingMutation) -> BoxFuture<'static, Result<(), ReplayError>> {
    let action = mutation.action.clone();
    self.dispatched.lock().unwrap().push(action.clone());
    if let Some(hook) = self.on_dispatch.lock().unwrap().as_ref() {
      hook(&action);
    }
    let fails = self.failing.lock().unwrap().contains(&action);
    let dropped = self.unreachable.lock().unwrap().contains(&action);

    Box::pin(async move {
      if dropped {
        Err(ReplayError::Fetch(FetchError::Unreachable(format!(
          "{} timed out",
          action
        ))))
      } else if fails {
        Err(ReplayError::Fetch(FetchError::Rejected {
          status: 500,
          body: format!("{} exploded", action),
        }))
      } else {
        Ok(())
      }
    })
  }
}
