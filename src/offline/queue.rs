//! Durable, ordered queue of writes awaiting connectivity.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::mutation::{MutationHandler, MutationStatus, PendingMutation};
use super::repository::QueueRepository;
use crate::clock::Clock;
use crate::network::ReplayTrigger;

/// What replay does after a mutation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
  /// Stop at the first failure; later mutations stay pending. Keeps
  /// create-then-update chains in causal order.
  #[default]
  Halt,
  /// Attempt every mutation regardless of earlier failures.
  Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
  /// Replayed and removed from the queue
  Synced,
  /// Replay attempted and failed; the mutation stays queued as `failed`
  Failed(String),
  /// The network could not be reached; the mutation stays `pending` and
  /// the rest of the run is skipped
  Offline(String),
  /// Not attempted (halted by an earlier failure, or offline)
  Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
  pub id: u64,
  pub action: String,
  pub result: ReplayResult,
  /// Whether the server answered this dispatch, successfully or not
  pub reached_network: bool,
}

impl ReplayOutcome {
  fn skipped(id: u64, action: String) -> Self {
    Self {
      id,
      action,
      result: ReplayResult::Skipped,
      reached_network: false,
    }
  }
}

/// Counts by state, for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
  pub pending: usize,
  pub syncing: usize,
  pub failed: usize,
}

impl QueueSummary {
  pub fn total(&self) -> usize {
    self.pending + self.syncing + self.failed
  }
}

struct QueueState {
  mutations: Vec<PendingMutation>,
  next_id: u64,
}

/// Holds writes that could not reach the network and replays them in
/// creation order.
///
/// Every change is persisted through the repository right away. The list is
/// only touched under one lock in this process; several processes sharing a
/// repository get last-write-wins on the whole list.
pub struct OfflineMutationQueue<R: QueueRepository> {
  repository: R,
  handler: Arc<dyn MutationHandler>,
  clock: Arc<dyn Clock>,
  policy: ReplayPolicy,
  connectivity: Option<watch::Receiver<bool>>,
  state: Mutex<QueueState>,
  replay_lock: tokio::sync::Mutex<()>,
}

impl<R: QueueRepository> OfflineMutationQueue<R> {
  /// Open the queue, restoring whatever the repository holds.
  ///
  /// An unreadable list is logged and treated as empty. Records left in
  /// `syncing` by an interrupted replay go back to `pending`.
  pub fn open(repository: R, handler: Arc<dyn MutationHandler>, clock: Arc<dyn Clock>) -> Self {
    let mut mutations = repository.load().unwrap_or_else(|e| {
      warn!(error = %e, "mutation queue unreadable, starting empty");
      Vec::new()
    });

    for mutation in mutations.iter_mut() {
      if mutation.status == MutationStatus::Syncing {
        mutation.status = MutationStatus::Pending;
      }
    }
    mutations.retain(|m| m.status != MutationStatus::Synced);
    mutations.sort_by_key(|m| m.id);

    // Ids are never reused, even after the list drains between sessions
    let stored_next = repository.load_next_id().unwrap_or_else(|e| {
      warn!(error = %e, "mutation id mark unreadable, deriving from the list");
      0
    });
    let next_id = mutations
      .last()
      .map_or(1, |m| m.id + 1)
      .max(stored_next);
    debug!(restored = mutations.len(), next_id, "mutation queue opened");

    Self {
      repository,
      handler,
      clock,
      policy: ReplayPolicy::default(),
      connectivity: None,
      state: Mutex::new(QueueState { mutations, next_id }),
      replay_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn with_policy(mut self, policy: ReplayPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Gate replay on connectivity: no new dispatch starts while offline.
  pub fn with_connectivity(mut self, online: watch::Receiver<bool>) -> Self {
    self.connectivity = Some(online);
    self
  }

  pub fn policy(&self) -> ReplayPolicy {
    self.policy
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn persist(&self, mutations: &[PendingMutation]) {
    if let Err(e) = self.repository.save(mutations) {
      warn!(error = %e, "failed to persist mutation queue");
    }
  }

  fn is_online(&self) -> bool {
    self
      .connectivity
      .as_ref()
      .map_or(true, |online| *online.borrow())
  }

  /// Append a mutation. Never fails; a persistence error is logged and the
  /// mutation stays queued in memory.
  pub fn enqueue(&self, action: &str, payload: Value) -> PendingMutation {
    let mut state = self.lock();

    let mutation = PendingMutation {
      id: state.next_id,
      action: action.to_string(),
      payload,
      created_at: self.clock.now(),
      status: MutationStatus::Pending,
      attempts: 0,
      last_error: None,
    };
    state.next_id += 1;
    if let Err(e) = self.repository.save_next_id(state.next_id) {
      warn!(error = %e, "failed to persist mutation id mark");
    }
    state.mutations.push(mutation.clone());
    self.persist(&state.mutations);

    info!(id = mutation.id, action, "mutation queued for sync");
    mutation
  }

  /// Snapshot of the queue in creation order.
  pub fn list(&self) -> Vec<PendingMutation> {
    self.lock().mutations.clone()
  }

  pub fn status(&self) -> QueueSummary {
    let state = self.lock();
    let mut summary = QueueSummary::default();
    for mutation in &state.mutations {
      match mutation.status {
        MutationStatus::Pending => summary.pending += 1,
        MutationStatus::Syncing => summary.syncing += 1,
        MutationStatus::Failed => summary.failed += 1,
        MutationStatus::Synced => {}
      }
    }
    summary
  }

  /// User-initiated removal. Returns whether the mutation was queued.
  pub fn discard(&self, id: u64) -> bool {
    let mut state = self.lock();
    let before = state.mutations.len();
    state.mutations.retain(|m| m.id != id);
    let removed = state.mutations.len() != before;
    if removed {
      self.persist(&state.mutations);
      info!(id, "mutation discarded");
    }
    removed
  }

  /// Put one failed mutation back in line.
  pub fn retry(&self, id: u64) -> bool {
    self.reset_failed(|m| m.id == id) > 0
  }

  /// Put every failed mutation back in line. Returns how many.
  pub fn retry_failed(&self) -> usize {
    self.reset_failed(|_| true)
  }

  fn reset_failed(&self, select: impl Fn(&PendingMutation) -> bool) -> usize {
    let mut state = self.lock();
    let mut count = 0;
    for mutation in state.mutations.iter_mut() {
      if mutation.status == MutationStatus::Failed && select(mutation) {
        mutation.status = MutationStatus::Pending;
        count += 1;
      }
    }
    if count > 0 {
      self.persist(&state.mutations);
    }
    count
  }

  /// Apply `f` to a queued mutation and persist. `None` if it is gone.
  fn update(&self, id: u64, f: impl FnOnce(&mut PendingMutation)) -> Option<PendingMutation> {
    let mut state = self.lock();
    let mutation = state.mutations.iter_mut().find(|m| m.id == id)?;
    f(mutation);
    let updated = mutation.clone();
    self.persist(&state.mutations);
    Some(updated)
  }

  fn remove(&self, id: u64) {
    let mut state = self.lock();
    state.mutations.retain(|m| m.id != id);
    self.persist(&state.mutations);
  }

  /// Replay pending and failed mutations in creation order.
  ///
  /// Runs one at a time; a second call waits for the first to finish.
  /// Failures are reported in the outcomes, never returned as errors. No new
  /// dispatch starts while the connectivity receiver reads offline.
  pub async fn replay_all(&self) -> Vec<ReplayOutcome> {
    self.replay(true).await
  }

  /// Replay regardless of the last known connectivity.
  ///
  /// The dispatches themselves find out whether the network is back: the
  /// first unreachable one leaves its mutation pending and ends the run.
  pub async fn replay_now(&self) -> Vec<ReplayOutcome> {
    self.replay(false).await
  }

  async fn replay(&self, gated: bool) -> Vec<ReplayOutcome> {
    let _replaying = self.replay_lock.lock().await;

    let candidates: Vec<(u64, String)> = self
      .lock()
      .mutations
      .iter()
      .filter(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::Failed))
      .map(|m| (m.id, m.action.clone()))
      .collect();

    if candidates.is_empty() {
      return Vec::new();
    }
    info!(count = candidates.len(), policy = ?self.policy, "replaying queued mutations");

    let mut outcomes = Vec::with_capacity(candidates.len());
    let mut halted = false;

    for (id, action) in candidates {
      if halted || (gated && !self.is_online()) {
        outcomes.push(ReplayOutcome::skipped(id, action));
        continue;
      }

      // Discarded while an earlier mutation was in flight
      let Some(mutation) = self.update(id, |m| {
        m.status = MutationStatus::Syncing;
        m.attempts += 1;
      }) else {
        continue;
      };

      let (result, reached_network) = match self.handler.dispatch(&mutation).await {
        Ok(()) => {
          self.remove(id);
          debug!(id, action = %action, "mutation synced");
          (ReplayResult::Synced, true)
        }
        Err(e) if e.is_unreachable() => {
          let reason = e.to_string();
          self.update(id, |m| {
            m.status = MutationStatus::Pending;
            m.last_error = Some(reason.clone());
          });
          info!(id, action = %action, error = %reason, "network unreachable, replay stopped");
          halted = true;
          (ReplayResult::Offline(reason), false)
        }
        Err(e) => {
          let reason = e.to_string();
          self.update(id, |m| {
            m.status = MutationStatus::Failed;
            m.last_error = Some(reason.clone());
          });
          warn!(id, action = %action, error = %reason, "mutation replay failed");
          if self.policy == ReplayPolicy::Halt {
            halted = true;
          }
          (ReplayResult::Failed(reason), e.reached_network())
        }
      };

      outcomes.push(ReplayOutcome {
        id,
        action,
        result,
        reached_network,
      });
    }

    let synced = outcomes
      .iter()
      .filter(|o| o.result == ReplayResult::Synced)
      .count();
    info!(synced, attempted = outcomes.len(), "replay finished");
    outcomes
  }
}

/// Lets the connectivity monitor drive replay.
impl<R: QueueRepository> ReplayTrigger for Arc<OfflineMutationQueue<R>> {
  fn trigger_replay(&self) -> BoxFuture<'static, ()> {
    let queue = Arc::clone(self);
    Box::pin(async move {
      queue.replay_all().await;
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::NetworkStatusMonitor;
  use crate::offline::repository::MemoryQueueRepository;
  use crate::testing::{ManualClock, ScriptedHandler};
  use serde_json::json;

  fn queue_with(
    repo: MemoryQueueRepository,
    handler: &Arc<ScriptedHandler>,
  ) -> OfflineMutationQueue<MemoryQueueRepository> {
    OfflineMutationQueue::open(repo, handler.clone(), ManualClock::new())
  }

  fn results(outcomes: &[ReplayOutcome]) -> Vec<(String, ReplayResult)> {
    outcomes
      .iter()
      .map(|o| (o.action.clone(), o.result.clone()))
      .collect()
  }

  fn failed(action: &str) -> ReplayResult {
    ReplayResult::Failed(format!("request rejected with status 500: {} exploded", action))
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids_and_persists() {
    let handler = ScriptedHandler::new();
    let queue = queue_with(MemoryQueueRepository::new(), &handler);

    let a = queue.enqueue("A", json!({ "n": 1 }));
    let b = queue.enqueue("B", json!({ "n": 2 }));
    assert!(a.id < b.id);
    assert_eq!(a.status, MutationStatus::Pending);
    assert_eq!(
      queue.status(),
      QueueSummary {
        pending: 2,
        syncing: 0,
        failed: 0
      }
    );

    let raw = queue.repository.raw().unwrap();
    let stored: Vec<PendingMutation> = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored, vec![a, b]);
  }

  #[test]
  fn test_reopen_restores_order_and_continues_ids() {
    let handler = ScriptedHandler::new();
    let first = queue_with(MemoryQueueRepository::new(), &handler);
    first.enqueue("A", Value::Null);
    first.enqueue("B", Value::Null);
    let raw = first.repository.raw().unwrap();

    let reopened = queue_with(MemoryQueueRepository::with_raw(raw), &handler);
    let c = reopened.enqueue("C", Value::Null);
    let actions: Vec<_> = reopened.list().into_iter().map(|m| m.action).collect();
    assert_eq!(actions, vec!["A", "B", "C"]);
    assert_eq!(c.id, 3);
  }

  #[test]
  fn test_interrupted_syncing_reloads_as_pending() {
    let raw = r#"[{"id":4,"action":"A","payload":null,"createdAt":"2024-03-01T12:00:00Z","status":"syncing","attempts":1}]"#;
    let queue = queue_with(MemoryQueueRepository::with_raw(raw), &ScriptedHandler::new());
    assert_eq!(queue.list()[0].status, MutationStatus::Pending);
    assert_eq!(queue.enqueue("B", Value::Null).id, 5);
  }

  #[test]
  fn test_corrupt_storage_starts_empty() {
    let queue = queue_with(
      MemoryQueueRepository::with_raw("{{{ definitely not json"),
      &ScriptedHandler::new(),
    );
    assert_eq!(queue.status().total(), 0);
    // Still usable, and the next save replaces the garbage
    queue.enqueue("A", Value::Null);
    assert_eq!(queue.status().pending, 1);
    assert!(queue.repository.raw().unwrap().starts_with('['));
  }

  #[tokio::test]
  async fn test_replay_all_in_creation_order() {
    let handler = ScriptedHandler::new();
    let queue = queue_with(MemoryQueueRepository::new(), &handler);
    for action in ["A", "B", "C", "D"] {
      queue.enqueue(action, Value::Null);
    }

    let outcomes = queue.replay_all().await;
    assert_eq!(handler.dispatched(), vec!["A", "B", "C", "D"]);
    assert!(outcomes.iter().all(|o| o.result == ReplayResult::Synced));
    assert_eq!(queue.status().total(), 0);
    assert_eq!(queue.repository.raw().unwrap(), "[]");
  }

  #[tokio::test]
  async fn test_halt_policy_stops_at_first_failure() {
    let handler = ScriptedHandler::new();
    handler.fail_action("B");
    let queue = queue_with(MemoryQueueRepository::new(), &handler);
    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }

    let outcomes = queue.replay_all().await;
    assert_eq!(
      results(&outcomes),
      vec![
        ("A".to_string(), ReplayResult::Synced),
        ("B".to_string(), failed("B")),
        ("C".to_string(), ReplayResult::Skipped),
      ]
    );
    assert_eq!(handler.dispatched(), vec!["A", "B"]);

    let remaining = queue.list();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].action, "B");
    assert_eq!(remaining[0].status, MutationStatus::Failed);
    assert_eq!(remaining[0].attempts, 1);
    assert!(remaining[0].last_error.is_some());
    assert_eq!(remaining[1].action, "C");
    assert_eq!(remaining[1].status, MutationStatus::Pending);
  }

  #[tokio::test]
  async fn test_continue_policy_attempts_everything() {
    let handler = ScriptedHandler::new();
    handler.fail_action("B");
    let queue =
      queue_with(MemoryQueueRepository::new(), &handler).with_policy(ReplayPolicy::Continue);
    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }

    let outcomes = queue.replay_all().await;
    assert_eq!(
      results(&outcomes),
      vec![
        ("A".to_string(), ReplayResult::Synced),
        ("B".to_string(), failed("B")),
        ("C".to_string(), ReplayResult::Synced),
      ]
    );

    let remaining = queue.list();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action, "B");
    assert_eq!(queue.status().failed, 1);
  }

  #[tokio::test]
  async fn test_failed_mutations_are_retried_on_next_replay() {
    let handler = ScriptedHandler::new();
    handler.fail_action("B");
    let queue = queue_with(MemoryQueueRepository::new(), &handler);
    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }
    queue.replay_all().await;

    handler.heal_action("B");
    let outcomes = queue.replay_all().await;
    assert_eq!(
      results(&outcomes),
      vec![
        ("B".to_string(), ReplayResult::Synced),
        ("C".to_string(), ReplayResult::Synced),
      ]
    );
    assert_eq!(handler.dispatched(), vec!["A", "B", "B", "C"]);
    assert!(queue.list().is_empty());
  }

  #[test]
  fn test_retry_and_discard() {
    let handler = ScriptedHandler::new();
    let queue = queue_with(MemoryQueueRepository::new(), &handler);
    let a = queue.enqueue("A", Value::Null);
    let b = queue.enqueue("B", Value::Null);

    // Nothing failed yet
    assert!(!queue.retry(a.id));
    assert_eq!(queue.retry_failed(), 0);

    queue.update(a.id, |m| m.status = MutationStatus::Failed);
    queue.update(b.id, |m| m.status = MutationStatus::Failed);
    assert!(queue.retry(a.id));
    assert_eq!(queue.status().failed, 1);
    assert_eq!(queue.retry_failed(), 1);
    assert_eq!(queue.status().pending, 2);

    assert!(queue.discard(a.id));
    assert!(!queue.discard(a.id));
    assert_eq!(queue.list().len(), 1);
  }

  #[tokio::test]
  async fn test_going_offline_mid_replay_stops_new_dispatches() {
    let monitor = Arc::new(NetworkStatusMonitor::new(true));
    let handler = ScriptedHandler::new();
    let queue = queue_with(MemoryQueueRepository::new(), &handler)
      .with_policy(ReplayPolicy::Continue)
      .with_connectivity(monitor.subscribe());
    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }

    // The connection drops while A is in flight; A still completes
    let hook_monitor = Arc::clone(&monitor);
    handler.on_dispatch(move |action| {
      if action == "A" {
        hook_monitor.set_online(false);
      }
    });

    let outcomes = queue.replay_all().await;
    assert_eq!(
      results(&outcomes),
      vec![
        ("A".to_string(), ReplayResult::Synced),
        ("B".to_string(), ReplayResult::Skipped),
        ("C".to_string(), ReplayResult::Skipped),
      ]
    );
    assert_eq!(queue.status().pending, 2);
  }

  #[tokio::test]
  async fn test_reconnect_replays_queue_once() {
    let monitor = NetworkStatusMonitor::new(false);
    let handler = ScriptedHandler::new();
    handler.fail_action("B");
    let queue = Arc::new(
      queue_with(MemoryQueueRepository::new(), &handler).with_connectivity(monitor.subscribe()),
    );
    monitor.attach_replay(Arc::new(Arc::clone(&queue)));

    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }

    // Offline: manual replay dispatches nothing
    let outcomes = queue.replay_all().await;
    assert!(outcomes.iter().all(|o| o.result == ReplayResult::Skipped));
    assert!(handler.dispatched().is_empty());

    monitor.set_online(true).expect("replay on reconnect").await.unwrap();
    assert!(monitor.set_online(true).is_none());

    assert_eq!(handler.dispatched(), vec!["A", "B"]);
    let remaining = queue.list();
    assert_eq!(remaining[0].status, MutationStatus::Failed);
    assert_eq!(remaining[1].status, MutationStatus::Pending);
  }

  #[test]
  fn test_ids_are_not_reused_after_the_queue_drains() {
    let handler = ScriptedHandler::new();
    let repo = Arc::new(MemoryQueueRepository::new());

    let first = OfflineMutationQueue::open(Arc::clone(&repo), handler.clone(), ManualClock::new());
    let a = first.enqueue("A", Value::Null);
    let b = first.enqueue("B", Value::Null);
    first.discard(a.id);
    first.discard(b.id);
    assert_eq!(repo.raw().unwrap(), "[]");
    drop(first);

    let reopened = OfflineMutationQueue::open(Arc::clone(&repo), handler, ManualClock::new());
    assert_eq!(reopened.enqueue("C", Value::Null).id, 3);
  }

  #[tokio::test]
  async fn test_replay_now_ignores_stale_offline_state() {
    let monitor = NetworkStatusMonitor::new(false);
    let handler = ScriptedHandler::new();
    let queue =
      queue_with(MemoryQueueRepository::new(), &handler).with_connectivity(monitor.subscribe());
    for action in ["A", "B"] {
      queue.enqueue(action, Value::Null);
    }

    assert!(queue
      .replay_all()
      .await
      .iter()
      .all(|o| o.result == ReplayResult::Skipped));

    let outcomes = queue.replay_now().await;
    assert!(outcomes
      .iter()
      .all(|o| o.result == ReplayResult::Synced && o.reached_network));
    assert_eq!(handler.dispatched(), vec!["A", "B"]);
    assert!(queue.list().is_empty());
  }

  #[tokio::test]
  async fn test_unreachable_dispatch_keeps_mutation_pending() {
    let handler = ScriptedHandler::new();
    handler.drop_action("B");
    let queue =
      queue_with(MemoryQueueRepository::new(), &handler).with_policy(ReplayPolicy::Continue);
    for action in ["A", "B", "C"] {
      queue.enqueue(action, Value::Null);
    }

    // Even under Continue, a dead network ends the run
    let outcomes = queue.replay_now().await;
    assert_eq!(outcomes[0].result, ReplayResult::Synced);
    assert!(matches!(outcomes[1].result, ReplayResult::Offline(_)));
    assert!(!outcomes[1].reached_network);
    assert_eq!(outcomes[2].result, ReplayResult::Skipped);
    assert_eq!(handler.dispatched(), vec!["A", "B"]);

    let remaining = queue.list();
    assert_eq!(remaining[0].action, "B");
    assert_eq!(remaining[0].status, MutationStatus::Pending);
    assert_eq!(remaining[0].attempts, 1);
    assert_eq!(
      remaining[0].last_error.as_deref(),
      Some("network unreachable: B timed out")
    );
    assert_eq!(queue.status().failed, 0);

    handler.heal_action("B");
    queue.replay_now().await;
    assert!(queue.list().is_empty());
  }
}
