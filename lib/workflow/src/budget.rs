//! Shared concurrency budget.
//!
//! Every node dispatch holds a [`BudgetPermit`] for as long as its task
//! runs. Limits apply globally, per workflow and per submitting user; a limit
//! of zero means unlimited. Counters are plain atomics: acquiring bumps each
//! one with a compare-and-swap and rolls back the ones already taken if a
//! later one is full. Per-workflow and per-user counters exist only while
//! some permit uses them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use weaver_core::{UserId, WorkflowId};

fn default_global() -> usize {
    64
}

fn default_per_workflow() -> usize {
    16
}

fn default_per_user() -> usize {
    16
}

fn default_per_execution() -> usize {
    8
}

/// Concurrency limits. Zero disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Node tasks running across the whole engine.
    #[serde(default = "default_global")]
    pub global: usize,
    #[serde(default = "default_per_workflow", alias = "perWorkflow")]
    pub per_workflow: usize,
    /// Applies to executions submitted with a user.
    #[serde(default = "default_per_user", alias = "perUser")]
    pub per_user: usize,
    /// Worker limit inside one execution.
    #[serde(default = "default_per_execution", alias = "perExecution")]
    pub per_execution: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global: default_global(),
            per_workflow: default_per_workflow(),
            per_user: default_per_user(),
            per_execution: default_per_execution(),
        }
    }
}

impl ConcurrencyConfig {
    /// Same limit everywhere.
    #[must_use]
    pub fn uniform(limit: usize) -> Self {
        Self {
            global: limit,
            per_workflow: limit,
            per_user: limit,
            per_execution: limit,
        }
    }
}

#[derive(Debug)]
struct Counters {
    config: ConcurrencyConfig,
    global: AtomicUsize,
    per_workflow: Mutex<HashMap<WorkflowId, Arc<AtomicUsize>>>,
    per_user: Mutex<HashMap<UserId, Arc<AtomicUsize>>>,
    released: Notify,
}

/// Engine-wide dispatch budget.
#[derive(Debug, Clone)]
pub struct ConcurrencyBudget {
    counters: Arc<Counters>,
}

impl Default for ConcurrencyBudget {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrencyBudget {
    #[must_use]
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            counters: Arc::new(Counters {
                config,
                global: AtomicUsize::new(0),
                per_workflow: Mutex::new(HashMap::new()),
                per_user: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    /// The configured limits.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.counters.config
    }

    /// Takes one slot from every applicable limit, or none at all.
    #[must_use]
    pub fn try_acquire(
        &self,
        workflow_id: WorkflowId,
        user_id: Option<UserId>,
    ) -> Option<BudgetPermit> {
        let config = &self.counters.config;
        if !try_increment(&self.counters.global, config.global) {
            return None;
        }
        let workflow = counter_for(&self.counters.per_workflow, workflow_id);
        let user = user_id.map(|id| counter_for(&self.counters.per_user, id));
        if !try_increment(&workflow, config.per_workflow) {
            self.counters.global.fetch_sub(1, Ordering::AcqRel);
            release_counter(&self.counters.per_workflow, &workflow_id, workflow);
            if let (Some(id), Some(user)) = (user_id, user) {
                release_counter(&self.counters.per_user, &id, user);
            }
            return None;
        }
        if !user
            .as_ref()
            .is_none_or(|counter| try_increment(counter, config.per_user))
        {
            workflow.fetch_sub(1, Ordering::AcqRel);
            self.counters.global.fetch_sub(1, Ordering::AcqRel);
            release_counter(&self.counters.per_workflow, &workflow_id, workflow);
            if let (Some(id), Some(user)) = (user_id, user) {
                release_counter(&self.counters.per_user, &id, user);
            }
            return None;
        }

        Some(BudgetPermit {
            counters: Arc::clone(&self.counters),
            workflow: Some((workflow_id, workflow)),
            user: user_id.zip(user),
        })
    }

    /// Resolves on the next permit release.
    ///
    /// Call [`Notified::enable`] on the pinned future before retrying
    /// `try_acquire`, so a release in between is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.counters.released.notified()
    }

    /// Permits currently held engine-wide.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.counters.global.load(Ordering::Acquire)
    }

    /// Permits currently held by one workflow.
    #[must_use]
    pub fn in_use_by_workflow(&self, workflow_id: WorkflowId) -> usize {
        self.counters
            .per_workflow
            .lock()
            .ok()
            .and_then(|map| map.get(&workflow_id).map(|c| c.load(Ordering::Acquire)))
            .unwrap_or(0)
    }
}

type CounterMap<K> = Mutex<HashMap<K, Arc<AtomicUsize>>>;

fn counter_for<K: Hash + Eq>(map: &CounterMap<K>, key: K) -> Arc<AtomicUsize> {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(map.entry(key).or_default())
}

/// Gives back a handle from [`counter_for`], removing the entry once no
/// other handle exists. Handles are only cloned under the map lock, so the
/// count seen here cannot grow behind our back.
fn release_counter<K: Hash + Eq>(map: &CounterMap<K>, key: &K, counter: Arc<AtomicUsize>) {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    drop(counter);
    if map
        .get(key)
        .is_some_and(|c| Arc::strong_count(c) == 1 && c.load(Ordering::Acquire) == 0)
    {
        map.remove(key);
    }
}

fn try_increment(counter: &AtomicUsize, limit: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (limit == 0 || current < limit).then_some(current + 1)
        })
        .is_ok()
}

/// One dispatch slot. Released on drop.
#[derive(Debug)]
pub struct BudgetPermit {
    counters: Arc<Counters>,
    // Options only so `drop` can move the handles out.
    workflow: Option<(WorkflowId, Arc<AtomicUsize>)>,
    user: Option<(UserId, Arc<AtomicUsize>)>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        if let Some((id, user)) = self.user.take() {
            user.fetch_sub(1, Ordering::AcqRel);
            release_counter(&self.counters.per_user, &id, user);
        }
        if let Some((id, workflow)) = self.workflow.take() {
            workflow.fetch_sub(1, Ordering::AcqRel);
            release_counter(&self.counters.per_workflow, &id, workflow);
        }
        self.counters.global.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.notify_waiters();
    }
}
