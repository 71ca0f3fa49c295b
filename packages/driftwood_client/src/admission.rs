//! Request admission: per-endpoint concurrency budgets with FIFO queueing.
//!
//! Every outbound request is wrapped in [`AdmissionController::admit`]
//! before the network call is issued. At most `limit` operations per
//! endpoint category run at once; the rest queue in arrival order. When a
//! task settles, the next queued task is started synchronously, before the
//! settling task's outcome is delivered, so a failing or cancelled task can
//! never starve the queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Endpoint categories with independent concurrency budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// Folder listings and gallery metadata.
    Folders,
    /// Thumbnail fetches.
    Thumb,
    /// Full-size file fetches.
    File,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Folders, Endpoint::Thumb, Endpoint::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Folders => "folders",
            Endpoint::Thumb => "thumb",
            Endpoint::File => "file",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-endpoint concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub folders: usize,
    pub thumb: usize,
    pub file: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            folders: 2,
            thumb: 6,
            file: 3,
        }
    }
}

impl AdmissionLimits {
    fn limit(&self, endpoint: Endpoint) -> usize {
        match endpoint {
            Endpoint::Folders => self.folders,
            Endpoint::Thumb => self.thumb,
            Endpoint::File => self.file,
        }
    }
}

/// How an admitted task finishes when it does not fulfil.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Cancelled by the caller (or a bulk cancel). Distinguishable from an
    /// operation failure so callers can treat it as "silently cancelled".
    #[error("operation aborted")]
    Aborted,
    /// The operation itself failed, including synchronous construction
    /// failure in the factory.
    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

impl AdmissionError {
    pub fn is_abort(&self) -> bool {
        matches!(self, AdmissionError::Aborted)
    }
}

type Outcome<T> = Result<T, AdmissionError>;

/// One cancellable operation produced by an admission factory: the future
/// that performs the work, plus an optional hook invoked when the task is
/// cancelled while in flight.
pub struct TaskOperation<T> {
    future: BoxFuture<'static, anyhow::Result<T>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> TaskOperation<T> {
    pub fn new(future: impl Future<Output = anyhow::Result<T>> + Send + 'static) -> Self {
        Self {
            future: Box::pin(future),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.cancel = Some(Box::new(hook));
        self
    }
}

enum QueueVerdict {
    Start,
    Abort,
}

type Launch = Box<dyn FnOnce(QueueVerdict) + Send>;

struct InflightEntry {
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
    abort: CancellationToken,
}

struct QueuedEntry {
    id: u64,
    abort: CancellationToken,
    launch: Launch,
}

struct CategoryState {
    limit: usize,
    inflight: HashMap<u64, InflightEntry>,
    queued: VecDeque<QueuedEntry>,
    peak_inflight: usize,
}

impl CategoryState {
    fn fresh(limit: usize) -> Self {
        Self {
            limit,
            inflight: HashMap::new(),
            queued: VecDeque::new(),
            peak_inflight: 0,
        }
    }
}

struct ControllerState {
    folders: CategoryState,
    thumb: CategoryState,
    file: CategoryState,
    next_task_id: u64,
}

impl ControllerState {
    fn fresh(limits: &AdmissionLimits, next_task_id: u64) -> Self {
        Self {
            folders: CategoryState::fresh(limits.folders),
            thumb: CategoryState::fresh(limits.thumb),
            file: CategoryState::fresh(limits.file),
            next_task_id,
        }
    }

    fn category_mut(&mut self, endpoint: Endpoint) -> &mut CategoryState {
        match endpoint {
            Endpoint::Folders => &mut self.folders,
            Endpoint::Thumb => &mut self.thumb,
            Endpoint::File => &mut self.file,
        }
    }

    fn category(&self, endpoint: Endpoint) -> &CategoryState {
        match endpoint {
            Endpoint::Folders => &self.folders,
            Endpoint::Thumb => &self.thumb,
            Endpoint::File => &self.file,
        }
    }
}

struct Inner {
    defaults: AdmissionLimits,
    state: Mutex<ControllerState>,
}

fn lock(inner: &Inner) -> MutexGuard<'_, ControllerState> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gates outbound requests so that no more than a fixed number per endpoint
/// category are in flight at once. Cloning shares the same budgets.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

/// Awaitable side of an admitted (or queued) task.
pub struct AdmissionTicket<T> {
    outcome: oneshot::Receiver<Outcome<T>>,
    handle: TaskHandle,
}

impl<T> AdmissionTicket<T> {
    /// A cloneable handle for cancelling this task.
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Wait for the task's single terminal outcome.
    pub async fn outcome(self) -> Outcome<T> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(AdmissionError::Aborted))
    }
}

/// Cancel handle for one admitted or queued task. Cancelling a settled task
/// is a no-op.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Weak<Inner>,
    endpoint: Endpoint,
    id: u64,
}

impl TaskHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            cancel_task(&inner, self.endpoint, self.id);
        }
    }
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                defaults: limits,
                state: Mutex::new(ControllerState::fresh(&limits, 0)),
            }),
        }
    }

    /// Admit an operation against the endpoint's budget.
    ///
    /// When a slot is free the factory is invoked immediately; otherwise the
    /// task queues in arrival order and the factory runs once a slot opens.
    /// Must be called from within a tokio runtime.
    pub fn admit<T, F>(&self, endpoint: Endpoint, factory: F) -> AdmissionTicket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<TaskOperation<T>> + Send + 'static,
    {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let abort = CancellationToken::new();

        let mut state = lock(&self.inner);
        state.next_task_id += 1;
        let id = state.next_task_id;
        let category = state.category_mut(endpoint);

        if category.inflight.len() < category.limit {
            reserve(category, id, abort.clone());
            drop(state);
            run_admitted(self.inner.clone(), endpoint, id, factory, outcome_tx, abort);
        } else {
            debug!(endpoint = %endpoint, task = id, "budget full, queueing");
            let weak = Arc::downgrade(&self.inner);
            let launch_abort = abort.clone();
            category.queued.push_back(QueuedEntry {
                id,
                abort,
                launch: Box::new(move |verdict| match verdict {
                    QueueVerdict::Start => match weak.upgrade() {
                        Some(inner) => {
                            run_admitted(inner, endpoint, id, factory, outcome_tx, launch_abort);
                        }
                        None => {
                            let _ = outcome_tx.send(Err(AdmissionError::Aborted));
                        }
                    },
                    QueueVerdict::Abort => {
                        let _ = outcome_tx.send(Err(AdmissionError::Aborted));
                    }
                }),
            });
        }

        AdmissionTicket {
            outcome: outcome_rx,
            handle: TaskHandle {
                inner: Arc::downgrade(&self.inner),
                endpoint,
                id,
            },
        }
    }

    /// Cancel every in-flight task and reject every queued task for the
    /// named endpoints (pass [`Endpoint::ALL`] for a full sweep). Counts
    /// return to zero; peaks are untouched.
    pub fn cancel_all(&self, endpoints: &[Endpoint]) {
        for &endpoint in endpoints {
            let (inflight, queued) = {
                let mut state = lock(&self.inner);
                let category = state.category_mut(endpoint);
                (
                    category.inflight.drain().collect::<Vec<_>>(),
                    category.queued.drain(..).collect::<Vec<_>>(),
                )
            };
            for (_, entry) in inflight {
                if let Some(hook) = entry.cancel_hook {
                    hook();
                }
                entry.abort.cancel();
            }
            for entry in queued {
                (entry.launch)(QueueVerdict::Abort);
            }
        }
    }

    /// Read-only view of every endpoint's budget.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = lock(&self.inner);
        BudgetSnapshot {
            taken_at: Utc::now(),
            endpoints: Endpoint::ALL
                .iter()
                .map(|&endpoint| {
                    let category = state.category(endpoint);
                    EndpointSnapshot {
                        endpoint,
                        limit: category.limit,
                        inflight: category.inflight.len(),
                        queued: category.queued.len(),
                        peak_inflight: category.peak_inflight,
                    }
                })
                .collect(),
        }
    }

    /// Restore the configured defaults and clear all counts, peaks
    /// included. Outstanding tasks are cancelled first so no settlement can
    /// touch the fresh state.
    pub fn reset_for_tests(&self) {
        self.cancel_all(&Endpoint::ALL);
        let mut state = lock(&self.inner);
        let next_task_id = state.next_task_id;
        *state = ControllerState::fresh(&self.inner.defaults, next_task_id);
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionLimits::default())
    }
}

/// Budget snapshot for one endpoint category.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: Endpoint,
    pub limit: usize,
    pub inflight: usize,
    pub queued: usize,
    pub peak_inflight: usize,
}

/// Point-in-time view of all budgets.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub endpoints: Vec<EndpointSnapshot>,
}

impl BudgetSnapshot {
    pub fn endpoint(&self, endpoint: Endpoint) -> &EndpointSnapshot {
        // Endpoint::ALL covers every variant, so the entry always exists.
        self.endpoints
            .iter()
            .find(|snapshot| snapshot.endpoint == endpoint)
            .unwrap_or_else(|| unreachable!("snapshot covers all endpoints"))
    }
}

fn reserve(category: &mut CategoryState, id: u64, abort: CancellationToken) {
    category.inflight.insert(
        id,
        InflightEntry {
            cancel_hook: None,
            abort,
        },
    );
    category.peak_inflight = category.peak_inflight.max(category.inflight.len());
}

/// Start the next queued entry if a slot is open. The returned launch must
/// be invoked after the state lock is released.
fn pop_startable(category: &mut CategoryState) -> Option<Launch> {
    if category.inflight.len() >= category.limit {
        return None;
    }
    let entry = category.queued.pop_front()?;
    reserve(category, entry.id, entry.abort);
    Some(entry.launch)
}

/// Release a settled task's slot and synchronously start the next queued
/// task. Returns false when the task had already been cancelled out.
fn release_and_drain(inner: &Arc<Inner>, endpoint: Endpoint, id: u64) -> bool {
    let next = {
        let mut state = lock(inner);
        let category = state.category_mut(endpoint);
        if category.inflight.remove(&id).is_none() {
            return false;
        }
        pop_startable(category)
    };
    if let Some(launch) = next {
        launch(QueueVerdict::Start);
    }
    true
}

/// Run a task whose slot is already reserved: invoke the factory, install
/// the cancel hook, and drive the operation to its single terminal outcome.
fn run_admitted<T, F>(
    inner: Arc<Inner>,
    endpoint: Endpoint,
    id: u64,
    factory: F,
    outcome: oneshot::Sender<Outcome<T>>,
    abort: CancellationToken,
) where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<TaskOperation<T>>,
{
    let operation = match factory() {
        Ok(operation) => operation,
        Err(err) => {
            // Construction failure is an ordinary task failure: the slot is
            // released and the queue drained before the failure propagates.
            release_and_drain(&inner, endpoint, id);
            let _ = outcome.send(Err(AdmissionError::Task(err)));
            return;
        }
    };

    let TaskOperation { future, cancel } = operation;
    let installed = {
        let mut state = lock(&inner);
        match state.category_mut(endpoint).inflight.get_mut(&id) {
            Some(entry) => {
                entry.cancel_hook = cancel;
                true
            }
            None => false,
        }
    };
    if !installed {
        // Cancelled between reservation and start.
        let _ = outcome.send(Err(AdmissionError::Aborted));
        return;
    }

    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                let _ = outcome.send(Err(AdmissionError::Aborted));
            }
            result = future => {
                let settled = release_and_drain(&inner, endpoint, id);
                let _ = outcome.send(if settled {
                    result.map_err(AdmissionError::Task)
                } else {
                    Err(AdmissionError::Aborted)
                });
            }
        }
    });
}

fn cancel_task(inner: &Arc<Inner>, endpoint: Endpoint, id: u64) {
    enum Target {
        Inflight {
            hook: Option<Box<dyn FnOnce() + Send>>,
            abort: CancellationToken,
            next: Option<Launch>,
        },
        Queued(Launch),
    }

    let target = {
        let mut state = lock(inner);
        let category = state.category_mut(endpoint);
        if let Some(entry) = category.inflight.remove(&id) {
            let next = pop_startable(category);
            Some(Target::Inflight {
                hook: entry.cancel_hook,
                abort: entry.abort,
                next,
            })
        } else if let Some(position) = category.queued.iter().position(|entry| entry.id == id) {
            category
                .queued
                .remove(position)
                .map(|entry| Target::Queued(entry.launch))
        } else {
            // Already settled or cancelled: no-op.
            None
        }
    };

    match target {
        Some(Target::Inflight { hook, abort, next }) => {
            if let Some(hook) = hook {
                hook();
            }
            abort.cancel();
            if let Some(launch) = next {
                launch(QueueVerdict::Start);
            }
        }
        // A queued task never occupied a slot, so there is nothing to drain.
        Some(Target::Queued(launch)) => launch(QueueVerdict::Abort),
        None => {}
    }
}
