//! Workflow instance controller: runs the instances this runner owns.
//!
//! # Execution flow
//!
//! 1. Open a watch on instances, then list the existing ones.
//! 2. Claim every non-terminal instance no other runner holds. Claiming a
//!    `Pending` instance initializes it.
//! 3. Advance owned instances by status: deploy and start initialized ones,
//!    pick up awakening ones, and spawn a `WorkflowRuntime` for `Executing`
//!    ones. `Waiting` instances get a timer that awakes them at their
//!    earliest deadline; `Suspended` ones stay idle until resumed, or until
//!    the workflow timeout times them out.
//! 4. A runtime failing with a retryable error is restarted on a fresh read,
//!    a bounded number of times.
//! 5. On shutdown: stop the loop and timers, interrupt every runtime (the
//!    instances stay `Executing`) and release every owned instance.
//!
//! Watch events only trigger reconciliation; every decision is taken on a
//! fresh read of the instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use synapse_types::activity::{metadata_keys, ActivityKind};
use synapse_types::config::RunnerConfig;
use synapse_types::error::{RepositoryError, TransitionError, WorkflowError};
use synapse_types::instance::{WorkflowInstance, WorkflowInstanceStatusType};
use synapse_types::resource::{labels, LabelSelector, Resource, WatchEvent};
use synapse_types::workflow::{Workflow, WorkflowDefinition};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::repository::{ResourcePatch, ResourceRepository};
use crate::runtime::{ExecutionHandle, RuntimeServices, WorkflowRuntime};

use super::claim::{try_claim, try_release, Claimable};
use super::ControllerError;

/// Restarts granted to a runtime failing with retryable errors.
pub const MAX_RESTARTS: u32 = 3;

const RESTART_BASE_DELAY: Duration = Duration::from_millis(200);

/// Attempts for user-requested transitions racing with the runtime.
const MAX_TRANSITION_ATTEMPTS: usize = 5;

struct RunningInstance {
    handle: ExecutionHandle,
    generation: u64,
}

/// (name, namespace) of an instance to look at again.
type Recheck = (String, String);

pub struct WorkflowInstanceController<R: ResourceRepository + 'static> {
    repo: Arc<R>,
    services: RuntimeServices,
    /// Qualified name stamped into the owner label.
    owner: String,
    /// Worker reference recorded on deployed instances.
    worker: String,
    runtimes: DashMap<String, RunningInstance>,
    timers: DashMap<String, JoinHandle<()>>,
    generation: AtomicU64,
    recheck_tx: mpsc::UnboundedSender<Recheck>,
    recheck_rx: Mutex<Option<mpsc::UnboundedReceiver<Recheck>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ResourceRepository + 'static> WorkflowInstanceController<R> {
    pub fn new(repo: Arc<R>, services: RuntimeServices, config: &RunnerConfig) -> Arc<Self> {
        let (recheck_tx, recheck_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            repo,
            services,
            owner: config.qualified_name(),
            worker: config.worker_ref(),
            runtimes: DashMap::new(),
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            recheck_tx,
            recheck_rx: Mutex::new(Some(recheck_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a runtime is currently driving the instance.
    pub fn is_running(&self, qualified_name: &str) -> bool {
        self.runtimes.contains_key(qualified_name)
    }

    pub fn running_count(&self) -> usize {
        self.runtimes.len()
    }

    /// Reconcile existing instances and keep watching for changes.
    pub async fn start(self: &Arc<Self>) -> Result<(), ControllerError> {
        let mut slot = self.task.lock().await;
        let Some(mut rechecks) = self.recheck_rx.lock().await.take() else {
            return Err(ControllerError::AlreadyStarted);
        };

        let mut changes = self.repo.watch::<WorkflowInstance>(None).await?;
        let existing: Vec<WorkflowInstance> = self.repo.list(None, &[]).await?;
        for instance in &existing {
            self.reconcile(instance.name(), instance.namespace()).await;
        }

        let controller = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = controller.cancel.cancelled() => break,
                    Some((name, namespace)) = rechecks.recv() => {
                        controller.reconcile(&name, &namespace).await;
                    }
                    change = changes.next() => match change {
                        Some(WatchEvent::Deleted(instance)) => controller.forget(&instance.qualified_name()),
                        Some(WatchEvent::Added(instance) | WatchEvent::Modified(instance)) => {
                            controller.reconcile(instance.name(), instance.namespace()).await;
                        }
                        None => {
                            tracing::warn!(runner = controller.owner.as_str(), "instance watch ended");
                            break;
                        }
                    },
                }
            }
        }));
        tracing::info!(runner = self.owner.as_str(), running = self.runtimes.len(), "instance controller started");
        Ok(())
    }

    async fn reconcile(self: &Arc<Self>, name: &str, namespace: &str) {
        let qualified = format!("{name}.{namespace}");
        let instance = match self.repo.get::<WorkflowInstance>(name, namespace).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                self.forget(&qualified);
                return;
            }
            Err(e) => {
                tracing::warn!(instance = qualified.as_str(), error = %e, "failed to read instance");
                return;
            }
        };
        if let Err(e) = self.advance(instance).await {
            tracing::warn!(instance = qualified.as_str(), error = %e, "failed to reconcile instance");
        }
    }

    /// Move an instance forward as far as this controller can.
    async fn advance(self: &Arc<Self>, instance: WorkflowInstance) -> Result<(), ControllerError> {
        let qualified = instance.qualified_name();
        if instance.status_type().is_terminal() {
            self.forget(&qualified);
            return Ok(());
        }
        if instance.owner().is_some_and(|owner| owner != self.owner) {
            return Ok(());
        }
        // Also finishes a claim whose activation lost a race.
        let Some(mut current) = try_claim(&*self.repo, &instance, &self.owner).await? else {
            return Ok(());
        };

        if !matches!(
            current.status_type(),
            WorkflowInstanceStatusType::Waiting | WorkflowInstanceStatusType::Suspended
        ) {
            self.cancel_timer(&qualified);
        }
        loop {
            let next = match current.status_type() {
                WorkflowInstanceStatusType::Initializing => {
                    let worker = self.worker.clone();
                    self.transition(&current, |i| {
                        i.deploy(worker)?;
                        i.start()
                    })
                    .await?
                }
                WorkflowInstanceStatusType::Deployed => self.transition(&current, |i| i.start()).await?,
                WorkflowInstanceStatusType::Awakening => {
                    let worker = self.worker.clone();
                    self.transition(&current, |i| {
                        i.mark_awakened(worker)?;
                        i.resume()
                    })
                    .await?
                }
                WorkflowInstanceStatusType::Awakened => self.transition(&current, |i| i.resume()).await?,
                WorkflowInstanceStatusType::Executing => {
                    if let Some(definition) = self.load_definition(&current).await? {
                        self.spawn_runtime(current, definition);
                    }
                    return Ok(());
                }
                WorkflowInstanceStatusType::Waiting => {
                    if let Some(definition) = self.load_definition(&current).await? {
                        self.schedule_wake(&current, &definition);
                    }
                    return Ok(());
                }
                WorkflowInstanceStatusType::Suspended => {
                    if let Some(definition) = self.load_definition(&current).await? {
                        self.schedule_timeout(&current, &definition);
                    }
                    return Ok(());
                }
                WorkflowInstanceStatusType::Pending => return Ok(()),
                _ => {
                    self.forget(&qualified);
                    return Ok(());
                }
            };
            // A conflict means someone else moved the instance; the watch
            // brings the newer version.
            match next {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
    }

    /// Apply `change` as a guarded patch. `None` on a version conflict.
    async fn transition<F>(
        &self,
        current: &WorkflowInstance,
        change: F,
    ) -> Result<Option<WorkflowInstance>, ControllerError>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<(), TransitionError>,
    {
        let mut next = current.clone();
        change(&mut next)?;
        let patch = ResourcePatch::diff(current, &next)?;
        match self
            .repo
            .patch::<WorkflowInstance>(current.name(), current.namespace(), &patch)
            .await
        {
            Ok(stored) => {
                tracing::info!(
                    instance = %stored.qualified_name(),
                    from = current.status_type().as_str(),
                    to = stored.status_type().as_str(),
                    "instance transitioned"
                );
                Ok(Some(stored))
            }
            Err(RepositoryError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Definition the instance runs, faulting the instance when it is gone.
    async fn load_definition(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Option<Arc<WorkflowDefinition>>, ControllerError> {
        let reference = &instance.spec.definition;
        let definition = self
            .repo
            .get::<Workflow>(&reference.name, &reference.namespace)
            .await?
            .and_then(|workflow| workflow.resolve(Some(&reference.version)).cloned());
        if let Some(definition) = definition {
            return Ok(Some(Arc::new(definition)));
        }

        let error = WorkflowError::new(WorkflowError::VALIDATION, "workflow definition not found").with_detail(format!(
            "{}.{} version {}",
            reference.name, reference.namespace, reference.version
        ));
        tracing::error!(instance = %instance.qualified_name(), error = %error, "cannot run instance");
        self.transition(instance, |i| i.fault(error)).await?;
        Ok(None)
    }

    fn spawn_runtime(self: &Arc<Self>, instance: WorkflowInstance, definition: Arc<WorkflowDefinition>) {
        let key = instance.qualified_name();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = ExecutionHandle::new();
        match self.runtimes.entry(key.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(RunningInstance {
                    handle: handle.clone(),
                    generation,
                });
            }
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let name = instance.name().to_string();
            let namespace = instance.namespace().to_string();
            let mut instance = instance;
            let mut restarts = 0;
            loop {
                let runtime = WorkflowRuntime::new(
                    Arc::clone(&controller.repo),
                    instance,
                    Arc::clone(&definition),
                    controller.services.clone(),
                )
                .with_handle(handle.clone());
                match runtime.run().await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() && restarts < MAX_RESTARTS && !handle.is_stopped() => {
                        restarts += 1;
                        let delay = RESTART_BASE_DELAY * 2u32.pow(restarts - 1);
                        tracing::warn!(
                            instance = key.as_str(),
                            error = %e,
                            restarts,
                            delay_ms = delay.as_millis() as u64,
                            "restarting workflow runtime"
                        );
                        tokio::time::sleep(delay).await;
                        match controller.repo.get::<WorkflowInstance>(&name, &namespace).await {
                            Ok(Some(fresh)) if fresh.status_type() == WorkflowInstanceStatusType::Executing => {
                                instance = fresh;
                            }
                            _ => break,
                        }
                    }
                    Err(e) => {
                        tracing::error!(instance = key.as_str(), error = %e, "workflow runtime aborted");
                        break;
                    }
                }
            }
            controller
                .runtimes
                .remove_if(&key, |_, running| running.generation == generation);
            // Changes that landed while the runtime was settling were skipped
            // by the occupied slot.
            if !controller.cancel.is_cancelled() {
                let _ = controller.recheck_tx.send((name, namespace));
            }
        });
    }

    /// Awake a waiting instance at its earliest deadline, if it has one.
    fn schedule_wake(self: &Arc<Self>, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        let deadline = wake_deadline(instance, definition);
        self.schedule_timer(instance, deadline, WorkflowInstanceStatusType::Waiting, |i| i.awake());
    }

    /// Time out a suspended instance when the workflow timeout elapses.
    fn schedule_timeout(self: &Arc<Self>, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        let deadline = timeout_deadline(instance, definition);
        self.schedule_timer(instance, deadline, WorkflowInstanceStatusType::Suspended, |i| {
            cancel_open_activities(i)?;
            i.time_out()
        });
    }

    /// Apply `change` at `deadline` if the instance is still in `status`.
    fn schedule_timer<F>(
        self: &Arc<Self>,
        instance: &WorkflowInstance,
        deadline: Option<DateTime<Utc>>,
        status: WorkflowInstanceStatusType,
        change: F,
    ) where
        F: FnOnce(&mut WorkflowInstance) -> Result<(), TransitionError> + Send + 'static,
    {
        let key = instance.qualified_name();
        self.cancel_timer(&key);
        let Some(deadline) = deadline else {
            return;
        };

        let repo = Arc::clone(&self.repo);
        let name = instance.name().to_string();
        let namespace = instance.namespace().to_string();
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(
            instance = key.as_str(),
            status = status.as_str(),
            deadline = %deadline.to_rfc3339(),
            "deadline timer scheduled"
        );
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let current = match repo.get::<WorkflowInstance>(&name, &namespace).await {
                Ok(Some(current)) if current.status_type() == status => current,
                _ => return,
            };
            let mut next = current.clone();
            if change(&mut next).is_err() {
                return;
            }
            let patch = match ResourcePatch::diff(&current, &next) {
                Ok(patch) => patch,
                Err(_) => return,
            };
            match repo.patch::<WorkflowInstance>(&name, &namespace, &patch).await {
                Ok(stored) => tracing::info!(
                    instance = %format!("{name}.{namespace}"),
                    from = status.as_str(),
                    to = stored.status_type().as_str(),
                    "instance reached its deadline"
                ),
                Err(e) => tracing::debug!(instance = %format!("{name}.{namespace}"), error = %e, "deadline timer skipped"),
            }
        });
        self.timers.insert(key, timer);
    }

    fn cancel_timer(&self, key: &str) {
        if let Some((_, timer)) = self.timers.remove(key) {
            timer.abort();
        }
    }

    fn forget(&self, key: &str) {
        self.cancel_timer(key);
        // The runtime removes its own entry when it returns.
    }

    // -----------------------------------------------------------------------
    // Control requests
    // -----------------------------------------------------------------------

    /// Suspend an executing instance.
    pub async fn suspend(&self, name: &str, namespace: &str) -> Result<(), ControllerError> {
        if let Some(running) = self.runtimes.get(&format!("{name}.{namespace}")) {
            running.handle.suspend();
            return Ok(());
        }
        self.request(name, namespace, |i| i.suspend()).await
    }

    /// Resume a suspended instance; the controller picks it up from there.
    pub async fn resume(&self, name: &str, namespace: &str) -> Result<(), ControllerError> {
        self.request(name, namespace, |i| i.resume()).await
    }

    /// Terminate an instance, cancelling its open activities.
    pub async fn terminate(&self, name: &str, namespace: &str) -> Result<(), ControllerError> {
        if let Some(running) = self.runtimes.get(&format!("{name}.{namespace}")) {
            running.handle.terminate();
            return Ok(());
        }
        self.request(name, namespace, |i| {
            cancel_open_activities(i)?;
            i.terminate()
        })
        .await
    }

    async fn request<F>(&self, name: &str, namespace: &str, change: F) -> Result<(), ControllerError>
    where
        F: Fn(&mut WorkflowInstance) -> Result<(), TransitionError>,
    {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self
                .repo
                .get::<WorkflowInstance>(name, namespace)
                .await?
                .ok_or_else(|| ControllerError::NotFound {
                    kind: "WorkflowInstance",
                    name: format!("{name}.{namespace}"),
                })?;
            if self.transition(&current, &change).await?.is_some() {
                return Ok(());
            }
        }
        Err(ControllerError::Repository(RepositoryError::Conflict {
            kind: "WorkflowInstance".to_string(),
            name: format!("{name}.{namespace}"),
            expected: 0,
            actual: 0,
        }))
    }

    /// Stop every runtime and release every owned instance.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(runner = self.owner.as_str(), error = %e, "instance controller loop panicked");
            }
        }
        for timer in self.timers.iter() {
            timer.value().abort();
        }
        self.timers.clear();
        for running in self.runtimes.iter() {
            running.value().handle.shutdown();
        }
        for _ in 0..100 {
            if self.runtimes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.runtimes.is_empty() {
            tracing::warn!(runner = self.owner.as_str(), running = self.runtimes.len(), "runtimes still stopping");
        }

        let owned: Vec<WorkflowInstance> = self
            .repo
            .list(None, &[LabelSelector::equals(labels::RUNNER, self.owner.clone())])
            .await?;
        let mut released = 0;
        for instance in &owned {
            match try_release(&*self.repo, instance, &self.owner).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    instance = %instance.qualified_name(),
                    error = %e,
                    "failed to release instance"
                ),
            }
        }
        tracing::info!(runner = self.owner.as_str(), released, "instance controller stopped");
        Ok(())
    }
}

impl<R: ResourceRepository + 'static> std::fmt::Debug for WorkflowInstanceController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstanceController")
            .field("owner", &self.owner)
            .field("running", &self.runtimes.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

fn cancel_open_activities(instance: &mut WorkflowInstance) -> Result<(), TransitionError> {
    for activity in instance.status.activities.iter_mut() {
        if !activity.status.is_terminal() {
            activity.cancel()?;
        }
    }
    Ok(())
}

/// When the workflow timeout elapses for a started instance.
fn timeout_deadline(instance: &WorkflowInstance, definition: &WorkflowDefinition) -> Option<DateTime<Utc>> {
    definition
        .timeout_secs
        .zip(instance.status.started_at)
        .and_then(|(secs, started_at)| {
            started_at.checked_add_signed(chrono::Duration::seconds(secs.min(u32::MAX as u64) as i64))
        })
}

/// Earliest of the instance timeout and the deadlines of open listens.
fn wake_deadline(instance: &WorkflowInstance, definition: &WorkflowDefinition) -> Option<DateTime<Utc>> {
    let timeout = timeout_deadline(instance, definition);
    let listens = instance
        .status
        .activities
        .iter()
        .filter(|a| a.kind == ActivityKind::Listen && !a.status.is_terminal())
        .filter_map(|a| a.meta(metadata_keys::DEADLINE))
        .filter_map(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));
    timeout.into_iter().chain(listens).min()
}
