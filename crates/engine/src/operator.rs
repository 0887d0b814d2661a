//! Apply/preview operator: executes a change order over the resource
//! DAG through runtime drivers and persists the resulting state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::models::{
    build_change_order, ActionType, ChangeOrder, Message, MessageStatus, Request,
};
use kusion_core::{Error, Intent, Resource, Result, State};
use kusion_runtime::{noop_runtimes, Runtime, RuntimeMap};
use kusion_state::StateStorage;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);
/// Message channel capacity per worker; producers block on backpressure.
pub const MSG_CAPACITY_PER_WORKER: usize = 5;

const EMPTY_INTENT_MSG: &str = "request.Intent is empty; use destroy to delete all";

#[derive(Debug)]
pub struct ApplyResponse {
    pub state: State,
}

#[derive(Debug)]
pub struct PreviewResponse {
    pub order: ChangeOrder,
}

/// Requests cancellation: no new steps are scheduled, in-flight steps
/// finish and their effects are recorded before the operator returns.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Drives one preview or apply operation. The runtime map is read-only
/// for the duration; result-state mutation and the final store write are
/// serialised behind single locks.
pub struct Operator {
    state_storage: Arc<dyn StateStorage>,
    runtimes: RuntimeMap,
    workers: usize,
    step_timeout: Duration,
    cancel: Arc<AtomicBool>,
    msg_tx: StdMutex<Option<mpsc::Sender<Message>>>,
    write_lock: Mutex<()>,
}

enum StepEffect {
    Put(Resource),
    Remove(String),
    None,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Skipped,
    Failed,
}

struct ExecutionReport {
    resources: BTreeMap<String, Resource>,
    failed: BTreeMap<String, Error>,
    cancelled: bool,
}

impl Operator {
    pub fn new(state_storage: Arc<dyn StateStorage>, runtimes: RuntimeMap) -> Self {
        Operator {
            state_storage,
            runtimes,
            workers: DEFAULT_WORKERS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            cancel: Arc::new(AtomicBool::new(false)),
            msg_tx: StdMutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Open the bounded progress channel for this operation. Call before
    /// `apply`/`preview` and drain concurrently: producers block once
    /// the buffer fills.
    pub fn subscribe(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(MSG_CAPACITY_PER_WORKER * self.workers);
        *self.msg_tx.lock().unwrap() = Some(tx);
        rx
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Execute the change order computed from prior state and the
    /// requested intent, then persist the resulting state with the next
    /// serial.
    pub async fn apply(&self, request: &Request) -> Result<ApplyResponse> {
        let t0 = std::time::Instant::now();
        let intent = validate_request(request)?;
        let prior = self.load_prior(request)?;
        let order = build_change_order(&prior.resources, &intent.resources)?;
        reject_undefined(&order, intent, &prior)?;

        let report = self
            .execute(&order, intent, &prior, self.runtimes.clone())
            .await?;
        if report.cancelled {
            return Err(Error::Cancelled);
        }

        let mut state = State::new(
            &request.project,
            &request.stack,
            &request.workspace,
            &request.operator,
        );
        state.tenant = request.tenant.clone();
        state.serial = prior.serial + 1;
        state.id = state.serial;
        state.version = if prior.version == 0 { 1 } else { prior.version };
        state.created_at = Some(Utc::now());
        state.resources = report.resources.into_values().collect();

        {
            let _guard = self.write_lock.lock().await;
            self.state_storage.put(&state)?;
        }
        histogram!("operation_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);

        if let Some((id, err)) = report.failed.into_iter().next() {
            warn!(id = %id, "apply finished with failed steps");
            return Err(err);
        }
        counter!("operation_apply_ok", 1u64);
        Ok(ApplyResponse { state })
    }

    /// Run the identical pipeline with no-op runtimes and return the
    /// synthesized change order. Undefined steps are surfaced in the
    /// order but never executed.
    pub async fn preview(&self, request: &Request) -> Result<PreviewResponse> {
        let intent = validate_request(request)?;
        let prior = self.load_prior(request)?;
        let order = build_change_order(&prior.resources, &intent.resources)?;
        let runtimes = noop_runtimes(intent.resources.iter().chain(prior.resources.iter()));
        let report = self.execute(&order, intent, &prior, runtimes).await?;
        if report.cancelled {
            return Err(Error::Cancelled);
        }
        counter!("operation_preview_ok", 1u64);
        Ok(PreviewResponse { order })
    }

    fn load_prior(&self, request: &Request) -> Result<State> {
        Ok(self
            .state_storage
            .get(&request.project, &request.stack, &request.workspace)?
            .unwrap_or_default())
    }

    fn message_sender(&self) -> mpsc::Sender<Message> {
        if let Some(tx) = self.msg_tx.lock().unwrap().take() {
            return tx;
        }
        // Nobody subscribed: sends fail immediately and are ignored.
        let (tx, _rx) = mpsc::channel(1);
        tx
    }

    async fn execute(
        &self,
        order: &ChangeOrder,
        intent: &Intent,
        prior: &State,
        runtimes: RuntimeMap,
    ) -> Result<ExecutionReport> {
        let desired: FxHashMap<String, Resource> = intent
            .resources
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        let prior_index: FxHashMap<String, Resource> = prior
            .resources
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        let deps: BTreeMap<String, Vec<String>> = order
            .change_steps
            .iter()
            .map(|(id, _)| {
                let targets = desired
                    .get(id)
                    .or_else(|| prior_index.get(id))
                    .map(|r| {
                        r.depends_on
                            .iter()
                            .filter(|d| order.change_steps.contains_key(*d))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (id.clone(), targets)
            })
            .collect();
        let crate::graph::DepGraph {
            mut indegree,
            dependents,
        } = crate::graph::build_graph(&order.change_steps, &deps);

        // Result state starts from the prior snapshot; steps mutate it
        // behind one mutex as they succeed.
        let result: Arc<Mutex<BTreeMap<String, Resource>>> = Arc::new(Mutex::new(
            prior
                .resources
                .iter()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
        ));

        let msg_tx = self.message_sender();
        let mut ready: BTreeSet<String> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut failed: BTreeMap<String, Error> = BTreeMap::new();
        let mut running: JoinSet<(String, Result<()>)> = JoinSet::new();

        loop {
            while running.len() < self.workers && !self.cancel.load(Ordering::SeqCst) {
                let Some(id) = ready.iter().next().cloned() else {
                    break;
                };
                ready.remove(&id);
                let Some(step) = order.change_steps.get(&id) else {
                    continue;
                };
                match step.action {
                    ActionType::Undefined => {
                        // Diagnostic only; never executed.
                        outcomes.insert(id.clone(), Outcome::Success);
                        complete_node(&id, &dependents, &mut indegree, &outcomes, &mut ready);
                        continue;
                    }
                    ActionType::UnChanged => {
                        send(&msg_tx, &id, step.action, MessageStatus::Start, None).await;
                        send(&msg_tx, &id, step.action, MessageStatus::Success, None).await;
                        outcomes.insert(id.clone(), Outcome::Success);
                        complete_node(&id, &dependents, &mut indegree, &outcomes, &mut ready);
                        continue;
                    }
                    _ => {}
                }

                let resource = step
                    .to
                    .as_ref()
                    .or(step.from.as_ref())
                    .ok_or_else(|| Error::InvalidArgument(format!("empty change step {id}")))?;
                let runtime = runtimes
                    .get(&resource.resource_type)
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "no runtime for type {}",
                            resource.resource_type
                        ))
                    })?;

                send(&msg_tx, &id, step.action, MessageStatus::Start, None).await;
                debug!(id = %id, action = %step.action, "step started");
                let action = step.action;
                let desired_resource = desired.get(&id).cloned();
                let prior_resource = prior_index.get(&id).cloned();
                let timeout = self.step_timeout;
                let step_id = id.clone();
                let result_handle = Arc::clone(&result);
                running.spawn(async move {
                    let fut = run_step(action, runtime, desired_resource, prior_resource);
                    let outcome = match tokio::time::timeout(timeout, fut).await {
                        Ok(Ok(effect)) => {
                            let mut result = result_handle.lock().await;
                            match effect {
                                StepEffect::Put(resource) => {
                                    result.insert(resource.id.clone(), resource);
                                }
                                StepEffect::Remove(id) => {
                                    result.remove(&id);
                                }
                                StepEffect::None => {}
                            }
                            Ok(())
                        }
                        Ok(Err(e)) => Err(wrap_step_error(&step_id, e)),
                        Err(_) => Err(Error::Timeout {
                            id: step_id.clone(),
                        }),
                    };
                    (step_id, outcome)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, step_result) = joined.map_err(|e| Error::RuntimeFailure {
                id: String::new(),
                message: format!("step task failed: {e}"),
            })?;
            let action = order
                .change_steps
                .get(&id)
                .map(|s| s.action)
                .unwrap_or(ActionType::Undefined);
            match step_result {
                Ok(()) => {
                    counter!("operation_step_ok", 1u64);
                    send(&msg_tx, &id, action, MessageStatus::Success, None).await;
                    outcomes.insert(id.clone(), Outcome::Success);
                    complete_node(&id, &dependents, &mut indegree, &outcomes, &mut ready);
                }
                Err(e) => {
                    counter!("operation_step_err", 1u64);
                    warn!(id = %id, error = %e, "step failed");
                    send(&msg_tx, &id, action, MessageStatus::Failed, Some(e.to_string())).await;
                    outcomes.insert(id.clone(), Outcome::Failed);
                    failed.insert(id.clone(), e);
                    skip_descendants(&id, order, &dependents, &mut outcomes, &msg_tx).await;
                }
            }
        }

        let cancelled =
            self.cancel.load(Ordering::SeqCst) && outcomes.len() < order.change_steps.len();
        let resources = Arc::try_unwrap(result)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        Ok(ExecutionReport {
            resources,
            failed,
            cancelled,
        })
    }
}

fn validate_request(request: &Request) -> Result<&Intent> {
    match &request.intent {
        Some(intent) => Ok(intent),
        None => Err(Error::InvalidArgument(EMPTY_INTENT_MSG.to_string())),
    }
}

/// Apply rejects Undefined steps before any execution; preview tolerates
/// and surfaces them.
fn reject_undefined(order: &ChangeOrder, intent: &Intent, prior: &State) -> Result<()> {
    let known: BTreeSet<&str> = intent
        .resources
        .iter()
        .map(|r| r.id.as_str())
        .chain(prior.resources.iter().map(|r| r.id.as_str()))
        .collect();
    for id in &order.step_keys {
        let Some(step) = order.change_steps.get(id) else {
            continue;
        };
        if step.action != ActionType::Undefined {
            continue;
        }
        let missing = intent
            .resources
            .iter()
            .find(|r| &r.id == id)
            .and_then(|r| r.depends_on.iter().find(|d| !known.contains(d.as_str())))
            .cloned()
            .unwrap_or_default();
        return Err(Error::UnresolvedDependency {
            id: id.clone(),
            missing,
        });
    }
    Ok(())
}

async fn run_step(
    action: ActionType,
    runtime: Arc<dyn Runtime>,
    desired: Option<Resource>,
    prior: Option<Resource>,
) -> Result<StepEffect> {
    match action {
        ActionType::Create | ActionType::Update => {
            let plan = desired
                .ok_or_else(|| Error::InvalidArgument("change step has no plan".to_string()))?;
            let applied = runtime.apply(prior.as_ref(), &plan).await?;
            Ok(StepEffect::Put(applied))
        }
        ActionType::Delete => {
            let target = prior
                .ok_or_else(|| Error::InvalidArgument("delete step has no prior".to_string()))?;
            runtime.delete(&target).await?;
            Ok(StepEffect::Remove(target.id))
        }
        ActionType::UnChanged | ActionType::Undefined => Ok(StepEffect::None),
    }
}

fn wrap_step_error(id: &str, e: Error) -> Error {
    match e {
        Error::RuntimeFailure { .. } | Error::Timeout { .. } | Error::Cancelled => e,
        other => Error::RuntimeFailure {
            id: id.to_string(),
            message: other.to_string(),
        },
    }
}

fn complete_node(
    id: &str,
    dependents: &BTreeMap<String, Vec<String>>,
    indegree: &mut BTreeMap<String, usize>,
    outcomes: &BTreeMap<String, Outcome>,
    ready: &mut BTreeSet<String>,
) {
    let Some(next) = dependents.get(id) else {
        return;
    };
    for dependent in next {
        if let Some(count) = indegree.get_mut(dependent) {
            *count = count.saturating_sub(1);
            if *count == 0 && !outcomes.contains_key(dependent) {
                ready.insert(dependent.clone());
            }
        }
    }
}

/// A failed or timed-out step never aborts siblings; its descendants
/// become Skipped.
async fn skip_descendants(
    id: &str,
    order: &ChangeOrder,
    dependents: &BTreeMap<String, Vec<String>>,
    outcomes: &mut BTreeMap<String, Outcome>,
    msg_tx: &mpsc::Sender<Message>,
) {
    let mut stack: Vec<String> = dependents.get(id).cloned().unwrap_or_default();
    while let Some(next) = stack.pop() {
        if outcomes.contains_key(&next) {
            continue;
        }
        let action = order
            .change_steps
            .get(&next)
            .map(|s| s.action)
            .unwrap_or(ActionType::Undefined);
        send(msg_tx, &next, action, MessageStatus::Skipped, None).await;
        outcomes.insert(next.clone(), Outcome::Skipped);
        stack.extend(dependents.get(&next).cloned().unwrap_or_default());
    }
}

async fn send(
    tx: &mpsc::Sender<Message>,
    id: &str,
    action: ActionType,
    status: MessageStatus,
    detail: Option<String>,
) {
    let _ = tx
        .send(Message {
            resource_id: id.to_string(),
            action,
            status,
            detail,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_requires_intent() {
        let err = validate_request(&Request::default()).unwrap_err().to_string();
        assert!(err.contains(EMPTY_INTENT_MSG), "err={err}");

        let request = Request {
            intent: Some(Intent::default()),
            ..Default::default()
        };
        assert!(validate_request(&request).is_ok());
    }
}
