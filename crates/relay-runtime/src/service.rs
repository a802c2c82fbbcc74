use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use relay_protocol::{
    ActionId, ActionOutcome, ActionResponse, ActionState, ActionStoragePort, ClientError,
    ClientResult, ContextPort, EventBusPort, Priority, RenderPort, RequestEnvelope,
    ResponseEnvelope, StorageKey, StoredEntry, TransportPort, TransportRequest,
    TransportResponse,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::action::Action;
use crate::collector::{Collector, Stage};
use crate::config::{ClientExecution, ServiceConfig, StoredCompletion};
use crate::decode::{Decoded, decode};
use crate::dedup::DedupStore;
use crate::detached::spawn_detached;
use crate::events::{
    CONNECTION_LOST, CONNECTION_RESUMED, DONE_WAITING, REFRESH_BEGIN, REFRESH_END, WAITING,
};
use crate::pool::{IdleTask, SlotPool};
use crate::registry::ActionDefinitions;

/// Storage key of the server token. Bootstrap code outside the service reads
/// it directly, so it must never change.
pub const TOKEN_STORAGE_KEY: &str = "$ActionService.token$";

const NO_RESPONSE_MESSAGE: &str = "No response for action";
const UNFINISHED_RESPONSE_MESSAGE: &str = "Server returned a non-terminal action state";

#[derive(Clone)]
pub struct ServicePorts {
    pub storage: Option<Arc<dyn ActionStoragePort>>,
    pub transport: Arc<dyn TransportPort>,
    pub events: Arc<dyn EventBusPort>,
    pub renderer: Arc<dyn RenderPort>,
    pub context: Arc<dyn ContextPort>,
    pub definitions: Arc<dyn ActionDefinitions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Collecting,
    Flushing,
    Completing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub phase: LoopPhase,
    pub queued: usize,
    pub deferred: usize,
    pub in_flight: usize,
    pub available_slots: usize,
    pub dedup_entries: usize,
    pub connected: bool,
}

struct ServiceState {
    queued: Vec<Action>,
    deferred: Vec<Action>,
    collector: Option<Collector>,
    next_generation: u64,
    reprocess: bool,
    process_scheduled: bool,
    pool: SlotPool,
    dedup: DedupStore,
    token: Option<String>,
    last_send: Instant,
    connected: bool,
    request_timeout: Option<Duration>,
    persisted_filter: Option<HashSet<String>>,
}

impl ServiceState {
    fn collector_mut(&mut self, generation: u64) -> ClientResult<&mut Collector> {
        self.collector
            .as_mut()
            .filter(|collector| collector.generation == generation)
            .ok_or_else(|| {
                ClientError::JoinMismatch(format!("pass {generation} is no longer active"))
            })
    }

    fn owns(&self, generation: u64) -> bool {
        self.collector
            .as_ref()
            .is_some_and(|collector| collector.generation == generation)
    }

    fn filter_allows(&self, key: &StorageKey) -> bool {
        self.persisted_filter
            .as_ref()
            .is_none_or(|keys| keys.contains(key.as_str()))
    }

    fn idle(&self) -> bool {
        self.queued.is_empty() && self.deferred.is_empty() && self.pool.in_flight(false) == 0
    }
}

type Job = Box<dyn FnOnce(&ActionService) + Send>;

struct ServiceInner {
    config: ServiceConfig,
    ports: ServicePorts,
    runtime: Handle,
    jobs: mpsc::UnboundedSender<Job>,
    state: Mutex<ServiceState>,
}

/// The action pipeline: queue, collector, connection pool and dispatch loop.
///
/// Cheap to clone. Must be created inside a tokio runtime; background work
/// (cache lookups, requests, persistence) is spawned onto it. Every
/// processing step and every action callback the pipeline fires runs on a
/// single driver task, so callbacks never overlap on any runtime flavor.
#[derive(Clone)]
pub struct ActionService {
    inner: Arc<ServiceInner>,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Start,
    Walk(u64),
    RunClientActions(u64),
    FinishCollection(u64),
    Completions(u64),
    FinishProcessing(u64),
    Done,
}

impl Step {
    fn generation(self) -> Option<u64> {
        match self {
            Self::Walk(g)
            | Self::RunClientActions(g)
            | Self::FinishCollection(g)
            | Self::Completions(g)
            | Self::FinishProcessing(g) => Some(g),
            Self::Start | Self::Done => None,
        }
    }
}

enum StoredResult {
    Served(Option<Action>),
    Retry(Action),
}

struct Dispatch {
    slot: usize,
    marker: u64,
    actions: usize,
    request: TransportRequest,
}

#[derive(Default)]
struct Outgoing {
    dispatches: Vec<Dispatch>,
    requeue: Vec<Action>,
    idle_tasks: Vec<IdleTask>,
    failed: Vec<(Action, String)>,
    orphaned: Vec<Action>,
}

fn abort_orphan(action: &Action) {
    debug!(action_id = %action.id(), "owner released; aborting action");
    if let Err(error) = action.abort() {
        warn!(action_id = %action.id(), error = %error, "abort failed");
    }
}

/// Runs queued pipeline steps one at a time until the service is dropped.
async fn run_driver(service: Weak<ServiceInner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = service.upgrade() else {
            break;
        };
        job(&ActionService { inner });
    }
    debug!("action driver stopped");
}

impl ActionService {
    pub fn new(config: ServiceConfig, ports: ServicePorts) -> ClientResult<Self> {
        if config.pool_size == 0 {
            return Err(ClientError::InvalidConfig(
                "connection pool needs at least one slot".to_owned(),
            ));
        }
        if config.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ClientError::InvalidConfig(
                "request timeout must be positive".to_owned(),
            ));
        }
        let runtime = Handle::try_current().map_err(|error| {
            ClientError::InvalidConfig(format!("action service needs a tokio runtime: {error}"))
        })?;

        let state = ServiceState {
            queued: Vec::new(),
            deferred: Vec::new(),
            collector: None,
            next_generation: 0,
            reprocess: false,
            process_scheduled: false,
            pool: SlotPool::new(config.pool_size),
            dedup: DedupStore::default(),
            token: None,
            last_send: Instant::now(),
            connected: true,
            request_timeout: config.request_timeout,
            persisted_filter: None,
        };
        let (jobs, pending) = mpsc::unbounded_channel();
        let inner = Arc::new(ServiceInner {
            config,
            ports,
            runtime,
            jobs,
            state: Mutex::new(state),
        });
        inner
            .runtime
            .spawn(run_driver(Arc::downgrade(&inner), pending));
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Queue an action for the next pass. Safe to call from callbacks.
    #[instrument(skip(self, action), fields(action_id = %action.id(), descriptor = action.descriptor()))]
    pub fn enqueue_action(&self, action: Action) {
        let schedule = {
            let mut state = self.inner.state.lock();
            state.queued.push(action);
            let schedule = state.collector.is_none() && !state.process_scheduled;
            if schedule {
                state.process_scheduled = true;
            }
            schedule
        };
        debug!("action enqueued");
        if schedule {
            self.process();
        }
    }

    /// Enqueue `actions` and call `on_all_complete` once every one of them
    /// has settled.
    pub fn run_actions(&self, actions: Vec<Action>, on_all_complete: impl FnOnce() + Send + 'static) {
        if actions.is_empty() {
            on_all_complete();
            return;
        }
        let remaining = Arc::new(AtomicUsize::new(actions.len()));
        let done: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(on_all_complete))));
        for action in &actions {
            let remaining = remaining.clone();
            let done = done.clone();
            action.on_settled(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let callback = done.lock().take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            });
        }
        for action in actions {
            self.enqueue_action(action);
        }
    }

    /// Schedule a pass. A pass already running picks the work up instead.
    pub fn process(&self) {
        self.schedule(|service| service.drive(Step::Start));
    }

    fn schedule(&self, job: impl FnOnce(&ActionService) + Send + 'static) {
        if self.inner.jobs.send(Box::new(job)).is_err() {
            warn!("action driver stopped; step dropped");
        }
    }

    fn drive(&self, mut step: Step) {
        loop {
            let current = step;
            let result = match current {
                Step::Done => return,
                Step::Start => self.start_pass(),
                Step::Walk(generation) => self.walk(generation),
                Step::RunClientActions(generation) => self.run_client_actions(generation),
                Step::FinishCollection(generation) => self.finish_collection(generation),
                Step::Completions(generation) => self.run_completion(generation),
                Step::FinishProcessing(generation) => self.finish_processing(generation),
            };
            step = match result {
                Ok(next) => next,
                Err(error) => {
                    error!(step = ?current, error = %error, "action processing failed");
                    if let Some(generation) = current.generation() {
                        self.abandon_pass(generation);
                    }
                    Step::Done
                }
            };
        }
    }

    fn yield_then(&self, step: Step) {
        let service = self.clone();
        self.inner.runtime.spawn(async move {
            tokio::task::yield_now().await;
            service.schedule(move |service| service.drive(step));
        });
    }

    fn start_pass(&self) -> ClientResult<Step> {
        let mut state = self.inner.state.lock();
        state.process_scheduled = false;
        if state.collector.is_some() {
            state.reprocess = true;
            return Ok(Step::Done);
        }
        state.next_generation += 1;
        state.reprocess = false;
        let generation = state.next_generation;
        state.collector = Some(Collector::new(generation));
        debug!(generation, queued = state.queued.len(), "processing pass started");
        Ok(Step::Walk(generation))
    }

    fn walk(&self, generation: u64) -> ClientResult<Step> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if !state.owns(generation) {
                return Ok(Step::Done);
            }
            std::mem::take(&mut state.queued)
        };

        for action in snapshot {
            if action.owner_gone() {
                abort_orphan(&action);
                continue;
            }
            if action.is_client() {
                self.inner
                    .state
                    .lock()
                    .collector_mut(generation)?
                    .client_actions
                    .push_back(action);
                continue;
            }
            self.collect_server_action(generation, action)?;
        }

        self.inner
            .state
            .lock()
            .collector_mut(generation)?
            .join
            .settle()?;
        Ok(Step::RunClientActions(generation))
    }

    fn collect_server_action(&self, generation: u64, action: Action) -> ClientResult<()> {
        let storage = self.inner.ports.storage.clone();
        let lookup = {
            let mut state = self.inner.state.lock();
            let use_cache = storage.is_some()
                && action.is_storable()
                && !action.is_refresh()
                && state.filter_allows(action.storage_key());
            let collector = state.collector_mut(generation)?;
            let index = collector.reserve_slot();
            collector.join.add()?;
            if use_cache {
                Some(index)
            } else {
                collector.fill_slot(index, action.clone());
                collector.join.settle()?;
                None
            }
        };

        if let (Some(index), Some(storage)) = (lookup, storage) {
            let service = self.clone();
            self.inner.runtime.spawn(async move {
                let result = storage.get(action.storage_key().as_str(), true).await;
                service.schedule(move |service| {
                    service.on_stored_lookup(generation, index, action, result);
                });
            });
        }
        Ok(())
    }

    fn on_stored_lookup(
        &self,
        generation: u64,
        index: usize,
        action: Action,
        result: ClientResult<Option<StoredEntry>>,
    ) {
        if let Err(error) = self.settle_lookup(generation, index, action, result) {
            error!(generation, error = %error, "cache lookup could not be settled");
        }
        self.drive(Step::FinishCollection(generation));
    }

    fn settle_lookup(
        &self,
        generation: u64,
        index: usize,
        action: Action,
        result: ClientResult<Option<StoredEntry>>,
    ) -> ClientResult<()> {
        if !self.inner.state.lock().owns(generation) {
            warn!(action_id = %action.id(), generation, "pass ended during cache lookup; requeueing");
            self.enqueue_action(action);
            return Ok(());
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(error) => {
                warn!(action_id = %action.id(), error = %error, "cache lookup failed; sending to server");
                None
            }
        };

        match entry {
            None => {
                self.inner
                    .state
                    .lock()
                    .collector_mut(generation)?
                    .fill_slot(index, action);
            }
            Some(entry) => match self.inner.config.stored_completion {
                StoredCompletion::Immediate => {
                    let result = self.execute_stored(&action, entry);
                    let mut state = self.inner.state.lock();
                    let collector = state.collector_mut(generation)?;
                    match result {
                        StoredResult::Served(refresh) => {
                            collector.actions_completed += 1;
                            if let Some(refresh) = refresh {
                                collector.fill_slot(index, refresh);
                            }
                        }
                        StoredResult::Retry(retry) => collector.fill_slot(index, retry),
                    }
                }
                StoredCompletion::AfterSend => {
                    self.inner
                        .state
                        .lock()
                        .collector_mut(generation)?
                        .completions
                        .push_back((action, entry));
                }
            },
        }

        self.inner
            .state
            .lock()
            .collector_mut(generation)?
            .join
            .settle()?;
        Ok(())
    }

    /// Complete `action` from a cached entry. Returns the server round trip
    /// that should follow, if any.
    fn execute_stored(&self, action: &Action, entry: StoredEntry) -> StoredResult {
        let now = chrono::Utc::now();
        let stale = entry.is_expired_at(now)
            || entry
                .age_at(now)
                .to_std()
                .is_ok_and(|age| age >= self.inner.config.auto_refresh_interval);

        let response = match serde_json::from_value::<ActionResponse>(entry.value) {
            Ok(response) => response,
            Err(error) => {
                warn!(action_id = %action.id(), error = %error, "cached response unreadable; retrying from server");
                return StoredResult::Retry(action.retry_action());
            }
        };
        if let Err(error) = action.apply_stored(&response) {
            warn!(action_id = %action.id(), error = %error, "cached response could not be applied");
            if action.state().is_live() {
                return StoredResult::Retry(action.retry_action());
            }
            return StoredResult::Served(None);
        }
        debug!(action_id = %action.id(), stale, "action served from cache");

        if !stale {
            return StoredResult::Served(None);
        }
        let refresh = action.refresh_action(response.return_value);
        self.fire(
            REFRESH_BEGIN,
            json!({ "actionId": refresh.id(), "descriptor": refresh.descriptor() }),
        );
        StoredResult::Served(Some(refresh))
    }

    fn run_client_actions(&self, generation: u64) -> ClientResult<Step> {
        loop {
            let next = self
                .inner
                .state
                .lock()
                .collector_mut(generation)?
                .client_actions
                .front()
                .cloned();
            let Some(action) = next else {
                return Ok(Step::FinishCollection(generation));
            };

            if action.owner_gone() {
                abort_orphan(&action);
            } else if let Err(error) = action.run_client() {
                error!(action_id = %action.id(), error = %error, "client action failed");
            }
            self.inner
                .state
                .lock()
                .collector_mut(generation)?
                .client_actions
                .pop_front();

            if self.inner.config.client_execution == ClientExecution::Cooperative {
                self.yield_then(Step::RunClientActions(generation));
                return Ok(Step::Done);
            }
        }
    }

    fn finish_collection(&self, generation: u64) -> ClientResult<Step> {
        let (completed, rewalk) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(collector) = state
                .collector
                .as_mut()
                .filter(|collector| collector.generation == generation)
            else {
                return Ok(Step::Done);
            };
            if collector.flushed || !collector.is_settled() {
                return Ok(Step::Done);
            }
            collector.flushed = true;
            let completed = std::mem::take(&mut collector.actions_completed);
            state.deferred.extend(collector.drain_collected());

            let rewalk = !state.queued.is_empty();
            if rewalk {
                collector.rewind();
            }
            (completed, rewalk)
        };

        if completed > 0 {
            self.fire(DONE_WAITING, json!({ "completed": completed }));
        }
        if rewalk {
            return Ok(Step::Walk(generation));
        }

        self.send_action_batches();

        let mut state = self.inner.state.lock();
        let collector = state.collector_mut(generation)?;
        if collector.completions.is_empty() {
            return Ok(Step::FinishProcessing(generation));
        }
        collector.stage = Stage::Completing;
        Ok(Step::Completions(generation))
    }

    fn run_completion(&self, generation: u64) -> ClientResult<Step> {
        let next = self
            .inner
            .state
            .lock()
            .collector_mut(generation)?
            .completions
            .pop_front();
        let Some((action, entry)) = next else {
            return Ok(Step::FinishProcessing(generation));
        };

        let follow_up = match self.execute_stored(&action, entry) {
            StoredResult::Served(refresh) => refresh,
            StoredResult::Retry(retry) => Some(retry),
        };
        if let Some(follow_up) = follow_up {
            self.inner.state.lock().queued.push(follow_up);
        }
        self.yield_then(Step::Completions(generation));
        Ok(Step::Done)
    }

    fn finish_processing(&self, generation: u64) -> ClientResult<Step> {
        let more = {
            let mut state = self.inner.state.lock();
            if !state.owns(generation) {
                return Ok(Step::Done);
            }
            state.collector = None;
            !state.queued.is_empty() || std::mem::take(&mut state.reprocess)
        };
        if more {
            return Ok(Step::Start);
        }
        debug!(generation, "processing pass drained");
        self.inner.ports.renderer.rerender_dirty();
        Ok(Step::Done)
    }

    /// Drop a pass whose bookkeeping went wrong, keeping its actions.
    fn abandon_pass(&self, generation: u64) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.owns(generation) {
            return;
        }
        if let Some(mut collector) = state.collector.take() {
            state.deferred.extend(collector.drain_collected());
            state.queued.extend(collector.client_actions.drain(..));
            state
                .queued
                .extend(collector.completions.drain(..).map(|(action, _)| action));
        }
        warn!(generation, "processing pass abandoned");
    }

    fn send_action_batches(&self) {
        let context = match self.inner.ports.context.encode_for_server() {
            Ok(context) => context,
            Err(error) => {
                warn!(error = %error, "context could not be encoded; sending empty context");
                "{}".to_owned()
            }
        };

        let outgoing = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let deferred = std::mem::take(&mut state.deferred);
            let mut outgoing = Outgoing::default();

            let mut foreground = Vec::new();
            let mut caboose = 0;
            let mut background = Vec::new();
            let mut later = Vec::new();
            for action in deferred {
                if action.owner_gone() {
                    outgoing.orphaned.push(action);
                    continue;
                }
                match action.get_priority() {
                    Priority::Foreground => foreground.push(action),
                    Priority::Caboose => {
                        caboose += 1;
                        foreground.push(action);
                    }
                    Priority::Background => background.push(action),
                    Priority::Deferred => later.push(action),
                }
            }

            if !foreground.is_empty() {
                let since_last_send = state.last_send.elapsed();
                if self.inner.config.batch.should_send_foreground(
                    foreground.len(),
                    caboose,
                    since_last_send,
                ) {
                    self.dispatch_batch(state, foreground, false, &context, &mut outgoing);
                } else {
                    debug!(
                        foreground = foreground.len(),
                        caboose, "holding foreground batch for caboose window"
                    );
                    outgoing.requeue.extend(foreground);
                }
            }

            self.dispatch_singles(state, background, usize::MAX, &context, &mut outgoing);

            if !later.is_empty() {
                let idle = state.queued.is_empty()
                    && outgoing.requeue.is_empty()
                    && state.pool.in_flight(false) == 0;
                if idle {
                    self.dispatch_singles(state, later, 1, &context, &mut outgoing);
                } else {
                    outgoing.requeue.extend(later);
                }
            }

            state.deferred.append(&mut outgoing.requeue);
            outgoing
        };

        for action in &outgoing.orphaned {
            abort_orphan(action);
        }
        for (action, message) in outgoing.failed {
            self.settle_with(&action, ActionOutcome::AppError(message));
        }
        for task in outgoing.idle_tasks {
            task();
        }
        for dispatch in outgoing.dispatches {
            self.start_dispatch(dispatch);
        }
    }

    fn dispatch_singles(
        &self,
        state: &mut ServiceState,
        actions: Vec<Action>,
        limit: usize,
        context: &str,
        outgoing: &mut Outgoing,
    ) {
        let mut sent = 0;
        for action in actions {
            if state.dedup.dedupe(&action, false) {
                continue;
            }
            if sent >= limit {
                outgoing.requeue.push(action);
                continue;
            }
            let before = outgoing.dispatches.len();
            self.dispatch_batch(state, vec![action], true, context, outgoing);
            if outgoing.dispatches.len() > before {
                sent += 1;
            }
        }
    }

    /// Bundle `actions` into one request on a free slot. Actions that cannot
    /// go out now are pushed to `outgoing.requeue`.
    fn dispatch_batch(
        &self,
        state: &mut ServiceState,
        actions: Vec<Action>,
        background: bool,
        context: &str,
        outgoing: &mut Outgoing,
    ) {
        let Some(slot_index) = state.pool.acquire(background) else {
            debug!(actions = actions.len(), background, "no free connection slot; deferring");
            outgoing.requeue.extend(actions);
            return;
        };

        let mut bundled = Vec::with_capacity(actions.len());
        for action in actions {
            if action.state() != ActionState::New {
                error!(action_id = %action.id(), state = action.state().as_str(), "action is not sendable");
                continue;
            }
            if state.dedup.dedupe(&action, true) {
                continue;
            }
            if let Err(error) = action.mark_running() {
                error!(action_id = %action.id(), error = %error, "action could not start");
                continue;
            }
            bundled.push(action);
        }

        let Some(slot) = state.pool.slot_mut(slot_index) else {
            outgoing.requeue.extend(bundled);
            return;
        };
        for action in bundled {
            if let Err(error) = slot.add_action(action) {
                error!(error = %error, "action dropped from request");
            }
        }
        if slot.is_empty() {
            outgoing.idle_tasks.extend(state.pool.release(slot_index));
            return;
        }

        let marker = slot.marker();
        let envelope = RequestEnvelope {
            actions: slot.actions().map(Action::invocation).collect(),
        };
        let message = match serde_json::to_string(&envelope) {
            Ok(message) => message,
            Err(error) => {
                let message = format!("request could not be encoded: {error}");
                outgoing.failed.extend(
                    slot.take_actions()
                        .into_values()
                        .map(|action| (action, message.clone())),
                );
                outgoing.idle_tasks.extend(state.pool.release(slot_index));
                return;
            }
        };

        state.last_send = Instant::now();
        outgoing.dispatches.push(Dispatch {
            slot: slot_index,
            marker,
            actions: envelope.actions.len(),
            request: TransportRequest {
                message,
                context: context.to_owned(),
                token: state.token.clone(),
                background,
                marker,
            },
        });
    }

    fn start_dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            slot,
            marker,
            actions,
            request,
        } = dispatch;
        info!(slot, marker, actions, background = request.background, "sending action request");
        self.fire(WAITING, json!({ "marker": marker }));

        let processed = Arc::new(AtomicBool::new(false));
        let timeout = self.inner.state.lock().request_timeout;

        let transport = self.inner.ports.transport.clone();
        let service = self.clone();
        let claim = processed.clone();
        self.inner.runtime.spawn(async move {
            let result = transport.send(request).await;
            if claim.swap(true, Ordering::AcqRel) {
                debug!(marker, "response arrived after timeout; ignored");
                return;
            }
            let response = match result {
                Ok(response) => Some(response),
                Err(error) => {
                    warn!(marker, error = %error, "request did not complete");
                    None
                }
            };
            service.schedule(move |service| service.receive(slot, marker, response));
        });

        if let Some(timeout) = timeout {
            let service = self.clone();
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if processed.swap(true, Ordering::AcqRel) {
                    return;
                }
                warn!(marker, timeout_ms = timeout.as_millis() as u64, "request timed out");
                service.schedule(move |service| service.receive(slot, marker, None));
            });
        }
    }

    #[instrument(skip(self, response))]
    fn receive(&self, slot: usize, marker: u64, response: Option<TransportResponse>) {
        let bundled = {
            let mut state = self.inner.state.lock();
            match state.pool.slot_mut(slot) {
                Some(in_flight) if in_flight.marker() == marker => in_flight.take_actions(),
                _ => {
                    warn!("completion for a request that is no longer in flight");
                    return;
                }
            }
        };

        match decode(response.as_ref(), self.inner.config.mode) {
            Decoded::Incomplete => {
                self.set_connected(false);
                self.settle_all(bundled, ActionOutcome::Incomplete);
            }
            Decoded::Error {
                message,
                detail,
                exception,
            } => {
                self.set_connected(true);
                warn!(detail = %detail, actions = bundled.len(), "request failed");
                if let Some(event) = exception {
                    self.fire(&event.descriptor, event.attributes);
                }
                self.settle_all(bundled, ActionOutcome::AppError(message));
            }
            Decoded::Success(envelope) => {
                self.set_connected(true);
                self.process_responses(envelope, bundled);
            }
        }

        self.fire(DONE_WAITING, json!({ "marker": marker }));
        let idle_tasks = self.inner.state.lock().pool.release(slot);
        for task in idle_tasks {
            task();
        }
        self.process();
    }

    fn set_connected(&self, connected: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        };
        if !changed {
            return;
        }
        if connected {
            info!("connection resumed");
            self.fire(CONNECTION_RESUMED, json!({}));
        } else {
            warn!("connection lost");
            self.fire(CONNECTION_LOST, json!({}));
        }
    }

    fn process_responses(&self, envelope: ResponseEnvelope, mut bundled: IndexMap<ActionId, Action>) {
        let ResponseEnvelope {
            actions,
            context,
            events,
            token,
        } = envelope;

        if let Some(token) = token {
            self.reset_token(token);
        }
        if let Some(context) = context
            && let Err(error) = self.inner.ports.context.merge(&context)
        {
            warn!(error = %error, "pushed context could not be merged");
        }
        for event in events {
            if self.inner.ports.events.has_handlers(&event.descriptor) {
                self.fire(&event.descriptor, event.attributes);
            }
        }

        for response in actions {
            let action = match bundled.shift_remove(&response.id) {
                Some(action) => action,
                None => match self.pushed_action(&response) {
                    Ok(Some(action)) => action,
                    Ok(None) => {
                        warn!(action_id = %response.id, "response for an unknown action");
                        continue;
                    }
                    Err(error) => {
                        error!(
                            error = %error.for_action(&response.id),
                            "pushed response could not be turned into an action"
                        );
                        continue;
                    }
                },
            };
            self.settle_response(&action, &response, true);
        }

        if !bundled.is_empty() {
            warn!(actions = bundled.len(), "request completed without responses for some actions");
            self.settle_all(
                bundled,
                ActionOutcome::AppError(NO_RESPONSE_MESSAGE.to_owned()),
            );
        }
    }

    /// Build an action for a storable response the server sent unasked.
    fn pushed_action(&self, response: &ActionResponse) -> ClientResult<Option<Action>> {
        if !response.storable || response.state != ActionState::Success {
            return Ok(None);
        }
        let Some(descriptor) = response.descriptor.as_deref() else {
            return Ok(None);
        };
        let def = self.inner.ports.definitions.resolve(descriptor)?;
        let params = response.params.clone().unwrap_or_else(|| json!({}));
        debug!(descriptor, "priming cache from pushed response");
        Ok(Some(def.new_instance(params).storable()))
    }

    fn settle_response(&self, action: &Action, response: &ActionResponse, store: bool) {
        if response.state.is_live() {
            warn!(action_id = %action.id(), state = response.state.as_str(), "response left the action unfinished");
            self.settle_with(
                action,
                ActionOutcome::AppError(format!(
                    "{UNFINISHED_RESPONSE_MESSAGE}: {}",
                    response.state.as_str()
                )),
            );
            return;
        }
        let duplicates = self.inner.state.lock().dedup.take_duplicates(action);
        if let Err(error) = action.apply_response(response) {
            error!(error = %error, "response could not be applied");
        }
        if action.is_refresh() {
            self.fire(
                REFRESH_END,
                json!({ "actionId": action.id(), "descriptor": action.descriptor() }),
            );
        }
        if store && action.is_storable() && response.state == ActionState::Success {
            self.persist(action, response);
        }
        for duplicate in duplicates {
            if let Err(error) = duplicate.apply_response(response) {
                error!(error = %error, "response could not be applied to duplicate");
            }
        }
    }

    fn settle_all(&self, bundled: IndexMap<ActionId, Action>, outcome: ActionOutcome) {
        for action in bundled.into_values() {
            self.settle_with(&action, outcome.clone());
        }
    }

    fn settle_with(&self, action: &Action, outcome: ActionOutcome) {
        let duplicates = self.inner.state.lock().dedup.take_duplicates(action);
        for target in std::iter::once(action).chain(duplicates.iter()) {
            if let Err(error) = target.complete(outcome.clone(), true) {
                error!(error = %error, "action could not be settled");
            }
        }
    }

    fn persist(&self, action: &Action, response: &ActionResponse) {
        let Some(storage) = self.inner.ports.storage.clone() else {
            return;
        };
        let value = match action.stored_response(response) {
            Ok(value) => value,
            Err(error) => {
                warn!(action_id = %action.id(), error = %error, "response could not be prepared for storage");
                return;
            }
        };
        let key = action.storage_key().as_str().to_owned();
        if let Some(filter) = self.inner.state.lock().persisted_filter.as_mut() {
            filter.insert(key.clone());
        }
        spawn_detached(&self.inner.runtime, "persist action response", async move {
            storage.put(&key, value).await
        });
    }

    fn fire(&self, name: &str, payload: Value) {
        self.inner.ports.events.fire(name, payload);
    }

    fn visible_storage(&self, key: &StorageKey) -> Option<Arc<dyn ActionStoragePort>> {
        let storage = self.inner.ports.storage.clone()?;
        if !self.inner.state.lock().filter_allows(key) {
            return None;
        }
        Some(storage)
    }

    /// Whether an unexpired cached response exists. Never modifies the cache.
    pub async fn is_action_in_storage(&self, descriptor: &str, params: &Value) -> bool {
        let key = StorageKey::derive(descriptor, params);
        let Some(storage) = self.visible_storage(&key) else {
            return false;
        };
        match storage.get(key.as_str(), false).await {
            Ok(entry) => entry.is_some(),
            Err(error) => {
                warn!(key = %key, error = %error, "cache lookup failed");
                false
            }
        }
    }

    /// Restart the expiry clock of a cached response. False when there is
    /// nothing to revalidate.
    #[instrument(skip(self, params))]
    pub async fn revalidate_action(&self, descriptor: &str, params: &Value) -> bool {
        let key = StorageKey::derive(descriptor, params);
        let Some(storage) = self.visible_storage(&key) else {
            return false;
        };
        let entry = match storage.get(key.as_str(), true).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(error) => {
                warn!(key = %key, error = %error, "cache lookup failed");
                return false;
            }
        };
        match storage.put(key.as_str(), entry.value).await {
            Ok(()) => true,
            Err(error) => {
                warn!(key = %key, error = %error, "cache entry could not be rewritten");
                false
            }
        }
    }

    /// Drop a cached response. A key this context cannot see counts as
    /// already gone.
    #[instrument(skip(self, params))]
    pub async fn invalidate_action(&self, descriptor: &str, params: &Value) -> ClientResult<bool> {
        let key = StorageKey::derive(descriptor, params);
        let Some(storage) = self.inner.ports.storage.clone() else {
            return Ok(false);
        };
        if !self.inner.state.lock().filter_allows(&key) {
            return Ok(true);
        }
        storage.remove(key.as_str()).await?;
        if let Some(filter) = self.inner.state.lock().persisted_filter.as_mut() {
            filter.remove(key.as_str());
        }
        debug!(key = %key, "cached response invalidated");
        Ok(true)
    }

    pub fn set_request_timeout(&self, timeout: Duration) -> ClientResult<()> {
        if timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "request timeout must be positive".to_owned(),
            ));
        }
        self.inner.state.lock().request_timeout = Some(timeout);
        Ok(())
    }

    /// Nothing queued, nothing deferred and no request in flight.
    pub fn idle(&self) -> bool {
        self.inner.state.lock().idle()
    }

    /// Run `task` once no request is in flight; right away if that is now.
    pub fn run_when_idle(&self, task: impl FnOnce() + Send + 'static) {
        let ready = self.inner.state.lock().pool.when_idle(Box::new(task));
        if let Some(task) = ready {
            task();
        }
    }

    pub fn in_flight(&self, exclude_background: bool) -> usize {
        self.inner.state.lock().pool.in_flight(exclude_background)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.lock().token.clone()
    }

    /// Replace the server token and persist it in the background.
    pub fn reset_token(&self, token: impl Into<String>) {
        self.inner.state.lock().token = Some(token.into());
        let service = self.clone();
        spawn_detached(&self.inner.runtime, "save token", async move {
            service.save_token_to_storage().await
        });
    }

    pub async fn save_token_to_storage(&self) -> ClientResult<()> {
        let Some(storage) = self.inner.ports.storage.clone() else {
            return Ok(());
        };
        let Some(token) = self.token() else {
            return Ok(());
        };
        storage
            .put(TOKEN_STORAGE_KEY, json!({ "token": token }))
            .await
    }

    /// Load a previously saved token. Returns it when one was found.
    pub async fn load_token_from_storage(&self) -> ClientResult<Option<String>> {
        let Some(storage) = self.inner.ports.storage.clone() else {
            return Ok(None);
        };
        let token = storage
            .get(TOKEN_STORAGE_KEY, true)
            .await?
            .and_then(|entry| entry.value.get("token").and_then(Value::as_str).map(str::to_owned));
        if let Some(token) = &token {
            self.inner.state.lock().token = Some(token.clone());
        }
        Ok(token)
    }

    /// Restrict cache reads to keys this context may see.
    ///
    /// Only applies to persistent storage; the filter holds the stored keys
    /// when the context was restored from storage and starts empty otherwise.
    #[instrument(skip(self))]
    pub async fn populate_persisted_filter(&self) -> ClientResult<()> {
        let Some(storage) = self
            .inner
            .ports
            .storage
            .clone()
            .filter(|storage| storage.is_persistent())
        else {
            self.inner.state.lock().persisted_filter = None;
            return Ok(());
        };

        let mut keys = HashSet::new();
        if self.inner.ports.context.restored_from_storage() {
            keys.extend(
                storage
                    .keys()
                    .await?
                    .into_iter()
                    .filter(|key| key != TOKEN_STORAGE_KEY),
            );
        }
        info!(visible = keys.len(), "persisted action filter populated");
        self.inner.state.lock().persisted_filter = Some(keys);
        Ok(())
    }

    /// Demote every action not yet sent to deferred priority.
    pub fn defer_pending_actions(&self) {
        let state = self.inner.state.lock();
        let collected = state
            .collector
            .iter()
            .flat_map(|collector| collector.collected.iter().flatten());
        for action in state.queued.iter().chain(state.deferred.iter()).chain(collected) {
            action.set_priority(Priority::Deferred);
        }
    }

    pub fn phase(&self) -> LoopPhase {
        let state = self.inner.state.lock();
        match &state.collector {
            Some(collector) if collector.stage == Stage::Completing => LoopPhase::Completing,
            Some(_) => LoopPhase::Collecting,
            None if state.pool.in_flight(false) > 0 => LoopPhase::Flushing,
            None => LoopPhase::Idle,
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let phase = self.phase();
        let state = self.inner.state.lock();
        ServiceSnapshot {
            phase,
            queued: state.queued.len(),
            deferred: state.deferred.len(),
            in_flight: state.pool.in_flight(false),
            available_slots: state.pool.available(),
            dedup_entries: state.dedup.len(),
            connected: state.connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::action::ComponentHandle;
    use crate::config::BatchPolicy;
    use crate::context::SharedContext;
    use crate::events::{ClientEvent, ClientEventHub};
    use crate::registry::{ActionDef, ActionRegistry};
    use async_trait::async_trait;
    use relay_storage::{FileActionStorage, MemoryActionStorage};
    use tokio::sync::{Semaphore, broadcast};

    type Responder = Arc<dyn Fn(&RequestEnvelope) -> ClientResult<TransportResponse> + Send + Sync>;

    struct ScriptedTransport {
        requests: Mutex<Vec<TransportRequest>>,
        gate: Semaphore,
        responder: Responder,
    }

    impl ScriptedTransport {
        fn open(responder: Responder) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                responder,
            })
        }

        fn gated(responder: Responder) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                responder,
            })
        }

        fn release(&self, responses: usize) {
            self.gate.add_permits(responses);
        }

        fn sent(&self) -> usize {
            self.requests.lock().len()
        }

        fn raw(&self) -> Vec<TransportRequest> {
            self.requests.lock().clone()
        }

        fn envelopes(&self) -> anyhow::Result<Vec<RequestEnvelope>> {
            let raw = self.raw();
            let mut envelopes = Vec::with_capacity(raw.len());
            for request in raw {
                envelopes.push(serde_json::from_str(&request.message)?);
            }
            Ok(envelopes)
        }
    }

    #[async_trait]
    impl TransportPort for ScriptedTransport {
        async fn send(&self, request: TransportRequest) -> ClientResult<TransportResponse> {
            let envelope: RequestEnvelope = serde_json::from_str(&request.message)?;
            self.requests.lock().push(request);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|error| ClientError::Transport(error.to_string()))?;
            permit.forget();
            (self.responder)(&envelope)
        }
    }

    fn echo_responses(envelope: &RequestEnvelope) -> ResponseEnvelope {
        let actions = envelope
            .actions
            .iter()
            .map(|invocation| {
                let mut response = ActionResponse::success(
                    invocation.id.clone(),
                    json!({ "descriptor": invocation.descriptor, "params": invocation.params }),
                );
                response.storable = invocation.storable;
                response
            })
            .collect();
        ResponseEnvelope {
            actions,
            ..ResponseEnvelope::default()
        }
    }

    fn echo() -> Responder {
        Arc::new(
            |envelope: &RequestEnvelope| -> ClientResult<TransportResponse> {
                Ok(TransportResponse::ok(serde_json::to_string(
                    &echo_responses(envelope),
                )?))
            },
        )
    }

    fn reply_with(build: impl Fn(&RequestEnvelope) -> ResponseEnvelope + Send + Sync + 'static) -> Responder {
        Arc::new(
            move |envelope: &RequestEnvelope| -> ClientResult<TransportResponse> {
                Ok(TransportResponse::ok(serde_json::to_string(&build(envelope))?))
            },
        )
    }

    struct CountingRenderer(AtomicUsize);

    impl RenderPort for CountingRenderer {
        fn rerender_dirty(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Memory storage whose reads take a few scheduler turns.
    struct SlowStorage(MemoryActionStorage);

    #[async_trait]
    impl ActionStoragePort for SlowStorage {
        async fn get(&self, key: &str, include_expired: bool) -> ClientResult<Option<StoredEntry>> {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.0.get(key, include_expired).await
        }

        async fn put(&self, key: &str, value: Value) -> ClientResult<()> {
            self.0.put(key, value).await
        }

        async fn remove(&self, key: &str) -> ClientResult<()> {
            self.0.remove(key).await
        }

        async fn keys(&self) -> ClientResult<Vec<String>> {
            self.0.keys().await
        }

        fn is_persistent(&self) -> bool {
            false
        }
    }

    struct Harness {
        service: ActionService,
        transport: Arc<ScriptedTransport>,
        storage: Arc<MemoryActionStorage>,
        renderer: Arc<CountingRenderer>,
        events: broadcast::Receiver<ClientEvent>,
    }

    impl Harness {
        fn renders(&self) -> usize {
            self.renderer.0.load(Ordering::SeqCst)
        }

        fn event_names(&mut self) -> Vec<String> {
            let mut names = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                names.push(event.name);
            }
            names
        }
    }

    fn build_service(
        config: ServiceConfig,
        transport: Arc<ScriptedTransport>,
        storage: Option<Arc<dyn ActionStoragePort>>,
        context: SharedContext,
        registry: ActionRegistry,
    ) -> anyhow::Result<(ActionService, Arc<CountingRenderer>, broadcast::Receiver<ClientEvent>)> {
        let hub = ClientEventHub::default();
        let events = hub.subscribe();
        let renderer = Arc::new(CountingRenderer(AtomicUsize::new(0)));
        let service = ActionService::new(
            config,
            ServicePorts {
                storage,
                transport,
                events: Arc::new(hub),
                renderer: renderer.clone(),
                context: Arc::new(context),
                definitions: Arc::new(registry),
            },
        )?;
        Ok((service, renderer, events))
    }

    fn harness_with(
        config: ServiceConfig,
        transport: Arc<ScriptedTransport>,
        registry: ActionRegistry,
    ) -> anyhow::Result<Harness> {
        let storage = Arc::new(MemoryActionStorage::default());
        let (service, renderer, events) = build_service(
            config,
            transport.clone(),
            Some(storage.clone()),
            SharedContext::default(),
            registry,
        )?;
        Ok(Harness {
            service,
            transport,
            storage,
            renderer,
            events,
        })
    }

    fn harness(config: ServiceConfig, transport: Arc<ScriptedTransport>) -> anyhow::Result<Harness> {
        harness_with(config, transport, ActionRegistry::default())
    }

    async fn settle_until(done: impl Fn() -> bool) -> bool {
        for _ in 0..1_000 {
            if done() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        done()
    }

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn cached(value: Value, age: chrono::Duration) -> anyhow::Result<StoredEntry> {
        let response = ActionResponse::success(ActionId::from("cached"), value);
        let stored_at = chrono::Utc::now() - age;
        Ok(StoredEntry {
            value: serde_json::to_value(response)?,
            stored_at,
            expires_at: stored_at + chrono::Duration::minutes(15),
        })
    }

    fn counted(action: Action, hits: &Arc<AtomicUsize>) -> Action {
        let hits = hits.clone();
        action.on_complete(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn logging_client(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Action {
        let log = log.clone();
        Action::client(
            name,
            json!({}),
            Arc::new(move |_: &Value| -> Result<Value, String> {
                log.lock().push(name);
                Ok(Value::Null)
            }),
        )
    }

    async fn local_actions_follow_enqueue_order(execution: ClientExecution) -> anyhow::Result<()> {
        let memory = MemoryActionStorage::default();
        for id in [1, 2] {
            let key = StorageKey::derive("Get", &json!({ "id": id }));
            memory.insert_entry(key.as_str(), cached(json!({ "id": id }), chrono::Duration::zero())?);
        }
        let storage: Arc<dyn ActionStoragePort> = Arc::new(SlowStorage(memory));
        let transport = ScriptedTransport::open(echo());
        let (service, renderer, _events) = build_service(
            ServiceConfig::default().client_execution(execution),
            transport.clone(),
            Some(storage),
            SharedContext::default(),
            ActionRegistry::default(),
        )?;

        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Action::server("Get", json!({ "id": 1 })).storable();
        let second = Action::server("Get", json!({ "id": 2 })).storable();
        service.enqueue_action(logging_client("c1", &log));
        service.enqueue_action(first.clone());
        service.enqueue_action(logging_client("c2", &log));
        service.enqueue_action(second.clone());
        service.enqueue_action(logging_client("c3", &log));

        assert!(settle_until(|| renderer.0.load(Ordering::SeqCst) >= 1).await);
        assert_eq!(*log.lock(), vec!["c1", "c2", "c3"]);
        assert!(first.is_from_storage());
        assert!(second.is_from_storage());
        assert_eq!(transport.sent(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn local_actions_run_in_enqueue_order() -> anyhow::Result<()> {
        local_actions_follow_enqueue_order(ClientExecution::Synchronous).await
    }

    #[tokio::test]
    async fn cooperative_local_actions_run_in_enqueue_order() -> anyhow::Result<()> {
        local_actions_follow_enqueue_order(ClientExecution::Cooperative).await
    }

    #[tokio::test]
    async fn identical_storable_actions_share_one_request() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::gated(echo()))?;
        let hits = Arc::new(AtomicUsize::new(0));

        let first = counted(Action::server("Get", json!({ "id": 1 })).storable(), &hits);
        h.service.enqueue_action(first.clone());
        assert!(settle_until(|| h.transport.sent() == 1).await);

        let second = counted(Action::server("Get", json!({ "id": 1 })).storable(), &hits);
        h.service.enqueue_action(second.clone());
        assert!(settle_until(|| h.renders() >= 2).await);
        assert_eq!(second.state(), ActionState::New);

        h.transport.release(1);
        assert!(settle_until(|| second.outcome().is_some()).await);

        let envelopes = h.transport.envelopes()?;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].actions.len(), 1);
        assert_eq!(&envelopes[0].actions[0].id, first.id());
        assert_eq!(first.outcome(), second.outcome());
        assert!(first.outcome().is_some_and(|outcome| outcome.is_success()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn single_slot_pool_sends_background_actions_one_at_a_time() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().pool_size(1),
            ScriptedTransport::gated(echo()),
        )?;
        let a = Action::server("Sync", json!({ "n": 1 })).priority(Priority::Background);
        let b = Action::server("Sync", json!({ "n": 2 })).priority(Priority::Background);
        h.service.enqueue_action(a.clone());
        h.service.enqueue_action(b.clone());

        assert!(settle_until(|| h.renders() >= 1).await);
        assert_eq!(h.transport.sent(), 1);
        assert_eq!(h.service.snapshot().deferred, 1);

        h.transport.release(1);
        assert!(settle_until(|| h.transport.sent() == 2).await);
        assert!(a.outcome().is_some_and(|outcome| outcome.is_success()));

        h.transport.release(1);
        assert!(settle_until(|| b.outcome().is_some()).await);
        assert!(h.service.idle());
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_requests_never_exceed_pool_size() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().pool_size(2),
            ScriptedTransport::gated(echo()),
        )?;
        let a = Action::server("Save", json!({ "n": 1 }));
        let b = Action::server("Save", json!({ "n": 2 }));
        let c = Action::server("Save", json!({ "n": 3 }));

        h.service.enqueue_action(a.clone());
        assert!(settle_until(|| h.transport.sent() == 1).await);
        h.service.enqueue_action(b.clone());
        assert!(settle_until(|| h.transport.sent() == 2).await);
        h.service.enqueue_action(c.clone());
        assert!(settle_until(|| h.renders() >= 3).await);

        let snapshot = h.service.snapshot();
        assert_eq!(h.transport.sent(), 2);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.available_slots, 0);
        assert_eq!(snapshot.deferred, 1);
        assert_eq!(snapshot.phase, LoopPhase::Flushing);

        h.transport.release(1);
        assert!(settle_until(|| h.transport.sent() == 3).await);
        assert!(h.service.in_flight(false) <= 2);

        h.transport.release(2);
        assert!(settle_until(|| c.outcome().is_some() && b.outcome().is_some()).await);
        assert!(a.outcome().is_some_and(|outcome| outcome.is_success()));
        Ok(())
    }

    #[tokio::test]
    async fn stale_cache_hit_completes_then_refreshes() -> anyhow::Result<()> {
        let mut h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        h.storage.insert_entry(
            key.as_str(),
            cached(json!({ "name": "old" }), chrono::Duration::minutes(5))?,
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let action = counted(Action::server("Get", json!({ "id": 1 })).storable(), &hits);
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| h.transport.sent() == 1).await);
        assert!(action.is_from_storage());
        assert_eq!(
            action.outcome(),
            Some(ActionOutcome::Success(json!({ "name": "old" })))
        );

        let envelopes = h.transport.envelopes()?;
        assert_eq!(envelopes[0].actions[0].descriptor, "Get");
        assert_ne!(&envelopes[0].actions[0].id, action.id());

        // the echoed value differs from the cached one, so callbacks replay
        assert!(settle_until(|| hits.load(Ordering::SeqCst) == 2).await);
        let names = h.event_names();
        assert!(names.iter().any(|name| name == REFRESH_BEGIN));
        assert!(names.iter().any(|name| name == REFRESH_END));
        Ok(())
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_the_server() -> anyhow::Result<()> {
        let mut h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        h.storage
            .insert_entry(key.as_str(), cached(json!(7), chrono::Duration::zero())?);

        let action = Action::server("Get", json!({ "id": 1 })).storable();
        h.service.enqueue_action(action.clone());
        assert!(settle_until(|| h.renders() >= 1).await);

        assert_eq!(action.outcome(), Some(ActionOutcome::Success(json!(7))));
        assert_eq!(h.transport.sent(), 0);
        assert!(h.event_names().iter().any(|name| name == DONE_WAITING));
        Ok(())
    }

    #[tokio::test]
    async fn cached_callbacks_can_run_after_the_flush() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().stored_completion(StoredCompletion::AfterSend),
            ScriptedTransport::open(echo()),
        )?;
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        h.storage
            .insert_entry(key.as_str(), cached(json!(1), chrono::Duration::zero())?);

        let hit = Action::server("Get", json!({ "id": 1 })).storable();
        let miss = Action::server("Get", json!({ "id": 2 })).storable();
        h.service.enqueue_action(hit.clone());
        h.service.enqueue_action(miss.clone());

        assert!(settle_until(|| hit.outcome().is_some() && miss.outcome().is_some()).await);
        assert!(hit.is_from_storage());
        assert!(!miss.is_from_storage());
        let envelopes = h.transport.envelopes()?;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(&envelopes[0].actions[0].id, miss.id());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_fails_the_request_and_the_pass_still_finishes() -> anyhow::Result<()> {
        let transport = ScriptedTransport::open(Arc::new(
            |_: &RequestEnvelope| -> ClientResult<TransportResponse> {
                Ok(TransportResponse::ok("while(1);\n{not json"))
            },
        ));
        let h = harness(ServiceConfig::default(), transport)?;
        let log = Arc::new(Mutex::new(Vec::new()));
        let remote = Action::server("Save", json!({}));
        let local = logging_client("local", &log);
        h.service.enqueue_action(remote.clone());
        h.service.enqueue_action(local.clone());

        assert!(settle_until(|| remote.outcome().is_some()).await);
        let message = remote
            .outcome()
            .and_then(|outcome| outcome.error_message().map(str::to_owned))
            .unwrap_or_default();
        assert!(message.contains("invalid JSON"));
        assert_eq!(remote.state(), ActionState::Error);
        assert!(local.outcome().is_some_and(|outcome| outcome.is_success()));
        assert!(settle_until(|| h.renders() >= 1).await);
        Ok(())
    }

    #[tokio::test]
    async fn actions_missing_from_the_response_settle_with_error() -> anyhow::Result<()> {
        let transport = ScriptedTransport::open(reply_with(|_| ResponseEnvelope::default()));
        let h = harness(ServiceConfig::default(), transport)?;
        let action = Action::server("Save", json!({}));
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| action.outcome().is_some()).await);
        assert_eq!(
            action.outcome(),
            Some(ActionOutcome::AppError(NO_RESPONSE_MESSAGE.to_owned()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn unfinished_response_state_settles_action_and_duplicates_with_error() -> anyhow::Result<()> {
        let transport = ScriptedTransport::gated(reply_with(|envelope: &RequestEnvelope| {
            let mut responses = echo_responses(envelope);
            for response in &mut responses.actions {
                response.state = ActionState::Running;
            }
            responses
        }));
        let h = harness(ServiceConfig::default(), transport)?;

        let first = Action::server("Get", json!({ "id": 1 })).storable();
        h.service.enqueue_action(first.clone());
        assert!(settle_until(|| h.transport.sent() == 1).await);
        let second = Action::server("Get", json!({ "id": 1 })).storable();
        h.service.enqueue_action(second.clone());
        assert!(settle_until(|| h.renders() >= 2).await);

        h.transport.release(1);
        assert!(settle_until(|| first.outcome().is_some() && second.outcome().is_some()).await);
        assert_eq!(first.state(), ActionState::Error);
        assert_eq!(first.outcome(), second.outcome());
        let message = first
            .outcome()
            .and_then(|outcome| outcome.error_message().map(str::to_owned))
            .unwrap_or_default();
        assert!(message.contains("RUNNING"));
        assert_eq!(h.transport.sent(), 1);
        assert_eq!(h.service.snapshot().dedup_entries, 0);
        assert!(!h.service.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn callbacks_never_overlap_on_a_multi_threaded_runtime() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().pool_size(4),
            ScriptedTransport::open(echo()),
        )?;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut actions = Vec::new();
        for n in 0..3 {
            let running = running.clone();
            let peak = peak.clone();
            actions.push(
                Action::server("Sync", json!({ "n": n }))
                    .priority(Priority::Background)
                    .on_complete(move |_| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        running.fetch_sub(1, Ordering::SeqCst);
                    }),
            );
        }
        for action in &actions {
            h.service.enqueue_action(action.clone());
        }
        for action in &actions {
            assert!(action.wait().await.is_success());
        }

        assert_eq!(h.transport.sent(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn caboose_waits_for_the_batch_window() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let action = Action::server("Log", json!({})).priority(Priority::Caboose);
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| h.renders() >= 1).await);
        assert_eq!(h.transport.sent(), 0);
        assert_eq!(h.service.snapshot().deferred, 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        h.service.process();
        assert!(settle_until(|| h.renders() >= 2).await);
        assert_eq!(h.transport.sent(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        h.service.process();
        assert!(settle_until(|| action.outcome().is_some()).await);
        assert_eq!(h.transport.sent(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn caboose_rides_along_with_foreground_work() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().batch(BatchPolicy {
                caboose_window: Duration::from_secs(600),
            }),
            ScriptedTransport::open(echo()),
        )?;
        let caboose = Action::server("Log", json!({})).priority(Priority::Caboose);
        let foreground = Action::server("Save", json!({}));
        h.service.enqueue_action(caboose.clone());
        h.service.enqueue_action(foreground.clone());

        assert!(settle_until(|| caboose.outcome().is_some()).await);
        let envelopes = h.transport.envelopes()?;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].actions.len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_is_incomplete_and_late_response_ignored() -> anyhow::Result<()> {
        let mut h = harness(
            ServiceConfig::default().request_timeout(Duration::from_secs(5)),
            ScriptedTransport::gated(echo()),
        )?;
        let hits = Arc::new(AtomicUsize::new(0));
        let action = counted(Action::server("Save", json!({ "n": 1 })), &hits);
        h.service.enqueue_action(action.clone());
        assert!(settle_until(|| h.transport.sent() == 1).await);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(settle_until(|| action.outcome().is_some()).await);
        assert_eq!(action.outcome(), Some(ActionOutcome::Incomplete));
        assert!(!h.service.is_connected());
        assert!(h.event_names().iter().any(|name| name == CONNECTION_LOST));

        h.transport.release(1);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(action.outcome(), Some(ActionOutcome::Incomplete));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let next = Action::server("Save", json!({ "n": 2 }));
        h.service.enqueue_action(next.clone());
        assert!(settle_until(|| h.transport.sent() == 2).await);
        h.transport.release(1);
        assert!(settle_until(|| next.outcome().is_some()).await);
        assert!(h.service.is_connected());
        assert!(h.event_names().iter().any(|name| name == CONNECTION_RESUMED));
        Ok(())
    }

    #[tokio::test]
    async fn pushed_storable_response_primes_the_cache() -> anyhow::Result<()> {
        let mut registry = ActionRegistry::default();
        registry.register(ActionDef::server("List"));
        let transport = ScriptedTransport::open(reply_with(|envelope| {
            let mut responses = echo_responses(envelope);
            let mut pushed = ActionResponse::success(ActionId::from("pushed-1"), json!(["a", "b"]));
            pushed.storable = true;
            pushed.descriptor = Some("List".to_owned());
            pushed.params = Some(json!({ "page": 1 }));
            responses.actions.push(pushed);
            responses
        }));
        let h = harness_with(ServiceConfig::default(), transport, registry)?;
        let action = Action::server("Save", json!({}));
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| action.outcome().is_some()).await);
        assert!(settle_until(|| h.storage.len() == 1).await);
        let key = StorageKey::derive("List", &json!({ "page": 1 }));
        let entry = h.storage.get(key.as_str(), false).await?;
        assert!(entry.is_some());
        assert!(
            h.service
                .is_action_in_storage("List", &json!({ "page": 1 }))
                .await
        );
        Ok(())
    }

    #[tokio::test]
    async fn server_token_is_saved_reused_and_reloaded() -> anyhow::Result<()> {
        let transport = ScriptedTransport::open(reply_with(|envelope| ResponseEnvelope {
            token: Some("tok-1".to_owned()),
            ..echo_responses(envelope)
        }));
        let h = harness(ServiceConfig::default(), transport)?;
        let first = Action::server("Save", json!({ "n": 1 }));
        h.service.enqueue_action(first.clone());
        assert!(settle_until(|| first.outcome().is_some()).await);
        assert_eq!(h.service.token().as_deref(), Some("tok-1"));
        assert!(settle_until(|| h.storage.len() == 1).await);

        let second = Action::server("Save", json!({ "n": 2 }));
        h.service.enqueue_action(second.clone());
        assert!(settle_until(|| second.outcome().is_some()).await);
        let raw = h.transport.raw();
        assert_eq!(raw[0].token, None);
        assert_eq!(raw[1].token.as_deref(), Some("tok-1"));

        let (reloaded, _, _) = build_service(
            ServiceConfig::default(),
            ScriptedTransport::open(echo()),
            Some(h.storage.clone()),
            SharedContext::default(),
            ActionRegistry::default(),
        )?;
        assert_eq!(reloaded.token(), None);
        assert_eq!(
            reloaded.load_token_from_storage().await?.as_deref(),
            Some("tok-1")
        );
        assert_eq!(reloaded.token().as_deref(), Some("tok-1"));
        Ok(())
    }

    #[tokio::test]
    async fn storage_queries_and_revalidation() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        let entry = cached(json!({ "name": "a" }), chrono::Duration::minutes(5))?;
        h.storage.insert_entry(key.as_str(), entry.clone());

        assert!(h.service.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        assert_eq!(h.storage.get(key.as_str(), true).await?, Some(entry.clone()));
        assert!(!h.service.is_action_in_storage("Get", &json!({ "id": 2 })).await);

        assert!(h.service.revalidate_action("Get", &json!({ "id": 1 })).await);
        let refreshed = h
            .storage
            .get(key.as_str(), true)
            .await?
            .ok_or_else(|| anyhow::anyhow!("entry vanished"))?;
        assert_eq!(refreshed.value, entry.value);
        assert!(refreshed.expires_at > entry.expires_at);
        assert!(!h.service.revalidate_action("Get", &json!({ "id": 2 })).await);

        assert!(h.service.invalidate_action("Get", &json!({ "id": 1 })).await?);
        assert!(!h.service.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_not_reported_in_storage() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        h.storage
            .insert_entry(key.as_str(), cached(json!(1), chrono::Duration::hours(1))?);
        assert!(!h.service.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        // expired entries can still be revalidated
        assert!(h.service.revalidate_action("Get", &json!({ "id": 1 })).await);
        assert!(h.service.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        Ok(())
    }

    #[tokio::test]
    async fn persisted_filter_hides_entries_from_a_fresh_context() -> anyhow::Result<()> {
        let root = unique_test_root("relay-runtime-filter");
        let storage = Arc::new(FileActionStorage::new(&root));
        let key = StorageKey::derive("Get", &json!({ "id": 1 }));
        storage.put(key.as_str(), json!({ "name": "a" })).await?;

        let (fresh, _, _) = build_service(
            ServiceConfig::default(),
            ScriptedTransport::open(echo()),
            Some(storage.clone()),
            SharedContext::fresh(json!({})),
            ActionRegistry::default(),
        )?;
        fresh.populate_persisted_filter().await?;
        assert!(!fresh.is_action_in_storage("Get", &json!({ "id": 1 })).await);
        assert!(fresh.invalidate_action("Get", &json!({ "id": 1 })).await?);
        assert!(storage.get(key.as_str(), false).await?.is_some());

        let (restored, _, _) = build_service(
            ServiceConfig::default(),
            ScriptedTransport::open(echo()),
            Some(storage.clone()),
            SharedContext::default(),
            ActionRegistry::default(),
        )?;
        restored.populate_persisted_filter().await?;
        assert!(restored.is_action_in_storage("Get", &json!({ "id": 1 })).await);

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn run_actions_reports_once_all_settle() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;

        let empty = Arc::new(AtomicBool::new(false));
        let flag = empty.clone();
        h.service
            .run_actions(Vec::new(), move || flag.store(true, Ordering::SeqCst));
        assert!(empty.load(Ordering::SeqCst));

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let a = Action::server("Save", json!({ "n": 1 }));
        let b = Action::server("Save", json!({ "n": 2 })).priority(Priority::Background);
        h.service.run_actions(vec![a.clone(), b.clone()], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(settle_until(|| done.load(Ordering::SeqCst) == 1).await);
        assert!(a.outcome().is_some() && b.outcome().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn released_owner_aborts_queued_action() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let owner = ComponentHandle::new();
        let action = Action::server("Get", json!({})).with_owner(owner.clone());
        owner.release();
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| action.outcome().is_some()).await);
        assert_eq!(action.outcome(), Some(ActionOutcome::Aborted));
        assert_eq!(h.transport.sent(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn held_caboose_is_aborted_once_its_owner_is_released() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        let owner = ComponentHandle::new();
        let action = Action::server("Log", json!({}))
            .priority(Priority::Caboose)
            .with_owner(owner.clone());
        h.service.enqueue_action(action.clone());

        assert!(settle_until(|| h.renders() >= 1).await);
        assert_eq!(h.service.snapshot().deferred, 1);

        owner.release();
        tokio::time::advance(Duration::from_secs(60)).await;
        h.service.process();
        assert!(settle_until(|| action.outcome().is_some()).await);
        assert_eq!(action.outcome(), Some(ActionOutcome::Aborted));
        assert_eq!(h.transport.sent(), 0);
        assert_eq!(h.service.snapshot().deferred, 0);
        Ok(())
    }

    #[tokio::test]
    async fn cooperative_local_action_skips_a_released_owner() -> anyhow::Result<()> {
        let h = harness(
            ServiceConfig::default().client_execution(ClientExecution::Cooperative),
            ScriptedTransport::open(echo()),
        )?;
        let owner = ComponentHandle::new();
        let closer = {
            let owner = owner.clone();
            Action::client(
                "Close",
                json!({}),
                Arc::new(move |_: &Value| -> Result<Value, String> {
                    owner.release();
                    Ok(Value::Null)
                }),
            )
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let orphan = logging_client("orphan", &log).with_owner(owner);

        h.service.enqueue_action(closer.clone());
        h.service.enqueue_action(orphan.clone());
        assert!(settle_until(|| orphan.outcome().is_some()).await);

        assert!(closer.outcome().is_some_and(|outcome| outcome.is_success()));
        assert_eq!(orphan.outcome(), Some(ActionOutcome::Aborted));
        assert!(log.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deferred_actions_wait_for_an_idle_service() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::gated(echo()))?;
        let busy = Action::server("Save", json!({}));
        h.service.enqueue_action(busy.clone());
        assert!(settle_until(|| h.transport.sent() == 1).await);

        let later = Action::server("Prefetch", json!({}));
        h.service.enqueue_action(later.clone());
        h.service.defer_pending_actions();
        assert_eq!(later.get_priority(), Priority::Deferred);
        assert!(settle_until(|| h.renders() >= 2).await);
        assert_eq!(h.transport.sent(), 1);

        h.transport.release(2);
        assert!(settle_until(|| later.outcome().is_some()).await);
        assert_eq!(h.transport.sent(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn idle_tasks_wait_for_in_flight_requests() -> anyhow::Result<()> {
        let h = harness(ServiceConfig::default(), ScriptedTransport::gated(echo()))?;
        let now = Arc::new(AtomicBool::new(false));
        let flag = now.clone();
        h.service
            .run_when_idle(move || flag.store(true, Ordering::SeqCst));
        assert!(now.load(Ordering::SeqCst));

        h.service.enqueue_action(Action::server("Save", json!({})));
        assert!(settle_until(|| h.transport.sent() == 1).await);
        assert!(!h.service.idle());

        let later = Arc::new(AtomicBool::new(false));
        let flag = later.clone();
        h.service
            .run_when_idle(move || flag.store(true, Ordering::SeqCst));
        assert!(!later.load(Ordering::SeqCst));

        h.transport.release(1);
        assert!(settle_until(|| later.load(Ordering::SeqCst)).await);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() -> anyhow::Result<()> {
        let built = build_service(
            ServiceConfig::default().pool_size(0),
            ScriptedTransport::open(echo()),
            None,
            SharedContext::default(),
            ActionRegistry::default(),
        );
        assert!(built.is_err());

        let h = harness(ServiceConfig::default(), ScriptedTransport::open(echo()))?;
        assert!(matches!(
            h.service.set_request_timeout(Duration::ZERO),
            Err(ClientError::InvalidConfig(_))
        ));
        assert!(h.service.set_request_timeout(Duration::from_secs(1)).is_ok());
        Ok(())
    }

    #[test]
    fn service_needs_a_runtime() {
        let built = build_service(
            ServiceConfig::default(),
            ScriptedTransport::open(echo()),
            None,
            SharedContext::default(),
            ActionRegistry::default(),
        );
        assert!(built.is_err());
    }
}
