use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use relay_protocol::{
    ActionId, ActionInvocation, ActionOutcome, ActionResponse, ActionState, ClientError,
    ClientResult, Priority, StorageKey,
};
use serde_json::Value;
use tokio::sync::watch;

pub type ActionCallback = Arc<dyn Fn(&ActionOutcome) + Send + Sync>;
pub type ClientHandler = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;
type SettleHook = Box<dyn FnOnce(&ActionOutcome) + Send>;

/// Liveness flag shared between an action and whatever issued it.
///
/// Once released, queued actions owned by it are aborted instead of sent.
#[derive(Debug, Clone)]
pub struct ComponentHandle {
    alive: Arc<AtomicBool>,
}

impl Default for ComponentHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHandle {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn release(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
enum ActionKind {
    Server,
    Client(ClientHandler),
}

#[derive(Debug, Clone)]
enum RefreshOrigin {
    /// Re-fetch of a value already served from the cache. Callbacks replay
    /// only if the server answers with something different.
    Refresh { original: Value },
    /// Stand-in for an action whose cached response could not be applied.
    Retry,
}

struct ActionCell {
    state: ActionState,
    priority: Priority,
    storable: bool,
    from_storage: bool,
    outcome: Option<ActionOutcome>,
    callbacks: Vec<ActionCallback>,
    settle_hooks: Vec<SettleHook>,
}

struct ActionInner {
    id: ActionId,
    descriptor: String,
    params: Value,
    storage_key: StorageKey,
    kind: ActionKind,
    owner: Option<ComponentHandle>,
    refresh: Option<RefreshOrigin>,
    cell: Mutex<ActionCell>,
    done: watch::Sender<Option<ActionOutcome>>,
}

/// A single remote or local call.
///
/// Cheap to clone; every clone refers to the same action. Builder methods
/// (`storable`, `priority`, `on_complete`, ...) are meant to be chained before
/// the action is enqueued.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.inner.id)
            .field("descriptor", &self.inner.descriptor)
            .field("state", &self.state())
            .finish()
    }
}

impl Action {
    #[allow(clippy::too_many_arguments)]
    fn build(
        id: ActionId,
        descriptor: String,
        params: Value,
        storage_key: StorageKey,
        kind: ActionKind,
        owner: Option<ComponentHandle>,
        refresh: Option<RefreshOrigin>,
        cell: ActionCell,
    ) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(ActionInner {
                id,
                descriptor,
                params,
                storage_key,
                kind,
                owner,
                refresh,
                cell: Mutex::new(cell),
                done,
            }),
        }
    }

    fn fresh_cell() -> ActionCell {
        ActionCell {
            state: ActionState::New,
            priority: Priority::Foreground,
            storable: false,
            from_storage: false,
            outcome: None,
            callbacks: Vec::new(),
            settle_hooks: Vec::new(),
        }
    }

    pub fn server(descriptor: impl Into<String>, params: Value) -> Self {
        let descriptor = descriptor.into();
        let storage_key = StorageKey::derive(&descriptor, &params);
        Self::build(
            ActionId::default(),
            descriptor,
            params,
            storage_key,
            ActionKind::Server,
            None,
            None,
            Self::fresh_cell(),
        )
    }

    pub fn client(descriptor: impl Into<String>, params: Value, handler: ClientHandler) -> Self {
        let descriptor = descriptor.into();
        let storage_key = StorageKey::derive(&descriptor, &params);
        Self::build(
            ActionId::default(),
            descriptor,
            params,
            storage_key,
            ActionKind::Client(handler),
            None,
            None,
            Self::fresh_cell(),
        )
    }

    fn take_cell(&self) -> ActionCell {
        let mut cell = self.inner.cell.lock();
        ActionCell {
            state: cell.state,
            priority: cell.priority,
            storable: cell.storable,
            from_storage: cell.from_storage,
            outcome: cell.outcome.clone(),
            callbacks: std::mem::take(&mut cell.callbacks),
            settle_hooks: std::mem::take(&mut cell.settle_hooks),
        }
    }

    /// Use an explicit storage key instead of the derived one. Call before
    /// the action is cloned or enqueued.
    pub fn with_storage_key(self, key: StorageKey) -> Self {
        let cell = self.take_cell();
        Self::build(
            self.inner.id.clone(),
            self.inner.descriptor.clone(),
            self.inner.params.clone(),
            key,
            self.inner.kind.clone(),
            self.inner.owner.clone(),
            self.inner.refresh.clone(),
            cell,
        )
    }

    pub fn with_owner(self, owner: ComponentHandle) -> Self {
        let cell = self.take_cell();
        Self::build(
            self.inner.id.clone(),
            self.inner.descriptor.clone(),
            self.inner.params.clone(),
            self.inner.storage_key.clone(),
            self.inner.kind.clone(),
            Some(owner),
            self.inner.refresh.clone(),
            cell,
        )
    }

    pub fn storable(self) -> Self {
        self.inner.cell.lock().storable = true;
        self
    }

    pub fn priority(self, priority: Priority) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn on_complete(self, callback: impl Fn(&ActionOutcome) + Send + Sync + 'static) -> Self {
        self.add_callback(Arc::new(callback));
        self
    }

    pub fn add_callback(&self, callback: ActionCallback) {
        self.inner.cell.lock().callbacks.push(callback);
    }

    /// Runs once when the action settles, after its callbacks. Not carried
    /// over to refresh actions.
    pub(crate) fn on_settled(&self, hook: impl FnOnce(&ActionOutcome) + Send + 'static) {
        let mut cell = self.inner.cell.lock();
        if let Some(outcome) = cell.outcome.clone() {
            drop(cell);
            hook(&outcome);
            return;
        }
        cell.settle_hooks.push(Box::new(hook));
    }

    pub fn id(&self) -> &ActionId {
        &self.inner.id
    }

    pub fn descriptor(&self) -> &str {
        &self.inner.descriptor
    }

    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.inner.storage_key
    }

    pub fn state(&self) -> ActionState {
        self.inner.cell.lock().state
    }

    pub fn outcome(&self) -> Option<ActionOutcome> {
        self.inner.cell.lock().outcome.clone()
    }

    pub fn get_priority(&self) -> Priority {
        self.inner.cell.lock().priority
    }

    pub fn set_priority(&self, priority: Priority) {
        self.inner.cell.lock().priority = priority;
    }

    pub fn is_storable(&self) -> bool {
        self.inner.cell.lock().storable
    }

    pub fn is_client(&self) -> bool {
        matches!(self.inner.kind, ActionKind::Client(_))
    }

    /// True for refresh and retry actions, which always go to the server.
    pub fn is_refresh(&self) -> bool {
        self.inner.refresh.is_some()
    }

    pub fn is_from_storage(&self) -> bool {
        self.inner.cell.lock().from_storage
    }

    pub(crate) fn owner_gone(&self) -> bool {
        self.inner
            .owner
            .as_ref()
            .is_some_and(|owner| !owner.is_alive())
    }

    /// Resolves with the terminal outcome.
    pub async fn wait(&self) -> ActionOutcome {
        let mut rx = self.inner.done.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(ActionOutcome::Aborted)
    }

    pub fn invocation(&self) -> ActionInvocation {
        ActionInvocation {
            id: self.inner.id.clone(),
            descriptor: self.inner.descriptor.clone(),
            params: self.inner.params.clone(),
            caller_descriptor: None,
            storable: self.is_storable(),
        }
    }

    pub(crate) fn mark_running(&self) -> ClientResult<()> {
        let mut cell = self.inner.cell.lock();
        if cell.state != ActionState::New {
            return Err(ClientError::InvalidTransition {
                from: cell.state,
                to: ActionState::Running,
            }
            .for_action(&self.inner.id));
        }
        cell.state = ActionState::Running;
        Ok(())
    }

    /// Settle with `outcome`. Callbacks run only when `notify` is set; settle
    /// hooks and waiters always observe the outcome.
    pub(crate) fn complete(&self, outcome: ActionOutcome, notify: bool) -> ClientResult<()> {
        let (callbacks, hooks) = {
            let mut cell = self.inner.cell.lock();
            if cell.state.is_terminal() {
                return Err(ClientError::InvalidTransition {
                    from: cell.state,
                    to: outcome.state(),
                }
                .for_action(&self.inner.id));
            }
            cell.state = outcome.state();
            cell.outcome = Some(outcome.clone());
            let callbacks = if notify {
                cell.callbacks.clone()
            } else {
                Vec::new()
            };
            (callbacks, std::mem::take(&mut cell.settle_hooks))
        };
        for callback in &callbacks {
            callback(&outcome);
        }
        for hook in hooks {
            hook(&outcome);
        }
        self.inner.done.send_replace(Some(outcome));
        Ok(())
    }

    pub(crate) fn abort(&self) -> ClientResult<()> {
        self.complete(ActionOutcome::Aborted, true)
    }

    pub(crate) fn run_client(&self) -> ClientResult<()> {
        let ActionKind::Client(handler) = &self.inner.kind else {
            return Err(ClientError::InvalidTransition {
                from: self.state(),
                to: ActionState::Running,
            }
            .for_action(&self.inner.id));
        };
        self.mark_running()?;
        let outcome = match handler(&self.inner.params) {
            Ok(value) => ActionOutcome::Success(value),
            Err(message) => ActionOutcome::AppError(message),
        };
        self.complete(outcome, true)
    }

    /// Apply a server (or cached) response and settle.
    pub(crate) fn apply_response(&self, response: &ActionResponse) -> ClientResult<()> {
        let outcome = match response.state {
            ActionState::Success => ActionOutcome::Success(response.return_value.clone()),
            ActionState::Error => ActionOutcome::AppError(
                response
                    .error_message()
                    .unwrap_or_else(|| "Unknown error".to_owned()),
            ),
            ActionState::Incomplete => ActionOutcome::Incomplete,
            ActionState::Aborted => ActionOutcome::Aborted,
            ActionState::New | ActionState::Running => {
                return Err(ClientError::InvalidTransition {
                    from: self.state(),
                    to: response.state,
                }
                .for_action(&self.inner.id));
            }
        };
        let notify = match &self.inner.refresh {
            Some(RefreshOrigin::Refresh { original }) => {
                response.state != ActionState::Success || response.return_value != *original
            }
            _ => true,
        };
        self.complete(outcome, notify)
    }

    pub(crate) fn apply_stored(&self, response: &ActionResponse) -> ClientResult<()> {
        self.inner.cell.lock().from_storage = true;
        self.apply_response(response)
    }

    /// Cache payload for a successful response of this action.
    pub(crate) fn stored_response(&self, response: &ActionResponse) -> ClientResult<Value> {
        let stored = ActionResponse {
            id: self.inner.id.clone(),
            state: ActionState::Success,
            return_value: response.return_value.clone(),
            error: Vec::new(),
            storable: true,
            descriptor: Some(self.inner.descriptor.clone()),
            params: Some(self.inner.params.clone()),
        };
        Ok(serde_json::to_value(stored)?)
    }

    fn derived(&self, refresh: RefreshOrigin, callbacks: Vec<ActionCallback>) -> Self {
        let priority = self.get_priority();
        let mut cell = Self::fresh_cell();
        cell.priority = priority;
        cell.storable = true;
        cell.callbacks = callbacks;
        Self::build(
            ActionId::default(),
            self.inner.descriptor.clone(),
            self.inner.params.clone(),
            self.inner.storage_key.clone(),
            ActionKind::Server,
            self.inner.owner.clone(),
            Some(refresh),
            cell,
        )
    }

    /// Server round trip for a value that was just served from the cache.
    pub(crate) fn refresh_action(&self, original: Value) -> Self {
        let callbacks = self.inner.cell.lock().callbacks.clone();
        self.derived(RefreshOrigin::Refresh { original }, callbacks)
    }

    /// Server round trip that settles this (still unsettled) action with
    /// whatever the server answers.
    pub(crate) fn retry_action(&self) -> Self {
        let retry = self.derived(RefreshOrigin::Retry, Vec::new());
        let original = self.clone();
        retry.on_settled(move |outcome| {
            if let Err(error) = original.complete(outcome.clone(), true) {
                tracing::warn!(action_id = %original.id(), error = %error, "retry could not settle original");
            }
        });
        retry
    }
}
