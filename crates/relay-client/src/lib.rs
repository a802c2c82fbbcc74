use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use relay_protocol::{ActionStoragePort, RenderPort, TransportPort};
use relay_runtime::{
    ActionDefinitions, ActionRegistry, ActionService, ClientEventHub, Mode, NoopRenderer,
    ServicePorts, SharedContext,
};
use relay_storage::{FileActionStorage, MemoryActionStorage};
use relay_transport::HttpTransport;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument};

pub use relay_protocol::{
    ActionOutcome, ActionState, ClientError, ClientResult, Priority, StorageKey,
};
pub use relay_runtime::{
    Action, ActionDef, ClientEvent, ClientExecution, ComponentHandle, LoopPhase, ServiceConfig,
    ServiceSnapshot, StoredCompletion,
};

const EVENT_BUFFER: usize = 1024;

pub struct ClientBuilder {
    host: String,
    endpoint: Option<String>,
    storage_root: Option<PathBuf>,
    storage_expiration: Option<chrono::Duration>,
    config: ServiceConfig,
    registry: ActionRegistry,
    context: Value,
    transport: Option<Arc<dyn TransportPort>>,
    renderer: Option<Arc<dyn RenderPort>>,
}

impl ClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            endpoint: None,
            storage_root: None,
            storage_expiration: None,
            config: ServiceConfig::default(),
            registry: ActionRegistry::default(),
            context: Value::Object(Default::default()),
            transport: None,
            renderer: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config = self.config.pool_size(pool_size);
        self
    }

    /// Cache responses on disk under `root` instead of in memory.
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn storage_expiration(mut self, expiration: chrono::Duration) -> Self {
        self.storage_expiration = Some(expiration);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.request_timeout(timeout);
        self
    }

    pub fn production(mut self, production: bool) -> Self {
        let mode = if production {
            Mode::Production
        } else {
            Mode::Development
        };
        self.config = self.config.mode(mode);
        self
    }

    pub fn client_execution(mut self, execution: ClientExecution) -> Self {
        self.config = self.config.client_execution(execution);
        self
    }

    pub fn stored_completion(mut self, completion: StoredCompletion) -> Self {
        self.config = self.config.stored_completion(completion);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn register(mut self, def: ActionDef) -> Self {
        self.registry.register(def);
        self
    }

    /// Replace the HTTP transport, e.g. with an in-process server.
    pub fn transport(mut self, transport: Arc<dyn TransportPort>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn RenderPort>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Wire the client. Must run inside a tokio runtime.
    pub fn build(self) -> ClientResult<RelayClient> {
        let storage: Arc<dyn ActionStoragePort> = match (&self.storage_root, self.storage_expiration) {
            (Some(root), Some(expiration)) => {
                Arc::new(FileActionStorage::with_expiration(root, expiration))
            }
            (Some(root), None) => Arc::new(FileActionStorage::new(root)),
            (None, Some(expiration)) => Arc::new(MemoryActionStorage::new(expiration)),
            (None, None) => Arc::new(MemoryActionStorage::default()),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let http = match &self.endpoint {
                    Some(endpoint) => HttpTransport::with_endpoint(&self.host, endpoint),
                    None => HttpTransport::new(&self.host),
                }
                .map_err(|error| ClientError::InvalidConfig(format!("{error:#}")))?;
                Arc::new(http)
            }
        };

        let events = ClientEventHub::new(EVENT_BUFFER);
        let context = Arc::new(SharedContext::new(self.context));
        let registry = Arc::new(self.registry);
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(NoopRenderer));

        let service = ActionService::new(
            self.config,
            ServicePorts {
                storage: Some(storage),
                transport,
                events: Arc::new(events.clone()),
                renderer,
                context: context.clone(),
                definitions: registry.clone(),
            },
        )?;
        info!(host = %self.host, persistent = self.storage_root.is_some(), "relay client ready");

        Ok(RelayClient {
            service,
            registry,
            events,
            context,
        })
    }
}

#[derive(Clone)]
pub struct RelayClient {
    service: ActionService,
    registry: Arc<ActionRegistry>,
    events: ClientEventHub,
    context: Arc<SharedContext>,
}

impl RelayClient {
    /// Restore the saved token and the persisted action filter.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> ClientResult<()> {
        self.service.load_token_from_storage().await?;
        self.service.populate_persisted_filter().await
    }

    pub fn service(&self) -> &ActionService {
        &self.service
    }

    /// Instantiate a registered action.
    pub fn new_action(&self, descriptor: &str, params: Value) -> ClientResult<Action> {
        Ok(self.registry.resolve(descriptor)?.new_instance(params))
    }

    pub fn enqueue(&self, action: Action) {
        self.service.enqueue_action(action);
    }

    /// Enqueue `actions` together and wait for all of them. Outcomes come
    /// back in input order.
    #[instrument(skip(self, actions), fields(actions = actions.len()))]
    pub async fn run_and_wait(&self, actions: Vec<Action>) -> Vec<ActionOutcome> {
        let waiters: Vec<Action> = actions.clone();
        self.service.run_actions(actions, || {});
        join_all(waiters.iter().map(Action::wait)).await
    }

    pub async fn is_action_in_storage(&self, descriptor: &str, params: &Value) -> bool {
        self.service.is_action_in_storage(descriptor, params).await
    }

    pub async fn revalidate_action(&self, descriptor: &str, params: &Value) -> bool {
        self.service.revalidate_action(descriptor, params).await
    }

    pub async fn invalidate_action(&self, descriptor: &str, params: &Value) -> ClientResult<bool> {
        self.service.invalidate_action(descriptor, params).await
    }

    pub fn token(&self) -> Option<String> {
        self.service.token()
    }

    pub fn reset_token(&self, token: impl Into<String>) {
        self.service.reset_token(token);
    }

    pub fn context(&self) -> Value {
        self.context.snapshot()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.service.snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<ClientEvent> {
        self.events.subscribe_stream()
    }
}
