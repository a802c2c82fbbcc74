use relay_protocol::EventBusPort;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

pub const CONNECTION_LOST: &str = "connectionLost";
pub const CONNECTION_RESUMED: &str = "connectionResumed";
pub const WAITING: &str = "waiting";
pub const DONE_WAITING: &str = "doneWaiting";
pub const REFRESH_BEGIN: &str = "refreshBegin";
pub const REFRESH_END: &str = "refreshEnd";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub name: String,
    pub payload: Value,
}

/// Broadcast event bus. An event has handlers while at least one subscriber
/// is attached.
#[derive(Debug, Clone)]
pub struct ClientEventHub {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for ClientEventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ClientEventHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl EventBusPort for ClientEventHub {
    fn fire(&self, name: &str, payload: Value) {
        debug!(event = name, "client event fired");
        self.publish(ClientEvent {
            name: name.to_owned(),
            payload,
        });
    }

    fn has_handlers(&self, _name: &str) -> bool {
        self.sender.receiver_count() > 0
    }
}
