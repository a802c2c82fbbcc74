use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How client-side actions of a pass are drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientExecution {
    /// All client actions run back-to-back on the turn that walked the queue.
    #[default]
    Synchronous,
    /// One client action per scheduled continuation.
    Cooperative,
}

/// When callbacks of actions answered from the cache run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredCompletion {
    /// As soon as the lookup resolves, inside the collection phase.
    #[default]
    Immediate,
    /// After the network flush of the pass, one per yield.
    AfterSend,
}

/// Controls the diagnostic detail of synthesized error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

/// Foreground batching window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub caboose_window: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            caboose_window: Duration::from_secs(60),
        }
    }
}

impl BatchPolicy {
    /// `foreground` counts every foreground action including cabooses.
    pub fn should_send_foreground(
        &self,
        foreground: usize,
        caboose: usize,
        since_last_send: Duration,
    ) -> bool {
        foreground > caboose || (caboose > 0 && since_last_send >= self.caboose_window)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub pool_size: usize,
    pub client_execution: ClientExecution,
    pub stored_completion: StoredCompletion,
    pub batch: BatchPolicy,
    pub request_timeout: Option<Duration>,
    /// Cached responses older than this are served and then refreshed.
    pub auto_refresh_interval: Duration,
    pub mode: Mode,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            client_execution: ClientExecution::Synchronous,
            stored_completion: StoredCompletion::Immediate,
            batch: BatchPolicy::default(),
            request_timeout: None,
            auto_refresh_interval: Duration::from_secs(30),
            mode: Mode::Development,
        }
    }
}

impl ServiceConfig {
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn client_execution(mut self, client_execution: ClientExecution) -> Self {
        self.client_execution = client_execution;
        self
    }

    pub fn stored_completion(mut self, stored_completion: StoredCompletion) -> Self {
        self.stored_completion = stored_completion;
        self
    }

    pub fn batch(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}
