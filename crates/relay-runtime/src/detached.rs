use std::future::Future;

use relay_protocol::ClientResult;
use tokio::runtime::Handle;
use tracing::warn;

/// Run `task` in the background. Its failure is logged and goes nowhere else.
pub(crate) fn spawn_detached<F>(handle: &Handle, label: &'static str, task: F)
where
    F: Future<Output = ClientResult<()>> + Send + 'static,
{
    handle.spawn(async move {
        if let Err(error) = task.await {
            warn!(task = label, error = %error, "detached task failed");
        }
    });
}
