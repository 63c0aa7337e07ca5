use async_trait::async_trait;
use tracing::info;

/// Outbound status updates back to the originating thread. Notification
/// failures never affect job state; the store is the source of truth and
/// is always written first.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, thread_id: &str, message: &str);
}

/// Default notifier: structured log lines. A chat-platform implementation
/// slots in behind the same trait.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, thread_id: &str, message: &str) {
        info!(thread_id, message, "Thread notification");
    }
}
