//! 影像到达通知
//!
//! 入站C-STORE写入影像后广播检查UID，等待中的检索据此提前醒来复查本地库。

use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ArrivalNotifier {
    sender: broadcast::Sender<String>,
}

impl ArrivalNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// 没有订阅者时静默丢弃
    pub fn notify(&self, study_instance_uid: &str) {
        let receivers = self.sender.send(study_instance_uid.to_string()).unwrap_or(0);
        trace!(study_instance_uid, receivers, "影像到达通知");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for ArrivalNotifier {
    fn default() -> Self {
        Self::new()
    }
}
