//! Notifier that keeps every message it is handed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use critiq_billing_core::{Channel, Notifier, NotifyError, OutboundMessage, TemplateKind};

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every delivery from now on (the attempt is still recorded)
    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<(Channel, TemplateKind)> {
        self.sent()
            .into_iter()
            .map(|m| (m.channel, m.template))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(message.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected(503));
        }
        Ok(())
    }
}
