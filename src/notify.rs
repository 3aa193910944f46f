//! Best-effort checkout signals for notification and analytics consumers.

use tokio::sync::broadcast;
use tracing::{debug, warn};
use crate::domain::events::CheckoutEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Fans events out to in-process subscribers and, when connected, to NATS.
/// Emitting never blocks and never fails the caller.
#[derive(Clone)]
pub struct Signals {
    tx: broadcast::Sender<CheckoutEvent>,
    nats: Option<async_nats::Client>,
}

impl Signals {
    pub fn new(nats: Option<async_nats::Client>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, nats }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckoutEvent> { self.tx.subscribe() }

    pub fn emit(&self, event: CheckoutEvent) {
        // no receivers is not an error
        let _ = self.tx.send(event.clone());
        let Some(client) = self.nats.clone() else { return };
        tokio::spawn(async move {
            let subject = event.subject();
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(subject, error = %e, "Failed to encode checkout signal");
                    return;
                }
            };
            match client.publish(subject.to_string(), payload.into()).await {
                Ok(()) => debug!(subject, "Published checkout signal"),
                Err(e) => warn!(subject, error = %e, "Failed to publish checkout signal"),
            }
        });
    }
}

impl Default for Signals {
    fn default() -> Self { Self::new(None) }
}
