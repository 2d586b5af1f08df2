// WG Tunnel Manager - Event Bus
// Broadcasts tunnel events to every subscriber (SSE clients, the log task)

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::trace;
use wg_tunnel_common::TunnelEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
    /// Replayed to each new subscriber
    privilege_warning: Arc<RwLock<Option<String>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            privilege_warning: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TunnelEvent) {
        // Err only means nobody is listening
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn status(&self, name: &str, active: bool) {
        self.publish(TunnelEvent::status(name, active));
    }

    pub fn failure(&self, name: &str, active: bool, error: impl Into<String>) {
        self.publish(TunnelEvent::failure(name, active, error));
    }

    pub fn set_privilege_warning(&self, message: String) {
        *self
            .privilege_warning
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(message.clone());
        self.publish(TunnelEvent::privilege_warning(message));
    }

    pub fn privilege_warning(&self) -> Option<String> {
        self.privilege_warning
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.failure("office", false, "boom");
        match rx.recv().await.unwrap() {
            TunnelEvent::TunnelStatus { name, success, error, .. } => {
                assert_eq!(name, "office");
                assert!(!success);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_privilege_warning_is_retained() {
        let bus = EventBus::new(8);
        assert!(bus.privilege_warning().is_none());
        bus.set_privilege_warning("not elevated".to_string());
        assert_eq!(bus.privilege_warning().as_deref(), Some("not elevated"));
    }
}
