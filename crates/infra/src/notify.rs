//! Outbound notifications (delivery status, inbound messages, session status).

use std::sync::Arc;

use tracing::warn;

use courier_events::{EventBus, Notification};

/// Where components push notifications.
///
/// Notifications are best-effort: a failed publish is logged and the state
/// change that caused it stands.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<B> NotificationSink for B
where
    B: EventBus<Notification>,
{
    fn notify(&self, notification: Notification) {
        let topic = notification.topic();
        let tenant_id = notification.tenant_id;
        if let Err(e) = self.publish(notification) {
            warn!(topic, tenant_id = %tenant_id, error = ?e, "failed to publish notification");
        }
    }
}

/// Sends every notification to several sinks (e.g. the local bus feeding
/// SSE clients and a Redis channel for other instances).
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.notify(notification.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{SessionId, TenantId};
    use courier_events::{InMemoryEventBus, NotificationKind};

    fn notification() -> Notification {
        Notification::new(
            TenantId::new(),
            SessionId::new("main").unwrap(),
            NotificationKind::SessionStatusChanged {
                status: "inactive".to_string(),
                reason: None,
            },
        )
    }

    #[test]
    fn event_buses_are_sinks() {
        let bus = Arc::new(InMemoryEventBus::<Notification>::new());
        let sub = bus.subscribe();
        let sink: Arc<dyn NotificationSink> = bus.clone();

        sink.notify(notification());
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(InMemoryEventBus::<Notification>::new());
        let b = Arc::new(InMemoryEventBus::<Notification>::new());
        let (sa, sb) = (a.subscribe(), b.subscribe());

        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.notify(notification());

        assert_eq!(sa.drain().len(), 1);
        assert_eq!(sb.drain().len(), 1);
    }
}
