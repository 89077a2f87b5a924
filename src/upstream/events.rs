//! Upstream connection events for status broadcasting.
//!
//! Uses `tokio::sync::broadcast` so any number of observers (the startup
//! logger, tests waiting for a state change) can watch the connection
//! manager without coupling to it. Persistence of these observations is a
//! separate concern handled by the event buffer.

use tokio::sync::broadcast;

/// Connection lifecycle event emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// Connection attempt started.
    Connecting {
        /// Server name
        name: String,
        /// Upstream MCP endpoint URL
        url: String,
    },

    /// Successfully connected and tools discovered.
    Connected {
        /// Server name
        name: String,
        /// Upstream MCP endpoint URL
        url: String,
        /// Number of aggregated tools discovered
        tool_count: usize,
    },

    /// Connection attempt or upstream call failed.
    ConnectionError {
        /// Server name
        name: String,
        /// Error message
        error: String,
    },

    /// Server left the connected state (explicit disconnect or health trip).
    Disconnected {
        /// Server name
        name: String,
        /// What caused the disconnect
        reason: String,
    },

    /// Tool list rebuilt for a connected server.
    ToolsLoaded {
        /// Server name
        name: String,
        /// New tool count
        tool_count: usize,
    },

    /// One health-loop probe completed.
    HealthCheck {
        /// Server name
        name: String,
        /// Whether the probe succeeded
        healthy: bool,
    },
}

impl RouterEvent {
    /// Get the server name from any event variant.
    pub fn name(&self) -> &str {
        match self {
            RouterEvent::Connecting { name, .. } => name,
            RouterEvent::Connected { name, .. } => name,
            RouterEvent::ConnectionError { name, .. } => name,
            RouterEvent::Disconnected { name, .. } => name,
            RouterEvent::ToolsLoaded { name, .. } => name,
            RouterEvent::HealthCheck { name, .. } => name,
        }
    }

    /// Returns true for failure events.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RouterEvent::ConnectionError { .. } | RouterEvent::HealthCheck { healthy: false, .. }
        )
    }
}

/// Broadcast sender for router events.
///
/// Clone freely; sending to zero receivers silently succeeds.
#[derive(Clone)]
pub struct RouterEventSender {
    tx: broadcast::Sender<RouterEvent>,
}

impl RouterEventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to all subscribers, ignoring lag and absence.
    pub fn send(&self, event: RouterEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> RouterEventReceiver {
        RouterEventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for RouterEventSender {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Receiver for router events. A lagged receiver skips missed events
/// rather than blocking the sender.
pub struct RouterEventReceiver {
    rx: broadcast::Receiver<RouterEvent>,
}

impl RouterEventReceiver {
    /// Receive the next event, waiting asynchronously. `None` when the
    /// sender is gone.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<RouterEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_and_error_flag() {
        let connected = RouterEvent::Connected {
            name: "calc".into(),
            url: "http://u:1/mcp".into(),
            tool_count: 2,
        };
        assert_eq!(connected.name(), "calc");
        assert!(!connected.is_error());

        let failed = RouterEvent::ConnectionError {
            name: "calc".into(),
            error: "connection refused".into(),
        };
        assert!(failed.is_error());

        let unhealthy = RouterEvent::HealthCheck {
            name: "calc".into(),
            healthy: false,
        };
        assert!(unhealthy.is_error());
    }

    #[tokio::test]
    async fn test_broadcast_to_multiple_subscribers() {
        let sender = RouterEventSender::default();
        let mut rx1 = sender.subscribe();
        let mut rx2 = sender.subscribe();

        sender.send(RouterEvent::Disconnected {
            name: "calc".into(),
            reason: "admin".into(),
        });

        assert_eq!(rx1.recv().await.unwrap().name(), "calc");
        assert_eq!(rx2.recv().await.unwrap().name(), "calc");
    }

    #[test]
    fn test_send_without_receivers() {
        let sender = RouterEventSender::new(4);
        sender.send(RouterEvent::Connecting {
            name: "calc".into(),
            url: "http://u:1/mcp".into(),
        });
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let sender = RouterEventSender::default();
        let mut rx = sender.subscribe();
        assert!(rx.try_recv().is_none());

        sender.send(RouterEvent::ToolsLoaded {
            name: "calc".into(),
            tool_count: 3,
        });
        assert!(rx.try_recv().is_some());
        assert!(rx.try_recv().is_none());
    }
}
