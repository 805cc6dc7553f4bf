use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Coarse classification of the active network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Wired,
    Unknown,
}

/// Snapshot of the network path as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPath {
    /// Whether the network is currently usable at all.
    pub is_reachable: bool,
    /// Interface classification.
    pub connection_type: ConnectionType,
    /// Whether the path is metered/expensive (e.g. cellular data).
    pub is_expensive: bool,
}

impl NetworkPath {
    pub fn reachable(connection_type: ConnectionType) -> Self {
        Self {
            is_reachable: true,
            connection_type,
            is_expensive: matches!(connection_type, ConnectionType::Cellular),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            is_reachable: false,
            connection_type: ConnectionType::Unknown,
            is_expensive: false,
        }
    }
}

impl Default for NetworkPath {
    fn default() -> Self {
        Self::reachable(ConnectionType::Unknown)
    }
}

/// Observation source for network path changes.
///
/// The monitor never touches segment state; it only publishes the latest
/// path. Whatever platform hook watches the actual interface feeds
/// [`ReachabilityMonitor::update`], and the orchestrator reacts to the
/// resulting change notifications.
pub struct ReachabilityMonitor {
    tx: watch::Sender<NetworkPath>,
}

impl ReachabilityMonitor {
    pub fn new(initial: NetworkPath) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new path observation. Subscribers are only woken when the
    /// path actually changed.
    pub fn update(&self, path: NetworkPath) {
        self.tx.send_if_modified(|current| {
            if *current == path {
                return false;
            }
            info!(
                "network path changed: reachable={} type={:?} expensive={}",
                path.is_reachable, path.connection_type, path.is_expensive
            );
            *current = path;
            true
        });
    }

    /// The most recently observed path.
    pub fn current(&self) -> NetworkPath {
        *self.tx.borrow()
    }

    /// Subscribe to path changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(NetworkPath::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_and_current() {
        let monitor = ReachabilityMonitor::new(NetworkPath::unreachable());
        assert!(!monitor.current().is_reachable);

        monitor.update(NetworkPath::reachable(ConnectionType::Wifi));
        let path = monitor.current();
        assert!(path.is_reachable);
        assert_eq!(path.connection_type, ConnectionType::Wifi);
        assert!(!path.is_expensive);
    }

    #[tokio::test]
    async fn test_subscriber_sees_transitions() {
        let monitor = ReachabilityMonitor::new(NetworkPath::reachable(ConnectionType::Wired));
        let mut rx = monitor.subscribe();

        monitor.update(NetworkPath::unreachable());
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_reachable);

        monitor.update(NetworkPath::reachable(ConnectionType::Cellular));
        rx.changed().await.unwrap();
        let path = *rx.borrow();
        assert!(path.is_reachable);
        assert!(path.is_expensive);
    }

    #[tokio::test]
    async fn test_redundant_update_does_not_notify() {
        let monitor = ReachabilityMonitor::new(NetworkPath::reachable(ConnectionType::Wifi));
        let mut rx = monitor.subscribe();

        monitor.update(NetworkPath::reachable(ConnectionType::Wifi));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_cellular_is_expensive() {
        assert!(NetworkPath::reachable(ConnectionType::Cellular).is_expensive);
        assert!(!NetworkPath::reachable(ConnectionType::Wifi).is_expensive);
    }
}
