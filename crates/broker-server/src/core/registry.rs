use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// One accepted connection's identity plus a token that lets the registry
/// (or an admin command, in a future iteration) tear it down independently of
/// the whole-server shutdown token.
pub struct ConnectionHandle {
    pub id: String,
    pub peer_addr: SocketAddr,
    pub cancel: CancellationToken,
}

/// Tracks every currently-connected client. Exists so the server can report
/// an accurate connection count and, on shutdown, cancel every connection's
/// token instead of relying solely on socket teardown.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self { connections: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, id: String, peer_addr: SocketAddr, parent: &CancellationToken) -> CancellationToken {
        let cancel = parent.child_token();
        let mut connections = self.connections.lock().expect("registry mutex poisoned");
        connections.insert(id.clone(), ConnectionHandle { id, peer_addr, cancel: cancel.clone() });
        cancel
    }

    pub fn deregister(&self, id: &str) {
        self.connections.lock().expect("registry mutex poisoned").remove(id);
    }

    pub fn count(&self) -> usize {
        self.connections.lock().expect("registry mutex poisoned").len()
    }

    pub fn disconnect_all(&self) {
        let connections = self.connections.lock().expect("registry mutex poisoned");
        for handle in connections.values() {
            handle.cancel.cancel();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister_tracks_count() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        registry.register("conn-1".to_string(), addr, &parent);
        assert_eq!(registry.count(), 1);
        registry.deregister("conn-1");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn disconnect_all_cancels_every_child_token() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let token = registry.register("conn-1".to_string(), addr, &parent);
        assert!(!token.is_cancelled());
        registry.disconnect_all();
        assert!(token.is_cancelled());
    }
}
