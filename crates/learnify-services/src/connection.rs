//! Pairing state with the desktop server.

use std::sync::{Arc, RwLock};

/// Where desktop-origin downloads get their server URL from. Read once per
/// item, at the moment the item is started.
pub trait SessionSource: Send + Sync {
    fn server_url(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct Pairing {
    server_url: Option<String>,
    server_name: Option<String>,
}

#[derive(Clone, Default)]
pub struct ServerConnection {
    pairing: Arc<RwLock<Pairing>>,
}

impl ServerConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair with the server at `url`. A trailing slash is dropped.
    pub fn set_server_url(&self, url: &str) {
        let url = url.trim().trim_end_matches('/').to_string();
        let mut pairing = self.write();
        pairing.server_url = (!url.is_empty()).then_some(url);
        tracing::info!(server_url = ?pairing.server_url, "desktop server set");
    }

    pub fn set_server_name(&self, name: &str) {
        self.write().server_name = Some(name.to_string());
    }

    pub fn server_name(&self) -> Option<String> {
        self.read().server_name.clone()
    }

    pub fn disconnect(&self) {
        *self.write() = Pairing::default();
        tracing::info!("desktop server disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.read().server_url.is_some()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Pairing> {
        self.pairing.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Pairing> {
        self.pairing.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionSource for ServerConnection {
    fn server_url(&self) -> Option<String> {
        self.read().server_url.clone()
    }
}
