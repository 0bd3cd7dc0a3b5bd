//! Advertiser/Scanner: presence on the local network.
//!
//! `Discovery` owns the transport-independent part: what we advertise, how a
//! resolved advertisement becomes a `Peer`, and the registry of peers seen
//! during the current scan. The wire side is behind `AdvertTransport`;
//! `multicast` is the UDP implementation used by the daemon.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use learnify_core::wire::TXT_ITEM_COUNT;
use learnify_core::Peer;

use crate::error::DiscoveryError;

pub mod multicast;
pub mod presence;

// ── Transport seam ────────────────────────────────────────────────────────────

/// What this device advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub instance: String,
    /// Advertised host name. Receivers prefer the datagram's source address.
    pub host: String,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
}

/// An advertisement as seen by the browsing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub instance: String,
    pub host: String,
    /// Every address the advertisement was seen from, as strings.
    pub addresses: Vec<String>,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(ResolvedService),
    Removed(String),
    Error(String),
}

pub trait AdvertTransport: Send + Sync {
    /// Start advertising `record`, replacing any previous advertisement.
    fn register(&self, record: ServiceRecord) -> Result<(), DiscoveryError>;
    fn unregister(&self) -> Result<(), DiscoveryError>;
    fn browse(&self) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError>;
    fn stop_browse(&self);
}

// ── Scanner output ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// New or changed peer. Same name means same peer: upsert.
    Found(Peer),
    Lost(String),
    Error(String),
}

/// Peers seen during the current scan, keyed by advertised name.
pub type PeerRegistry = Arc<DashMap<String, Peer>>;

/// Turn a resolved advertisement into a `Peer`.
///
/// Returns `None` for our own advertisement. The first IPv4-looking address
/// wins; with none, the advertised host is used as is.
pub fn resolve_peer(device_name: &str, service: &ResolvedService) -> Option<Peer> {
    if service.instance == device_name {
        return None;
    }

    let host = service
        .addresses
        .iter()
        .find(|addr| addr.contains('.') && !addr.contains(':'))
        .cloned()
        .unwrap_or_else(|| service.host.clone());

    let item_count = service
        .txt
        .get(TXT_ITEM_COUNT)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    Some(Peer {
        name: service.instance.clone(),
        host,
        port: service.port,
        item_count,
    })
}

pub struct Discovery {
    device_name: String,
    transport: Arc<dyn AdvertTransport>,
    peers: PeerRegistry,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(device_name: impl Into<String>, transport: Arc<dyn AdvertTransport>) -> Self {
        Self {
            device_name: device_name.into(),
            transport,
            peers: Arc::new(DashMap::new()),
            scan_task: Mutex::new(None),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Advertise this device. Calling again replaces the advertisement.
    ///
    /// Failures go to `on_error`, never to the caller.
    pub fn publish(&self, port: u16, item_count: u32, on_error: impl FnOnce(DiscoveryError)) {
        let mut txt = BTreeMap::new();
        txt.insert(TXT_ITEM_COUNT.to_string(), item_count.to_string());
        let record = ServiceRecord {
            instance: self.device_name.clone(),
            host: format!("{}.local", self.device_name.replace(' ', "-")),
            port,
            txt,
        };

        match self.transport.register(record) {
            Ok(()) => tracing::info!(name = %self.device_name, port, item_count, "advertisement published"),
            Err(e) => on_error(e),
        }
    }

    /// Withdraw the advertisement. Nothing published is not an error.
    pub fn unpublish(&self) {
        match self.transport.unregister() {
            Ok(()) => tracing::info!(name = %self.device_name, "advertisement withdrawn"),
            Err(e) => tracing::debug!(error = %e, "unpublish ignored"),
        }
    }

    /// Start browsing. Restarts an existing scan.
    ///
    /// The returned channel carries found/lost events until `stop`. Our own
    /// advertisement is filtered out, and a re-resolution that changes
    /// nothing is not reported again.
    pub fn scan(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        self.stop();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut browse = match self.transport.browse() {
            Ok(browse) => browse,
            Err(e) => {
                tracing::warn!(error = %e, "scan failed to start");
                let _ = tx.send(ScanEvent::Error(e.to_string()));
                return rx;
            }
        };

        let device_name = self.device_name.clone();
        let peers = self.peers.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = browse.recv().await {
                let out = match event {
                    BrowseEvent::Resolved(service) => {
                        let Some(peer) = resolve_peer(&device_name, &service) else {
                            tracing::trace!("ignoring own advertisement");
                            continue;
                        };
                        let previous = peers.insert(peer.name.clone(), peer.clone());
                        if previous.as_ref() == Some(&peer) {
                            continue;
                        }
                        tracing::info!(peer = %peer.name, host = %peer.host, port = peer.port, items = peer.item_count, "peer found");
                        ScanEvent::Found(peer)
                    }
                    BrowseEvent::Removed(name) => {
                        if peers.remove(&name).is_none() {
                            continue;
                        }
                        tracing::info!(peer = %name, "peer lost");
                        ScanEvent::Lost(name)
                    }
                    BrowseEvent::Error(message) => {
                        tracing::warn!(error = %message, "browse error");
                        ScanEvent::Error(message)
                    }
                };
                // The registry stays current even with nobody listening.
                let _ = tx.send(out);
            }
        });

        *self.scan_slot() = Some(task);
        rx
    }

    /// Stop browsing and forget every peer. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(task) = self.scan_slot().take() {
            task.abort();
            self.transport.stop_browse();
            tracing::debug!("scan stopped");
        }
        self.peers.clear();
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn peer(&self, name: &str) -> Option<Peer> {
        self.peers.get(name).map(|e| e.value().clone())
    }

    fn scan_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.scan_task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}
