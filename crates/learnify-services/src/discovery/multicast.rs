//! UDP multicast advertisement transport.
//!
//! Announcements are JSON datagrams (see `learnify_core::wire::Announcement`)
//! sent to an IPv4 multicast group on a fixed interval. Browsing joins the
//! same group; the datagram's source address becomes the resolved address.
//! A withdraw datagram or `peer_ttl` of silence produces a removal.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use learnify_core::config::NetworkConfig;
use learnify_core::wire::Announcement;

use super::{AdvertTransport, BrowseEvent, ResolvedService, ServiceRecord};
use crate::error::DiscoveryError;

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval: Duration,
    pub peer_ttl: Duration,
}

impl From<&NetworkConfig> for MulticastConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            group: network.multicast_group,
            port: network.announce_port,
            interval: Duration::from_secs(network.announce_interval_secs.max(1)),
            peer_ttl: Duration::from_secs(network.peer_ttl_secs.max(1)),
        }
    }
}

struct Advert {
    instance: String,
    task: JoinHandle<()>,
}

pub struct MulticastTransport {
    config: MulticastConfig,
    advert: Mutex<Option<Advert>>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastTransport {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            config,
            advert: Mutex::new(None),
            browse_task: Mutex::new(None),
        }
    }

    fn dest(&self) -> SocketAddr {
        SocketAddrV4::new(self.config.group, self.config.port).into()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AdvertTransport for MulticastTransport {
    fn register(&self, record: ServiceRecord) -> Result<(), DiscoveryError> {
        let datagram =
            Announcement::announce(&record.instance, &record.host, record.port, record.txt)
                .encode()?;
        let socket = make_sender_socket().map_err(DiscoveryError::Socket)?;
        let socket = UdpSocket::from_std(socket).map_err(DiscoveryError::Socket)?;

        let task = tokio::spawn(announce_loop(socket, self.dest(), datagram, self.config.interval));
        let previous = lock(&self.advert).replace(Advert {
            instance: record.instance,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    /// Stop announcing and tell listeners right away.
    fn unregister(&self) -> Result<(), DiscoveryError> {
        let advert = lock(&self.advert)
            .take()
            .ok_or(DiscoveryError::NotPublished)?;
        advert.task.abort();

        let datagram = Announcement::withdraw(&advert.instance).encode()?;
        let socket = make_sender_socket().map_err(DiscoveryError::Socket)?;
        socket
            .send_to(&datagram, self.dest())
            .map_err(DiscoveryError::Send)?;
        Ok(())
    }

    fn browse(&self) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let socket =
            make_listener_socket(self.config.group, self.config.port).map_err(DiscoveryError::Socket)?;
        let socket = UdpSocket::from_std(socket).map_err(DiscoveryError::Socket)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(listener_loop(socket, tx, self.config.peer_ttl));
        if let Some(previous) = lock(&self.browse_task).replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    fn stop_browse(&self) {
        if let Some(task) = lock(&self.browse_task).take() {
            task.abort();
        }
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        if let Some(advert) = lock(&self.advert).take() {
            advert.task.abort();
        }
        self.stop_browse();
    }
}

/// Send the same announcement every `interval` until aborted.
async fn announce_loop(socket: UdpSocket, dest: SocketAddr, datagram: Vec<u8>, interval: Duration) {
    let mut ticker = time::interval(interval);
    tracing::info!(%dest, interval_secs = interval.as_secs(), "advertisement broadcast starting");

    loop {
        ticker.tick().await;
        match socket.send_to(&datagram, dest).await {
            Ok(n) => tracing::trace!(bytes = n, "advertisement sent"),
            Err(e) => tracing::warn!(error = %e, "advertisement send failed"),
        }
    }
}

/// Receive announcements and expire silent instances. Ends when the
/// browse channel is dropped.
async fn listener_loop(socket: UdpSocket, tx: mpsc::UnboundedSender<BrowseEvent>, ttl: Duration) {
    let mut buf = vec![0u8; 2048];
    let mut last_seen: HashMap<String, Instant> = HashMap::new();
    let mut sweep = time::interval(Duration::from_secs(1));

    tracing::info!(ttl_secs = ttl.as_secs(), "advertisement listener starting");

    while !tx.is_closed() {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        let _ = tx.send(BrowseEvent::Error(e.to_string()));
                        continue;
                    }
                };
                if let Some(event) = handle_datagram(&buf[..len], from, &mut last_seen) {
                    let _ = tx.send(event);
                }
            }
            _ = sweep.tick() => {
                for name in expire(&mut last_seen, ttl) {
                    tracing::debug!(instance = %name, "advertisement expired");
                    let _ = tx.send(BrowseEvent::Removed(name));
                }
            }
        }
    }
}

fn handle_datagram(
    datagram: &[u8],
    from: SocketAddr,
    last_seen: &mut HashMap<String, Instant>,
) -> Option<BrowseEvent> {
    match Announcement::decode(datagram) {
        Ok(Announcement::Announce {
            instance,
            host,
            port,
            txt,
            ..
        }) => {
            last_seen.insert(instance.clone(), Instant::now());
            Some(BrowseEvent::Resolved(ResolvedService {
                instance,
                host,
                addresses: vec![from.ip().to_string()],
                port,
                txt,
            }))
        }
        Ok(Announcement::Withdraw { instance, .. }) => last_seen
            .remove(&instance)
            .map(|_| BrowseEvent::Removed(instance)),
        Err(e) => {
            tracing::trace!(%from, error = %e, "ignoring datagram");
            None
        }
    }
}

fn expire(last_seen: &mut HashMap<String, Instant>, ttl: Duration) -> Vec<String> {
    let expired: Vec<String> = last_seen
        .iter()
        .filter(|(_, seen)| seen.elapsed() >= ttl)
        .map(|(name, _)| name.clone())
        .collect();
    for name in &expired {
        last_seen.remove(name);
    }
    expired
}

/// UDP socket for sending to the group. TTL 1 keeps it on the local link.
fn make_sender_socket() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    Ok(socket.into())
}

/// UDP socket bound to the announce port and joined to the group.
fn make_listener_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}
