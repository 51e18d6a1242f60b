use std::{
    fmt::{Display, Error, Formatter},
    net::SocketAddr,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use quinn::Connection;

use ghostchain_common::{crypto::hash, time::get_current_time_in_seconds};

use crate::config::PEER_RATE_LIMIT_PER_SEC;

/// Lifecycle of a peer table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    Failed = 3,
}

impl PeerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerStatus::Connecting,
            1 => PeerStatus::Connected,
            2 => PeerStatus::Disconnected,
            _ => PeerStatus::Failed,
        }
    }
}

/// 64-bit peer id: first 8 bytes of `sha256(ip_octets ‖ port)`.
pub fn peer_id(addr: &SocketAddr) -> u64 {
    let mut bytes = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
    }
    bytes.extend_from_slice(&addr.port().to_le_bytes());
    hash(&bytes).low_u64()
}

/// One connected peer: the QUIC connection plus the bookkeeping the
/// manager and the gossip layer need. All mutable fields are atomics so
/// readers never block the connection tasks.
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    connection: Connection,
    status: AtomicU8,
    // seconds since epoch of the last message from this peer
    last_seen: AtomicU64,
    // advertised chain height, updated by sync responses
    height: AtomicU64,
    protocol_version: String,
    // announcement rate limiting, one counting window per second
    window_count: AtomicU32,
    window_start: AtomicU64,
}

impl Peer {
    pub fn new(addr: SocketAddr, connection: Connection, protocol_version: String) -> Self {
        Self {
            id: peer_id(&addr),
            addr,
            connection,
            status: AtomicU8::new(PeerStatus::Connected as u8),
            last_seen: AtomicU64::new(get_current_time_in_seconds()),
            height: AtomicU64::new(0),
            protocol_version,
            window_count: AtomicU32::new(0),
            window_start: AtomicU64::new(get_current_time_in_seconds()),
        }
    }

    pub fn get_id(&self) -> u64 {
        self.id
    }

    pub fn get_addr(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn get_status(&self) -> PeerStatus {
        PeerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: PeerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.get_status() == PeerStatus::Connected
    }

    pub fn get_protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn get_last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Acquire)
    }

    /// Record traffic from this peer.
    pub fn touch(&self) {
        self.last_seen
            .store(get_current_time_in_seconds(), Ordering::Release);
    }

    pub fn get_height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Release);
    }

    /// Count one inbound announcement against the per-second window.
    /// Returns false once the peer exceeds the limit; the caller closes
    /// the stream.
    pub fn register_announcement(&self) -> bool {
        let now = get_current_time_in_seconds();
        let window = self.window_start.load(Ordering::Acquire);
        if now != window {
            self.window_start.store(now, Ordering::Release);
            self.window_count.store(1, Ordering::Release);
            return true;
        }
        self.window_count.fetch_add(1, Ordering::AcqRel) < PEER_RATE_LIMIT_PER_SEC
    }

    /// Close the underlying connection and mark the entry.
    pub fn close(&self, status: PeerStatus) {
        self.set_status(status);
        self.connection.close(0u32.into(), b"closing");
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "Peer[{:016x} @ {} {:?} height {}]",
            self.id,
            self.addr,
            self.get_status(),
            self.get_height()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_deterministic() {
        let a: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(peer_id(&a), peer_id(&b));
    }

    #[test]
    fn test_peer_id_depends_on_port() {
        let a: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:7778".parse().unwrap();
        assert_ne!(peer_id(&a), peer_id(&b));
    }
}
