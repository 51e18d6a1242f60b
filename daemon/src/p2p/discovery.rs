//! IPv6 multicast peer discovery.
//!
//! Every round the node multicasts a `PeerDiscovery` beacon with its id,
//! QUIC port and version; listeners answer with a unicast `PeerResponse`
//! carrying the peers they know. Both directions feed the candidate
//! pool from which the peer manager dials.

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use log::{debug, trace, warn};
use tokio::net::UdpSocket;

use ghostchain_common::{config::VERSION, time::get_current_time_in_millis};

use crate::{
    config::{DISCOVERY_MULTICAST_GROUP, DISCOVERY_PEER_LIMIT, DISCOVERY_PORT},
    core::storage::Storage,
};

use super::{
    error::P2pError,
    packet::{Envelope, Packet, PeerDiscovery, PeerResponse},
    P2pServer,
};

// discovery beacons are tiny, anything larger is garbage
const MAX_DATAGRAM_SIZE: usize = 1280;

/// Two nodes can talk when their major versions match.
fn compatible_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    major(version) == major(VERSION)
}

pub struct DiscoveryService<S: Storage> {
    server: Arc<P2pServer<S>>,
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    p2p_port: u16,
}

impl<S: Storage> DiscoveryService<S> {
    /// Bind the discovery socket, join the multicast group and spawn the
    /// listener task.
    pub async fn start(
        server: Arc<P2pServer<S>>,
        p2p_port: u16,
    ) -> Result<Arc<Self>, P2pError> {
        let group_ip: Ipv6Addr = DISCOVERY_MULTICAST_GROUP
            .parse()
            .expect("valid multicast group constant");
        let socket = UdpSocket::bind((IpAddr::V6(Ipv6Addr::UNSPECIFIED), DISCOVERY_PORT)).await?;
        socket.join_multicast_v6(&group_ip, 0)?;

        let service = Arc::new(Self {
            server,
            socket: Arc::new(socket),
            group: SocketAddr::new(IpAddr::V6(group_ip), DISCOVERY_PORT),
            p2p_port,
        });
        service.clone().spawn_listener();
        Ok(service)
    }

    /// Multicast one discovery beacon; called every discovery round.
    pub async fn announce(&self) {
        let envelope = Envelope::new(
            self.server.get_node_id().clone(),
            get_current_time_in_millis(),
            Packet::PeerDiscovery(PeerDiscovery {
                node_id: self.server.get_node_id().clone(),
                port: self.p2p_port,
                version: VERSION.to_string(),
            }),
        );
        if let Err(e) = self.socket.send_to(&envelope.encode(), self.group).await {
            warn!("discovery announce failed: {}", e);
        }
    }

    fn spawn_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut exit = self.server.subscribe_exit();
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    received = self.socket.recv_from(&mut buffer) => {
                        let (len, from) = match received {
                            Ok(received) => received,
                            Err(e) => {
                                warn!("discovery socket error: {}", e);
                                break;
                            }
                        };
                        if let Err(e) = self.handle_datagram(&buffer[..len], from).await {
                            trace!("discarded discovery datagram from {}: {}", from, e);
                        }
                    }
                }
            }
            debug!("discovery listener exited");
        });
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Result<(), P2pError> {
        let envelope = Envelope::decode(bytes)?;
        if &envelope.sender_id == self.server.get_node_id() {
            // our own multicast came back around
            return Ok(());
        }
        match envelope.packet {
            Packet::PeerDiscovery(discovery) => {
                if !compatible_version(&discovery.version) {
                    debug!(
                        "ignoring peer {} with incompatible version {}",
                        from, discovery.version
                    );
                    return Ok(());
                }
                let candidate = SocketAddr::new(from.ip(), discovery.port);
                self.server.add_candidate(candidate).await;

                // answer with the peers we know
                let peers = self
                    .server
                    .connected_peers()
                    .await
                    .iter()
                    .take(DISCOVERY_PEER_LIMIT)
                    .map(|peer| *peer.get_addr())
                    .collect();
                let response = Envelope::new(
                    self.server.get_node_id().clone(),
                    get_current_time_in_millis(),
                    Packet::PeerResponse(PeerResponse {
                        node_id: self.server.get_node_id().clone(),
                        peers,
                    }),
                );
                self.socket.send_to(&response.encode(), from).await?;
                Ok(())
            }
            Packet::PeerResponse(response) => {
                for addr in response.peers {
                    self.server.add_candidate(addr).await;
                }
                Ok(())
            }
            other => Err(P2pError::UnexpectedPacket {
                expected: super::packet::packet_type::PEER_DISCOVERY,
                got: other.tag(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        assert!(compatible_version(VERSION));
        assert!(!compatible_version("999.0.0"));
    }
}
