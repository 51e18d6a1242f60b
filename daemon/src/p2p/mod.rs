pub mod discovery;
pub mod error;
pub mod packet;
pub mod peer;
mod sync;

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use lru::LruCache;
use quinn::{
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
    ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    time::timeout,
};

use ghostchain_common::{
    config::VERSION,
    crypto::Hash,
    time::{get_current_time_in_millis, get_current_time_in_seconds},
};

use crate::{
    config::{
        GOSSIP_SEEN_CACHE_SIZE, PEER_DIAL_BACKOFF_BASE_SECS, PEER_DIAL_BACKOFF_CAP_SECS,
        PEER_DIAL_TIMEOUT_MILLIS, PEER_IDLE_TIMEOUT_SECS, PEER_MAX_PAYLOAD_SIZE,
        PEER_STREAM_READ_TIMEOUT_MILLIS, P2P_ALPN,
    },
    core::{blockchain::Blockchain, storage::Storage},
};

use self::{
    error::P2pError,
    packet::{Envelope, Packet, ENVELOPE_HEADER_SIZE},
    peer::{peer_id, Peer, PeerStatus},
};

// The QUIC server name peers dial; certificates are self-signed and not
// verified, identity comes from the protocol layer
const SERVER_NAME: &str = "ghostchain";

struct DialState {
    fails: u32,
    next_attempt: Instant,
}

/// QUIC peer manager: owns the endpoint, the bounded peer table and the
/// candidate pool, and provides the framed send / request primitives the
/// gossip and sync layers are built on.
pub struct P2pServer<S: Storage> {
    node_id: Hash,
    endpoint: Endpoint,
    blockchain: Arc<Blockchain<S>>,
    peer_list: RwLock<HashMap<u64, Arc<Peer>>>,
    candidates: Mutex<VecDeque<SocketAddr>>,
    dial_states: Mutex<HashMap<SocketAddr, DialState>>,
    // recently seen announcement hashes, receiver-side duplicate
    // suppression with a TTL
    seen: Mutex<LruCache<Hash, Instant>>,
    max_peers: usize,
    max_connections: usize,
    exit: broadcast::Sender<()>,
}

impl<S: Storage> P2pServer<S> {
    /// Bind the QUIC listener and spawn the accept and gossip tasks.
    pub fn start(
        blockchain: Arc<Blockchain<S>>,
        node_id: Hash,
        bind_addr: SocketAddr,
        max_peers: usize,
        max_connections: usize,
    ) -> Result<Arc<Self>, P2pError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let endpoint = Self::build_endpoint(provider, bind_addr)?;
        info!("p2p listening on {} (ALPN ghostchain/1.0)", bind_addr);

        let (exit, _) = broadcast::channel(1);
        let server = Arc::new(Self {
            node_id,
            endpoint,
            blockchain,
            peer_list: RwLock::new(HashMap::new()),
            candidates: Mutex::new(VecDeque::new()),
            dial_states: Mutex::new(HashMap::new()),
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(GOSSIP_SEEN_CACHE_SIZE).unwrap(),
            )),
            max_peers,
            max_connections,
            exit,
        });

        server.clone().spawn_accept_task();
        server.clone().spawn_gossip_tasks();
        Ok(server)
    }

    fn build_endpoint(
        provider: Arc<CryptoProvider>,
        bind_addr: SocketAddr,
    ) -> Result<Endpoint, P2pError> {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
        let cert_chain = vec![certified.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let mut server_crypto = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        server_crypto.alpn_protocols = vec![P2P_ALPN.to_vec()];

        let mut client_crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![P2P_ALPN.to_vec()];

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_secs(PEER_IDLE_TIMEOUT_SECS)
                .try_into()
                .map_err(|_| P2pError::Crypto("idle timeout out of range".into()))?,
        ));
        transport.keep_alive_interval(Some(Duration::from_secs(15)));
        let transport = Arc::new(transport);

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(server_crypto).map_err(|e| P2pError::Crypto(e.to_string()))?,
        ));
        server_config.transport_config(transport.clone());

        let mut client_config = ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(client_crypto).map_err(|e| P2pError::Crypto(e.to_string()))?,
        ));
        client_config.transport_config(transport);

        let mut endpoint = Endpoint::server(server_config, bind_addr)?;
        endpoint.set_default_client_config(client_config);
        Ok(endpoint)
    }

    pub fn get_node_id(&self) -> &Hash {
        &self.node_id
    }

    pub fn get_blockchain(&self) -> &Arc<Blockchain<S>> {
        &self.blockchain
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit.subscribe()
    }

    fn spawn_accept_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut exit = self.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    incoming = self.endpoint.accept() => {
                        let Some(incoming) = incoming else { break };
                        if self.peer_count().await >= self.max_connections {
                            debug!("connection limit reached, refusing {}", incoming.remote_address());
                            incoming.refuse();
                            continue;
                        }
                        let server = self.clone();
                        tokio::spawn(async move {
                            match incoming.await {
                                Ok(connection) => {
                                    let addr = connection.remote_address();
                                    if let Err(e) = server.register_peer(connection).await {
                                        debug!("rejected inbound connection from {}: {}", addr, e);
                                    }
                                }
                                Err(e) => debug!("inbound handshake failed: {}", e),
                            }
                        });
                    }
                }
            }
            debug!("p2p accept task exited");
        });
    }

    /// Dial a remote peer with timeout and exponential backoff tracking.
    pub async fn connect_to(self: &Arc<Self>, addr: SocketAddr) -> Result<(), P2pError> {
        {
            let peers = self.peer_list.read().await;
            if peers.contains_key(&peer_id(&addr)) {
                return Ok(());
            }
            if peers.len() >= self.max_peers {
                return Err(P2pError::PeerTableFull);
            }
        }
        {
            let dial_states = self.dial_states.lock().await;
            if let Some(state) = dial_states.get(&addr) {
                if state.next_attempt > Instant::now() {
                    return Err(P2pError::RateLimited);
                }
            }
        }

        debug!("dialing {}", addr);
        let result = async {
            let connecting = self.endpoint.connect(addr, SERVER_NAME)?;
            let connection = timeout(
                Duration::from_millis(PEER_DIAL_TIMEOUT_MILLIS),
                connecting,
            )
            .await??;
            self.register_peer(connection).await
        }
        .await;

        let mut dial_states = self.dial_states.lock().await;
        match result {
            Ok(()) => {
                dial_states.remove(&addr);
                Ok(())
            }
            Err(e) => {
                let state = dial_states.entry(addr).or_insert(DialState {
                    fails: 0,
                    next_attempt: Instant::now(),
                });
                state.fails += 1;
                let delay = (PEER_DIAL_BACKOFF_BASE_SECS << state.fails.min(6))
                    .min(PEER_DIAL_BACKOFF_CAP_SECS);
                state.next_attempt = Instant::now() + Duration::from_secs(delay);
                warn!("dial to {} failed ({} attempts): {}", addr, state.fails, e);
                Err(e)
            }
        }
    }

    async fn register_peer(self: &Arc<Self>, connection: Connection) -> Result<(), P2pError> {
        let addr = connection.remote_address();
        let peer = Arc::new(Peer::new(addr, connection, VERSION.to_string()));
        {
            let mut peers = self.peer_list.write().await;
            if peers.len() >= self.max_peers {
                peer.close(PeerStatus::Disconnected);
                return Err(P2pError::PeerTableFull);
            }
            if peers.contains_key(&peer.get_id()) {
                // already connected on the other direction
                peer.close(PeerStatus::Disconnected);
                return Ok(());
            }
            peers.insert(peer.get_id(), peer.clone());
        }
        info!("peer {} connected", peer);
        self.clone().spawn_connection_task(peer);
        Ok(())
    }

    fn spawn_connection_task(self: Arc<Self>, peer: Arc<Peer>) {
        tokio::spawn(async move {
            let mut exit = self.exit.subscribe();
            let connection = peer.get_connection().clone();
            loop {
                tokio::select! {
                    _ = exit.recv() => {
                        peer.close(PeerStatus::Disconnected);
                        break;
                    }
                    stream = connection.accept_uni() => match stream {
                        Ok(recv) => {
                            let server = self.clone();
                            let peer = peer.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_uni_stream(&peer, recv).await {
                                    trace!("announcement stream from {} dropped: {}", peer.get_addr(), e);
                                }
                            });
                        }
                        Err(e) => {
                            debug!("peer {} connection lost: {}", peer.get_addr(), e);
                            peer.set_status(PeerStatus::Disconnected);
                            break;
                        }
                    },
                    stream = connection.accept_bi() => match stream {
                        Ok((send, recv)) => {
                            let server = self.clone();
                            let peer = peer.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_bi_stream(&peer, send, recv).await {
                                    trace!("request stream from {} dropped: {}", peer.get_addr(), e);
                                }
                            });
                        }
                        Err(e) => {
                            debug!("peer {} connection lost: {}", peer.get_addr(), e);
                            peer.set_status(PeerStatus::Disconnected);
                            break;
                        }
                    },
                }
            }
            self.remove_peer(peer.get_id()).await;
        });
    }

    // One announcement per unidirectional stream
    async fn handle_uni_stream(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        recv: RecvStream,
    ) -> Result<(), P2pError> {
        if !peer.register_announcement() {
            return Err(P2pError::RateLimited);
        }
        let envelope = Self::read_envelope(recv).await?;
        peer.touch();
        self.handle_announcement(peer, envelope).await
    }

    // One request/response pair per bidirectional stream
    async fn handle_bi_stream(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        mut send: SendStream,
        recv: RecvStream,
    ) -> Result<(), P2pError> {
        let envelope = Self::read_envelope(recv).await?;
        peer.touch();
        let response = self.handle_request(peer, envelope).await?;
        let bytes = self.make_envelope(response).encode();
        send.write_all(&bytes).await?;
        send.finish()?;
        Ok(())
    }

    async fn read_envelope(mut recv: RecvStream) -> Result<Envelope, P2pError> {
        let read = async {
            let mut header = [0u8; ENVELOPE_HEADER_SIZE];
            recv.read_exact(&mut header).await?;
            let payload_len =
                u32::from_le_bytes(header[ENVELOPE_HEADER_SIZE - 4..].try_into().unwrap());
            if payload_len > PEER_MAX_PAYLOAD_SIZE {
                return Err(P2pError::PayloadTooLarge(payload_len));
            }
            let mut payload = vec![0u8; payload_len as usize];
            recv.read_exact(&mut payload).await?;
            let mut bytes = header.to_vec();
            bytes.extend_from_slice(&payload);
            Ok(Envelope::decode(&bytes)?)
        };
        timeout(Duration::from_millis(PEER_STREAM_READ_TIMEOUT_MILLIS), read).await?
    }

    fn make_envelope(&self, packet: Packet) -> Envelope {
        Envelope::new(self.node_id.clone(), get_current_time_in_millis(), packet)
    }

    /// Fire-and-forget a packet to one peer over a fresh unidirectional
    /// stream.
    async fn send_to_peer(peer: &Arc<Peer>, bytes: Bytes) -> Result<(), P2pError> {
        let mut send = peer.get_connection().open_uni().await?;
        send.write_all(&bytes).await?;
        send.finish()?;
        Ok(())
    }

    /// Send a packet once to every connected peer, each on its own
    /// stream and its own task so one slow peer never stalls the rest.
    pub async fn broadcast(self: &Arc<Self>, packet: Packet) {
        let bytes = Bytes::from(self.make_envelope(packet).encode());
        let peers = self.connected_peers().await;
        trace!("broadcasting {} bytes to {} peers", bytes.len(), peers.len());
        for peer in peers {
            let bytes = bytes.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::send_to_peer(&peer, bytes).await {
                    debug!("broadcast to {} failed: {}", peer.get_addr(), e);
                }
            });
        }
    }

    /// Request/response round-trip on a fresh bidirectional stream.
    pub async fn request(&self, peer: &Arc<Peer>, packet: Packet) -> Result<Envelope, P2pError> {
        let (mut send, recv) = peer.get_connection().open_bi().await?;
        let bytes = self.make_envelope(packet).encode();
        send.write_all(&bytes).await?;
        send.finish()?;
        let envelope = Self::read_envelope(recv).await?;
        peer.touch();
        Ok(envelope)
    }

    pub async fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peer_list
            .read()
            .await
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peer_list.read().await.len()
    }

    async fn remove_peer(&self, id: u64) {
        if let Some(peer) = self.peer_list.write().await.remove(&id) {
            info!("peer {} removed", peer);
        }
    }

    pub async fn mark_peer_failed(&self, peer: &Arc<Peer>) {
        warn!("marking peer {} as failed", peer.get_addr());
        peer.close(PeerStatus::Failed);
        self.remove_peer(peer.get_id()).await;
    }

    /// Queue a discovered address for dialing.
    pub async fn add_candidate(&self, addr: SocketAddr) {
        if self.peer_list.read().await.contains_key(&peer_id(&addr)) {
            return;
        }
        let mut candidates = self.candidates.lock().await;
        if !candidates.contains(&addr) {
            candidates.push_back(addr);
        }
    }

    /// Prune dead peers, then dial candidates until the table is full.
    pub async fn maintain_peers(self: &Arc<Self>) {
        // drop entries whose connection is already gone or idle too long
        let stale: Vec<u64> = {
            let peers = self.peer_list.read().await;
            let now = get_current_time_in_seconds();
            peers
                .values()
                .filter(|peer| {
                    !peer.is_connected()
                        || peer.get_connection().close_reason().is_some()
                        || now.saturating_sub(peer.get_last_seen()) > PEER_IDLE_TIMEOUT_SECS
                })
                .map(|peer| peer.get_id())
                .collect()
        };
        for id in stale {
            if let Some(peer) = self.peer_list.read().await.get(&id).cloned() {
                peer.close(PeerStatus::Disconnected);
            }
            self.remove_peer(id).await;
        }

        while self.peer_count().await < self.max_peers {
            let Some(addr) = self.candidates.lock().await.pop_front() else {
                break;
            };
            if let Err(e) = self.connect_to(addr).await {
                trace!("candidate {} not connected: {}", addr, e);
            }
        }
    }

    /// Receiver-side duplicate suppression: true when the hash was
    /// already seen within the TTL, marking it either way.
    pub async fn check_and_mark_seen(&self, hash: Hash, ttl: Duration) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        if let Some(at) = seen.get(&hash) {
            if now.duration_since(*at) < ttl {
                return true;
            }
        }
        seen.put(hash, now);
        false
    }

    /// Close every connection and stop the background tasks.
    pub async fn stop(&self) {
        info!("stopping p2p server");
        let _ = self.exit.send(());
        for peer in self.peer_list.write().await.drain().map(|(_, peer)| peer) {
            peer.close(PeerStatus::Disconnected);
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

// Peer certificates are throwaway self-signed blobs; the overlay takes
// identity from node ids, not from the TLS layer. Signatures are still
// verified so the session itself is authenticated end-to-end.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
