//! Wire protocol of the p2p overlay.
//!
//! Each QUIC stream carries exactly one length-prefixed message:
//!
//! ```text
//! type:         u8
//! sender_id:    32 bytes
//! timestamp_ms: u64 little-endian
//! payload_len:  u32 little-endian
//! payload:      payload_len bytes, type-specific canonical encoding
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ghostchain_common::{
    block::{Block, Height},
    crypto::Hash,
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
    transaction::Transaction,
};

/// Message type identifiers.
pub mod packet_type {
    pub const BLOCK_ANNOUNCEMENT: u8 = 1;
    pub const TRANSACTION_ANNOUNCEMENT: u8 = 2;
    pub const BLOCK_REQUEST: u8 = 3;
    pub const BLOCK_RESPONSE: u8 = 4;
    pub const PEER_DISCOVERY: u8 = 5;
    pub const PEER_RESPONSE: u8 = 6;
    pub const SYNC_REQUEST: u8 = 7;
    pub const SYNC_RESPONSE: u8 = 8;
}

// type + sender id + timestamp + payload length
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 32 + 8 + 4;

/// An inclusive range of block heights, at most
/// `CHAIN_SYNC_REQUEST_MAX_BLOCKS` wide (enforced by the handler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: Height,
    pub end: Height,
}

impl BlockRange {
    pub fn span(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

impl Serializer for BlockRange {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.start);
        writer.write_u64(self.end);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let start = reader.read_u64()?;
        let end = reader.read_u64()?;
        if end < start {
            return Err(ReaderError::InvalidValue);
        }
        Ok(BlockRange { start, end })
    }

    fn size(&self) -> usize {
        16
    }
}

/// Multicast discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDiscovery {
    pub node_id: Hash,
    pub port: u16,
    pub version: String,
}

impl Serializer for PeerDiscovery {
    fn write(&self, writer: &mut Writer) {
        self.node_id.write(writer);
        writer.write_u16(self.port);
        write_string(writer, &self.version);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let node_id = Hash::read(reader)?;
        let port = reader.read_u16()?;
        let version = read_string(reader)?;
        Ok(PeerDiscovery {
            node_id,
            port,
            version,
        })
    }

    fn size(&self) -> usize {
        self.node_id.size() + 2 + 1 + self.version.len()
    }
}

/// Answer to a discovery beacon: who we are and which peers we know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResponse {
    pub node_id: Hash,
    pub peers: Vec<SocketAddr>,
}

impl Serializer for PeerResponse {
    fn write(&self, writer: &mut Writer) {
        self.node_id.write(writer);
        writer.write_u8(self.peers.len() as u8);
        for peer in &self.peers {
            write_socket_addr(writer, peer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let node_id = Hash::read(reader)?;
        let count = reader.read_u8()? as usize;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(read_socket_addr(reader)?);
        }
        Ok(PeerResponse { node_id, peers })
    }

    fn size(&self) -> usize {
        self.node_id.size()
            + 1
            + self
                .peers
                .iter()
                .map(|peer| socket_addr_size(peer))
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub latest_height: Height,
    pub latest_hash: Hash,
}

impl Serializer for SyncRequest {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.latest_height);
        self.latest_hash.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let latest_height = reader.read_u64()?;
        let latest_hash = Hash::read(reader)?;
        Ok(SyncRequest {
            latest_height,
            latest_hash,
        })
    }

    fn size(&self) -> usize {
        8 + self.latest_hash.size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub peer_latest_height: Height,
    pub blocks_available: bool,
}

impl Serializer for SyncResponse {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.peer_latest_height);
        writer.write_u8(self.blocks_available as u8);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let peer_latest_height = reader.read_u64()?;
        let blocks_available = match reader.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(ReaderError::InvalidValue),
        };
        Ok(SyncResponse {
            peer_latest_height,
            blocks_available,
        })
    }

    fn size(&self) -> usize {
        9
    }
}

/// The closed union of wire messages.
#[derive(Debug, Clone)]
pub enum Packet {
    BlockAnnouncement(Block),
    TransactionAnnouncement(Transaction),
    BlockRequest(BlockRange),
    BlockResponse(Vec<Block>),
    PeerDiscovery(PeerDiscovery),
    PeerResponse(PeerResponse),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

impl Packet {
    pub fn tag(&self) -> u8 {
        match self {
            Packet::BlockAnnouncement(_) => packet_type::BLOCK_ANNOUNCEMENT,
            Packet::TransactionAnnouncement(_) => packet_type::TRANSACTION_ANNOUNCEMENT,
            Packet::BlockRequest(_) => packet_type::BLOCK_REQUEST,
            Packet::BlockResponse(_) => packet_type::BLOCK_RESPONSE,
            Packet::PeerDiscovery(_) => packet_type::PEER_DISCOVERY,
            Packet::PeerResponse(_) => packet_type::PEER_RESPONSE,
            Packet::SyncRequest(_) => packet_type::SYNC_REQUEST,
            Packet::SyncResponse(_) => packet_type::SYNC_RESPONSE,
        }
    }

    fn write_payload(&self, writer: &mut Writer) {
        match self {
            Packet::BlockAnnouncement(block) => block.write(writer),
            Packet::TransactionAnnouncement(tx) => tx.write(writer),
            Packet::BlockRequest(range) => range.write(writer),
            Packet::BlockResponse(blocks) => blocks.write(writer),
            Packet::PeerDiscovery(discovery) => discovery.write(writer),
            Packet::PeerResponse(response) => response.write(writer),
            Packet::SyncRequest(request) => request.write(writer),
            Packet::SyncResponse(response) => response.write(writer),
        }
    }

    fn read_payload(tag: u8, reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(match tag {
            packet_type::BLOCK_ANNOUNCEMENT => Packet::BlockAnnouncement(Block::read(reader)?),
            packet_type::TRANSACTION_ANNOUNCEMENT => {
                Packet::TransactionAnnouncement(Transaction::read(reader)?)
            }
            packet_type::BLOCK_REQUEST => Packet::BlockRequest(BlockRange::read(reader)?),
            packet_type::BLOCK_RESPONSE => Packet::BlockResponse(Vec::<Block>::read(reader)?),
            packet_type::PEER_DISCOVERY => Packet::PeerDiscovery(PeerDiscovery::read(reader)?),
            packet_type::PEER_RESPONSE => Packet::PeerResponse(PeerResponse::read(reader)?),
            packet_type::SYNC_REQUEST => Packet::SyncRequest(SyncRequest::read(reader)?),
            packet_type::SYNC_RESPONSE => Packet::SyncResponse(SyncResponse::read(reader)?),
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

/// One framed message: envelope header plus a packet.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender_id: Hash,
    pub timestamp_ms: TimestampMillis,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(sender_id: Hash, timestamp_ms: TimestampMillis, packet: Packet) -> Self {
        Self {
            sender_id,
            timestamp_ms,
            packet,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Writer::new();
        self.packet.write_payload(&mut payload);
        let payload = payload.bytes();

        let mut writer = Writer::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
        writer.write_u8(self.packet.tag());
        self.sender_id.write(&mut writer);
        writer.write_u64(self.timestamp_ms);
        writer.write_u32(payload.len() as u32);
        writer.write_bytes(&payload);
        writer.bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let tag = reader.read_u8()?;
        let sender_id = Hash::read(&mut reader)?;
        let timestamp_ms = reader.read_u64()?;
        let payload_len = reader.read_u32()? as usize;
        if payload_len != reader.remaining() {
            return Err(ReaderError::InvalidSize);
        }
        let packet = Packet::read_payload(tag, &mut reader)?;
        if reader.remaining() != 0 {
            return Err(ReaderError::TrailingBytes);
        }
        Ok(Envelope {
            sender_id,
            timestamp_ms,
            packet,
        })
    }
}

fn write_string(writer: &mut Writer, value: &str) {
    writer.write_u8(value.len() as u8);
    writer.write_bytes(value.as_bytes());
}

fn read_string(reader: &mut Reader) -> Result<String, ReaderError> {
    let len = reader.read_u8()? as usize;
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ReaderError::InvalidValue)
}

fn write_socket_addr(writer: &mut Writer, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            writer.write_u8(4);
            writer.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            writer.write_u8(6);
            writer.write_bytes(&ip.octets());
        }
    }
    writer.write_u16(addr.port());
}

fn read_socket_addr(reader: &mut Reader) -> Result<SocketAddr, ReaderError> {
    let ip = match reader.read_u8()? {
        4 => {
            let octets: [u8; 4] = reader
                .read_bytes(4)?
                .try_into()
                .map_err(|_| ReaderError::InvalidValue)?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = reader
                .read_bytes(16)?
                .try_into()
                .map_err(|_| ReaderError::InvalidValue)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(ReaderError::InvalidValue),
    };
    let port = reader.read_u16()?;
    Ok(SocketAddr::new(ip, port))
}

fn socket_addr_size(addr: &SocketAddr) -> usize {
    match addr.ip() {
        IpAddr::V4(_) => 1 + 4 + 2,
        IpAddr::V6(_) => 1 + 16 + 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostchain_common::crypto::hash;

    #[test]
    fn test_envelope_roundtrip_sync_request() {
        let envelope = Envelope::new(
            hash(b"node"),
            1_700_000_000_000,
            Packet::SyncRequest(SyncRequest {
                latest_height: 42,
                latest_hash: hash(b"tip"),
            }),
        );
        let bytes = envelope.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.sender_id, envelope.sender_id);
        assert_eq!(decoded.timestamp_ms, envelope.timestamp_ms);
        match decoded.packet {
            Packet::SyncRequest(request) => {
                assert_eq!(request.latest_height, 42);
                assert_eq!(request.latest_hash, hash(b"tip"));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_envelope_layout() {
        let envelope = Envelope::new(
            Hash::zero(),
            7,
            Packet::SyncResponse(SyncResponse {
                peer_latest_height: 1,
                blocks_available: true,
            }),
        );
        let bytes = envelope.encode();
        // type tag first
        assert_eq!(bytes[0], packet_type::SYNC_RESPONSE);
        // payload length little-endian at offset 41
        let payload_len = u32::from_le_bytes(bytes[41..45].try_into().unwrap());
        assert_eq!(payload_len as usize, bytes.len() - ENVELOPE_HEADER_SIZE);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let envelope = Envelope::new(
            Hash::zero(),
            7,
            Packet::BlockRequest(BlockRange { start: 1, end: 10 }),
        );
        let mut bytes = envelope.encode();
        bytes.pop();
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_inverted_block_range_rejected() {
        let range = BlockRange { start: 10, end: 1 };
        let bytes = range.to_bytes();
        assert!(matches!(
            BlockRange::from_bytes(&bytes),
            Err(ReaderError::InvalidValue)
        ));
    }

    #[test]
    fn test_peer_response_roundtrip() {
        let response = PeerResponse {
            node_id: hash(b"peer"),
            peers: vec![
                "127.0.0.1:7777".parse().unwrap(),
                "[::1]:7777".parse().unwrap(),
            ],
        };
        let decoded = PeerResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(decoded, response);
    }
}
