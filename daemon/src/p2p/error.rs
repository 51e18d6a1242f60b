use thiserror::Error;

use ghostchain_common::serializer::ReaderError;

use crate::core::error::BlockchainError;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Peer table is full")]
    PeerTableFull,

    #[error("Peer {0} not found")]
    PeerNotFound(u64),

    #[error("Peer timed out")]
    PeerTimeout,

    #[error("Stream closed by the remote peer")]
    StreamClosed,

    #[error("Peer is rate limited")]
    RateLimited,

    #[error("Unexpected packet type {got} in response to {expected}")]
    UnexpectedPacket { expected: u8, got: u8 },

    #[error("Message payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(u32),

    #[error("Malformed packet: {0}")]
    Decoding(#[from] ReaderError),

    #[error("TLS setup error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("QUIC crypto setup error: {0}")]
    Crypto(String),

    #[error("Certificate generation error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("QUIC write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("QUIC read error: {0}")]
    Read(#[from] quinn::ReadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
}

impl From<quinn::ReadExactError> for P2pError {
    fn from(e: quinn::ReadExactError) -> Self {
        match e {
            quinn::ReadExactError::FinishedEarly(_) => P2pError::StreamClosed,
            quinn::ReadExactError::ReadError(e) => P2pError::Read(e),
        }
    }
}

impl From<quinn::ReadToEndError> for P2pError {
    fn from(e: quinn::ReadToEndError) -> Self {
        match e {
            quinn::ReadToEndError::TooLong => P2pError::PayloadTooLarge(0),
            quinn::ReadToEndError::Read(e) => P2pError::Read(e),
        }
    }
}

impl From<quinn::ClosedStream> for P2pError {
    fn from(_: quinn::ClosedStream) -> Self {
        P2pError::StreamClosed
    }
}

impl From<tokio::time::error::Elapsed> for P2pError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        P2pError::PeerTimeout
    }
}
