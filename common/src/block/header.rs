use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Hash, Hashable, HASH_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
};

// index + timestamp + previous hash + merkle root + nonce
pub const HEADER_SIZE: usize = 8 + 8 + HASH_SIZE + HASH_SIZE + 8;

/// Fixed-width block header. The block hash is SHA-256 over exactly these
/// bytes in this order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    // Height of the block, genesis is 0
    pub index: u64,
    pub timestamp_ms: TimestampMillis,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(
        index: u64,
        timestamp_ms: TimestampMillis,
        previous_hash: Hash,
        merkle_root: Hash,
        nonce: u64,
    ) -> Self {
        Self {
            index,
            timestamp_ms,
            previous_hash,
            merkle_root,
            nonce,
        }
    }

    pub fn get_height(&self) -> u64 {
        self.index
    }

    pub fn get_timestamp(&self) -> TimestampMillis {
        self.timestamp_ms
    }

    pub fn get_previous_hash(&self) -> &Hash {
        &self.previous_hash
    }

    pub fn get_merkle_root(&self) -> &Hash {
        &self.merkle_root
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.index);
        writer.write_u64(self.timestamp_ms);
        writer.write_hash(&self.previous_hash);
        writer.write_hash(&self.merkle_root);
        writer.write_u64(self.nonce);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let index = reader.read_u64()?;
        let timestamp_ms = reader.read_u64()?;
        let previous_hash = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let nonce = reader.read_u64()?;
        Ok(BlockHeader {
            index,
            timestamp_ms,
            previous_hash,
            merkle_root,
            nonce,
        })
    }

    fn size(&self) -> usize {
        HEADER_SIZE
    }
}

impl Hashable for BlockHeader {}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "BlockHeader[height: {}, previous: {}, timestamp: {}, nonce: {}]",
            self.index, self.previous_hash, self.timestamp_ms, self.nonce
        )
    }
}
