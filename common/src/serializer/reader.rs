use thiserror::Error;

use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes available in the buffer")]
    NotEnoughBytes,

    #[error("Invalid size prefix")]
    InvalidSize,

    #[error("Invalid value read from the buffer")]
    InvalidValue,

    #[error("Buffer contains trailing bytes after decoding")]
    TrailingBytes,

    #[error("Invalid hex string")]
    InvalidHex,
}

// Cursor over a byte slice from which canonical encodings are decoded.
// Every read advances the cursor; a short buffer yields NotEnoughBytes
// instead of panicking.
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, total: 0 }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], ReaderError> {
        if count > self.bytes.len() {
            return Err(ReaderError::NotEnoughBytes);
        }
        let (read, rest) = self.bytes.split_at(count);
        self.bytes = rest;
        self.total += count;
        Ok(read)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes_32(&mut self) -> Result<[u8; 32], ReaderError> {
        let bytes = self.read_bytes(32)?;
        Ok(bytes.try_into().unwrap())
    }

    pub fn read_bytes_64(&mut self) -> Result<[u8; 64], ReaderError> {
        let bytes = self.read_bytes(64)?;
        Ok(bytes.try_into().unwrap())
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        let bytes = self.read_bytes(HASH_SIZE)?;
        Ok(Hash::new(bytes.try_into().unwrap()))
    }

    // How many bytes have been consumed so far
    pub fn total_read(&self) -> usize {
        self.total
    }

    // How many bytes are left to read
    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(reader.read_u16().is_ok());
        assert!(matches!(
            reader.read_u16(),
            Err(ReaderError::NotEnoughBytes)
        ));
    }

    #[test]
    fn test_cursor_tracking() {
        let bytes = [0u8; 12];
        let mut reader = Reader::new(&bytes);
        reader.read_u64().unwrap();
        assert_eq!(reader.total_read(), 8);
        assert_eq!(reader.remaining(), 4);
    }
}
