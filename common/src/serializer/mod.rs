mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

// Canonical byte encoding used for hashing, signing, storage and the wire.
// Implementations must produce byte-identical output across nodes: all
// integers are little-endian fixed width, all fields are written in
// declaration order.
pub trait Serializer {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>
    where
        Self: Sized;

    // Exact size in bytes of the canonical encoding
    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.bytes()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.total_read() != bytes.len() {
            return Err(ReaderError::TrailingBytes);
        }
        Ok(value)
    }

    fn from_hex(hex: &str) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let bytes = hex::decode(hex).map_err(|_| ReaderError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

impl<T: Serializer> Serializer for Vec<T> {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.len() as u32);
        for item in self {
            item.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_u32()? as usize;
        // Bounded by what the buffer can actually hold
        if count > reader.remaining() {
            return Err(ReaderError::InvalidSize);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }

    fn size(&self) -> usize {
        4 + self.iter().map(|item| item.size()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let value: u64 = 0xDEAD_BEEF_CAFE_F00D;
        let bytes = value.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u64::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = 1u32.to_bytes();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = 7u16.to_bytes();
        bytes.push(0);
        assert!(matches!(
            u16::from_bytes(&bytes),
            Err(ReaderError::TrailingBytes)
        ));
    }

    #[test]
    fn test_vec_roundtrip() {
        let values: Vec<u64> = vec![1, 2, 3];
        let decoded = Vec::<u64>::from_bytes(&values.to_bytes()).unwrap();
        assert_eq!(decoded, values);
    }
}
