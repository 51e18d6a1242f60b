use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

/// Number of distinguishable fungible balances tracked per account.
pub const ASSET_COUNT: usize = 4;

// The four-asset economy. The wire tag of each kind is its discriminant
// and must never be reordered.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum AssetKind {
    /// Paid as fee on every transaction, burned on application.
    Gas = 0,
    /// Fixed supply, confers leader-selection weight.
    Stake = 1,
    /// Minted/burned by protocol rewards and spends.
    Utility = 2,
    /// Fixed cap, freely transferable.
    Brand = 3,
}

impl AssetKind {
    pub const ALL: [AssetKind; ASSET_COUNT] = [
        AssetKind::Gas,
        AssetKind::Stake,
        AssetKind::Utility,
        AssetKind::Brand,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(AssetKind::Gas),
            1 => Some(AssetKind::Stake),
            2 => Some(AssetKind::Utility),
            3 => Some(AssetKind::Brand),
            _ => None,
        }
    }

    // Index into per-account balance storage
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl Serializer for AssetKind {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.tag());
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        AssetKind::from_tag(reader.read_u8()?).ok_or(ReaderError::InvalidValue)
    }

    fn size(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(AssetKind::Gas.tag(), 0);
        assert_eq!(AssetKind::Stake.tag(), 1);
        assert_eq!(AssetKind::Utility.tag(), 2);
        assert_eq!(AssetKind::Brand.tag(), 3);
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in AssetKind::iter() {
            assert_eq!(AssetKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(AssetKind::from_tag(4), None);
    }

    #[test]
    fn test_unknown_tag_rejected_on_read() {
        assert!(matches!(
            AssetKind::from_bytes(&[9]),
            Err(ReaderError::InvalidValue)
        ));
    }
}
