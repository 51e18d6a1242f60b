use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::Nonce,
    asset::AssetKind,
    crypto::{hash, Address, Hash, Hashable, KeyPair, PublicKey, Signature},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// from + to + asset tag + amount + gas fee + nonce
pub const TX_SIGNING_SIZE: usize = 20 + 20 + 1 + 8 + 8 + 8;
// signing payload + public key + signature
pub const TX_SIZE: usize = TX_SIGNING_SIZE + 32 + 64;

/// Validation failures reported to the submitter or peer. The offending
/// transaction or block is dropped without any state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Sender and recipient are the same address")]
    SelfTransfer,

    #[error("Gas fee must be strictly positive")]
    ZeroGasFee,

    #[error("Public key does not derive the sender address")]
    AddressMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Merkle root does not match transactions")]
    MerkleMismatch,

    #[error("Block hash does not match header")]
    HashMismatch,
}

/// A signed transfer of one asset kind between two accounts.
///
/// The canonical hash (also the signing payload digest) covers the first
/// six fields only; the public key is bound to the sender by address
/// derivation rather than by inclusion in the hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    from: Address,
    to: Address,
    asset: AssetKind,
    amount: u64,
    gas_fee: u64,
    nonce: Nonce,
    public_key: PublicKey,
    signature: Signature,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: Address,
        to: Address,
        asset: AssetKind,
        amount: u64,
        gas_fee: u64,
        nonce: Nonce,
        public_key: PublicKey,
        signature: Signature,
    ) -> Self {
        Self {
            from,
            to,
            asset,
            amount,
            gas_fee,
            nonce,
            public_key,
            signature,
        }
    }

    /// Build and sign a transfer in one step.
    pub fn create(
        keypair: &KeyPair,
        to: Address,
        asset: AssetKind,
        amount: u64,
        gas_fee: u64,
        nonce: Nonce,
    ) -> Self {
        let public_key = keypair.get_public_key();
        let mut tx = Self::new(
            public_key.to_address(),
            to,
            asset,
            amount,
            gas_fee,
            nonce,
            public_key,
            Signature::zero(),
        );
        tx.signature = keypair.sign(&tx.get_signing_bytes());
        tx
    }

    pub fn get_from(&self) -> &Address {
        &self.from
    }

    pub fn get_to(&self) -> &Address {
        &self.to
    }

    pub fn get_asset(&self) -> AssetKind {
        self.asset
    }

    pub fn get_amount(&self) -> u64 {
        self.amount
    }

    pub fn get_gas_fee(&self) -> u64 {
        self.gas_fee
    }

    pub fn get_nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn get_public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn get_signature(&self) -> &Signature {
        &self.signature
    }

    /// Canonical signing payload: `from ‖ to ‖ asset_tag ‖ amount ‖
    /// gas_fee ‖ nonce`, little-endian fixed width.
    pub fn get_signing_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(TX_SIGNING_SIZE);
        self.from.write(&mut writer);
        self.to.write(&mut writer);
        self.asset.write(&mut writer);
        writer.write_u64(self.amount);
        writer.write_u64(self.gas_fee);
        writer.write_u64(self.nonce);
        writer.bytes()
    }

    /// Structural checks that need no chain state.
    pub fn validate_structural(&self) -> Result<(), ValidationError> {
        if self.from == self.to {
            return Err(ValidationError::SelfTransfer);
        }
        if self.gas_fee == 0 {
            return Err(ValidationError::ZeroGasFee);
        }
        if self.public_key.to_address() != self.from {
            return Err(ValidationError::AddressMismatch);
        }
        Ok(())
    }

    /// Verify the Ed25519 signature over the canonical hash preimage.
    pub fn validate_signature(&self) -> Result<(), ValidationError> {
        self.public_key
            .verify(&self.get_signing_bytes(), &self.signature)
            .map_err(|_| ValidationError::InvalidSignature)
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        self.from.write(writer);
        self.to.write(writer);
        self.asset.write(writer);
        writer.write_u64(self.amount);
        writer.write_u64(self.gas_fee);
        writer.write_u64(self.nonce);
        self.public_key.write(writer);
        self.signature.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let from = Address::read(reader)?;
        let to = Address::read(reader)?;
        let asset = AssetKind::read(reader)?;
        let amount = reader.read_u64()?;
        let gas_fee = reader.read_u64()?;
        let nonce = reader.read_u64()?;
        let public_key = PublicKey::read(reader)?;
        let signature = Signature::read(reader)?;
        Ok(Transaction {
            from,
            to,
            asset,
            amount,
            gas_fee,
            nonce,
            public_key,
            signature,
        })
    }

    fn size(&self) -> usize {
        TX_SIZE
    }
}

impl Hashable for Transaction {
    // Canonical hash excludes public key and signature
    fn hash(&self) -> Hash {
        hash(&self.get_signing_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_tx(amount: u64) -> Transaction {
        let keypair = KeyPair::new();
        let to = Address::from_public_key_bytes(&[9u8; 32]);
        Transaction::create(&keypair, to, AssetKind::Gas, amount, 10, 0)
    }

    #[test]
    fn test_roundtrip() {
        let tx = signed_tx(100);
        let bytes = tx.to_bytes();
        assert_eq!(bytes.len(), TX_SIZE);
        assert_eq!(bytes.len(), tx.size());
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(tx.hash(), decoded.hash());
    }

    #[test]
    fn test_signature_verifies() {
        let tx = signed_tx(100);
        assert!(tx.validate_structural().is_ok());
        assert!(tx.validate_signature().is_ok());
    }

    #[test]
    fn test_hash_excludes_signature() {
        let keypair = KeyPair::new();
        let to = Address::from_public_key_bytes(&[9u8; 32]);
        let a = Transaction::create(&keypair, to, AssetKind::Gas, 5, 1, 0);
        let mut b = a.clone();
        b.signature = Signature::zero();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_self_transfer_rejected() {
        let keypair = KeyPair::new();
        let tx = Transaction::create(&keypair, keypair.get_address(), AssetKind::Gas, 5, 1, 0);
        assert_eq!(
            tx.validate_structural(),
            Err(ValidationError::SelfTransfer)
        );
    }

    #[test]
    fn test_zero_gas_fee_rejected() {
        let keypair = KeyPair::new();
        let to = Address::from_public_key_bytes(&[9u8; 32]);
        let tx = Transaction::create(&keypair, to, AssetKind::Brand, 5, 0, 0);
        assert_eq!(tx.validate_structural(), Err(ValidationError::ZeroGasFee));
    }

    #[test]
    fn test_tampered_amount_fails_signature() {
        let mut tx = signed_tx(100);
        tx.amount = 101;
        assert_eq!(
            tx.validate_signature(),
            Err(ValidationError::InvalidSignature)
        );
    }

    #[test]
    fn test_foreign_public_key_rejected() {
        let mut tx = signed_tx(100);
        tx.public_key = KeyPair::new().get_public_key();
        assert_eq!(
            tx.validate_structural(),
            Err(ValidationError::AddressMismatch)
        );
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip_preserves_all_fields(
            amount in any::<u64>(),
            gas_fee in 1u64..,
            nonce in any::<u64>(),
            to_seed in any::<[u8; 32]>(),
        ) {
            let keypair = KeyPair::new();
            let to = Address::from_public_key_bytes(&to_seed);
            let tx = Transaction::create(&keypair, to, AssetKind::Brand, amount, gas_fee, nonce);

            let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
            prop_assert_eq!(&decoded, &tx);
            prop_assert_eq!(decoded.hash(), tx.hash());
            prop_assert!(decoded.validate_signature().is_ok());
        }

        #[test]
        fn prop_signing_bytes_are_fixed_width(
            amount in any::<u64>(),
            gas_fee in 1u64..,
            nonce in any::<u64>(),
        ) {
            let keypair = KeyPair::new();
            let to = Address::from_public_key_bytes(&[1u8; 32]);
            let tx = Transaction::create(&keypair, to, AssetKind::Utility, amount, gas_fee, nonce);
            prop_assert_eq!(tx.get_signing_bytes().len(), TX_SIGNING_SIZE);
        }
    }
}
