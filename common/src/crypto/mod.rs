mod address;
mod hash;
mod keypair;

pub use address::{Address, ADDRESS_SIZE};
pub use hash::{hash, Hash, Hashable, HASH_SIZE};
pub use keypair::{
    CryptoError, KeyPair, PublicKey, SecretKey, Signature, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE,
    SIGNATURE_SIZE,
};
