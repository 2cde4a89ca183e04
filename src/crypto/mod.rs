mod cipher;
mod crypto_context;
mod key;

pub use cipher::{CipherKind, NONCE_LEN, SALT_LEN, TAG_LEN};
pub use crypto_context::{CryptoContext, DecryptHalf, EncryptHalf};
pub use key::PskKey;
