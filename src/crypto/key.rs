use std::sync::OnceLock;

use argon2::Argon2;

use super::cipher::KEY_MATERIAL_LEN;

/// Pre-shared key, hashed together with a per-direction salt into AEAD key
/// material. Shared by reference between all sessions of the server.
#[derive(Debug)]
pub struct PskKey {
    psk_bytes: Box<[u8]>,
}

impl PskKey {
    pub fn new(psk: &str) -> Self {
        Self {
            psk_bytes: psk.as_bytes().to_vec().into_boxed_slice(),
        }
    }

    /// Argon2id with opslimit 3 and memlimit 8192 bytes. These parameters are
    /// wire-visible; both peers must derive identical key material.
    /// ref: https://github.com/icpz/open-snell/blob/master/components/aead/cipher.go#L48
    pub fn derive(&self, salt: &[u8]) -> [u8; KEY_MATERIAL_LEN] {
        static ARGON2: OnceLock<Argon2> = OnceLock::new();

        let instance = ARGON2.get_or_init(|| {
            let params = argon2::Params::new(8, 3, 1, Some(KEY_MATERIAL_LEN)).unwrap();
            Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
        });

        let mut output = [0u8; KEY_MATERIAL_LEN];
        instance
            .hash_password_into(&self.psk_bytes, salt, &mut output)
            .unwrap();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let key = PskKey::new("hunter2");
        let salt = [7u8; 16];
        assert_eq!(key.derive(&salt), key.derive(&salt));
    }

    #[test]
    fn test_derive_depends_on_salt() {
        let key = PskKey::new("hunter2");
        assert_ne!(key.derive(&[0u8; 16]), key.derive(&[1u8; 16]));
    }
}
