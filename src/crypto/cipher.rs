use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, CHACHA20_POLY1305};
use ring::error::Unspecified;

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

/// Width of the Argon2id output. AES-128-GCM only consumes the first 16
/// bytes, but the derivation always produces the full 32 so that swapping in
/// the fallback cipher does not require a second password hash.
pub const KEY_MATERIAL_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Chacha20Poly1305,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Chacha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self {
            CipherKind::Aes128Gcm => &AES_128_GCM,
            CipherKind::Chacha20Poly1305 => &CHACHA20_POLY1305,
        }
    }

    fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Chacha20Poly1305 => 32,
        }
    }

    /// Builds a per-direction AEAD key from derived key material.
    pub fn session_key(&self, material: &[u8; KEY_MATERIAL_LEN]) -> LessSafeKey {
        let unbound = UnboundKey::new(self.algorithm(), &material[..self.key_len()]).unwrap();
        LessSafeKey::new(unbound)
    }
}

/// Seals `ptext` with an explicit nonce and appends ciphertext followed by
/// the 16-byte tag to `out`.
pub(super) fn seal_append(
    key: &LessSafeKey,
    nonce: &[u8; NONCE_LEN],
    ptext: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), Unspecified> {
    let start = out.len();
    out.extend_from_slice(ptext);
    let tag = key.seal_in_place_separate_tag(
        Nonce::assume_unique_for_key(*nonce),
        Aad::empty(),
        &mut out[start..],
    )?;
    out.extend_from_slice(tag.as_ref());
    Ok(())
}

/// Opens `ctext` (ciphertext plus trailing tag) without consuming it; the
/// plaintext is appended to `out`. `scratch` is a reusable work buffer.
pub(super) fn open_append(
    key: &LessSafeKey,
    nonce: &[u8; NONCE_LEN],
    ctext: &[u8],
    scratch: &mut Vec<u8>,
    out: &mut Vec<u8>,
) -> Result<(), Unspecified> {
    scratch.clear();
    scratch.extend_from_slice(ctext);
    let plain = key.open_in_place(
        Nonce::assume_unique_for_key(*nonce),
        Aad::empty(),
        scratch,
    )?;
    out.extend_from_slice(plain);
    Ok(())
}

/// Opens a sealed 2-byte big-endian length without touching the input
/// buffer, so the same bytes can be retried under another key.
pub(super) fn open_u16_be(
    key: &LessSafeKey,
    nonce: &[u8; NONCE_LEN],
    ctext: &[u8],
) -> Result<u16, Unspecified> {
    let mut tmp = [0u8; 2 + TAG_LEN];
    tmp.copy_from_slice(ctext);
    let plain = key.open_in_place(
        Nonce::assume_unique_for_key(*nonce),
        Aad::empty(),
        &mut tmp,
    )?;
    Ok(u16::from_be_bytes([plain[0], plain[1]]))
}

/// 96-bit little-endian counter increment, matching libsodium's
/// sodium_increment.
pub(super) fn increment_nonce(nonce: &mut [u8; NONCE_LEN]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}
