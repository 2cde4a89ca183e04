use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use rand::RngCore;
use ring::aead::LessSafeKey;

use super::cipher::{
    increment_nonce, open_append, open_u16_be, seal_append, CipherKind, KEY_MATERIAL_LEN,
    NONCE_LEN, SALT_LEN, TAG_LEN,
};
use super::key::PskKey;

const CHUNK_MAX_SIZE: usize = 0x3fff;
const CHUNK_HEADER_LEN: usize = 2 + TAG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionState {
    Uninitialized,
    Encrypt,
    Decrypt,
}

/// One direction of the framer: key, running nonce and (on the decrypt side)
/// ciphertext pending a complete chunk. Once a direction has encrypted it can
/// never decrypt and vice versa.
struct Direction {
    state: DirectionState,
    key: Option<LessSafeKey>,
    material: [u8; KEY_MATERIAL_LEN],
    nonce: [u8; NONCE_LEN],
    buffer: Vec<u8>,
    scratch: Vec<u8>,
}

impl Direction {
    fn new() -> Self {
        Self {
            state: DirectionState::Uninitialized,
            key: None,
            material: [0u8; KEY_MATERIAL_LEN],
            nonce: [0u8; NONCE_LEN],
            buffer: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

/// Streaming AEAD framer for one tunnel connection. The wire format per
/// direction is a raw salt followed by sealed chunks; each chunk is a sealed
/// 2-byte big-endian body length and, when the length is non-zero, a sealed
/// body. A zero length is the logical end-of-stream marker.
///
/// The decrypt side commits to key material as soon as the salt arrives, so
/// it cannot know yet which cipher the peer picked. The first chunk header is
/// tried with the primary cipher and, on auth failure, once with the
/// fallback.
pub struct CryptoContext {
    cipher: CipherKind,
    fallback: Option<CipherKind>,
    cipher_selected: AtomicBool,
    key: Arc<PskKey>,
    encrypt: Direction,
    decrypt: Direction,
}

impl CryptoContext {
    pub fn new(cipher: CipherKind, fallback: Option<CipherKind>, key: Arc<PskKey>) -> Self {
        Self {
            cipher,
            fallback,
            cipher_selected: AtomicBool::new(false),
            key,
            encrypt: Direction::new(),
            decrypt: Direction::new(),
        }
    }

    /// Splits into per-direction halves so the two forwarding tasks of one
    /// session can run concurrently. Must only be used once the handshake has
    /// fixed the cipher choice: the encrypt half snapshots it.
    pub fn split(&mut self) -> (DecryptHalf<'_>, EncryptHalf<'_>) {
        let selected_cipher = self.cipher;
        let CryptoContext {
            cipher,
            fallback,
            cipher_selected,
            key,
            encrypt,
            decrypt,
        } = self;
        let cipher_selected: &AtomicBool = cipher_selected;
        let key: &Arc<PskKey> = key;
        (
            DecryptHalf {
                cipher,
                fallback,
                cipher_selected,
                key,
                ctx: decrypt,
            },
            EncryptHalf {
                cipher: selected_cipher,
                cipher_selected,
                key,
                ctx: encrypt,
            },
        )
    }

    pub fn encrypt_some(
        &mut self,
        ctext: &mut Vec<u8>,
        ptext: &[u8],
        add_zero_chunk: bool,
    ) -> std::io::Result<()> {
        self.split().1.encrypt_some(ctext, ptext, add_zero_chunk)
    }

    pub fn decrypt_some(
        &mut self,
        ptext: &mut Vec<u8>,
        ctext: &[u8],
        has_zero_chunk: &mut bool,
    ) -> std::io::Result<()> {
        self.split().0.decrypt_some(ptext, ctext, has_zero_chunk)
    }

    pub fn has_pending(&self) -> bool {
        self.decrypt.buffer.len() > CHUNK_HEADER_LEN
    }

    /// Pre-initializes the encrypt direction with a caller-chosen salt so
    /// tests can compare ciphertext byte-for-byte. The salt is not emitted.
    #[cfg(test)]
    pub fn seed_encrypt_salt(&mut self, salt: &[u8; SALT_LEN]) {
        self.encrypt.material = self.key.derive(salt);
        self.encrypt.key = Some(self.cipher.session_key(&self.encrypt.material));
        self.encrypt.state = DirectionState::Encrypt;
    }
}

pub struct EncryptHalf<'a> {
    cipher: CipherKind,
    cipher_selected: &'a AtomicBool,
    key: &'a Arc<PskKey>,
    ctx: &'a mut Direction,
}

impl EncryptHalf<'_> {
    pub fn encrypt_some(
        &mut self,
        ctext: &mut Vec<u8>,
        ptext: &[u8],
        add_zero_chunk: bool,
    ) -> std::io::Result<()> {
        let ctx = &mut *self.ctx;
        if ctx.state == DirectionState::Decrypt {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "encrypt context invalid state",
            ));
        }

        if ptext.is_empty() && !add_zero_chunk {
            return Ok(());
        }

        if ctx.state == DirectionState::Uninitialized {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            ctx.material = self.key.derive(&salt);
            ctx.key = Some(self.cipher.session_key(&ctx.material));
            ctext.extend_from_slice(&salt);
            ctx.state = DirectionState::Encrypt;
            self.cipher_selected.store(true, Ordering::Relaxed);
        }

        let key = ctx.key.as_ref().unwrap();
        for piece in ptext.chunks(CHUNK_MAX_SIZE) {
            seal_append(key, &ctx.nonce, &(piece.len() as u16).to_be_bytes(), ctext)
                .map_err(encrypt_failed)?;
            increment_nonce(&mut ctx.nonce);
            seal_append(key, &ctx.nonce, piece, ctext).map_err(encrypt_failed)?;
            increment_nonce(&mut ctx.nonce);
        }

        if add_zero_chunk {
            seal_append(key, &ctx.nonce, &0u16.to_be_bytes(), ctext).map_err(encrypt_failed)?;
            increment_nonce(&mut ctx.nonce);
        }

        Ok(())
    }
}

pub struct DecryptHalf<'a> {
    cipher: &'a mut CipherKind,
    fallback: &'a mut Option<CipherKind>,
    cipher_selected: &'a AtomicBool,
    key: &'a Arc<PskKey>,
    ctx: &'a mut Direction,
}

impl DecryptHalf<'_> {
    pub fn has_pending(&self) -> bool {
        self.ctx.buffer.len() > CHUNK_HEADER_LEN
    }

    pub fn decrypt_some(
        &mut self,
        ptext: &mut Vec<u8>,
        ctext: &[u8],
        has_zero_chunk: &mut bool,
    ) -> std::io::Result<()> {
        let ctx = &mut *self.ctx;
        if ctx.state == DirectionState::Encrypt {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "decrypt context invalid state",
            ));
        }

        *has_zero_chunk = false;
        if ctext.is_empty() && ctx.buffer.len() <= CHUNK_HEADER_LEN {
            return Ok(());
        }

        ctx.buffer.extend_from_slice(ctext);

        if ctx.state == DirectionState::Uninitialized {
            if ctx.buffer.len() < SALT_LEN {
                return Ok(());
            }
            ctx.material = self.key.derive(&ctx.buffer[..SALT_LEN]);
            ctx.key = Some(self.cipher.session_key(&ctx.material));
            ctx.buffer.drain(..SALT_LEN);
            ctx.state = DirectionState::Decrypt;
        }

        let mut consumed = 0;
        loop {
            let available = ctx.buffer.len() - consumed;
            if available < CHUNK_HEADER_LEN {
                break;
            }
            let header = &ctx.buffer[consumed..consumed + CHUNK_HEADER_LEN];

            let chunk_len = loop {
                match open_u16_be(ctx.key.as_ref().unwrap(), &ctx.nonce, header) {
                    Ok(len) => break len as usize,
                    Err(_) => {
                        if !self.cipher_selected.load(Ordering::Relaxed) && self.fallback.is_some()
                        {
                            // The peer committed to a cipher before we could
                            // tell which one; retry this header once with the
                            // fallback under the same key material and nonce.
                            *self.cipher = self.fallback.take().unwrap();
                            ctx.key = Some(self.cipher.session_key(&ctx.material));
                            debug!("retrying first chunk with {}", self.cipher.name());
                            continue;
                        }
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "chunk length authentication failed",
                        ));
                    }
                }
            };
            self.cipher_selected.store(true, Ordering::Relaxed);

            if chunk_len > CHUNK_MAX_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("chunk length {chunk_len} exceeds maximum"),
                ));
            }

            let needed = if chunk_len == 0 {
                CHUNK_HEADER_LEN
            } else {
                CHUNK_HEADER_LEN + chunk_len + TAG_LEN
            };
            if available < needed {
                // The body has not fully arrived. Leave the header in place
                // and the nonce untouched; the next call re-decrypts the same
                // header with the same nonce.
                break;
            }
            increment_nonce(&mut ctx.nonce);

            if chunk_len == 0 {
                *has_zero_chunk = true;
                consumed += needed;
                break;
            }

            let body = consumed + CHUNK_HEADER_LEN..consumed + needed;
            open_append(
                ctx.key.as_ref().unwrap(),
                &ctx.nonce,
                &ctx.buffer[body],
                &mut ctx.scratch,
                ptext,
            )
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "chunk body authentication failed",
                )
            })?;
            increment_nonce(&mut ctx.nonce);
            consumed += needed;
        }
        ctx.buffer.drain(..consumed);
        Ok(())
    }
}

fn encrypt_failed(_: ring::error::Unspecified) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "failed to encrypt chunk")
}
