use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::crypto::{CryptoContext, DecryptHalf, EncryptHalf};
use crate::obfs::{DeobfsStatus, ObfsReader, ObfsWriter, Obfuscator};

pub const BUF_SIZE: usize = 8192;

/// Message-oriented duplex stream: raw socket, optional obfuscation layer
/// and the AEAD framer composed into `read_some`/`write` calls that carry
/// whole plaintext messages plus the zero-chunk end-of-stream signal.
pub struct SnellStream {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    crypto: CryptoContext,
    obfs: Option<Obfuscator>,
    read_buf: Box<[u8]>,
}

impl SnellStream {
    pub fn new(stream: TcpStream, crypto: CryptoContext, obfs: Option<Obfuscator>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            read_half,
            write_half,
            crypto,
            obfs,
            read_buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
        }
    }

    /// Borrows the two independent halves so one forwarding task can read
    /// from the client while the other writes to it.
    pub fn split(&mut self) -> (SnellStreamReader<'_>, SnellStreamWriter<'_>) {
        let (decrypt, encrypt) = self.crypto.split();
        let (obfs_read, obfs_write) = match self.obfs.as_mut() {
            Some(obfs) => {
                let (r, w) = obfs.split();
                (Some(r), Some(w))
            }
            None => (None, None),
        };
        (
            SnellStreamReader {
                socket: &mut self.read_half,
                crypto: decrypt,
                obfs: obfs_read,
                raw: &mut self.read_buf[..],
            },
            SnellStreamWriter {
                socket: &mut self.write_half,
                crypto: encrypt,
                obfs: obfs_write,
            },
        )
    }

    pub async fn read_some(
        &mut self,
        plain: &mut Vec<u8>,
        has_zero_chunk: &mut bool,
    ) -> std::io::Result<usize> {
        self.split().0.read_some(plain, has_zero_chunk).await
    }

    pub async fn write(&mut self, plain: &[u8], add_zero_chunk: bool) -> std::io::Result<()> {
        self.split().1.write(plain, add_zero_chunk).await
    }
}

pub struct SnellStreamReader<'a> {
    socket: &'a mut OwnedReadHalf,
    crypto: DecryptHalf<'a>,
    obfs: Option<ObfsReader<'a>>,
    raw: &'a mut [u8],
}

impl SnellStreamReader<'_> {
    /// Appends decrypted plaintext to `plain`, reading from the socket until
    /// at least one byte or a zero chunk arrives. Returns the number of
    /// appended bytes; `Ok(0)` with `has_zero_chunk` false means EOF.
    pub async fn read_some(
        &mut self,
        plain: &mut Vec<u8>,
        has_zero_chunk: &mut bool,
    ) -> std::io::Result<usize> {
        let start_len = plain.len();
        *has_zero_chunk = false;

        // Drain ciphertext buffered by a previous call (for example the
        // remainder after a zero chunk) before touching the socket.
        if self.crypto.has_pending() {
            self.crypto.decrypt_some(plain, &[], has_zero_chunk)?;
            if plain.len() > start_len || *has_zero_chunk {
                return Ok(plain.len() - start_len);
            }
        }

        let mut staged = Vec::new();
        loop {
            let nread = self.socket.read(self.raw).await?;
            if nread == 0 {
                return Ok(0);
            }
            staged.clear();
            staged.extend_from_slice(&self.raw[..nread]);
            if let Some(obfs) = self.obfs.as_mut() {
                if obfs.deobfs_request(&mut staged)? == DeobfsStatus::NeedMore {
                    continue;
                }
            }
            self.crypto.decrypt_some(plain, &staged, has_zero_chunk)?;
            if plain.len() > start_len || *has_zero_chunk {
                return Ok(plain.len() - start_len);
            }
        }
    }
}

pub struct SnellStreamWriter<'a> {
    socket: &'a mut OwnedWriteHalf,
    crypto: EncryptHalf<'a>,
    obfs: Option<ObfsWriter<'a>>,
}

impl SnellStreamWriter<'_> {
    /// Encrypts, obfuscates and writes one whole message. The record hits
    /// the socket in a single write_all, so concurrent writers on other
    /// sockets never interleave within a record.
    pub async fn write(&mut self, plain: &[u8], add_zero_chunk: bool) -> std::io::Result<()> {
        let mut ctext = Vec::with_capacity(plain.len() + 128);
        self.crypto.encrypt_some(&mut ctext, plain, add_zero_chunk)?;
        if let Some(obfs) = self.obfs.as_mut() {
            obfs.obfs_response(&mut ctext);
        }
        if !ctext.is_empty() {
            self.socket.write_all(&ctext).await?;
        }
        Ok(())
    }
}
