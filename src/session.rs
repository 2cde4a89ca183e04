use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::{Address, NetLocation};
use crate::crypto::{CipherKind, CryptoContext, PskKey};
use crate::obfs::Obfuscator;
use crate::resolver::Resolver;
use crate::snell_stream::{SnellStream, BUF_SIZE};

const SNELL_VERSION: u8 = 0x01;
const CMD_PING: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_CONNECT_V2: u8 = 0x05;
const RESPONSE_ERROR: u8 = 0x02;

/// One accepted client connection. Runs the handshake, connects to the
/// requested target and forwards both directions; with v2 sub-session reuse
/// the cycle repeats on the same connection until either side gives up.
pub struct SnellSession {
    stream: SnellStream,
    resolver: Arc<dyn Resolver>,
    peer_addr: SocketAddr,
    uid: String,
    snell_v2: bool,
}

enum Handshake {
    /// Client closed the connection instead of (or while) handshaking.
    Eof,
    Ping,
    Connect {
        location: NetLocation,
        /// Plaintext decoded beyond the handshake header; the first client
        /// payload for the target.
        pending: Vec<u8>,
        /// A zero chunk already arrived: forward the pending bytes, then
        /// stop the client-to-target direction.
        shutdown_after_forward: bool,
    },
}

impl SnellSession {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        psk: Arc<PskKey>,
        obfs: Option<Obfuscator>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let crypto = CryptoContext::new(
            CipherKind::Aes128Gcm,
            Some(CipherKind::Chacha20Poly1305),
            psk,
        );
        debug!("session from {peer_addr} opened");
        Self {
            stream: SnellStream::new(stream, crypto, obfs),
            resolver,
            peer_addr,
            uid: "<none>".to_string(),
            snell_v2: true,
        }
    }

    pub async fn run(mut self) {
        loop {
            self.uid = "<none>".to_string();
            let handshake = match self.handshake().await {
                Ok(h) => h,
                Err(e) => {
                    error!(
                        "session {} from {} handshake failed, abort session: {}",
                        self.uid, self.peer_addr, e
                    );
                    break;
                }
            };

            match handshake {
                Handshake::Eof => {
                    info!(
                        "session {} from {} handshake meets eof, end session",
                        self.uid, self.peer_addr
                    );
                    break;
                }
                Handshake::Ping => {
                    debug!("session {} from {} sending pong back", self.uid, self.peer_addr);
                    self.send_pong().await;
                    break;
                }
                Handshake::Connect {
                    location,
                    pending,
                    shutdown_after_forward,
                } => {
                    let addrs = match self.resolve(&location).await {
                        Ok(addrs) => addrs,
                        Err(e) => {
                            error!(
                                "session {} from {} failed to resolve {}, {}",
                                self.uid, self.peer_addr, location, e
                            );
                            self.write_error_back(&e).await;
                            if self.snell_v2 {
                                continue;
                            }
                            break;
                        }
                    };
                    let target = match connect_any(&addrs).await {
                        Ok(target) => target,
                        Err(e) => {
                            error!(
                                "session {} from {} failed to connect {}, {}",
                                self.uid, self.peer_addr, location, e
                            );
                            self.write_error_back(&e).await;
                            if self.snell_v2 {
                                continue;
                            }
                            break;
                        }
                    };
                    info!(
                        "session {} from {} connected to target {}",
                        self.uid, self.peer_addr, location
                    );

                    self.forward(target, pending, shutdown_after_forward).await;

                    if !self.snell_v2 {
                        break;
                    }
                    info!(
                        "session {} from {} starts for new sub connection",
                        self.uid, self.peer_addr
                    );
                }
            }
        }
        debug!("session {} from {} closed", self.uid, self.peer_addr);
    }

    /// Reads and parses one handshake record:
    /// version(1) cmd(1) uid_len(1) uid addr_len(1) addr port(2 BE).
    /// The accumulated plaintext is re-parsed from the start whenever more
    /// bytes arrive.
    async fn handshake(&mut self) -> std::io::Result<Handshake> {
        let mut plain: Vec<u8> = Vec::new();
        let mut saw_zero_chunk = false;

        loop {
            let mut has_zero_chunk = false;
            let nread = self.stream.read_some(&mut plain, &mut has_zero_chunk).await?;
            saw_zero_chunk |= has_zero_chunk;
            if nread == 0 && !has_zero_chunk {
                return Ok(Handshake::Eof);
            }

            if plain.len() < 4 {
                continue;
            }
            if plain[0] != SNELL_VERSION {
                return Err(std::io::Error::other(format!(
                    "unsupported protocol version 0x{:02x}",
                    plain[0]
                )));
            }
            match plain[1] {
                CMD_PING => return Ok(Handshake::Ping),
                CMD_CONNECT_V2 => {}
                CMD_CONNECT => {
                    // v1 connect: exactly one sub-session on this connection.
                    self.snell_v2 = false;
                }
                cmd => {
                    return Err(std::io::Error::other(format!(
                        "unsupported command 0x{cmd:02x}"
                    )));
                }
            }

            let uid_len = plain[2] as usize;
            if plain.len() < 3 + uid_len + 1 {
                continue;
            }
            let addr_len = plain[3 + uid_len] as usize;
            let addr_start = 4 + uid_len;
            if plain.len() < addr_start + addr_len + 2 {
                continue;
            }

            if uid_len > 0 {
                self.uid = String::from_utf8_lossy(&plain[3..3 + uid_len]).into_owned();
            }
            let host = std::str::from_utf8(&plain[addr_start..addr_start + addr_len])
                .map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("failed to decode hostname: {e}"),
                    )
                })?;
            let port = u16::from_be_bytes([
                plain[addr_start + addr_len],
                plain[addr_start + addr_len + 1],
            ]);
            let location = NetLocation::new(Address::from_str(host)?, port);
            debug!(
                "session {} from {} handshake extracted target {}",
                self.uid, self.peer_addr, location
            );

            let pending = plain[addr_start + addr_len + 2..].to_vec();
            return Ok(Handshake::Connect {
                location,
                pending,
                shutdown_after_forward: saw_zero_chunk,
            });
        }
    }

    async fn resolve(&self, location: &NetLocation) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addr) = location.to_socket_addr_nonblocking() {
            return Ok(vec![addr]);
        }
        let addrs = self.resolver.resolve_location(location).await?;
        if addrs.is_empty() {
            return Err(std::io::Error::other(format!(
                "could not resolve {location}"
            )));
        }
        Ok(addrs)
    }

    async fn send_pong(&mut self) {
        if let Err(e) = self.stream.write(&[0x00], true).await {
            error!(
                "session {} from {} write pong error, {}",
                self.uid, self.peer_addr, e
            );
        }
    }

    /// Error reply: opcode 0x02, one length byte, then up to 255 message
    /// bytes, terminated with a zero chunk.
    async fn write_error_back(&mut self, err: &std::io::Error) {
        let message = err.to_string();
        let message = message.as_bytes();
        let len = message.len().min(255);
        let mut reply = Vec::with_capacity(2 + len);
        reply.push(RESPONSE_ERROR);
        reply.push(len as u8);
        reply.extend_from_slice(&message[..len]);
        if let Err(e) = self.stream.write(&reply, true).await {
            error!(
                "session {} from {} write error back failed, {}",
                self.uid, self.peer_addr, e
            );
        }
    }

    async fn forward(&mut self, target: TcpStream, pending: Vec<u8>, shutdown_after_forward: bool) {
        let uid = self.uid.clone();
        let peer_addr = self.peer_addr;
        let snell_v2 = self.snell_v2;
        let (mut target_read, mut target_write) = target.into_split();
        let (mut client_read, mut client_write) = self.stream.split();

        let client_to_target = async {
            let mut buffer = pending;
            loop {
                let mut has_zero_chunk = false;
                if buffer.is_empty() && !shutdown_after_forward {
                    match client_read.read_some(&mut buffer, &mut has_zero_chunk).await {
                        Ok(0) if !has_zero_chunk => {
                            if snell_v2 {
                                error!("session {uid} from {peer_addr} client read meets eof");
                            } else {
                                info!("session {uid} from {peer_addr} client read meets eof");
                            }
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("session {uid} from {peer_addr} client read error, {e}");
                            break;
                        }
                    }
                }
                if !buffer.is_empty() {
                    if let Err(e) = target_write.write_all(&buffer).await {
                        error!("session {uid} from {peer_addr} target write error, {e}");
                        break;
                    }
                    buffer.clear();
                }
                if has_zero_chunk || shutdown_after_forward {
                    debug!("session {uid} from {peer_addr} terminates forwarding c2t");
                    break;
                }
            }
            let _ = target_write.shutdown().await;
        };

        let target_to_client = async {
            let mut buf = vec![0u8; BUF_SIZE];
            let mut lead_byte = true;
            loop {
                // The first plaintext sent back to the client starts with a
                // single 0x00 reply byte ahead of the target payload.
                let offset = if lead_byte {
                    buf[0] = 0x00;
                    1
                } else {
                    0
                };
                lead_byte = false;

                let (nread, eof) = match target_read.read(&mut buf[offset..]).await {
                    Ok(0) => (0, true),
                    Ok(n) => (n, false),
                    Err(e) => {
                        error!("session {uid} from {peer_addr} target read error, {e}");
                        break;
                    }
                };
                if let Err(e) = client_write
                    .write(&buf[..offset + nread], eof && snell_v2)
                    .await
                {
                    error!("session {uid} from {peer_addr} client write error, {e}");
                    break;
                }
                if eof {
                    debug!("session {uid} from {peer_addr} terminates forwarding t2c");
                    break;
                }
            }
        };

        tokio::join!(client_to_target, target_to_client);
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no addresses to connect to")))
}
