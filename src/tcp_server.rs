use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;

use crate::config::{ObfsMode, ServerConfig};
use crate::crypto::PskKey;
use crate::obfs::Obfuscator;
use crate::resolver::Resolver;
use crate::session::SnellSession;

/// Binds the listener and accepts connections forever, spawning one session
/// task per client. Accept errors are logged, not fatal.
pub async fn run_tcp_server(
    config: ServerConfig,
    resolver: Arc<dyn Resolver>,
) -> std::io::Result<()> {
    let ServerConfig {
        bind_address,
        psk,
        obfs,
    } = config;

    let psk = Arc::new(PskKey::new(&psk));
    let obfs_template = obfs.map(|o| match o.mode {
        ObfsMode::Http => Obfuscator::http(&o.host),
        ObfsMode::Tls => Obfuscator::tls(&o.host),
    });

    let listener = TcpListener::bind(bind_address).await?;
    info!("start listening at {bind_address}");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set nodelay on {peer_addr}: {e}");
        }
        debug!("accepted a new connection from {peer_addr}");

        let session = SnellSession::new(
            stream,
            peer_addr,
            psk.clone(),
            obfs_template.as_ref().map(Obfuscator::duplicate),
            resolver.clone(),
        );
        tokio::spawn(session.run());
    }
}
