use std::collections::HashMap;
use std::net::SocketAddr;

use log::{info, warn};

pub const DEFAULT_OBFS_HOST: &str = "www.bing.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsMode {
    Http,
    Tls,
}

#[derive(Debug, Clone)]
pub struct ObfsConfig {
    pub mode: ObfsMode,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub psk: String,
    pub obfs: Option<ObfsConfig>,
}

impl ServerConfig {
    pub fn new(
        listen: &str,
        psk: String,
        obfs: Option<String>,
        obfs_host: String,
    ) -> std::io::Result<Self> {
        if listen.is_empty() || psk.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "listening address and psk should not be empty",
            ));
        }
        let bind_address = parse_listen(listen)?;
        let obfs = obfs.and_then(|method| {
            let mode = match method.as_str() {
                "http" => ObfsMode::Http,
                "tls" => ObfsMode::Tls,
                other => {
                    warn!("unknown obfs method {other}, disable obfs");
                    return None;
                }
            };
            info!("using obfs method {method}, obfs-host {obfs_host}");
            Some(ObfsConfig {
                mode,
                host: obfs_host.clone(),
            })
        });
        Ok(Self {
            bind_address,
            psk,
            obfs,
        })
    }

    /// Loads an INI file with a single `[snell-server]` section and keys
    /// `listen`, `psk`, `obfs` and `obfs-host`.
    pub fn from_ini_file(path: &str) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ini = parse_ini(&contents)?;
        let listen = ini.get("snell-server", "listen").unwrap_or("").to_string();
        let psk = ini.get("snell-server", "psk").unwrap_or("").to_string();
        let obfs = ini.get("snell-server", "obfs").map(str::to_string);
        let obfs_host = ini
            .get("snell-server", "obfs-host")
            .unwrap_or(DEFAULT_OBFS_HOST)
            .to_string();
        Self::new(&listen, psk, obfs, obfs_host)
    }
}

/// `ip:port` or `[ipv6]:port`; address literals only.
pub fn parse_listen(s: &str) -> std::io::Result<SocketAddr> {
    s.parse::<SocketAddr>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid listen address {s}: {e}"),
        )
    })
}

#[derive(Debug)]
struct Ini {
    items: HashMap<String, String>,
}

impl Ini {
    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.items
            .get(&format!("{section}.{key}"))
            .map(String::as_str)
    }
}

fn parse_ini(contents: &str) -> std::io::Result<Ini> {
    let mut items = HashMap::new();
    let mut section = String::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].to_string();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "configuration file parse error at line {}: {}",
                    lineno + 1,
                    line
                ),
            ));
        };
        items.insert(
            format!("{}.{}", section, key.trim()),
            value.trim().to_string(),
        );
    }
    Ok(Ini { items })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ini_sections_and_trimming() {
        let ini = parse_ini(
            "; comment\n\
             # another\n\
             [snell-server]\n\
             listen = 0.0.0.0:8388\n\
             psk=hunter2\n\
             obfs =  tls\n",
        )
        .unwrap();
        assert_eq!(ini.get("snell-server", "listen"), Some("0.0.0.0:8388"));
        assert_eq!(ini.get("snell-server", "psk"), Some("hunter2"));
        assert_eq!(ini.get("snell-server", "obfs"), Some("tls"));
        assert_eq!(ini.get("snell-server", "obfs-host"), None);
    }

    #[test]
    fn test_parse_ini_rejects_bare_line() {
        let err = parse_ini("[snell-server]\nnot a key value\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_listen_forms() {
        assert!(parse_listen("127.0.0.1:8388").is_ok());
        assert!(parse_listen("[::1]:8388").is_ok());
        assert!(parse_listen("localhost:8388").is_err());
        assert!(parse_listen("127.0.0.1").is_err());
    }

    #[test]
    fn test_unknown_obfs_disables_obfuscation() {
        let config = ServerConfig::new(
            "127.0.0.1:8388",
            "hunter2".to_string(),
            Some("quic".to_string()),
            DEFAULT_OBFS_HOST.to_string(),
        )
        .unwrap();
        assert!(config.obfs.is_none());
    }

    #[test]
    fn test_empty_psk_is_rejected() {
        assert!(ServerConfig::new(
            "127.0.0.1:8388",
            String::new(),
            None,
            DEFAULT_OBFS_HOST.to_string()
        )
        .is_err());
    }
}
