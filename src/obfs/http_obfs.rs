use chrono::Utc;
use rand::Rng;

use super::DeobfsStatus;

/// HTTP-upgrade mimicry. The client greeting must look like a websocket
/// upgrade request; the server answers with a synthetic 101 response. After
/// the greetings both directions are pass-through.
pub struct HttpObfs {
    host_port: String,
    read: HttpReadState,
    write: HttpWriteState,
}

impl HttpObfs {
    pub fn new(host: &str) -> Self {
        Self {
            host_port: host.to_string(),
            read: HttpReadState::new(),
            write: HttpWriteState::new(),
        }
    }

    pub fn duplicate(&self) -> Self {
        Self {
            host_port: self.host_port.clone(),
            read: HttpReadState::new(),
            write: HttpWriteState::new(),
        }
    }

    pub(super) fn states(&mut self) -> (&mut HttpReadState, &mut HttpWriteState) {
        (&mut self.read, &mut self.write)
    }
}

pub struct HttpReadState {
    header_consumed: bool,
    buffer: Vec<u8>,
}

impl HttpReadState {
    fn new() -> Self {
        Self {
            header_consumed: false,
            buffer: Vec::new(),
        }
    }

    pub(super) fn deobfs_request(&mut self, data: &mut Vec<u8>) -> std::io::Result<DeobfsStatus> {
        if self.header_consumed {
            return Ok(DeobfsStatus::Ready);
        }

        self.buffer.append(data);

        if self.buffer.len() >= 3 && !self.buffer[..3].eq_ignore_ascii_case(b"GET") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http obfs method mismatch",
            ));
        }

        let Some(end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            return Ok(DeobfsStatus::NeedMore);
        };

        // Only the Upgrade field is validated; anything else the client puts
        // in the header block is accepted.
        match upgrade_header_value(&self.buffer[..end]) {
            Some(value) if value == b"websocket" => {}
            Some(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "http obfs upgrade protocol mismatch",
                ));
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "http obfs upgrade field not found",
                ));
            }
        }

        data.extend_from_slice(&self.buffer[end + 4..]);
        self.buffer = Vec::new();
        self.header_consumed = true;
        Ok(DeobfsStatus::Ready)
    }
}

pub struct HttpWriteState {
    greeting_sent: bool,
}

impl HttpWriteState {
    fn new() -> Self {
        Self { greeting_sent: false }
    }

    pub(super) fn obfs_response(&mut self, data: &mut Vec<u8>) {
        if self.greeting_sent {
            return;
        }
        self.greeting_sent = true;

        let mut rng = rand::thread_rng();
        let major: u8 = rng.gen_range(0..11);
        let minor: u8 = rng.gen_range(0..12);
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        let accept = random_accept_token(&mut rng);
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Server: nginx/1.{major}.{minor}\r\n\
             Date: {date}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        );
        data.splice(0..0, head.into_bytes());
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Finds the Upgrade header value in a block of header lines. The field name
/// match is case-insensitive, leading blanks in the value are skipped.
fn upgrade_header_value(header: &[u8]) -> Option<&[u8]> {
    for line in header.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() <= 8 || !line[..8].eq_ignore_ascii_case(b"Upgrade:") {
            continue;
        }
        let mut value = &line[8..];
        while let Some((first, rest)) = value.split_first() {
            if *first != b' ' && *first != b'\t' {
                break;
            }
            value = rest;
        }
        return Some(value);
    }
    None
}

/// 24 characters from the base64 alphabet, optionally '='-padded in the last
/// one or two positions, shaped like a real Sec-WebSocket-Accept value.
fn random_accept_token(rng: &mut impl Rng) -> String {
    const B64_CHARS: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut token: Vec<u8> = (0..22)
        .map(|_| B64_CHARS[rng.gen_range(0..B64_CHARS.len())])
        .collect();
    if rng.gen_bool(0.5) {
        token.extend_from_slice(b"==");
    } else {
        token.push(B64_CHARS[rng.gen_range(0..B64_CHARS.len())]);
        if rng.gen_bool(0.5) {
            token.push(b'=');
        } else {
            token.push(B64_CHARS[rng.gen_range(0..B64_CHARS.len())]);
        }
    }
    String::from_utf8(token).unwrap()
}

#[cfg(test)]
mod tests {
    use super::super::{DeobfsStatus, Obfuscator};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: www.bing.com\r\n\
        User-Agent: curl/7.43.0\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    #[test]
    fn test_greeting_with_trailing_payload() {
        let mut obfs = Obfuscator::http("www.bing.com");
        let mut data = REQUEST.to_vec();
        data.extend_from_slice(b"ciphertext");
        assert_eq!(obfs.deobfs_request(&mut data).unwrap(), DeobfsStatus::Ready);
        assert_eq!(data, b"ciphertext");
    }

    #[test]
    fn test_greeting_split_across_reads() {
        let mut obfs = Obfuscator::http("www.bing.com");
        for chunk in REQUEST.chunks(7) {
            let mut data = chunk.to_vec();
            let status = obfs.deobfs_request(&mut data).unwrap();
            if status == DeobfsStatus::NeedMore {
                assert!(data.is_empty());
            }
        }
        // Steady state is pass-through.
        let mut data = b"later bytes".to_vec();
        assert_eq!(obfs.deobfs_request(&mut data).unwrap(), DeobfsStatus::Ready);
        assert_eq!(data, b"later bytes");
    }

    #[test]
    fn test_rejects_non_get() {
        let mut obfs = Obfuscator::http("www.bing.com");
        let mut data = b"POST / HTTP/1.1\r\n\r\n".to_vec();
        assert!(obfs.deobfs_request(&mut data).is_err());
    }

    #[test]
    fn test_rejects_missing_upgrade() {
        let mut obfs = Obfuscator::http("www.bing.com");
        let mut data = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        assert!(obfs.deobfs_request(&mut data).is_err());
    }

    #[test]
    fn test_rejects_wrong_upgrade_value() {
        let mut obfs = Obfuscator::http("www.bing.com");
        let mut data = b"GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n".to_vec();
        assert!(obfs.deobfs_request(&mut data).is_err());
    }

    #[test]
    fn test_response_greeting_then_pass_through() {
        let mut obfs = Obfuscator::http("www.bing.com");
        let mut data = b"first".to_vec();
        obfs.obfs_response(&mut data);
        assert!(data.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(data.ends_with(b"\r\n\r\nfirst"));
        let text = String::from_utf8_lossy(&data);
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: "));

        let mut data = b"second".to_vec();
        obfs.obfs_response(&mut data);
        assert_eq!(data, b"second");
    }
}
