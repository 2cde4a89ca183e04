use std::time::SystemTime;

use rand::RngCore;

use super::DeobfsStatus;

// Fixed layout of the synthetic ClientHello the client-side obfuscator
// emits. The session-ticket extension directly follows the hello body and
// carries the first ciphertext bytes as its payload.
const CLIENT_HELLO_LEN: usize = 138;
const RECORD_LEN_OFFSET: usize = 3;
const SESSION_ID_OFFSET: usize = 44;
const TICKET_TYPE_OFFSET: usize = CLIENT_HELLO_LEN;
const TICKET_LEN_OFFSET: usize = CLIENT_HELLO_LEN + 2;
const TICKET_PAYLOAD_OFFSET: usize = CLIENT_HELLO_LEN + 4;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const SESSION_TICKET_TYPE: u16 = 0x0023;

const DATA_HEADER: [u8; 3] = [0x17, 0x03, 0x03];
const FRAME_MAX_LEN: usize = 16384;

const SERVER_HELLO_TIME_OFFSET: usize = 11;
const SERVER_HELLO_RANDOM_OFFSET: usize = 15;
const SERVER_HELLO_SESSION_ID_OFFSET: usize = 44;
const SERVER_HELLO_LEN: usize = 96;

// ServerHello with cipher suite TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
// (0xCCA8), followed by renegotiation-info, extended-master-secret and
// ec-point-formats extensions. Byte-exact with the shape existing clients
// expect, including the zeroed extensions-length field.
const SERVER_HELLO_TEMPLATE: [u8; SERVER_HELLO_LEN] = [
    0x16, 0x03, 0x01, 0x00, 0x5b, // record header
    0x02, 0x00, 0x00, 0x57, // handshake header
    0x03, 0x03, // version
    0x00, 0x00, 0x00, 0x00, // unix time, patched per response
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x20, // session id length
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, // session id, patched per response
    0xcc, 0xa8, // cipher suite
    0x00, // compression method
    0x00, 0x00, // extensions length
    0xff, 0x01, 0x00, 0x01, 0x00, // renegotiation info
    0x00, 0x17, 0x00, 0x00, // extended master secret
    0x00, 0x0b, 0x00, 0x02, 0x01, 0x00, // ec point formats
];

const CHANGE_CIPHER_SPEC: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

/// Pseudo-TLS mimicry: the greeting exchange imitates a TLS 1.2 handshake
/// and steady-state traffic rides in application-data records. No actual TLS
/// is spoken.
pub struct TlsObfs {
    hostname: String,
    read: TlsReadState,
    write: TlsWriteState,
}

impl TlsObfs {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            read: TlsReadState::new(),
            write: TlsWriteState::new(),
        }
    }

    pub fn duplicate(&self) -> Self {
        Self::new(&self.hostname)
    }

    pub(super) fn states(&mut self) -> (&mut TlsReadState, &mut TlsWriteState) {
        (&mut self.read, &mut self.write)
    }
}

/// Client session id echoed back in the ServerHello. Slot 32 records whether
/// a value was captured from the greeting.
#[derive(Debug, Clone, Copy)]
pub struct SessionId([u8; 33]);

impl SessionId {
    fn new() -> Self {
        SessionId([0u8; 33])
    }

    fn capture(&mut self, id: &[u8]) {
        self.0[..32].copy_from_slice(id);
        self.0[32] = 1;
    }

    fn is_captured(&self) -> bool {
        self.0[32] != 0
    }

    fn bytes(&self) -> &[u8] {
        &self.0[..32]
    }
}

/// Inbound state machine: greeting ingest followed by application-data
/// record parsing.
pub struct TlsReadState {
    greeting_done: bool,
    buffer: Vec<u8>,
    frame: Frame,
    pub(super) session_id: SessionId,
}

struct Frame {
    idx: usize,
    len: usize,
    hdr: [u8; 2],
}

impl TlsReadState {
    fn new() -> Self {
        Self {
            greeting_done: false,
            buffer: Vec::new(),
            frame: Frame {
                idx: 0,
                len: 0,
                hdr: [0u8; 2],
            },
            session_id: SessionId::new(),
        }
    }

    pub(super) fn deobfs_request(&mut self, data: &mut Vec<u8>) -> std::io::Result<DeobfsStatus> {
        if self.greeting_done {
            let input = std::mem::take(data);
            deobfs_app_data(&mut self.frame, &input, data)?;
            return Ok(DeobfsStatus::Ready);
        }

        self.buffer.append(data);

        if self.buffer.is_empty() {
            return Ok(DeobfsStatus::NeedMore);
        }
        if self.buffer[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "tls obfs content type mismatch",
            ));
        }
        if self.buffer.len() < TICKET_PAYLOAD_OFFSET {
            return Ok(DeobfsStatus::NeedMore);
        }

        let record_len = read_u16_be(&self.buffer, RECORD_LEN_OFFSET) as usize + 5;
        if read_u16_be(&self.buffer, TICKET_TYPE_OFFSET) != SESSION_TICKET_TYPE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "tls obfs session ticket type mismatch",
            ));
        }
        let ticket_len = read_u16_be(&self.buffer, TICKET_LEN_OFFSET) as usize;
        if TICKET_PAYLOAD_OFFSET + ticket_len > record_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "tls obfs session ticket exceeds hello record",
            ));
        }

        // Hold everything until the whole ClientHello record is here, so a
        // byte-dribbled greeting yields the same ticket payload as a
        // monolithic one.
        if self.buffer.len() < record_len {
            return Ok(DeobfsStatus::NeedMore);
        }

        self.session_id
            .capture(&self.buffer[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 32]);

        data.extend_from_slice(
            &self.buffer[TICKET_PAYLOAD_OFFSET..TICKET_PAYLOAD_OFFSET + ticket_len],
        );
        deobfs_app_data(&mut self.frame, &self.buffer[record_len..], data)?;

        self.buffer = Vec::new();
        self.greeting_done = true;
        Ok(DeobfsStatus::Ready)
    }
}

pub struct TlsWriteState {
    greeting_sent: bool,
}

impl TlsWriteState {
    fn new() -> Self {
        Self { greeting_sent: false }
    }

    pub(super) fn obfs_response(&mut self, session_id: &SessionId, data: &mut Vec<u8>) {
        debug_assert!(data.len() <= u16::MAX as usize);

        if self.greeting_sent {
            let mut head = [0u8; 5];
            head[..3].copy_from_slice(&DATA_HEADER);
            head[3..].copy_from_slice(&(data.len() as u16).to_be_bytes());
            data.splice(0..0, head);
            return;
        }
        self.greeting_sent = true;

        let mut head = Vec::with_capacity(SERVER_HELLO_LEN + CHANGE_CIPHER_SPEC.len() + 5);
        head.extend_from_slice(&SERVER_HELLO_TEMPLATE);
        let now = SystemTime::UNIX_EPOCH.elapsed().unwrap().as_secs() as u32;
        head[SERVER_HELLO_TIME_OFFSET..SERVER_HELLO_TIME_OFFSET + 4]
            .copy_from_slice(&now.to_be_bytes());
        rand::thread_rng()
            .fill_bytes(&mut head[SERVER_HELLO_RANDOM_OFFSET..SERVER_HELLO_RANDOM_OFFSET + 28]);
        let sid = &mut head[SERVER_HELLO_SESSION_ID_OFFSET..SERVER_HELLO_SESSION_ID_OFFSET + 32];
        if session_id.is_captured() {
            sid.copy_from_slice(session_id.bytes());
        } else {
            rand::thread_rng().fill_bytes(sid);
        }

        head.extend_from_slice(&CHANGE_CIPHER_SPEC);
        head.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x03]);
        head.extend_from_slice(&(data.len() as u16).to_be_bytes());
        data.splice(0..0, head);
    }
}

fn read_u16_be(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Scans application-data records, validating the three magic bytes and the
/// 16-bit length, and appends record bodies to `out`. Record boundaries may
/// fall anywhere relative to the input slices.
fn deobfs_app_data(frame: &mut Frame, input: &[u8], out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut i = 0;
    while i < input.len() {
        if frame.len == 0 {
            let b = input[i];
            if frame.idx < 3 {
                if b != DATA_HEADER[frame.idx] {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "tls obfs invalid frame",
                    ));
                }
            } else {
                frame.hdr[frame.idx - 3] = b;
            }
            frame.idx += 1;
            i += 1;
            if frame.idx == 5 {
                frame.len = u16::from_be_bytes(frame.hdr) as usize;
                frame.idx = 0;
                if frame.len > FRAME_MAX_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("tls obfs frame too big: {}", frame.len),
                    ));
                }
            }
        } else {
            let take = frame.len.min(input.len() - i);
            out.extend_from_slice(&input[i..i + take]);
            i += take;
            frame.len -= take;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{DeobfsStatus, Obfuscator};
    use super::*;

    /// Builds the ClientHello + session-ticket greeting a client-side
    /// obfuscator produces, with `payload` as the embedded ciphertext.
    fn build_client_greeting(payload: &[u8], host: &str) -> Vec<u8> {
        let total = CLIENT_HELLO_LEN + 4 + payload.len() + 9 + host.len() + 66;
        let mut out = Vec::with_capacity(total);
        out.push(0x16);
        out.extend_from_slice(&[0x03, 0x01]);
        out.extend_from_slice(&((total - 5) as u16).to_be_bytes());
        out.push(0x01);
        out.push(0x00);
        out.extend_from_slice(&((total - 9) as u16).to_be_bytes());
        out.extend_from_slice(&[0x03, 0x03]);
        out.extend_from_slice(&[0u8; 4]); // unix time
        out.extend_from_slice(&[0u8; 28]); // random
        out.push(32);
        out.extend_from_slice(&[0xabu8; 32]); // session id
        out.extend_from_slice(&56u16.to_be_bytes());
        out.extend_from_slice(&[0u8; 56]); // cipher suites
        out.push(1);
        out.push(0); // compression methods
        out.extend_from_slice(&((total - CLIENT_HELLO_LEN) as u16).to_be_bytes());
        // session ticket extension carrying the payload
        out.extend_from_slice(&SESSION_TICKET_TYPE.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        // server name extension
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
        out.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        out.push(0);
        out.extend_from_slice(&(host.len() as u16).to_be_bytes());
        out.extend_from_slice(host.as_bytes());
        // remaining extensions; content is not inspected by the server
        out.extend_from_slice(&[0u8; 66]);
        assert_eq!(out.len(), total);
        out
    }

    fn frame_record(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&DATA_HEADER);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_greeting_monolithic() {
        let greeting = build_client_greeting(b"embedded ciphertext", "www.bing.com");
        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut data = greeting;
        assert_eq!(obfs.deobfs_request(&mut data).unwrap(), DeobfsStatus::Ready);
        assert_eq!(data, b"embedded ciphertext");
    }

    #[test]
    fn test_greeting_one_byte_at_a_time_matches_monolithic() {
        let payload = b"the first chunk of real ciphertext";
        let mut greeting = build_client_greeting(payload, "www.bing.com");
        greeting.extend_from_slice(&frame_record(b" and a trailing record"));

        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut collected = Vec::new();
        for &b in greeting.iter() {
            let mut data = vec![b];
            match obfs.deobfs_request(&mut data).unwrap() {
                DeobfsStatus::Ready => collected.append(&mut data),
                DeobfsStatus::NeedMore => assert!(data.is_empty()),
            }
        }
        let mut expected = payload.to_vec();
        expected.extend_from_slice(b" and a trailing record");
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_steady_state_frames_across_splits() {
        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut data = build_client_greeting(b"", "www.bing.com");
        obfs.deobfs_request(&mut data).unwrap();

        let mut wire = frame_record(b"hello");
        wire.extend_from_slice(&frame_record(b" world"));
        let mut collected = Vec::new();
        for chunk in wire.chunks(3) {
            let mut data = chunk.to_vec();
            obfs.deobfs_request(&mut data).unwrap();
            collected.append(&mut data);
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn test_rejects_wrong_content_type() {
        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut data = vec![0x17, 0x03, 0x03];
        assert!(obfs.deobfs_request(&mut data).is_err());
    }

    #[test]
    fn test_rejects_wrong_ticket_type() {
        let mut greeting = build_client_greeting(b"x", "www.bing.com");
        greeting[TICKET_TYPE_OFFSET] = 0xff;
        let mut obfs = Obfuscator::tls("www.bing.com");
        assert!(obfs.deobfs_request(&mut greeting).is_err());
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut data = build_client_greeting(b"", "www.bing.com");
        obfs.deobfs_request(&mut data).unwrap();

        let mut data = vec![0x17, 0x03, 0x03, 0x40, 0x01]; // 16385
        assert!(obfs.deobfs_request(&mut data).is_err());
    }

    #[test]
    fn test_response_round_trip_with_byte_resplitting() {
        let mut obfs = Obfuscator::tls("www.bing.com");
        let mut greeting = build_client_greeting(b"", "www.bing.com");
        obfs.deobfs_request(&mut greeting).unwrap();

        let mut first = b"first response bytes".to_vec();
        obfs.obfs_response(&mut first);
        let mut second = b"second".to_vec();
        obfs.obfs_response(&mut second);

        // Client view of the greeting: ServerHello + ChangeCipherSpec, then
        // an EncryptedHandshake record holding the first payload, then plain
        // application-data records.
        assert_eq!(first[0], 0x16);
        assert_eq!(
            &first[SERVER_HELLO_SESSION_ID_OFFSET..SERVER_HELLO_SESSION_ID_OFFSET + 32],
            &[0xabu8; 32],
        );
        let eh_offset = SERVER_HELLO_LEN + CHANGE_CIPHER_SPEC.len();
        assert_eq!(&first[eh_offset..eh_offset + 3], &[0x16, 0x03, 0x03]);
        let eh_len = read_u16_be(&first, eh_offset + 3) as usize;
        assert_eq!(&first[eh_offset + 5..eh_offset + 5 + eh_len], b"first response bytes");

        let mut wire = first[eh_offset + 5 + eh_len..].to_vec();
        wire.extend_from_slice(&second);
        let mut frame = Frame { idx: 0, len: 0, hdr: [0u8; 2] };
        let mut recovered = Vec::new();
        for &b in wire.iter() {
            deobfs_app_data(&mut frame, &[b], &mut recovered).unwrap();
        }
        assert_eq!(recovered, b"second");
    }
}
