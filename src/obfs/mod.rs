mod http_obfs;
mod tls_obfs;

pub use http_obfs::HttpObfs;
pub use tls_obfs::TlsObfs;

use http_obfs::{HttpReadState, HttpWriteState};
use tls_obfs::{SessionId, TlsReadState, TlsWriteState};

/// Outcome of feeding bytes into the inbound de-obfuscation state machine.
/// `NeedMore` means the greeting has not fully arrived yet; it never
/// surfaces past the stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeobfsStatus {
    Ready,
    NeedMore,
}

/// Wire-level mimicry wrapped around the already-encrypted stream. Each
/// session clones the configured template with `duplicate()`; the template
/// itself is never mutated after startup.
pub enum Obfuscator {
    Http(HttpObfs),
    Tls(TlsObfs),
}

impl Obfuscator {
    pub fn http(host: &str) -> Self {
        Obfuscator::Http(HttpObfs::new(host))
    }

    pub fn tls(host: &str) -> Self {
        Obfuscator::Tls(TlsObfs::new(host))
    }

    /// Fresh instance carrying only the immutable configuration.
    pub fn duplicate(&self) -> Self {
        match self {
            Obfuscator::Http(o) => Obfuscator::Http(o.duplicate()),
            Obfuscator::Tls(o) => Obfuscator::Tls(o.duplicate()),
        }
    }

    /// Splits into the inbound and outbound state machines so the two
    /// forwarding directions can run concurrently. The writer snapshots the
    /// TLS session id; the reader only assigns it during the greeting,
    /// before any response is emitted.
    pub fn split(&mut self) -> (ObfsReader<'_>, ObfsWriter<'_>) {
        match self {
            Obfuscator::Http(o) => {
                let (read, write) = o.states();
                (ObfsReader::Http(read), ObfsWriter::Http(write))
            }
            Obfuscator::Tls(o) => {
                let (read, write) = o.states();
                let session_id = read.session_id;
                (
                    ObfsReader::Tls(read),
                    ObfsWriter::Tls { state: write, session_id },
                )
            }
        }
    }

    pub fn deobfs_request(&mut self, data: &mut Vec<u8>) -> std::io::Result<DeobfsStatus> {
        self.split().0.deobfs_request(data)
    }

    pub fn obfs_response(&mut self, data: &mut Vec<u8>) {
        self.split().1.obfs_response(data)
    }
}

pub enum ObfsReader<'a> {
    Http(&'a mut HttpReadState),
    Tls(&'a mut TlsReadState),
}

impl ObfsReader<'_> {
    /// Consumes the raw bytes in `data` and replaces them with the carried
    /// ciphertext. On `NeedMore`, `data` comes back empty.
    pub fn deobfs_request(&mut self, data: &mut Vec<u8>) -> std::io::Result<DeobfsStatus> {
        match self {
            ObfsReader::Http(state) => state.deobfs_request(data),
            ObfsReader::Tls(state) => state.deobfs_request(data),
        }
    }
}

pub enum ObfsWriter<'a> {
    Http(&'a mut HttpWriteState),
    Tls {
        state: &'a mut TlsWriteState,
        session_id: SessionId,
    },
}

impl ObfsWriter<'_> {
    /// Wraps outbound ciphertext in place: the first call prepends the
    /// protocol greeting, later calls the steady-state framing.
    pub fn obfs_response(&mut self, data: &mut Vec<u8>) {
        match self {
            ObfsWriter::Http(state) => state.obfs_response(data),
            ObfsWriter::Tls { state, session_id } => state.obfs_response(session_id, data),
        }
    }
}
