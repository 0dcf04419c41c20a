//! TLS client sessions driven by readiness, plus trust-store construction.
//!
//! rustls never touches the socket on its own; every operation here pumps
//! `read_tls`/`write_tls` against the non-blocking stream and reports which
//! readiness it is missing. Note the asymmetry this preserves: a handshake
//! step or even a plaintext *read* can come back `WantWrite`, and vice
//! versa. The reactor must poll for whatever the last call asked, not for
//! what the protocol phase suggests.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use mio::net::TcpStream;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::error::FetchError;

/// Completion state of a control operation (handshake, flush, shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    Ready,
    WantRead,
    WantWrite,
}

/// Outcome of a data operation. `Bytes(0)` from a read means end of stream;
/// whether that is fine or fatal is the caller's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoData {
    Bytes(usize),
    WantRead,
    WantWrite,
}

/// Seam between the connection state machine and the encrypted stream.
/// Production uses [`TlsStream`]; tests script one.
pub trait Transport: Send {
    fn handshake(&mut self) -> Result<IoAction, FetchError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<IoData, FetchError>;
    fn write(&mut self, buf: &[u8]) -> Result<IoData, FetchError>;
    /// Push any buffered TLS records out to the socket.
    fn flush(&mut self) -> Result<IoAction, FetchError>;
    /// Send close_notify and drain it.
    fn shutdown(&mut self) -> Result<IoAction, FetchError>;
    /// Underlying socket for poll registration; `None` for test transports.
    fn socket(&mut self) -> Option<&mut TcpStream>;
}

/// Build the shared client configuration once; it is read-only afterwards
/// and shared by reference across all connections.
pub fn client_config(ca_bundle: Option<&Path>) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match ca_bundle {
        Some(path) => {
            for cert in CertificateDer::pem_file_iter(path)
                .with_context(|| format!("failed to read CA bundle {}", path.display()))?
            {
                let cert = cert.context("invalid certificate in CA bundle")?;
                roots
                    .add(cert)
                    .context("unusable certificate in CA bundle")?;
            }
        }
        None => {
            let loaded = rustls_native_certs::load_native_certs();
            for err in &loaded.errors {
                tracing::warn!("skipping platform trust anchor: {}", err);
            }
            for cert in loaded.certs {
                // tolerate the odd stale root in the platform store
                let _ = roots.add(cert);
            }
        }
    }
    anyhow::ensure!(!roots.is_empty(), "trust store is empty");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// One TLS session over one non-blocking TCP stream.
pub struct TlsStream {
    sess: ClientConnection,
    sock: TcpStream,
    close_sent: bool,
}

impl TlsStream {
    /// Wrap a connected (or connecting) socket. `host` doubles as SNI and
    /// the certificate validation name.
    pub fn connect(config: Arc<ClientConfig>, host: &str, sock: TcpStream) -> Result<Self, FetchError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| FetchError::InvalidUrl(format!("{host}: not a valid server name")))?;
        let sess = ClientConnection::new(config, name)?;
        Ok(Self {
            sess,
            sock,
            close_sent: false,
        })
    }

    /// Write queued TLS records. `Ok(true)` when fully drained,
    /// `Ok(false)` when the socket pushed back.
    fn pump_out(&mut self) -> Result<bool, FetchError> {
        while self.sess.wants_write() {
            match self.sess.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FetchError::TlsIo(e)),
            }
        }
        Ok(true)
    }

    /// Pull TLS records off the socket and decode them.
    fn pump_in(&mut self) -> Result<IoData, FetchError> {
        loop {
            match self.sess.read_tls(&mut self.sock) {
                Ok(0) => return Ok(IoData::Bytes(0)),
                Ok(n) => {
                    self.sess.process_new_packets().map_err(FetchError::Tls)?;
                    return Ok(IoData::Bytes(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoData::WantRead),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FetchError::TlsIo(e)),
            }
        }
    }
}

impl Transport for TlsStream {
    fn handshake(&mut self) -> Result<IoAction, FetchError> {
        while self.sess.is_handshaking() {
            if self.sess.wants_write() {
                if !self.pump_out()? {
                    return Ok(IoAction::WantWrite);
                }
                continue;
            }
            match self.pump_in()? {
                IoData::Bytes(0) => return Err(FetchError::RemoteClose),
                IoData::Bytes(_) => {}
                IoData::WantRead => return Ok(IoAction::WantRead),
                IoData::WantWrite => return Ok(IoAction::WantWrite),
            }
        }
        Ok(IoAction::Ready)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoData, FetchError> {
        debug_assert!(!buf.is_empty());
        loop {
            // flush first so a renegotiated record or alert can't wedge us
            if self.sess.wants_write() && !self.pump_out()? {
                return Ok(IoData::WantWrite);
            }
            match self.sess.reader().read(buf) {
                Ok(n) => return Ok(IoData::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match self.pump_in()? {
                    IoData::Bytes(0) => return Ok(IoData::Bytes(0)),
                    IoData::Bytes(_) => continue,
                    want => return Ok(want),
                },
                // peer dropped the link without close_notify; let HTTP
                // framing decide whether the response was complete
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(IoData::Bytes(0)),
                Err(e) => return Err(FetchError::TlsIo(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoData, FetchError> {
        if !self.pump_out()? {
            return Ok(IoData::WantWrite);
        }
        let n = self.sess.writer().write(buf).map_err(FetchError::TlsIo)?;
        self.pump_out()?;
        Ok(IoData::Bytes(n))
    }

    fn flush(&mut self) -> Result<IoAction, FetchError> {
        if self.pump_out()? {
            Ok(IoAction::Ready)
        } else {
            Ok(IoAction::WantWrite)
        }
    }

    fn shutdown(&mut self) -> Result<IoAction, FetchError> {
        if !self.close_sent {
            self.sess.send_close_notify();
            self.close_sent = true;
        }
        if self.pump_out()? {
            Ok(IoAction::Ready)
        } else {
            Ok(IoAction::WantWrite)
        }
    }

    fn socket(&mut self) -> Option<&mut TcpStream> {
        Some(&mut self.sock)
    }
}
