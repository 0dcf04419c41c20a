//! Fetch error taxonomy.
//!
//! Every way a single fetch can go wrong collapses to one `FetchError`, and
//! every `FetchError` collapses to a `Failed` result at the subsystem
//! boundary. Retry policy (if any) belongs to the controller; the only retry
//! performed here is address-list failover during connect.

use std::io;

use thiserror::Error;

/// Malformed data on the wire. These are always fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The status line did not carry a 3-digit code in [200, 599].
    #[error("malformed status line")]
    MalformedStatus,
    /// A recognized header carried a value we could not parse
    /// (e.g. a non-numeric Content-Length). Unrecognized headers are skipped.
    #[error("malformed {0} header")]
    MalformedHeader(&'static str),
    /// A chunk-size line was not valid hex, or was preposterously large.
    #[error("invalid chunk size")]
    BadChunkSize,
    /// The read buffer filled up without a line terminator in sight.
    #[error("response line too long")]
    LineTooLong,
}

/// Terminal failure of one fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL could not be parsed, or is not an https URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Name resolution produced no usable addresses.
    #[error("name resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    /// Every candidate address was refused or unreachable.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    /// TLS-level failure (handshake, certificate validation, record layer).
    #[error("TLS failure: {0}")]
    Tls(#[from] rustls::Error),
    /// Transport I/O failed underneath the TLS session.
    #[error("TLS transport error: {0}")]
    TlsIo(#[source] io::Error),
    /// The server sent something we refuse to parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// More than the permitted number of chained redirects.
    #[error("too many redirections")]
    TooManyRedirects,
    /// Writing body bytes to the output sink failed.
    #[error("sink write failed: {0}")]
    Sink(#[source] io::Error),
    /// The server closed the connection before the response was complete.
    #[error("connection closed before response was complete")]
    RemoteClose,
    /// The per-step deadline expired.
    #[error("connection timed out")]
    Timeout,
}
