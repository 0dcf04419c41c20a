//! One in-flight fetch: socket, TLS session, read buffer, and the protocol
//! state machine that drives them.
//!
//! A connection advances through states strictly in sequence; each call to
//! [`Connection::step`] performs at most one I/O attempt for the current
//! state and reports whether the reactor should poll (`Want`), cascade into
//! the next state (`Advance` -> [`Connection::advance`]), or free the slot
//! (`Finished`). Errors abort the fetch; the reactor turns them into a
//! `Failed` result unless one was already produced.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use rustls::ClientConfig;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::job::{FetchJob, FetchOutcome, FetchResult, Sink};
use crate::linebuf::LineBuffer;
use crate::resolver::{self, AddrList};
use crate::tls::{IoAction, IoData, TlsStream, Transport};
use crate::uri::{self, HttpsUri};
use crate::wire::{self, ChunkLine, Header};

/// Read buffer cap; also the fatal line-length bound.
const BUF_SIZE: usize = 32 * 1024;

/// A fetch following more redirects than this has lost its way.
const MAX_REDIRECTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Connect,
    TlsConnect,
    Request,
    ResponseStatus,
    ResponseHeader,
    ResponseData,
    ResponseChunked,
    WriteData,
    Done,
}

/// Which readiness the reactor should wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

/// What a state-machine call asks of the reactor next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnProgress {
    Want(Want),
    /// Current stage finished; call [`Connection::advance`].
    Advance,
    /// Terminal; release the slot.
    Finished,
}

enum HeaderFlow {
    More,
    End,
    Redirected,
}

enum Fill {
    Data,
    Eof,
    Want(Want),
}

pub struct Connection {
    id: u64,
    target: HttpsUri,
    /// Safe-for-logs rendition of the current URL.
    url: String,
    conditional_since: Option<String>,
    last_modified: Option<String>,
    addrs: AddrList,
    /// Socket while connecting; handed to the TLS session afterwards.
    sock: Option<TcpStream>,
    transport: Option<Box<dyn Transport>>,
    /// Bumped for every fresh socket so the reactor re-registers it.
    sock_gen: u32,
    buf: LineBuffer,
    request: Vec<u8>,
    reqpos: usize,
    /// Content-Length remaining, or current chunk remaining.
    expected: u64,
    chunked: bool,
    status: u16,
    redirects: u32,
    state: State,
    sink: Option<Sink>,
    /// Result produced but not yet collected by the reactor.
    result: Option<FetchResult>,
    /// A result has been produced at some point; guards exactly-once.
    completed: bool,
    pub deadline: Instant,
    tls_config: Arc<ClientConfig>,
    bind_addr: Option<IpAddr>,
    user_agent: String,
}

impl Connection {
    pub fn new(
        job: FetchJob,
        target: HttpsUri,
        addrs: AddrList,
        tls_config: Arc<ClientConfig>,
        cfg: &FetcherConfig,
    ) -> Self {
        let url = uri::safe_display(&job.url);
        Self {
            id: job.id,
            target,
            url,
            conditional_since: job.if_modified_since,
            last_modified: None,
            addrs,
            sock: None,
            transport: None,
            sock_gen: 0,
            buf: LineBuffer::new(BUF_SIZE),
            request: Vec::new(),
            reqpos: 0,
            expected: 0,
            chunked: false,
            status: 0,
            redirects: 0,
            state: State::Init,
            sink: Some(job.sink),
            result: None,
            completed: false,
            deadline: Instant::now() + cfg.step_timeout,
            tls_config,
            bind_addr: cfg.bind_addr,
            user_agent: cfg.user_agent.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display form of the current URL, already escaped for logging.
    pub fn url_display(&self) -> &str {
        &self.url
    }

    pub fn socket_generation(&self) -> u32 {
        self.sock_gen
    }

    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        match (&mut self.sock, &mut self.transport) {
            (Some(sock), _) => Some(sock),
            (None, Some(t)) => t.socket(),
            (None, None) => None,
        }
    }

    /// Hand over a produced result (at most once).
    pub fn take_result(&mut self) -> Option<FetchResult> {
        self.result.take()
    }

    /// Whether this connection ever produced a result.
    pub fn has_completed(&self) -> bool {
        self.completed
    }

    /// Flush and drop the sink. Idempotent; the reactor calls it exactly
    /// once when the slot is freed.
    pub fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush() {
                tracing::warn!(url = %self.url, error = %e, "sink flush on close failed");
            }
        }
    }

    /// One I/O attempt for the current state.
    pub fn step(&mut self) -> Result<ConnProgress, FetchError> {
        match self.state {
            State::Init => self.start_connect(),
            State::Connect => self.finish_connect(),
            State::TlsConnect => self.tls_step(),
            State::Request => self.write_request(),
            State::ResponseStatus
            | State::ResponseHeader
            | State::ResponseData
            | State::ResponseChunked => self.read_step(),
            State::WriteData => self.write_data(),
            State::Done => self.shutdown_step(),
        }
    }

    /// Move to the next state after `step` reported `Advance`, performing
    /// that state's first I/O attempt. The reactor loops over this until the
    /// machine wants readiness again, so no call here recurses into another.
    pub fn advance(&mut self) -> Result<ConnProgress, FetchError> {
        match self.state {
            State::Init => self.start_connect(),
            State::Connect => {
                self.state = State::TlsConnect;
                self.begin_tls()
            }
            State::TlsConnect => {
                self.build_request();
                self.state = State::Request;
                self.write_request()
            }
            State::Request => {
                self.buf.clear();
                self.state = State::ResponseStatus;
                self.read_step()
            }
            State::ResponseData | State::ResponseChunked => {
                self.state = State::WriteData;
                self.write_data()
            }
            State::Done => self.shutdown_step(),
            State::ResponseStatus | State::ResponseHeader | State::WriteData => {
                unreachable!("advance called in mid-parse state")
            }
        }
    }

    fn complete(&mut self, outcome: FetchOutcome) {
        let last_modified = match outcome {
            FetchOutcome::Ok | FetchOutcome::NotModified => self.last_modified.take(),
            FetchOutcome::Failed => None,
        };
        self.result = Some(FetchResult {
            id: self.id,
            outcome,
            last_modified,
        });
        self.completed = true;
    }

    // ---- connect ----

    /// Try candidates until one connects or goes pending.
    fn start_connect(&mut self) -> Result<ConnProgress, FetchError> {
        self.state = State::Connect;
        self.transport = None;
        self.sock = None;
        let mut last_err: Option<io::Error> = None;
        loop {
            let Some(addr) = self.addrs.next() else {
                return Err(FetchError::Connect(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "address list exhausted")
                })));
            };
            match connect_socket(addr, self.bind_addr) {
                Ok(sock) => {
                    self.sock = Some(sock);
                    self.sock_gen += 1;
                    // even an instant connect gets confirmed via writability
                    return Ok(ConnProgress::Want(Want::Write));
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, %addr, error = %e, "connect candidate failed");
                    last_err = Some(e);
                }
            }
        }
    }

    /// The pending connect's socket became writable; check how it went.
    fn finish_connect(&mut self) -> Result<ConnProgress, FetchError> {
        let Some(sock) = self.sock.as_mut() else {
            unreachable!("no socket in connect state");
        };
        match sock.take_error() {
            Ok(Some(e)) | Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "connect failed");
                return self.start_connect();
            }
            Ok(None) => {}
        }
        match sock.peer_addr() {
            Ok(_) => Ok(ConnProgress::Advance),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(ConnProgress::Want(Want::Write)),
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "connect failed");
                self.start_connect()
            }
        }
    }

    // ---- tls ----

    fn begin_tls(&mut self) -> Result<ConnProgress, FetchError> {
        let Some(sock) = self.sock.take() else {
            unreachable!("no socket entering TLS state");
        };
        let stream = TlsStream::connect(self.tls_config.clone(), &self.target.host, sock)?;
        self.transport = Some(Box::new(stream));
        self.tls_step()
    }

    fn tls_step(&mut self) -> Result<ConnProgress, FetchError> {
        let Some(t) = self.transport.as_mut() else {
            unreachable!("no transport in TLS state");
        };
        match t.handshake()? {
            IoAction::Ready => Ok(ConnProgress::Advance),
            IoAction::WantRead => Ok(ConnProgress::Want(Want::Read)),
            IoAction::WantWrite => Ok(ConnProgress::Want(Want::Write)),
        }
    }

    // ---- request ----

    fn build_request(&mut self) {
        let path = uri::encode_path(&self.target.path);
        let mut req = format!(
            "GET /{} HTTP/1.1\r\nConnection: close\r\nUser-Agent: {}\r\nHost: {}\r\n",
            path,
            self.user_agent,
            self.target.host_header(),
        );
        if let Some(since) = &self.conditional_since {
            req.push_str(&format!("If-Modified-Since: {}\r\n", since));
        }
        req.push_str("\r\n");
        self.request = req.into_bytes();
        self.reqpos = 0;
    }

    fn write_request(&mut self) -> Result<ConnProgress, FetchError> {
        let Some(t) = self.transport.as_mut() else {
            unreachable!("no transport in request state");
        };
        while self.reqpos < self.request.len() {
            match t.write(&self.request[self.reqpos..])? {
                IoData::Bytes(n) => self.reqpos += n,
                IoData::WantRead => return Ok(ConnProgress::Want(Want::Read)),
                IoData::WantWrite => return Ok(ConnProgress::Want(Want::Write)),
            }
        }
        match t.flush()? {
            IoAction::Ready => Ok(ConnProgress::Advance),
            IoAction::WantRead => Ok(ConnProgress::Want(Want::Read)),
            IoAction::WantWrite => Ok(ConnProgress::Want(Want::Write)),
        }
    }

    // ---- response ----

    /// Parse whatever is buffered, reading more only when the current state
    /// genuinely needs further bytes.
    fn read_step(&mut self) -> Result<ConnProgress, FetchError> {
        loop {
            match self.state {
                State::ResponseStatus => {
                    let Some(line) = self.buf.take_line() else {
                        match self.fill()? {
                            Fill::Data => continue,
                            Fill::Eof => return Err(self.remote_close()),
                            Fill::Want(w) => return Ok(ConnProgress::Want(w)),
                        }
                    };
                    self.status = wire::parse_status_line(&line).map_err(|e| {
                        tracing::warn!(url = %self.url, line = %uri::safe_display(&line), "bad status line");
                        e
                    })?;
                    if is_redirect(self.status) {
                        self.redirects += 1;
                        if self.redirects > MAX_REDIRECTS {
                            tracing::warn!(url = %self.url, "too many redirections");
                            return Err(FetchError::TooManyRedirects);
                        }
                    } else if self.status != 200 && self.status != 304 {
                        tracing::warn!(url = %self.url, status = self.status, "unexpected status");
                    }
                    self.state = State::ResponseHeader;
                }
                State::ResponseHeader => {
                    let Some(line) = self.buf.take_line() else {
                        match self.fill()? {
                            Fill::Data => continue,
                            Fill::Eof => return Err(self.remote_close()),
                            Fill::Want(w) => return Ok(ConnProgress::Want(w)),
                        }
                    };
                    match self.handle_header(&line)? {
                        HeaderFlow::More => {}
                        HeaderFlow::Redirected => return Ok(ConnProgress::Advance),
                        HeaderFlow::End => match self.status {
                            200 => {
                                self.state = if self.chunked {
                                    // a Content-Length next to chunked framing is ignored
                                    self.expected = 0;
                                    State::ResponseChunked
                                } else {
                                    State::ResponseData
                                };
                            }
                            304 => {
                                self.complete(FetchOutcome::NotModified);
                                self.state = State::Done;
                                return Ok(ConnProgress::Advance);
                            }
                            _ => {
                                self.complete(FetchOutcome::Failed);
                                self.state = State::Done;
                                return Ok(ConnProgress::Advance);
                            }
                        },
                    }
                }
                State::ResponseData => {
                    if self.buf.is_full() || self.buf.len() as u64 >= self.expected {
                        return Ok(ConnProgress::Advance);
                    }
                    match self.fill()? {
                        Fill::Data => {}
                        Fill::Eof => return Err(self.remote_close()),
                        Fill::Want(w) => return Ok(ConnProgress::Want(w)),
                    }
                }
                State::ResponseChunked => {
                    if self.expected == 0 {
                        let Some(line) = self.buf.take_line() else {
                            match self.fill()? {
                                Fill::Data => continue,
                                Fill::Eof => return Err(self.remote_close()),
                                Fill::Want(w) => return Ok(ConnProgress::Want(w)),
                            }
                        };
                        match wire::parse_chunk_line(&line).map_err(|e| {
                            tracing::warn!(url = %self.url, "invalid chunk size");
                            e
                        })? {
                            ChunkLine::Blank => {}
                            ChunkLine::Size(0) => {
                                self.complete(FetchOutcome::Ok);
                                self.state = State::Done;
                                return Ok(ConnProgress::Advance);
                            }
                            ChunkLine::Size(n) => self.expected = n,
                        }
                        continue;
                    }
                    if self.buf.is_full() || self.buf.len() as u64 >= self.expected {
                        return Ok(ConnProgress::Advance);
                    }
                    match self.fill()? {
                        Fill::Data => {}
                        Fill::Eof => return Err(self.remote_close()),
                        Fill::Want(w) => return Ok(ConnProgress::Want(w)),
                    }
                }
                _ => unreachable!("read_step outside response states"),
            }
        }
    }

    /// Top up the read buffer. Called only when more bytes are required, so
    /// a full buffer here means an overlong protocol line and EOF means a
    /// truncated response.
    fn fill(&mut self) -> Result<Fill, FetchError> {
        if self.buf.is_full() {
            tracing::warn!(url = %self.url, "protocol line exceeds buffer cap");
            return Err(crate::error::ProtocolError::LineTooLong.into());
        }
        let Some(t) = self.transport.as_mut() else {
            unreachable!("no transport while reading response");
        };
        match t.read(self.buf.space())? {
            IoData::Bytes(0) => Ok(Fill::Eof),
            IoData::Bytes(n) => {
                self.buf.advance(n);
                Ok(Fill::Data)
            }
            IoData::WantRead => Ok(Fill::Want(Want::Read)),
            IoData::WantWrite => Ok(Fill::Want(Want::Write)),
        }
    }

    fn remote_close(&self) -> FetchError {
        tracing::warn!(url = %self.url, "connection closed mid-response");
        FetchError::RemoteClose
    }

    fn handle_header(&mut self, line: &str) -> Result<HeaderFlow, FetchError> {
        match wire::parse_header_line(line).map_err(|e| {
            tracing::warn!(url = %self.url, line = %uri::safe_display(line), "bad header");
            e
        })? {
            Header::End => Ok(HeaderFlow::End),
            Header::ContentLength(n) => {
                self.expected = n;
                Ok(HeaderFlow::More)
            }
            Header::Chunked => {
                self.chunked = true;
                Ok(HeaderFlow::More)
            }
            Header::LastModified(v) => {
                self.last_modified = Some(v);
                Ok(HeaderFlow::More)
            }
            Header::Location(loc) if is_redirect(self.status) => {
                self.redirect(&loc)?;
                Ok(HeaderFlow::Redirected)
            }
            Header::Location(_) | Header::Other => Ok(HeaderFlow::More),
        }
    }

    /// Tear the current connection down and restart against the Location
    /// target. The correlation id and the conditional timestamp survive;
    /// everything else is per-target state and resets.
    fn redirect(&mut self, location: &str) -> Result<(), FetchError> {
        let next = uri::resolve_redirect(&self.target, location)?;
        tracing::info!(from = %self.url, to = %uri::safe_display(&next.to_url()), "redirect");
        self.target = next;
        self.url = uri::safe_display(&self.target.to_url());
        self.last_modified = None;
        self.buf.clear();
        self.request.clear();
        self.reqpos = 0;
        self.expected = 0;
        self.chunked = false;
        self.status = 0;
        // no graceful TLS close on redirect; just drop the session
        self.transport = None;
        self.sock = None;
        self.addrs = resolver::resolve(&self.target.host, self.target.port)?;
        self.state = State::Init;
        Ok(())
    }

    // ---- body delivery ----

    /// Drain buffered body bytes to the sink. Sinks are regular files and
    /// always writable, so this never has to wait for readiness.
    fn write_data(&mut self) -> Result<ConnProgress, FetchError> {
        let n = (self.buf.len() as u64).min(self.expected) as usize;
        if n > 0 {
            let Some(sink) = self.sink.as_mut() else {
                unreachable!("sink already closed while writing body");
            };
            sink.write_all(&self.buf.data()[..n]).map_err(FetchError::Sink)?;
            self.buf.consume(n);
            self.expected -= n as u64;
        }
        if !self.chunked && self.expected == 0 {
            self.complete(FetchOutcome::Ok);
            self.state = State::Done;
            return Ok(ConnProgress::Advance);
        }
        // chunk finished or buffer drained: back to reading
        self.state = if self.chunked {
            State::ResponseChunked
        } else {
            State::ResponseData
        };
        self.read_step()
    }

    // ---- teardown ----

    /// Flush close_notify. Failures here no longer matter; the response is
    /// already accounted for.
    fn shutdown_step(&mut self) -> Result<ConnProgress, FetchError> {
        let Some(t) = self.transport.as_mut() else {
            return Ok(ConnProgress::Finished);
        };
        match t.shutdown() {
            Ok(IoAction::Ready) => Ok(ConnProgress::Finished),
            Ok(IoAction::WantRead) => Ok(ConnProgress::Want(Want::Read)),
            Ok(IoAction::WantWrite) => Ok(ConnProgress::Want(Want::Write)),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "TLS close failed");
                Ok(ConnProgress::Finished)
            }
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301..=303 | 307 | 308)
}

/// One non-blocking connect attempt, optionally bound to a local address of
/// the matching family.
fn connect_socket(addr: SocketAddr, bind: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(local) = bind {
        if local.is_ipv4() == addr.is_ipv4() {
            socket.bind(&SocketAddr::new(local, 0).into())?;
        }
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc as StdArc, Mutex};

    /// Transport that replays a canned server response and records writes.
    struct ScriptedTransport {
        input: Vec<u8>,
        pos: usize,
        /// Max bytes handed out per read, to exercise partial reads.
        read_chunk: usize,
        written: Vec<u8>,
    }

    impl ScriptedTransport {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                read_chunk: usize::MAX,
                written: Vec::new(),
            }
        }

        fn with_read_chunk(input: &[u8], chunk: usize) -> Self {
            let mut t = Self::new(input);
            t.read_chunk = chunk;
            t
        }
    }

    impl Transport for ScriptedTransport {
        fn handshake(&mut self) -> Result<IoAction, FetchError> {
            Ok(IoAction::Ready)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<IoData, FetchError> {
            let n = buf
                .len()
                .min(self.read_chunk)
                .min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(IoData::Bytes(n))
        }

        fn write(&mut self, buf: &[u8]) -> Result<IoData, FetchError> {
            self.written.extend_from_slice(buf);
            Ok(IoData::Bytes(buf.len()))
        }

        fn flush(&mut self) -> Result<IoAction, FetchError> {
            Ok(IoAction::Ready)
        }

        fn shutdown(&mut self) -> Result<IoAction, FetchError> {
            Ok(IoAction::Ready)
        }

        fn socket(&mut self) -> Option<&mut TcpStream> {
            None
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(StdArc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_tls_config() -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    /// Connection parked in RESPONSE_STATUS with a scripted response.
    fn conn_for_response(transport: ScriptedTransport) -> (Connection, SharedSink) {
        let sink = SharedSink::default();
        let job = FetchJob {
            id: 7,
            url: "https://example.test/dir/file".into(),
            if_modified_since: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
            sink: Box::new(sink.clone()),
        };
        let target = HttpsUri::parse(&job.url).unwrap();
        let mut conn = Connection::new(
            job,
            target,
            AddrList::from_addrs(vec![]),
            test_tls_config(),
            &FetcherConfig::default(),
        );
        conn.transport = Some(Box::new(transport));
        conn.state = State::ResponseStatus;
        (conn, sink)
    }

    /// Drive to termination the way the reactor does.
    fn drive(conn: &mut Connection) -> Result<FetchResult, FetchError> {
        loop {
            let mut progress = conn.step()?;
            while progress == ConnProgress::Advance {
                progress = conn.advance()?;
            }
            match progress {
                ConnProgress::Finished => {
                    return Ok(conn.take_result().expect("finished without result"));
                }
                ConnProgress::Want(w) => panic!("scripted transport asked to wait: {w:?}"),
                ConnProgress::Advance => unreachable!(),
            }
        }
    }

    #[test]
    fn content_length_body_is_delivered_exactly() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(result.id, 7);
        assert_eq!(&*sink.0.lock().unwrap(), b"hello world");
    }

    #[test]
    fn zero_length_body_completes_ok() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn chunked_body_round_trips() {
        let response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(&*sink.0.lock().unwrap(), b"hello");
    }

    #[test]
    fn chunked_body_with_fragmented_reads() {
        let response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nabcdef\r\n4\r\nghij\r\n0\r\n\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::with_read_chunk(response, 3));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(&*sink.0.lock().unwrap(), b"abcdefghij");
    }

    #[test]
    fn chunked_ignores_content_length() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 9999\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(&*sink.0.lock().unwrap(), b"ok");
    }

    #[test]
    fn not_modified_short_circuits_without_body() {
        let response =
            b"HTTP/1.1 304 Not Modified\r\nLast-Modified: Tue, 02 Jan 2024 00:00:00 GMT\r\n\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::NotModified);
        assert_eq!(
            result.last_modified.as_deref(),
            Some("Tue, 02 Jan 2024 00:00:00 GMT")
        );
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn last_modified_propagates_on_ok() {
        let response = b"HTTP/1.1 200 OK\r\nLast-Modified: Wed, 03 Jan 2024 00:00:00 GMT\r\nContent-Length: 2\r\n\r\nhi";
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(
            result.last_modified.as_deref(),
            Some("Wed, 03 Jan 2024 00:00:00 GMT")
        );
    }

    #[test]
    fn unexpected_status_fails_without_body() {
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Failed);
        assert_eq!(result.last_modified, None);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn redirect_status_without_location_fails() {
        let response = b"HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n";
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Failed);
    }

    #[test]
    fn malformed_chunk_size_is_fatal() {
        let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(response));
        let err = drive(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Protocol(ProtocolError::BadChunkSize)
        ));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_status_line_is_fatal() {
        let response = b"garbage\r\n";
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(response));
        let err = drive(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Protocol(ProtocolError::MalformedStatus)
        ));
    }

    #[test]
    fn redirect_limit_trips() {
        let response = b"HTTP/1.1 302 Found\r\nLocation: /next\r\n\r\n";
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(response));
        conn.redirects = MAX_REDIRECTS;
        let err = drive(&mut conn).unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects));
    }

    #[test]
    fn truncated_body_is_remote_close() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(response));
        let err = drive(&mut conn).unwrap_err();
        assert!(matches!(err, FetchError::RemoteClose));
    }

    #[test]
    fn overlong_status_line_is_fatal() {
        let mut response = vec![b'a'; BUF_SIZE + 100];
        response.extend_from_slice(b"\r\n");
        let (mut conn, _sink) = conn_for_response(ScriptedTransport::new(&response));
        let err = drive(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Protocol(ProtocolError::LineTooLong)
        ));
    }

    #[test]
    fn body_larger_than_buffer_streams_through() {
        let body = vec![b'x'; BUF_SIZE * 2 + 123];
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        let (mut conn, sink) = conn_for_response(ScriptedTransport::new(&response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(sink.0.lock().unwrap().len(), body.len());
    }

    #[test]
    fn request_carries_conditional_header() {
        let mut conn = {
            let sink = SharedSink::default();
            let job = FetchJob {
                id: 1,
                url: "https://example.test:8443/a dir/file".into(),
                if_modified_since: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
                sink: Box::new(sink),
            };
            let target = HttpsUri::parse(&job.url).unwrap();
            Connection::new(
                job,
                target,
                AddrList::from_addrs(vec![]),
                test_tls_config(),
                &FetcherConfig::default(),
            )
        };
        conn.build_request();
        let req = String::from_utf8(conn.request.clone()).unwrap();
        assert!(req.starts_with("GET /a%20dir/file HTTP/1.1\r\n"));
        assert!(req.contains("Connection: close\r\n"));
        assert!(req.contains("Host: example.test:8443\r\n"));
        assert!(req.contains("If-Modified-Since: Mon, 01 Jan 2024 00:00:00 GMT\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    /// Sink that counts flushes and drops, for close-exactly-once checks.
    struct CountingSink {
        flushes: StdArc<AtomicUsize>,
        drops: StdArc<AtomicUsize>,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Drop for CountingSink {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn conn_with_counting_sink(
        transport: ScriptedTransport,
    ) -> (Connection, StdArc<AtomicUsize>, StdArc<AtomicUsize>) {
        let flushes = StdArc::new(AtomicUsize::new(0));
        let drops = StdArc::new(AtomicUsize::new(0));
        let job = FetchJob {
            id: 7,
            url: "https://example.test/dir/file".into(),
            if_modified_since: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
            sink: Box::new(CountingSink {
                flushes: flushes.clone(),
                drops: drops.clone(),
            }),
        };
        let target = HttpsUri::parse(&job.url).unwrap();
        let mut conn = Connection::new(
            job,
            target,
            AddrList::from_addrs(vec![]),
            test_tls_config(),
            &FetcherConfig::default(),
        );
        conn.transport = Some(Box::new(transport));
        conn.state = State::ResponseStatus;
        (conn, flushes, drops)
    }

    #[test]
    fn sink_closes_exactly_once_on_ok() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let (mut conn, flushes, drops) = conn_with_counting_sink(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::Ok);
        conn.close_sink();
        conn.close_sink();
        assert_eq!(flushes.load(Ordering::SeqCst), 1, "one flush on close");
        assert_eq!(drops.load(Ordering::SeqCst), 1, "sink dropped once");
        drop(conn);
        assert_eq!(drops.load(Ordering::SeqCst), 1, "drop of the connection adds nothing");
    }

    #[test]
    fn sink_closes_exactly_once_on_not_modified() {
        let response = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        let (mut conn, _flushes, drops) = conn_with_counting_sink(ScriptedTransport::new(response));
        let result = drive(&mut conn).unwrap();
        assert_eq!(result.outcome, FetchOutcome::NotModified);
        conn.close_sink();
        drop(conn);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn host_header_omits_default_port_and_brackets_ipv6() {
        let u = HttpsUri::parse("https://example.test/x").unwrap();
        assert_eq!(u.host_header(), "example.test");
        let u = HttpsUri::parse("https://[2001:db8::2]:993/x").unwrap();
        assert_eq!(u.host_header(), "[2001:db8::2]:993");
    }
}
