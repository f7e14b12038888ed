use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tapwire_http::{
    match_preface, parse_request_head, request_body_framing, validate_h2c_upgrade, Authority,
    BodyFraming, Http2Setting, HttpMessage, HttpRequestHead, HttpResponseHead, HttpVersion,
    PrefaceMatch, PropertyValue, PROPERTY_H2_STREAM, UPGRADE_HOP_HEADERS,
};
use tapwire_tls::{
    build_server_config, is_tls_handshake, CertificateService, APPLICATION_PROTOCOL_HTTP_1_1,
    APPLICATION_PROTOCOL_HTTP_2,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::LazyConfigAcceptor;

use crate::config::ServerConfig;
use crate::connection::ConnectionState;
use crate::dispatch::{dispatch_message, DispatchOutcome, HttpMessageHandler};
use crate::error::{log_classified, PipelineError};
use crate::passthrough::run_pass_through;
use crate::timeout::read_idle_guarded;

const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Byte stream a connection runs over, before or after TLS termination.
pub trait ConnectionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnectionIo for T {}

/// Notified whenever a protocol has been negotiated for a connection
/// (ALPN, cleartext preface, or h2c upgrade), so an external assembler
/// can rebuild the stages that follow.
pub trait PipelineConfigurator: Send + Sync {
    fn configure(&self, connection: &ConnectionState, protocol: &str);
}

/// Context handed to the HTTP/2 codec when a connection was switched by
/// an `Upgrade: h2c` request rather than a preface or ALPN.
#[derive(Debug)]
pub struct Http2UpgradeContext {
    /// The upgraded request, already stripped of hop-by-hop headers and
    /// tagged as stream 1.
    pub message: HttpMessage,
    pub settings: Vec<Http2Setting>,
}

/// The connection bytes handed over to the HTTP/2 codec.
pub struct Http2Io {
    pub stream: Box<dyn ConnectionIo>,
    /// Bytes already read off the wire, including the client preface
    /// when one was matched.
    pub buffered: Vec<u8>,
    pub upgrade: Option<Http2UpgradeContext>,
}

/// External HTTP/2 decoder/encoder collaborator. The pipeline core
/// detects and negotiates h2; framing belongs to this codec.
pub trait Http2Codec: Send + Sync {
    fn serve<'a>(
        &'a self,
        connection: &'a ConnectionState,
        io: Http2Io,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;
}

/// Shared collaborators handed to every connection. Read-only once the
/// server is running.
pub struct ProxyRuntime {
    pub server_config: Arc<ServerConfig>,
    pub tls_config: tapwire_tls::TlsConfig,
    pub certificates: Arc<dyn CertificateService>,
    pub handlers: Vec<Arc<dyn HttpMessageHandler>>,
    pub configurator: Option<Arc<dyn PipelineConfigurator>>,
    pub h2_codec: Option<Arc<dyn Http2Codec>>,
}

impl ProxyRuntime {
    pub fn new(
        server_config: Arc<ServerConfig>,
        tls_config: tapwire_tls::TlsConfig,
        certificates: Arc<dyn CertificateService>,
    ) -> Self {
        Self {
            server_config,
            tls_config,
            certificates,
            handlers: Vec::new(),
            configurator: None,
            h2_codec: None,
        }
    }
}

/// Runs the whole pipeline for one accepted connection. Every fatal
/// path is classified and logged here, exactly once.
pub async fn serve_connection(
    runtime: Arc<ProxyRuntime>,
    stream: TcpStream,
) -> Result<(), PipelineError> {
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);

    let state = ConnectionState::new(
        local_addr,
        peer_addr,
        Arc::clone(&runtime.server_config),
        runtime.tls_config.clone(),
    );

    let result = run_pipeline(&runtime, &state, BufferedConn::new(Box::new(stream))).await;
    if let Err(error) = &result {
        log_classified(state.id(), error);
    }
    result
}

pub(crate) struct BufferedConn {
    pub(crate) stream: Box<dyn ConnectionIo>,
    pub(crate) read_buf: Vec<u8>,
}

impl BufferedConn {
    pub(crate) fn new(stream: Box<dyn ConnectionIo>) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Reads one more chunk into the buffer; zero means EOF.
    async fn read_more(
        &mut self,
        state: &ConnectionState,
        idle: Duration,
    ) -> Result<usize, PipelineError> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = read_idle_guarded(&mut self.stream, &mut chunk, state, idle).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Buffers until `pattern` is seen and drains everything up to and
    /// including it. `Ok(None)` means the peer closed cleanly between
    /// messages.
    async fn read_until_pattern(
        &mut self,
        state: &ConnectionState,
        pattern: &[u8],
        max_bytes: usize,
        idle: Duration,
    ) -> Result<Option<Vec<u8>>, PipelineError> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                return Ok(Some(self.read_buf.drain(..end).collect()));
            }
            if self.read_buf.len() > max_bytes {
                return Err(PipelineError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                )));
            }
            if self.read_more(state, idle).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(PipelineError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                )));
            }
        }
    }

    async fn read_exact_bytes(
        &mut self,
        state: &ConnectionState,
        count: usize,
        idle: Duration,
    ) -> Result<Vec<u8>, PipelineError> {
        while self.read_buf.len() < count {
            if self.read_more(state, idle).await? == 0 {
                return Err(PipelineError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside message body",
                )));
            }
        }
        Ok(self.read_buf.drain(..count).collect())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

enum SniffOutcome {
    Tls,
    NotTls,
    CleanEof,
}

async fn run_pipeline(
    runtime: &ProxyRuntime,
    state: &ConnectionState,
    mut conn: BufferedConn,
) -> Result<(), PipelineError> {
    let idle = state.server_config().timeouts.idle_read();
    let max_head_bytes = state.server_config().max_head_bytes;
    let mut authority: Option<Authority> = None;

    'detect: loop {
        let mut preface_armed = true;

        match sniff_tls(&mut conn, state, idle).await? {
            SniffOutcome::CleanEof => return Ok(()),
            SniffOutcome::NotTls => {}
            SniffOutcome::Tls => {
                let negotiated =
                    terminate_tls(runtime, state, &mut conn, authority.as_ref()).await?;
                match negotiated {
                    Negotiated::Alpn(protocol) => {
                        notify_configurator(runtime, state, &protocol);
                        if protocol == APPLICATION_PROTOCOL_HTTP_2 {
                            return serve_h2(runtime, state, conn, None).await;
                        }
                        // A real negotiation settles the protocol; only
                        // the fallback leaves the preface detector armed.
                        preface_armed = false;
                    }
                    Negotiated::Fallback => {
                        notify_configurator(runtime, state, APPLICATION_PROTOCOL_HTTP_1_1);
                    }
                }
            }
        }

        if preface_armed {
            match detect_preface(&mut conn, state, idle).await? {
                PrefaceOutcome::Matched => {
                    notify_configurator(runtime, state, APPLICATION_PROTOCOL_HTTP_2);
                    return serve_h2(runtime, state, conn, None).await;
                }
                PrefaceOutcome::NotPreface => {}
            }
        }

        // HTTP/1.x exchange loop; the h2c upgrade detector decides at
        // most once per detection round.
        let mut upgrade_armed = true;
        loop {
            let head_raw = match conn
                .read_until_pattern(state, b"\r\n\r\n", max_head_bytes, idle)
                .await?
            {
                Some(raw) => raw,
                None => return Ok(()),
            };
            let request = parse_request_head(&head_raw)?;
            let body = read_request_body(&mut conn, state, &request, idle).await?;
            let mut message = HttpMessage::new(request, body);
            let is_connect = message.request.is_connect();

            if upgrade_armed && !is_connect {
                upgrade_armed = false;
                if let Ok(settings) = validate_h2c_upgrade(&message.request) {
                    let switching = accept_h2c_upgrade(&mut message);
                    notify_configurator(runtime, state, APPLICATION_PROTOCOL_HTTP_2);
                    conn.stream.write_all(&switching.to_bytes()).await?;
                    conn.stream.flush().await?;
                    let upgrade = Http2UpgradeContext { message, settings };
                    return serve_h2(runtime, state, conn, Some(upgrade)).await;
                }
            }

            if is_connect {
                if let Some(target) = message.request.authority(443) {
                    if state.pass_through_chosen().is_none() {
                        let chosen = state.server_config().pass_through_matches(&target);
                        state.choose_pass_through(chosen);
                        if chosen {
                            return run_pass_through(state, conn, target).await;
                        }
                    }
                    authority = Some(target);
                }
            }

            match dispatch_message(state, &runtime.handlers, &mut message) {
                DispatchOutcome::CloseWithoutResponse => return Ok(()),
                DispatchOutcome::Respond { close_after } => {
                    write_response(&mut conn.stream, &message).await?;
                    if is_connect {
                        // The next bytes on this connection are the
                        // tunnelled protocol; sniff them again.
                        continue 'detect;
                    }
                    if close_after {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sniff_tls(
    conn: &mut BufferedConn,
    state: &ConnectionState,
    idle: Duration,
) -> Result<SniffOutcome, PipelineError> {
    loop {
        match is_tls_handshake(&conn.read_buf) {
            Some(true) => return Ok(SniffOutcome::Tls),
            Some(false) => return Ok(SniffOutcome::NotTls),
            None => {
                if conn.read_more(state, idle).await? == 0 {
                    if conn.read_buf.is_empty() {
                        return Ok(SniffOutcome::CleanEof);
                    }
                    // A short cleartext burst; the HTTP path reports it.
                    return Ok(SniffOutcome::NotTls);
                }
            }
        }
    }
}

enum Negotiated {
    Alpn(String),
    Fallback,
}

async fn terminate_tls(
    runtime: &ProxyRuntime,
    state: &ConnectionState,
    conn: &mut BufferedConn,
    authority: Option<&Authority>,
) -> Result<Negotiated, PipelineError> {
    let buffered = std::mem::take(&mut conn.read_buf);
    let placeholder: Box<dyn ConnectionIo> = Box::new(io::Cursor::new(Vec::new()));
    let stream = std::mem::replace(&mut conn.stream, placeholder);
    let replay = ReplayStream::new(buffered, stream);

    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), replay);
    let start = acceptor
        .await
        .map_err(|error| PipelineError::TlsHandshake(error.to_string()))?;

    // The name the client announced; the CONNECT authority (or the
    // listener address) stands in when it announced none.
    let server_name = match start.client_hello().server_name() {
        Some(name) => name.to_string(),
        None => match authority {
            Some(authority) => authority.host.clone(),
            None => state.local_addr().ip().to_string(),
        },
    };
    let material = runtime
        .certificates
        .certificate_for(state.local_addr(), &server_name)?;
    let server_config = build_server_config(material, state.tls_config())?;

    let tls_stream = start
        .into_stream(server_config)
        .await
        .map_err(|error| PipelineError::TlsHandshake(error.to_string()))?;
    state.mark_tls_upgraded();

    let negotiated = tls_stream
        .get_ref()
        .1
        .alpn_protocol()
        .map(|protocol| String::from_utf8_lossy(protocol).into_owned());
    conn.stream = Box::new(tls_stream);

    match negotiated {
        Some(protocol) => Ok(Negotiated::Alpn(protocol)),
        None => Ok(Negotiated::Fallback),
    }
}

enum PrefaceOutcome {
    Matched,
    NotPreface,
}

async fn detect_preface(
    conn: &mut BufferedConn,
    state: &ConnectionState,
    idle: Duration,
) -> Result<PrefaceOutcome, PipelineError> {
    loop {
        match match_preface(&conn.read_buf) {
            PrefaceMatch::Matched => return Ok(PrefaceOutcome::Matched),
            PrefaceMatch::Mismatch => return Ok(PrefaceOutcome::NotPreface),
            PrefaceMatch::NeedMoreBytes => {
                if conn.read_more(state, idle).await? == 0 {
                    return Ok(PrefaceOutcome::NotPreface);
                }
            }
        }
    }
}

fn notify_configurator(runtime: &ProxyRuntime, state: &ConnectionState, protocol: &str) {
    if let Some(configurator) = &runtime.configurator {
        configurator.configure(state, protocol);
    }
}

fn accept_h2c_upgrade(message: &mut HttpMessage) -> HttpResponseHead {
    let mut switching = HttpResponseHead::new(HttpVersion::Http11, 101, "Switching Protocols");
    switching.set_header("Connection", "Upgrade");
    switching.set_header("Upgrade", "h2c");

    for name in UPGRADE_HOP_HEADERS {
        message.request.remove_headers(name);
    }
    message.set_property(PROPERTY_H2_STREAM, PropertyValue::Number(1));
    switching
}

async fn read_request_body(
    conn: &mut BufferedConn,
    state: &ConnectionState,
    request: &HttpRequestHead,
    idle: Duration,
) -> Result<Bytes, PipelineError> {
    let max_body_bytes = state.server_config().max_body_bytes;
    match request_body_framing(request) {
        BodyFraming::None | BodyFraming::CloseDelimited => Ok(Bytes::new()),
        BodyFraming::ContentLength(length) => {
            if length > max_body_bytes as u64 {
                return Err(PipelineError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request body exceeded configured limit",
                )));
            }
            let body = conn.read_exact_bytes(state, length as usize, idle).await?;
            Ok(Bytes::from(body))
        }
        BodyFraming::Chunked => read_chunked_body(conn, state, idle, max_body_bytes).await,
    }
}

async fn read_chunked_body(
    conn: &mut BufferedConn,
    state: &ConnectionState,
    idle: Duration,
    max_body_bytes: usize,
) -> Result<Bytes, PipelineError> {
    let mut body = Vec::new();
    loop {
        let size_line = conn
            .read_until_pattern(state, b"\r\n", max_body_bytes, idle)
            .await?
            .ok_or_else(|| {
                PipelineError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside chunked body",
                ))
            })?;
        let size = parse_chunk_size(&size_line)?;
        if size == 0 {
            // Trailer section, up to and including the empty line.
            loop {
                let line = conn
                    .read_until_pattern(state, b"\r\n", max_body_bytes, idle)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunked trailers",
                        ))
                    })?;
                if line == b"\r\n" {
                    return Ok(Bytes::from(body));
                }
            }
        }
        if body.len() + size > max_body_bytes {
            return Err(PipelineError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body exceeded configured limit",
            )));
        }
        let chunk = conn.read_exact_bytes(state, size + 2, idle).await?;
        if &chunk[size..] != b"\r\n" {
            return Err(PipelineError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk data was not terminated by CRLF",
            )));
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, PipelineError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| {
            PipelineError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk size line was not valid UTF-8",
            ))
        })?
        .trim_end_matches("\r\n");
    let size_text = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_text, 16).map_err(|_| {
        PipelineError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid chunk size",
        ))
    })
}

async fn write_response(
    stream: &mut Box<dyn ConnectionIo>,
    message: &HttpMessage,
) -> Result<(), PipelineError> {
    let Some(response) = &message.response else {
        return Err(PipelineError::Internal(
            "dispatch produced no response to write".to_string(),
        ));
    };
    stream.write_all(&response.to_bytes()).await?;
    if !message.response_body.is_empty() {
        stream.write_all(&message.response_body).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn serve_h2(
    runtime: &ProxyRuntime,
    state: &ConnectionState,
    conn: BufferedConn,
    upgrade: Option<Http2UpgradeContext>,
) -> Result<(), PipelineError> {
    match &runtime.h2_codec {
        Some(codec) => {
            let io = Http2Io {
                stream: conn.stream,
                buffered: conn.read_buf,
                upgrade,
            };
            codec.serve(state, io).await.map_err(PipelineError::Io)
        }
        None => {
            tracing::debug!(
                connection_id = %state.id(),
                "HTTP/2 negotiated but no codec installed, closing connection"
            );
            Ok(())
        }
    }
}

/// Replays already-buffered bytes before reading from the underlying
/// stream; writes go straight through. Lets the TLS acceptor see the
/// handshake bytes the sniffer consumed.
struct ReplayStream {
    prefix: Vec<u8>,
    offset: usize,
    inner: Box<dyn ConnectionIo>,
}

impl ReplayStream {
    fn new(prefix: Vec<u8>, inner: Box<dyn ConnectionIo>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for ReplayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let available = &this.prefix[this.offset..];
            let count = available.len().min(buf.remaining());
            buf.put_slice(&available[..count]);
            this.offset += count;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
