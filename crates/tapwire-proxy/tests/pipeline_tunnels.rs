use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tapwire_http::{parse_response_head, Http2Setting, HttpMessage, PROPERTY_H2_STREAM};
use tapwire_proxy::{
    run_proxy_server, ConnectEstablishedHandler, ConnectionState, HandlerContext, HandlerError,
    Http2Codec, Http2Io, HttpMessageHandler, PassThroughConfig, PipelineConfigurator,
    ProxyRuntime, ServerConfig,
};
use tapwire_tls::{CaConfig, LocalCertificateAuthority, TlsConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct Responder {
    head: &'static str,
    body: &'static [u8],
}

impl HttpMessageHandler for Responder {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        message: &mut HttpMessage,
    ) -> Result<(), HandlerError> {
        if ctx.is_from_client() && !message.request.is_connect() {
            message
                .set_response(parse_response_head(self.head.as_bytes()).expect("response head"));
            message.set_response_body(self.body);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingConfigurator {
    protocols: Mutex<Vec<String>>,
}

impl PipelineConfigurator for RecordingConfigurator {
    fn configure(&self, _connection: &ConnectionState, protocol: &str) {
        self.protocols
            .lock()
            .expect("protocols lock")
            .push(protocol.to_string());
    }
}

struct RecordedH2 {
    buffered: Vec<u8>,
    upgrade_settings: Option<Vec<Http2Setting>>,
    upgrade_message: Option<HttpMessage>,
}

#[derive(Default)]
struct RecordingH2Codec {
    recorded: Mutex<Option<RecordedH2>>,
}

impl Http2Codec for RecordingH2Codec {
    fn serve<'a>(
        &'a self,
        _connection: &'a ConnectionState,
        io: Http2Io,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let (upgrade_settings, upgrade_message) = match io.upgrade {
                Some(upgrade) => (Some(upgrade.settings), Some(upgrade.message)),
                None => (None, None),
            };
            *self.recorded.lock().expect("recorded lock") = Some(RecordedH2 {
                buffered: io.buffered,
                upgrade_settings,
                upgrade_message,
            });
            Ok(())
        })
    }
}

struct TestProxy {
    port: u16,
    ca: Arc<LocalCertificateAuthority>,
    configurator: Arc<RecordingConfigurator>,
    h2_codec: Arc<RecordingH2Codec>,
    server: JoinHandle<io::Result<tapwire_proxy::ProxyRunSummary>>,
}

async fn start_proxy(
    handlers: Vec<Arc<dyn HttpMessageHandler>>,
    config: ServerConfig,
    tls_config: TlsConfig,
) -> TestProxy {
    let ca = Arc::new(LocalCertificateAuthority::new(CaConfig::default()).expect("ca"));
    let configurator = Arc::new(RecordingConfigurator::default());
    let h2_codec = Arc::new(RecordingH2Codec::default());

    let certificates: Arc<dyn tapwire_tls::CertificateService> =
        Arc::clone(&ca) as Arc<dyn tapwire_tls::CertificateService>;
    let mut runtime = ProxyRuntime::new(Arc::new(config), tls_config, certificates);
    runtime.handlers = handlers;
    runtime.configurator = Some(Arc::clone(&configurator) as Arc<dyn PipelineConfigurator>);
    runtime.h2_codec = Some(Arc::clone(&h2_codec) as Arc<dyn Http2Codec>);
    let runtime = Arc::new(runtime);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("listener addr").port();
    let server = tokio::spawn(run_proxy_server(runtime, listener, 1));
    TestProxy {
        port,
        ca,
        configurator,
        h2_codec,
        server,
    }
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to proxy")
}

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// One-shot echo server standing in for the real tunnel destination.
async fn start_echo_server() -> (u16, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let port = listener.local_addr().expect("echo addr").port();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept echo");
        let mut seen = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let read = stream.read(&mut buf).await.expect("echo read");
            if read == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..read]);
            stream.write_all(&buf[..read]).await.expect("echo write");
        }
        seen
    });
    (port, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pass_through_relays_bytes_verbatim_in_both_directions() {
    let (echo_port, echo) = start_echo_server().await;
    let config = ServerConfig {
        pass_through: PassThroughConfig {
            enabled: true,
            authorities: vec!["127.0.0.1".to_string()],
        },
        ..ServerConfig::default()
    };
    let proxy = start_proxy(
        vec![Arc::new(ConnectEstablishedHandler)],
        config,
        TlsConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .expect("write CONNECT");

    let mut established = vec![0_u8; ESTABLISHED.len()];
    client
        .read_exact(&mut established)
        .await
        .expect("read established");
    assert_eq!(established, ESTABLISHED);

    client
        .write_all(b"not http at all \x00\x01\x02")
        .await
        .expect("write tunnel bytes");
    let mut echoed = vec![0_u8; 19];
    client.read_exact(&mut echoed).await.expect("read echoed");
    assert_eq!(echoed, b"not http at all \x00\x01\x02");

    drop(client);
    let seen = echo.await.expect("echo join");
    assert_eq!(seen, b"not http at all \x00\x01\x02");

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    // Interception never engaged, so no protocol was ever configured.
    assert!(proxy.configurator.protocols.lock().expect("lock").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_then_tls_is_terminated_with_an_sni_matched_certificate() {
    let proxy = start_proxy(
        vec![
            Arc::new(ConnectEstablishedHandler),
            Arc::new(Responder {
                head: "HTTP/1.1 200 OK\r\nContent-Length: 5",
                body: b"intls",
            }),
        ],
        ServerConfig::default(),
        TlsConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("write CONNECT");
    let mut established = vec![0_u8; ESTABLISHED.len()];
    client
        .read_exact(&mut established)
        .await
        .expect("read established");
    assert_eq!(established, ESTABLISHED);

    // The client verifies the presented certificate against the
    // proxy's CA and the requested name, so a successful handshake
    // proves the dynamically issued leaf matches the authority.
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(proxy.ca.ca_certificate_der().clone())
        .expect("trust proxy ca");
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::pki_types::ServerName::try_from("example.org").expect("name");
    let mut tls_client = connector
        .connect(server_name, client)
        .await
        .expect("tls handshake with proxy");

    tls_client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .expect("write request inside tls");
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nintls";
    let mut response = vec![0_u8; expected.len()];
    tls_client
        .read_exact(&mut response)
        .await
        .expect("read response inside tls");
    assert_eq!(response, expected);

    drop(tls_client);
    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    // No ALPN offered, so the pipeline was configured for the
    // HTTP/1.1 fallback.
    assert_eq!(
        *proxy.configurator.protocols.lock().expect("lock"),
        vec!["http/1.1".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alpn_h2_hands_the_connection_to_the_codec() {
    let tls_config = TlsConfig {
        alpn_enabled: true,
        application_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        ..TlsConfig::default()
    };
    let proxy = start_proxy(
        vec![Arc::new(ConnectEstablishedHandler)],
        ServerConfig::default(),
        tls_config,
    )
    .await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("write CONNECT");
    let mut established = vec![0_u8; ESTABLISHED.len()];
    client
        .read_exact(&mut established)
        .await
        .expect("read established");

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(proxy.ca.ca_certificate_der().clone())
        .expect("trust proxy ca");
    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_config.alpn_protocols = vec![b"h2".to_vec()];
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::pki_types::ServerName::try_from("example.org").expect("name");
    let tls_client = connector
        .connect(server_name, client)
        .await
        .expect("tls handshake with proxy");
    assert_eq!(tls_client.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    drop(tls_client);
    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);

    assert_eq!(
        *proxy.configurator.protocols.lock().expect("lock"),
        vec!["h2".to_string()]
    );
    let recorded = proxy.h2_codec.recorded.lock().expect("lock");
    let recorded = recorded.as_ref().expect("codec invoked");
    assert!(recorded.upgrade_settings.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleartext_preface_switches_to_the_codec_with_bytes_intact() {
    let proxy = start_proxy(Vec::new(), ServerConfig::default(), TlsConfig::default()).await;

    let preface = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
    let mut client = connect(proxy.port).await;
    client.write_all(preface).await.expect("write preface");

    let mut trailing = Vec::new();
    client.read_to_end(&mut trailing).await.expect("read to close");
    assert!(trailing.is_empty());

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    assert_eq!(
        *proxy.configurator.protocols.lock().expect("lock"),
        vec!["h2".to_string()]
    );
    let recorded = proxy.h2_codec.recorded.lock().expect("lock");
    let recorded = recorded.as_ref().expect("codec invoked");
    assert_eq!(recorded.buffered, preface);
    assert!(recorded.upgrade_settings.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn h2c_upgrade_switches_protocols_and_notifies_the_codec() {
    let proxy = start_proxy(Vec::new(), ServerConfig::default(), TlsConfig::default()).await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: example.org\r\nUpgrade: h2c\r\nConnection: Upgrade, HTTP2-Settings\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .expect("write upgrade request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read to close");
    assert_eq!(
        response,
        b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n"
    );

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    assert_eq!(
        *proxy.configurator.protocols.lock().expect("lock"),
        vec!["h2".to_string()]
    );

    let recorded = proxy.h2_codec.recorded.lock().expect("lock");
    let recorded = recorded.as_ref().expect("codec invoked");
    assert_eq!(
        recorded.upgrade_settings.as_deref(),
        Some(
            &[
                Http2Setting {
                    identifier: 3,
                    value: 100
                },
                Http2Setting {
                    identifier: 4,
                    value: 65_535
                },
            ][..]
        )
    );
    let message = recorded.upgrade_message.as_ref().expect("upgrade message");
    assert!(message.has_property(PROPERTY_H2_STREAM));
    assert!(message.request.header("Upgrade").is_none());
    assert!(message.request.header("Connection").is_none());
    assert!(message.request.header("HTTP2-Settings").is_none());
    assert_eq!(message.request.header("Host"), Some("example.org"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_upgrade_is_served_as_plain_http1() {
    let proxy = start_proxy(
        vec![Arc::new(Responder {
            head: "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close",
            body: b"",
        })],
        ServerConfig::default(),
        TlsConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    // Connection header names an extra token, so the upgrade must be
    // ignored.
    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: example.org\r\nUpgrade: h2c\r\nConnection: Upgrade, HTTP2-Settings, keep-alive\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .expect("write request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read to close");
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    assert!(proxy.h2_codec.recorded.lock().expect("lock").is_none());
}
