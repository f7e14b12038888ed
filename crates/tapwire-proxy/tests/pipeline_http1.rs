use std::sync::Arc;

use tapwire_http::{parse_response_head, HttpMessage};
use tapwire_proxy::{
    run_proxy_server, HandlerContext, HandlerError, HttpMessageHandler, ProxyRuntime,
    ServerConfig,
};
use tapwire_tls::{CaConfig, LocalCertificateAuthority, TlsConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Answers every non-CONNECT request with a fixed response.
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

struct TestProxy {
    port: u16,
    server: JoinHandle<std::io::Result<tapwire_proxy::ProxyRunSummary>>,
}

async fn start_proxy(
    handlers: Vec<Arc<dyn HttpMessageHandler>>,
    config: ServerConfig,
) -> TestProxy {
    let ca = Arc::new(LocalCertificateAuthority::new(CaConfig::default()).expect("ca"));
    let mut runtime = ProxyRuntime::new(Arc::new(config), TlsConfig::default(), ca);
    runtime.handlers = handlers;
    let runtime = Arc::new(runtime);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("listener addr").port();
    let server = tokio::spawn(run_proxy_server(runtime, listener, 1));
    TestProxy { port, server }
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to proxy")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_alive_connection_serves_multiple_exchanges() {
    let proxy = start_proxy(
        vec![Arc::new(Responder {
            head: "HTTP/1.1 200 OK\r\nContent-Length: 2",
            body: b"ok",
        })],
        ServerConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    for _ in 0..2 {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")
            .await
            .expect("write request");
        let mut response = vec![0_u8; expected.len()];
        client.read_exact(&mut response).await.expect("read response");
        assert_eq!(response, expected);
    }

    drop(client);
    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
    assert_eq!(summary.failed_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_handlers_produce_the_bare_default_response_and_close() {
    let proxy = start_proxy(Vec::new(), ServerConfig::default()).await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read to close");
    assert_eq!(response, b"HTTP/1.0 0\r\n\r\n");

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_header_ends_the_connection_after_one_exchange() {
    let proxy = start_proxy(
        vec![Arc::new(Responder {
            head: "HTTP/1.1 200 OK\r\nConnection: close",
            body: b"",
        })],
        ServerConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read to close");
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_bodies_are_consumed_before_the_next_exchange() {
    let proxy = start_proxy(
        vec![Arc::new(Responder {
            head: "HTTP/1.1 200 OK\r\nContent-Length: 0",
            body: b"",
        })],
        ServerConfig::default(),
    )
    .await;

    let mut client = connect(proxy.port).await;
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

    client
        .write_all(b"POST /a HTTP/1.1\r\nHost: example.org\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .expect("write first request");
    let mut response = vec![0_u8; expected.len()];
    client.read_exact(&mut response).await.expect("read first");
    assert_eq!(response, expected);

    client
        .write_all(
            b"POST /b HTTP/1.1\r\nHost: example.org\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nworld\r\n0\r\n\r\n",
        )
        .await
        .expect("write second request");
    let mut response = vec![0_u8; expected.len()];
    client.read_exact(&mut response).await.expect("read second");
    assert_eq!(response, expected);

    drop(client);
    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.completed_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_head_closes_and_counts_as_failure() {
    let proxy = start_proxy(Vec::new(), ServerConfig::default()).await;

    let mut client = connect(proxy.port).await;
    client
        .write_all(b"MalformedRequest HTTP/1.1\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.expect("read to close");
    assert!(response.is_empty());

    let summary = proxy.server.await.expect("join").expect("summary");
    assert_eq!(summary.failed_connections, 1);
}
