use std::io;
use std::time::Duration;

use tapwire_http::Authority;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connection::ConnectionState;
use crate::error::PipelineError;
use crate::pipeline::{BufferedConn, ConnectionIo};

const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Abandons interception for a CONNECT tunnel: answers
/// `200 Connection established`, opens the outbound leg, and relays
/// bytes verbatim in both directions until either side goes idle,
/// errors, or closes. No HTTP decoding happens afterwards.
pub(crate) async fn run_pass_through(
    state: &ConnectionState,
    mut conn: BufferedConn,
    target: Authority,
) -> Result<(), PipelineError> {
    conn.stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    conn.stream.flush().await?;

    let timeouts = state.server_config().timeouts;
    let mut upstream = tokio::time::timeout(
        timeouts.upstream_connect(),
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| PipelineError::UpstreamConnect(format!("connect to {target} timed out")))?
    .map_err(|error| PipelineError::UpstreamConnect(format!("connect to {target}: {error}")))?;

    // Bytes the client pipelined behind its CONNECT head.
    let buffered = std::mem::take(&mut conn.read_buf);
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
    }

    relay_bidirectional(conn.stream, upstream, timeouts.relay_idle()).await
}

/// Verbatim two-way byte relay. Reads are paced by the peer write
/// completing before the next read, EOF on one side flushes and shuts
/// down the other, and inactivity on either side ends the tunnel.
async fn relay_bidirectional(
    mut client: Box<dyn ConnectionIo>,
    mut upstream: TcpStream,
    idle: Duration,
) -> Result<(), PipelineError> {
    let mut from_client = [0_u8; IO_CHUNK_SIZE];
    let mut from_upstream = [0_u8; IO_CHUNK_SIZE];
    let mut client_closed = false;
    let mut upstream_closed = false;

    loop {
        if client_closed && upstream_closed {
            return Ok(());
        }

        tokio::select! {
            read = read_with_timeout(&mut client, &mut from_client, idle), if !client_closed => {
                let read = read?;
                if read == 0 {
                    client_closed = true;
                    close_on_flush(&mut upstream).await;
                } else {
                    upstream.write_all(&from_client[..read]).await?;
                }
            }
            read = read_with_timeout(&mut upstream, &mut from_upstream, idle), if !upstream_closed => {
                let read = read?;
                if read == 0 {
                    upstream_closed = true;
                    close_on_flush(&mut client).await;
                } else {
                    client.write_all(&from_upstream[..read]).await?;
                }
            }
        }
    }
}

async fn read_with_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    idle: Duration,
) -> Result<usize, PipelineError>
where
    S: AsyncReadExt + Unpin,
{
    match tokio::time::timeout(idle, stream.read(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::IdleTimeout(idle)),
    }
}

async fn close_on_flush<S>(stream: &mut S)
where
    S: AsyncWriteExt + Unpin,
{
    let _ = stream.flush().await;
    if let Err(error) = stream.shutdown().await {
        if !is_ignored_shutdown_error(&error) {
            tracing::debug!(%error, "relay shutdown failed");
        }
    }
}

fn is_ignored_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
