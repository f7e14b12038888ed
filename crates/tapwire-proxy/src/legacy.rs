use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 16;
const PUMP_CHUNK_SIZE: usize = 8 * 1024;

/// Classic blocking read/write view over an async connection, for
/// collaborators that still expect socket semantics.
///
/// A pump task bridges the two concurrency models over bounded
/// channels, so the async side never blocks and the blocking side gets
/// back-pressure. All blocking calls must run on a plain thread (or a
/// blocking pool), never on a runtime worker.
pub struct LegacySocketAdapter {
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    connected: Arc<AtomicBool>,
    tls_terminated: bool,
    socket: Option<std::net::TcpStream>,
}

impl LegacySocketAdapter {
    /// Attaches to the connection's byte stream at its current point in
    /// the pipeline. `tls_terminated` records whether a TLS layer
    /// already decrypts the stream; `socket` carries the real socket
    /// for option forwarding when one is available.
    pub fn attach<S>(io: S, socket: Option<std::net::TcpStream>, tls_terminated: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(pump(io, outbound_rx, inbound_tx, Arc::clone(&connected)));

        Self {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            pending: Vec::new(),
            connected,
            tls_terminated,
            socket,
        }
    }

    /// Blocking read; returns zero once the connection is closed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.inbound.blocking_recv() {
                Some(bytes) => self.pending = bytes,
                None => return Ok(0),
            }
        }
        let count = self.pending.len().min(buf.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        Ok(count)
    }

    /// Blocking write of the whole buffer.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let Some(sender) = &self.outbound else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "adapter already closed",
            ));
        };
        sender.blocking_send(buf.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::NotConnected, "connection closed")
        })?;
        Ok(buf.len())
    }

    /// Flushes pending writes and shuts down the write side.
    pub fn close(&mut self) {
        self.outbound = None;
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some() && self.connected.load(Ordering::SeqCst)
    }

    /// Whether TLS termination had already happened where this adapter
    /// attached.
    pub fn is_tls_terminated(&self) -> bool {
        self.tls_terminated
    }

    pub fn set_keep_alive(&self, keep_alive: bool) -> io::Result<()> {
        let socket = self.require_socket()?;
        SockRef::from(socket).set_keepalive(keep_alive)
    }

    pub fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        self.require_socket()?.set_nodelay(no_delay)
    }

    fn require_socket(&self) -> io::Result<&std::net::TcpStream> {
        self.socket.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "no underlying socket available for option changes",
            )
        })
    }
}

async fn pump<S>(
    mut io: S,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = [0_u8; PUMP_CHUNK_SIZE];
    loop {
        tokio::select! {
            bytes = outbound.recv() => match bytes {
                Some(bytes) => {
                    if io.write_all(&bytes).await.is_err() || io.flush().await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = io.shutdown().await;
                    break;
                }
            },
            read = io.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if inbound.send(buf[..count].to_vec()).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    connected.store(false, Ordering::SeqCst);
}
