use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::pipeline::{serve_connection, ProxyRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyRunSummary {
    pub accepted_connections: u64,
    pub completed_connections: u64,
    pub failed_connections: u64,
}

/// Accepts up to `max_connections` connections, running one pipeline
/// task per connection, then drains them and reports how each ended.
/// Connection failures are already classified and logged by the
/// pipeline; here they only count.
pub async fn run_proxy_server(
    runtime: Arc<ProxyRuntime>,
    listener: TcpListener,
    max_connections: usize,
) -> io::Result<ProxyRunSummary> {
    let mut summary = ProxyRunSummary::default();
    let mut tasks = JoinSet::new();

    for _ in 0..max_connections {
        let (stream, _peer_addr) = listener.accept().await?;
        summary.accepted_connections += 1;
        let runtime = Arc::clone(&runtime);
        tasks.spawn(async move { serve_connection(runtime, stream).await });
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => summary.completed_connections += 1,
            Ok(Err(_)) | Err(_) => summary.failed_connections += 1,
        }
    }

    Ok(summary)
}
