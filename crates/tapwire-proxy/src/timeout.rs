use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::connection::ConnectionState;
use crate::error::PipelineError;

/// Reads from the stream under the connection's idle-read timer.
///
/// The timer is disarmed while a message is being processed: a slow
/// application side must not be mistaken for a dead network peer.
pub(crate) async fn read_idle_guarded<S>(
    stream: &mut S,
    buf: &mut [u8],
    state: &ConnectionState,
    idle: Duration,
) -> Result<usize, PipelineError>
where
    S: AsyncRead + Unpin,
{
    if state.is_processing_message() {
        return Ok(stream.read(buf).await?);
    }
    match tokio::time::timeout(idle, stream.read(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::IdleTimeout(idle)),
    }
}
