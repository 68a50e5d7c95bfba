//! Connection forwarding
//!
//! Dials a backend for an accepted connection and relays bytes in both
//! directions. Each direction half-closes its destination when its source
//! ends, so one side can finish sending while still receiving.

use crate::error::ForwardError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Size of the per-direction copy buffer
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// Number of directions that ended with a read or write error
    pub errors: u8,
}

/// Result of one direction of a relay
#[derive(Debug)]
struct PipeOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

/// Open a connection to `backend`, failing after `timeout`
pub async fn dial(backend: &str, timeout: Duration) -> Result<TcpStream, ForwardError> {
    match tokio::time::timeout(timeout, TcpStream::connect(backend)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(backend, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(ForwardError::Dial {
            addr: backend.to_string(),
            source,
        }),
        Err(_) => Err(ForwardError::DialTimeout {
            addr: backend.to_string(),
        }),
    }
}

/// Forward `inbound` to `backend`.
///
/// On dial failure the inbound connection is dropped (closed) and the error
/// returned; nothing is retried. Otherwise returns once both directions have
/// finished and both connections are closed.
pub async fn relay(
    inbound: TcpStream,
    backend: &str,
    connect_timeout: Duration,
) -> Result<RelayStats, ForwardError> {
    let outbound = match dial(backend, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            drop(inbound);
            return Err(e);
        }
    };
    Ok(splice(inbound, outbound).await)
}

/// Relay between two already-open streams until both directions finish
pub async fn splice<C, B>(client: C, backend: B) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let (upstream, downstream) = tokio::join!(
        pipe(client_read, backend_write, "client_to_backend"),
        pipe(backend_read, client_write, "backend_to_client"),
    );

    let errors = [&upstream, &downstream]
        .iter()
        .filter(|o| o.error.is_some())
        .count() as u8;

    RelayStats {
        client_to_backend: upstream.bytes,
        backend_to_client: downstream.bytes,
        errors,
    }
}

/// Copy `reader` into `writer` until end-of-stream or error, then shut down
/// the writer.
///
/// The reader is only dropped; a split read half cannot shut down the read
/// side of its socket. The socket closes once both halves of it are gone.
async fn pipe<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> PipeOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction, error = %e, "Relay read failed");
                error = Some(e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(direction, error = %e, "Relay write failed");
            error = Some(e);
            break;
        }
        bytes += n as u64;
    }

    // Half-close: the peer sees end-of-stream while the other direction drains
    if let Err(e) = writer.shutdown().await {
        debug!(direction, error = %e, "Relay shutdown failed");
    }
    drop(reader);

    PipeOutcome { bytes, error }
}
