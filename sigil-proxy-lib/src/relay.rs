//! Full-duplex byte relay between two streams with idle deadlines,
//! cancellation, and per-direction accounting.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction by [`relay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCounts {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayCounts {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copy bytes between `a` and `b` in both directions until EOF, error,
/// idle deadline, or cancellation.
///
/// When one direction finishes it half-closes its destination so the peer
/// sees EOF there while the opposite direction keeps flowing; some
/// protocols need the response after the client closes its sending side.
/// Accumulated counts are returned even when the session was cancelled.
pub async fn relay<A, B>(a: A, b: B, cancel: CancellationToken, idle: Duration) -> RelayCounts
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let (a_to_b, b_to_a) = tokio::join!(
        copy_direction(a_read, b_write, cancel.clone(), idle),
        copy_direction(b_read, a_write, cancel.clone(), idle),
    );
    RelayCounts { a_to_b, b_to_a }
}

async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    cancel: CancellationToken,
    idle: Duration,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = timeout(idle, src.read(&mut buf)) => r,
        };
        let n = match read {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
            Err(_) => break, // idle deadline
        };
        let wrote = tokio::select! {
            _ = cancel.cancelled() => false,
            w = dst.write_all(&buf[..n]) => w.is_ok(),
        };
        if !wrote {
            break;
        }
        written += n as u64;
    }
    // Half-close the destination so the peer observes EOF in this direction.
    let _ = dst.shutdown().await;
    written
}
