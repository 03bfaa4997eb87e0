use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

const MIN_PACE: Duration = Duration::from_millis(1);
const MAX_PACE: Duration = Duration::from_millis(100);

/// Byte-granularity token bucket for pacing a stream direction.
struct ByteBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl ByteBucket {
    fn for_mbps(mbps: u64) -> Self {
        let capacity = (mbps as f64) * 1_048_576.0 / 8.0;
        Self { tokens: capacity, capacity, refill_per_sec: capacity, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Bucket is usable once at least one token is available.
    fn ready(&mut self) -> bool {
        self.refill();
        self.tokens >= 1.0
    }

    /// Sleep until roughly one token is available, bounded to 1-100 ms.
    fn pace(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec).clamp(MIN_PACE, MAX_PACE)
    }

    /// Deduct the bytes actually transferred. May go negative after a large
    /// transfer, which extends the subsequent pacing wait.
    fn consume(&mut self, n: usize) {
        self.tokens -= n as f64;
    }
}

/// Wraps a bidirectional stream and paces each direction at a configured
/// megabits-per-second rate. A rate of 0 short-circuits to pass-through.
pub struct ThrottledStream<S> {
    inner: S,
    read_bucket: Option<ByteBucket>,
    write_bucket: Option<ByteBucket>,
    read_pace: Option<Pin<Box<Sleep>>>,
    write_pace: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, mbps: u64) -> Self {
        let bucket = || (mbps > 0).then(|| ByteBucket::for_mbps(mbps));
        Self {
            inner,
            read_bucket: bucket(),
            write_bucket: bucket(),
            read_pace: None,
            write_pace: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Wait for a token, parking on the pacing timer as needed.
/// Returns `Poll::Ready(())` once a token is available.
fn poll_token(
    bucket: &mut Option<ByteBucket>,
    pace: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(bucket) = bucket.as_mut() else {
        return Poll::Ready(());
    };
    loop {
        if let Some(timer) = pace.as_mut() {
            match timer.as_mut().poll(cx) {
                Poll::Ready(()) => *pace = None,
                Poll::Pending => return Poll::Pending,
            }
        }
        if bucket.ready() {
            return Poll::Ready(());
        }
        *pace = Some(Box::pin(tokio::time::sleep(bucket.pace())));
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if poll_token(&mut this.read_bucket, &mut this.read_pace, cx).is_pending() {
            return Poll::Pending;
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(bucket) = this.read_bucket.as_mut() {
                    bucket.consume(buf.filled().len() - before);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if poll_token(&mut this.write_bucket, &mut this.write_pace, cx).is_pending() {
            return Poll::Pending;
        }
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                if let Some(bucket) = this.write_bucket.as_mut() {
                    bucket.consume(n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
