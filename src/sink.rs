//! Observation sink — an optional, best-effort tap on spliced traffic.
//!
//! The sink must never slow down or block the splice. `Tee` hands it bytes
//! through a bounded channel with `try_send`; a full channel means the sink
//! is falling behind, and we drop the sample rather than apply backpressure
//! to the proxied connection.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::trace;

const SINK_CHANNEL_CAPACITY: usize = 2048;

/// Direction a captured chunk traveled, for log annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

pub trait ObservationSink: Send + Sync {
    fn observe(&self, direction: Direction, data: &[u8]);
    fn close(&self);
}

/// Discards everything. The default when no sink is configured.
pub struct NullSink;

impl ObservationSink for NullSink {
    fn observe(&self, _direction: Direction, _data: &[u8]) {}
    fn close(&self) {}
}

/// Logs a hex dump of every captured chunk via `tracing`, off the splice's
/// hot path: `observe` only ever does a non-blocking channel send, and a
/// background task does the actual formatting and logging.
pub struct LoggingSink {
    tx: mpsc::Sender<(Direction, Bytes)>,
}

impl LoggingSink {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<(Direction, Bytes)>(SINK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some((direction, data)) = rx.recv().await {
                trace!(?direction, bytes = data.len(), dump = %hex::encode(&data), "observed traffic");
            }
        });
        Arc::new(Self { tx })
    }
}

impl ObservationSink for LoggingSink {
    fn observe(&self, direction: Direction, data: &[u8]) {
        if self.tx.try_send((direction, Bytes::copy_from_slice(data))).is_err() {
            trace!(bytes = data.len(), "observation sink overloaded, dropping sample");
        }
    }

    fn close(&self) {}
}

/// Wraps an `AsyncWrite` half of a spliced connection, forwarding every
/// write to the inner writer and best-effort offering the same bytes to an
/// `ObservationSink`.
pub struct Tee<W> {
    inner: W,
    sink: Arc<dyn ObservationSink>,
    direction: Direction,
}

impl<W> Tee<W> {
    pub fn new(inner: W, sink: Arc<dyn ObservationSink>, direction: Direction) -> Self {
        Self {
            inner,
            sink,
            direction,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Tee<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.sink.observe(this.direction, &buf[..*n]);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct CountingSink {
        count: std::sync::atomic::AtomicUsize,
    }

    impl ObservationSink for CountingSink {
        fn observe(&self, _direction: Direction, _data: &[u8]) {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn close(&self) {}
    }

    #[tokio::test]
    async fn tee_forwards_and_observes() {
        use tokio::io::AsyncReadExt;

        let sink = Arc::new(CountingSink {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let (mut far_end, near_end) = tokio::io::duplex(64);
        let mut tee = Tee::new(near_end, sink.clone(), Direction::ClientToServer);
        tee.write_all(b"hello").await.unwrap();

        let mut received = [0u8; 5];
        far_end.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello");
        assert_eq!(sink.count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_sink_is_inert() {
        let sink: Arc<dyn ObservationSink> = Arc::new(NullSink);
        sink.observe(Direction::ServerToClient, b"anything");
        sink.close();
    }
}
