use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Cumulative read/written counters shared between a stream wrapper and the
/// bookkeeping that outlives it.
#[derive(Debug, Default)]
pub struct ByteCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl ByteCounters {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }
}

/// Transparent stream wrapper that counts every byte moved through it.
///
/// Counters live behind an `Arc` so they stay readable after the stream is
/// torn down. If the socket dies abruptly the counters still reflect
/// everything observed up to the last poll.
pub struct CountedStream<S> {
    inner: S,
    counters: Arc<ByteCounters>,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, counters: Arc<ByteCounters>) -> Self {
        Self { inner, counters }
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            self.counters.add_read(n as u64);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.counters.add_written(*n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = &result {
            self.counters.add_written(*n as u64);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    started: bool,
    finalized_tx: u64,
    finalized_rx: u64,
    next_registration: u64,
    live: Vec<(u64, LiveTarget)>,
}

#[derive(Debug)]
struct LiveTarget {
    counters: Arc<ByteCounters>,
    previous_bytes_read: u64,
    previous_bytes_written: u64,
}

impl LiveTarget {
    fn delta(&self) -> (u64, u64) {
        let tx = self
            .counters
            .bytes_written()
            .saturating_sub(self.previous_bytes_written);
        let rx = self
            .counters
            .bytes_read()
            .saturating_sub(self.previous_bytes_read);
        (tx, rx)
    }
}

/// Accumulates target-socket byte totals for one connection.
///
/// Totals stay `None` until the first target socket is registered, so a
/// connection that never opened one reports null target stats. Sockets
/// still in flight contribute their current deltas, so a snapshot taken
/// during an abrupt teardown reflects everything observed so far.
#[derive(Debug, Default)]
pub struct TargetTracker {
    inner: Mutex<TrackerInner>,
}

impl TargetTracker {
    /// Attach a target socket. Latches the socket's current counters so a
    /// reused socket contributes only the delta accrued while registered.
    pub fn register(self: &Arc<Self>, counters: Arc<ByteCounters>) -> TargetGuard {
        let mut inner = self.inner.lock().unwrap();
        inner.started = true;
        inner.next_registration += 1;
        let registration = inner.next_registration;
        inner.live.push((
            registration,
            LiveTarget {
                previous_bytes_read: counters.bytes_read(),
                previous_bytes_written: counters.bytes_written(),
                counters,
            },
        ));
        TargetGuard {
            tracker: Arc::clone(self),
            registration,
            finalized: AtomicBool::new(false),
        }
    }

    /// `(trg_tx_bytes, trg_rx_bytes)`: finalized totals plus the current
    /// deltas of every live target socket.
    pub fn totals(&self) -> (Option<u64>, Option<u64>) {
        let inner = self.inner.lock().unwrap();
        if !inner.started {
            return (None, None);
        }
        let (mut tx, mut rx) = (inner.finalized_tx, inner.finalized_rx);
        for (_, live) in &inner.live {
            let (live_tx, live_rx) = live.delta();
            tx += live_tx;
            rx += live_rx;
        }
        (Some(tx), Some(rx))
    }

    fn finalize_registration(&self, registration: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.live.iter().position(|(id, _)| *id == registration) {
            let (_, live) = inner.live.swap_remove(index);
            let (tx, rx) = live.delta();
            inner.finalized_tx += tx;
            inner.finalized_rx += rx;
        }
    }
}

/// Finalization handle for one target-socket registration. Folds the
/// deltas since registration into the connection totals, either on an
/// explicit `finalize()` (end-of-use signal) or when dropped.
pub struct TargetGuard {
    tracker: Arc<TargetTracker>,
    registration: u64,
    finalized: AtomicBool,
}

impl TargetGuard {
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.finalize_registration(self.registration);
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counted_stream_tracks_both_directions() {
        let (client, mut server) = tokio::io::duplex(64);
        let counters = Arc::new(ByteCounters::default());
        let mut counted = CountedStream::new(client, counters.clone());

        counted.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(counted.counters().bytes_written(), 5);
        assert_eq!(counters.bytes_read(), 7);
    }

    #[test]
    fn test_totals_none_until_first_registration() {
        let tracker = Arc::new(TargetTracker::default());
        assert_eq!(tracker.totals(), (None, None));

        let counters = Arc::new(ByteCounters::default());
        let guard = tracker.register(counters);
        drop(guard);

        assert_eq!(tracker.totals(), (Some(0), Some(0)));
    }

    #[test]
    fn test_reused_socket_counts_delta_only() {
        let tracker = Arc::new(TargetTracker::default());
        let counters = Arc::new(ByteCounters::default());

        // First use of the socket.
        counters.add_written(100);
        counters.add_read(40);
        let guard = tracker.register(counters.clone());
        counters.add_written(10);
        counters.add_read(5);
        guard.finalize();
        assert_eq!(tracker.totals(), (Some(10), Some(5)));

        // Reuse: the latch starts at the current counters, not at zero.
        let guard = tracker.register(counters.clone());
        counters.add_written(3);
        counters.add_read(2);
        drop(guard);
        assert_eq!(tracker.totals(), (Some(13), Some(7)));
    }

    #[test]
    fn test_live_sockets_visible_in_totals() {
        let tracker = Arc::new(TargetTracker::default());
        let counters = Arc::new(ByteCounters::default());
        let guard = tracker.register(counters.clone());
        counters.add_written(7);

        // Still in flight, but already part of the snapshot.
        assert_eq!(tracker.totals(), (Some(7), Some(0)));
        guard.finalize();
        assert_eq!(tracker.totals(), (Some(7), Some(0)));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let tracker = Arc::new(TargetTracker::default());
        let counters = Arc::new(ByteCounters::default());
        let guard = tracker.register(counters.clone());
        counters.add_written(8);
        guard.finalize();
        guard.finalize();
        drop(guard);
        assert_eq!(tracker.totals(), (Some(8), Some(0)));
    }

    #[test]
    fn test_totals_sum_over_multiple_sockets() {
        let tracker = Arc::new(TargetTracker::default());
        for i in 1..=3u64 {
            let counters = Arc::new(ByteCounters::default());
            let guard = tracker.register(counters.clone());
            counters.add_written(i * 10);
            counters.add_read(i);
            drop(guard);
        }
        assert_eq!(tracker.totals(), (Some(60), Some(6)));
    }
}
