//! Connection tap
//!
//! A [`TapStream`] wraps a session socket and mirrors every chunk read
//! or written to a debug sink, each chunk preceded by a directional
//! prefix (`c> ` client-to-proxy, `c< ` proxy-to-client, `s> `/`s< `
//! for the upstream side). Mirroring is gated on an atomic flag so the
//! session can switch it off mid-stream without re-wiring anything:
//! with `conn_log: handshake` the flag is cleared just before the relay
//! starts, keeping mail bodies and tokens out of the sink.
//!
//! Sink errors are ignored; the tap never fails the primary I/O.

use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared debug sink. Production uses stderr; tests inject a buffer.
pub type TapSink = Arc<Mutex<dyn Write + Send>>;

/// A stderr-backed sink.
#[must_use]
pub fn stderr_sink() -> TapSink {
    Arc::new(Mutex::new(std::io::stderr()))
}

/// The shared tap state for one session: the sink and the enable flag.
///
/// Cloned into both the downstream and upstream [`TapStream`] so a
/// single `disable()` silences the whole session.
#[derive(Clone)]
pub struct Tap {
    sink: TapSink,
    enabled: Arc<AtomicBool>,
}

impl Tap {
    #[must_use]
    pub fn new(sink: TapSink) -> Self {
        Self {
            sink,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Switch mirroring off. Irreversible for the session.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn mirror(&self, prefix: &str, payload: &[u8]) {
        if !self.is_enabled() || payload.is_empty() {
            return;
        }
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(prefix.as_bytes());
            let _ = sink.write_all(payload);
        }
    }
}

/// Socket adapter that tees reads and writes into a [`Tap`].
///
/// Built with [`TapStream::passthrough`] when `conn_log` is off; the
/// adapter is then inert and simply delegates.
pub struct TapStream<S> {
    inner: S,
    tap: Option<Tap>,
    read_prefix: &'static str,
    write_prefix: &'static str,
}

impl<S> std::fmt::Debug for TapStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapStream")
            .field("tap_enabled", &self.tap.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> TapStream<S> {
    pub fn new(inner: S, tap: Tap, read_prefix: &'static str, write_prefix: &'static str) -> Self {
        Self {
            inner,
            tap: Some(tap),
            read_prefix,
            write_prefix,
        }
    }

    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            tap: None,
            read_prefix: "",
            write_prefix: "",
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TapStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(tap)) = (&poll, &this.tap) {
            tap.mirror(this.read_prefix, &buf.filled()[before..]);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TapStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(tap)) = (&poll, &this.tap) {
            tap.mirror(this.write_prefix, &buf[..*n]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
