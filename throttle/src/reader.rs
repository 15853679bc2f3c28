//! Stream decorators that route every read through a [`ReadThrottler`].
//!
//! Each read is preceded by a throttling decision and followed by a notification carrying the
//! number of bytes the inner stream actually returned (zero at end of stream). Throttling
//! failures surface as `std::io::Error` so callers see I/O failures uniformly.

use std::io::{BufRead, Read, Seek};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::throttler::{AverageRateThrottler, ReadThrottler};

fn byte_count(size: usize) -> u64 {
    u64::try_from(size).unwrap_or(u64::MAX)
}

/// Blocking reader decorator.
#[derive(Debug)]
pub struct ThrottledReader<R, T: ?Sized = AverageRateThrottler> {
    inner: R,
    throttler: Arc<T>,
    max_wait: Option<Duration>,
    // bytes handed out by the last fill_buf and not consumed yet
    buffered: usize,
}

impl<R, T: ReadThrottler + ?Sized> ThrottledReader<R, T> {
    /// Waits as long as the throttler requires.
    pub fn new(inner: R, throttler: Arc<T>) -> Self {
        Self::with_max_wait(inner, throttler, None)
    }

    /// Reads fail with `ErrorKind::TimedOut` instead of pausing longer than `max_wait`.
    pub fn with_max_wait(inner: R, throttler: Arc<T>, max_wait: Option<Duration>) -> Self {
        Self {
            inner,
            throttler,
            max_wait,
            buffered: 0,
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub fn throttler(&self) -> &Arc<T> {
        &self.throttler
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read, T: ReadThrottler + ?Sized> Read for ThrottledReader<R, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.throttler.throttle(self.max_wait)?;
        let size = self.inner.read(buf)?;
        // a buffered inner reader serves this from what fill_buf already exposed
        self.buffered = self.buffered.saturating_sub(size);
        self.throttler.notify_read(byte_count(size));
        Ok(size)
    }
}

/// Only refills of the inner buffer are throttled; bytes already exposed by `fill_buf` are
/// handed out again without a new decision.
impl<R: BufRead, T: ReadThrottler + ?Sized> BufRead for ThrottledReader<R, T> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        if self.buffered == 0 {
            self.throttler.throttle(self.max_wait)?;
        }
        let buf = self.inner.fill_buf()?;
        self.buffered = buf.len();
        Ok(buf)
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.buffered = self.buffered.saturating_sub(amt);
        self.throttler.notify_read(byte_count(amt));
    }
}

impl<R: Seek, T: ?Sized> Seek for ThrottledReader<R, T> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        // seeking discards whatever the inner reader had buffered
        self.buffered = 0;
        self.inner.seek(pos)
    }
}

/// Async reader decorator for tokio.
///
/// Instead of blocking, a required pause is awaited on a tokio timer. Once the pause has elapsed
/// the pending read goes ahead without a new throttling decision, even if the inner stream is
/// not ready right away.
#[derive(Debug)]
pub struct AsyncThrottledReader<R, T: ?Sized = AverageRateThrottler> {
    inner: R,
    throttler: Arc<T>,
    max_wait: Option<Duration>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    admitted: bool,
}

impl<R, T: ReadThrottler + ?Sized> AsyncThrottledReader<R, T> {
    pub fn new(inner: R, throttler: Arc<T>) -> Self {
        Self::with_max_wait(inner, throttler, None)
    }

    pub fn with_max_wait(inner: R, throttler: Arc<T>, max_wait: Option<Duration>) -> Self {
        Self {
            inner,
            throttler,
            max_wait,
            sleep: None,
            admitted: false,
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub fn throttler(&self) -> &Arc<T> {
        &self.throttler
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin, T: ReadThrottler + ?Sized> AsyncRead for AsyncThrottledReader<R, T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if !this.admitted {
            if this.sleep.is_none() {
                let pause = this.throttler.check(this.max_wait)?;
                if !pause.is_zero() {
                    tracing::debug!("throttling read for {:?}", pause);
                    this.sleep = Some(Box::pin(tokio::time::sleep(pause)));
                }
            }
            if let Some(sleep) = this.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                this.sleep = None;
            }
            this.admitted = true;
        }
        let filled_before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        this.admitted = false;
        result?;
        let size = buf.filled().len().saturating_sub(filled_before);
        this.throttler.notify_read(byte_count(size));
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncSeek + Unpin, T: ?Sized> AsyncSeek for AsyncThrottledReader<R, T> {
    fn start_seek(mut self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Wraps streams so they all draw from one shared throttler.
#[derive(Debug)]
pub struct ThrottledReaderFactory<T: ?Sized = AverageRateThrottler> {
    throttler: Arc<T>,
    max_wait: Option<Duration>,
}

impl<T: ?Sized> Clone for ThrottledReaderFactory<T> {
    fn clone(&self) -> Self {
        Self {
            throttler: self.throttler.clone(),
            max_wait: self.max_wait,
        }
    }
}

impl<T: ReadThrottler + ?Sized> ThrottledReaderFactory<T> {
    pub fn new(throttler: Arc<T>) -> Self {
        Self {
            throttler,
            max_wait: None,
        }
    }

    /// Default max wait for readers created by this factory.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn throttler(&self) -> &Arc<T> {
        &self.throttler
    }

    pub fn create<R: Read>(&self, reader: R) -> ThrottledReader<R, T> {
        ThrottledReader::with_max_wait(reader, self.throttler.clone(), self.max_wait)
    }

    pub fn create_with_max_wait<R: Read>(
        &self,
        reader: R,
        max_wait: Option<Duration>,
    ) -> ThrottledReader<R, T> {
        ThrottledReader::with_max_wait(reader, self.throttler.clone(), max_wait)
    }

    pub fn create_async<R: AsyncRead + Unpin>(&self, reader: R) -> AsyncThrottledReader<R, T> {
        AsyncThrottledReader::with_max_wait(reader, self.throttler.clone(), self.max_wait)
    }
}
