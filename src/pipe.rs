use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Default)]
struct PipeState {
    buf: BytesMut,
    closed: bool,
}

/// Byte queue between the session reader and a consumer.
///
/// Bytes fed before [`BufferedPipe::close`] stay readable after it; once the
/// queue is drained a closed pipe returns empty reads without waiting.
pub struct BufferedPipe {
    state: Mutex<PipeState>,
    readable: watch::Sender<bool>,
}

impl Default for BufferedPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedPipe {
    pub fn new() -> Self {
        let (readable, _) = watch::channel(false);
        Self {
            state: Mutex::new(PipeState::default()),
            readable,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh(&self, state: &PipeState) {
        self.readable
            .send_replace(!state.buf.is_empty() || state.closed);
    }

    /// Appends data. Data fed after close is dropped.
    pub fn feed(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.closed || data.is_empty() {
            return;
        }
        state.buf.extend_from_slice(data);
        self.refresh(&state);
    }

    pub fn read_ready(&self) -> bool {
        let state = self.lock();
        !state.buf.is_empty() || state.closed
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// `Some(empty)` once closed and drained, `None` when it would block.
    pub fn try_read(&self, size: usize) -> Option<Bytes> {
        let mut state = self.lock();
        if !state.buf.is_empty() {
            let size = size.min(state.buf.len());
            let out = state.buf.split_to(size).freeze();
            self.refresh(&state);
            return Some(out);
        }
        if state.closed {
            return Some(Bytes::new());
        }
        None
    }

    /// Up to `size` bytes. Empty bytes mean the pipe is closed.
    pub async fn read(&self, size: usize, timeout: Option<Duration>) -> Result<Bytes> {
        let mut readable = self.readable.subscribe();
        let wait = async {
            loop {
                if let Some(data) = self.try_read(size) {
                    return data;
                }
                if readable.wait_for(|ready| *ready).await.is_err() {
                    return Bytes::new();
                }
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::Timeout),
            None => Ok(wait.await),
        }
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.refresh(&state);
    }

    /// Watch that mirrors "a read would not block".
    pub fn readable(&self) -> watch::Receiver<bool> {
        self.readable.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn read_after_close_drains_then_returns_empty() {
        let pipe = BufferedPipe::new();
        pipe.feed(b"hello world");
        pipe.close();
        pipe.feed(b"ignored");

        assert_eq!(&pipe.read(5, None).await.unwrap()[..], b"hello");
        assert_eq!(&pipe.read(100, None).await.unwrap()[..], b" world");
        assert!(pipe.read(100, None).await.unwrap().is_empty());
        assert!(pipe.read(100, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_times_out_on_empty() {
        let pipe = BufferedPipe::new();
        let res = pipe.read(10, Some(Duration::from_millis(20))).await;
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn reader_wakes_on_feed_and_close() {
        let pipe = Arc::new(BufferedPipe::new());
        let reader = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move {
                let mut out = vec![];
                loop {
                    let data = pipe.read(3, None).await.unwrap();
                    if data.is_empty() {
                        break out;
                    }
                    out.extend(data);
                }
            })
        };

        let mut readable = pipe.readable();
        assert!(!*readable.borrow_and_update());
        pipe.feed(b"abc");
        tokio::task::yield_now().await;
        pipe.feed(b"defg");
        pipe.close();
        assert_eq!(reader.await.unwrap(), b"abcdefg");
        assert!(*readable.borrow());
        assert!(pipe.read_ready());
    }
}
