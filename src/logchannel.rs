//! Bounded ring-buffer channel carrying container log bytes from the
//! streaming task to the task that appends them to `client.log` (§5: "log
//! streams are many-producer-one-consumer channels with bounded
//! backpressure; dropped messages prefer older-most").
//!
//! [`ContainerRuntime::stream_logs`](crate::runtime::ContainerRuntime::stream_logs)
//! writes through a plain [`tokio::io::AsyncWrite`], so the channel is
//! byte-oriented rather than line-oriented: once the buffer exceeds its
//! capacity, the oldest buffered bytes are evicted to make room for the
//! newest, rather than applying backpressure to the log stream itself.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use tokio::{io::AsyncWrite, sync::Notify};

/// Default ring-buffer capacity per stream (§9 "bounded backpressure").
pub const DEFAULT_CAPACITY_BYTES: usize = 1 << 20;

struct Ring {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
    notify: Notify,
}

/// The producer half: an [`AsyncWrite`] that never blocks the log-streaming
/// task, evicting the oldest buffered bytes instead.
#[derive(Clone)]
pub struct LogSender(Arc<Ring>);

/// The consumer half: drains buffered bytes in arrival order.
pub struct LogReceiver(Arc<Ring>);

/// Builds a ring-buffer channel with room for `capacity` bytes.
#[must_use]
pub fn channel(capacity: usize) -> (LogSender, LogReceiver) {
    let ring = Arc::new(Ring {
        buf: Mutex::new(VecDeque::new()),
        capacity,
        notify: Notify::new(),
    });
    (LogSender(ring.clone()), LogReceiver(ring))
}

impl AsyncWrite for LogSender {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut guard = self.0.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.extend(buf.iter().copied());
        let overflow = guard.len().saturating_sub(self.0.capacity);
        if overflow > 0 {
            guard.drain(..overflow);
        }
        drop(guard);
        self.0.notify.notify_one();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl LogReceiver {
    /// Waits for and drains whatever bytes are currently buffered.
    pub async fn recv(&mut self) -> Vec<u8> {
        loop {
            {
                let mut guard = self.0.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if !guard.is_empty() {
                    return guard.drain(..).collect();
                }
            }
            self.0.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn delivers_written_bytes_in_order() {
        let (mut sender, mut receiver) = channel(1024);
        sender.write_all(b"hello ").await.unwrap();
        sender.write_all(b"world").await.unwrap();
        assert_eq!(receiver.recv().await, b"hello world");
    }

    #[tokio::test]
    async fn evicts_oldest_bytes_once_over_capacity() {
        let (mut sender, mut receiver) = channel(4);
        sender.write_all(b"abcd").await.unwrap();
        sender.write_all(b"ef").await.unwrap();
        assert_eq!(receiver.recv().await, b"cdef");
    }
}
