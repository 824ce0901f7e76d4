//! Backend queue seam between topics/channels and storage.
//!
//! Durable topics and channels sit on a [`DiskQueue`]; `#ephemeral` ones
//! use [`EphemeralQueue`], which accepts and discards overflow.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::diskqueue::{DiskQueue, QueueError};

#[async_trait]
pub trait BackendQueue: Send + Sync {
    async fn put(&self, data: Vec<u8>) -> Result<(), QueueError>;
    fn depth(&self) -> i64;
    /// One-shot: the owning pump takes the read side for the queue's life.
    fn take_reader(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
    async fn empty(&self) -> Result<(), QueueError>;
    async fn close(&self) -> Result<(), QueueError>;
    async fn delete(&self) -> Result<(), QueueError>;
}

#[async_trait]
impl BackendQueue for DiskQueue {
    async fn put(&self, data: Vec<u8>) -> Result<(), QueueError> {
        DiskQueue::put(self, data).await
    }

    fn depth(&self) -> i64 {
        DiskQueue::depth(self)
    }

    fn take_reader(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        DiskQueue::take_reader(self)
    }

    async fn empty(&self) -> Result<(), QueueError> {
        DiskQueue::empty(self).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        DiskQueue::close(self).await
    }

    async fn delete(&self) -> Result<(), QueueError> {
        DiskQueue::delete(self).await
    }
}

/// Backend for `#ephemeral` topics and channels: nothing is stored,
/// overflow is dropped, and the reader never yields.
pub struct EphemeralQueue {
    // keeps the reader pending instead of closed
    _keepalive: mpsc::Sender<Vec<u8>>,
    reader: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl EphemeralQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            _keepalive: tx,
            reader: Mutex::new(Some(rx)),
        }
    }
}

impl Default for EphemeralQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendQueue for EphemeralQueue {
    async fn put(&self, _data: Vec<u8>) -> Result<(), QueueError> {
        Ok(())
    }

    fn depth(&self) -> i64 {
        0
    }

    fn take_reader(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.reader.lock().take()
    }

    async fn empty(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn delete(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
