//! A FIFO queue with a blocking pop and non-blocking push, used to hand
//! decoded multicast frames from a connection's read loop to whatever is
//! consuming them (the client session's `Receive` API).
//!
//! The reference implementation (`pkg/container/syncqueue.go`) is a
//! hand-rolled CAS linked list with a park/unpark wakeup. `tokio::sync::mpsc`
//! already gives an unbounded, multi-producer, single-consumer channel with
//! the same "producers never block" contract, so this is a thin named
//! wrapper rather than a reimplementation.

use tokio::sync::mpsc;

/// Producer handle. Cloneable; `push` never blocks or fails while any
/// receiver remains alive.
#[derive(Clone)]
pub struct QueueSender<T>(mpsc::UnboundedSender<T>);

/// Consumer handle. Not cloneable — one logical reader per queue, matching
/// the reference's single-consumer `Pop`.
pub struct QueueReceiver<T>(mpsc::UnboundedReceiver<T>);

/// Create a new unbounded FIFO queue.
pub fn sync_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender(tx), QueueReceiver(rx))
}

impl<T> QueueSender<T> {
    /// Enqueue a value. Fails only once every receiver has been dropped.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.0.send(value).map_err(|e| e.0)
    }
}

impl<T> QueueReceiver<T> {
    /// Block (async) until a value is available, or `None` once every
    /// sender has been dropped.
    pub async fn pop(&mut self) -> Option<T> {
        self.0.recv().await
    }
}
