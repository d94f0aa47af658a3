// File:    pipeline.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Module seams: the communicator trait, delivery sinks, a byte-budgeted queue and its draining worker.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Plumbing between modules.
//!
//! Each module exposes [`Communicator::do_perform`]. Producers hand results
//! to a [`Sink`]; a [`ByteQueue`] is a sink with a byte budget whose
//! [`Worker`] drains it into the next module on its own thread.

use std::collections::VecDeque;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::framing::{Cluster, Framed, RawMessage, SendMethod};

/// Where a message entering a module comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderType {
    /// Unknown origin.
    Invalid,
    /// First SSL channel.
    SslChannelOne,
    /// Second SSL channel.
    SslChannelTwo,
    /// Local gateway.
    Gateway,
    /// AES key exchange module.
    AesModule,
    /// OTP processor.
    OtpModule,
}

impl SenderType {
    /// SSL channel a cluster should travel on.
    #[must_use]
    pub const fn from_send_method(method: SendMethod) -> Self {
        match method {
            SendMethod::ChannelTwo => Self::SslChannelTwo,
            _ => Self::SslChannelOne,
        }
    }
}

/// A module that accepts typed messages.
pub trait Communicator: Send + Sync {
    /// Processes one message from `from`; returns the bytes consumed.
    fn do_perform(&self, msg: RawMessage, from: SenderType) -> Result<usize>;

    /// Identity of this module as a message origin.
    fn sender_type(&self) -> SenderType;
}

/// Receives items produced by a module.
pub trait Sink<T>: Send + Sync {
    /// Takes one item, blocking while the consumer is saturated.
    fn deliver(&self, item: T) -> Result<()>;
}

impl<T: Send> Sink<T> for Mutex<Vec<T>> {
    fn deliver(&self, item: T) -> Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        Ok(())
    }
}

impl<T: Send> Sink<T> for SyncSender<T> {
    fn deliver(&self, item: T) -> Result<()> {
        self.send(item).map_err(|_| Error::Closed)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<(RawMessage, SenderType)>,
    usage: usize,
    closed: bool,
}

/// FIFO of messages bounded by their total byte size.
///
/// A budget of zero admits one message at a time.
#[derive(Debug)]
pub struct ByteQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
    budget: usize,
}

impl ByteQueue {
    /// Empty queue holding up to `budget` bytes.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            budget,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, state: &QueueState, len: usize) -> bool {
        state.messages.is_empty() || state.usage + len <= self.budget
    }

    /// Blocks until `len` more bytes fit. Returns false once the queue is closed.
    pub fn wait_ready_to_write(&self, len: usize) -> bool {
        let mut state = self.lock();
        while !state.closed && !self.fits(&state, len) {
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.closed
    }

    /// Appends a message, blocking while the budget is exhausted.
    pub fn enqueue(&self, msg: RawMessage, from: SenderType) -> Result<()> {
        let len = msg.len();
        let mut state = self.lock();
        while !state.closed && !self.fits(&state, len) {
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(Error::Closed);
        }
        state.usage += len;
        state.messages.push_back((msg, from));
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Removes the oldest message, blocking while empty. `None` once closed and drained.
    pub fn pop(&self) -> Option<(RawMessage, SenderType)> {
        let mut state = self.lock();
        loop {
            if let Some((msg, from)) = state.messages.pop_front() {
                state.usage -= msg.len();
                drop(state);
                self.writable.notify_all();
                return Some((msg, from));
            }
            if state.closed {
                return None;
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Rejects further writes and wakes every waiter; queued messages can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// True once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes queued and the budget.
    #[must_use]
    pub fn usage(&self) -> (usize, usize) {
        (self.lock().usage, self.budget)
    }

    /// Messages queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink<Cluster> for ByteQueue {
    fn deliver(&self, cluster: Cluster) -> Result<()> {
        let from = SenderType::from_send_method(cluster.send_method());
        let msg = RawMessage::new(cluster.package_type(), cluster.as_bytes().to_vec())
            .with_send_method(cluster.send_method());
        self.enqueue(msg, from)
    }
}

/// Thread draining a [`ByteQueue`] into a [`Communicator`].
///
/// Dropping the worker closes the queue and joins the thread.
pub struct Worker {
    queue: Arc<ByteQueue>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a thread named `name` that feeds every queued message to `target`.
    ///
    /// A fatal error from `target` closes the queue and stops the worker.
    pub fn spawn(
        name: &str,
        queue: Arc<ByteQueue>,
        target: Arc<dyn Communicator>,
    ) -> std::io::Result<Self> {
        let thread_queue = Arc::clone(&queue);
        let thread_name = name.to_owned();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some((msg, from)) = thread_queue.pop() {
                    match target.do_perform(msg, from) {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!("{thread_name}: {e}");
                            thread_queue.close();
                        }
                        Err(e) => debug!("{thread_name}: {e}"),
                    }
                }
                debug!("{thread_name}: drained");
            })?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// The queue this worker drains.
    #[must_use]
    pub const fn queue(&self) -> &Arc<ByteQueue> {
        &self.queue
    }

    /// Closes the queue, lets the worker drain it, and joins the thread.
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Pipeline worker panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
