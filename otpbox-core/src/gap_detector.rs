// File:    gap_detector.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: In-order cluster delivery, sequence and connection gap timers, page delivery timing and channel selection.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Gap detection.
//!
//! Clusters may arrive out of order over the two channels. The
//! [`ReorderBuffer`] holds early arrivals until the missing cluster shows up;
//! [`GapTimers`] bounds how long that may take. [`GapDetector`] composes the
//! two for the decode side. [`PageDelivery`] and [`SendPolicy`] serve the
//! encode side.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use log::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::framing::{Cluster, Framed, SendMethod, successor_id};
use crate::scheduler::{Scheduler, TaskHandle};

/// Timer expiries posted to the gap detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    /// The cluster with this id did not arrive in time.
    SequenceGapExpired(u64),
    /// No key package arrived in time.
    ConnectionTimeout,
}

/// Holds clusters that arrived ahead of the expected one.
#[derive(Debug)]
pub struct ReorderBuffer {
    expected: Option<u64>,
    pending: BTreeMap<u64, Cluster>,
    buffered_bytes: usize,
    budget_bytes: usize,
}

impl ReorderBuffer {
    /// Empty buffer with a budget of `budget_kb` KiB.
    #[must_use]
    pub const fn new(budget_kb: usize) -> Self {
        Self {
            expected: None,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
            budget_bytes: budget_kb * 1024,
        }
    }

    /// Id of the next cluster to deliver.
    #[must_use]
    pub const fn expected(&self) -> Option<u64> {
        self.expected
    }

    /// Id of the cluster holding back delivery, if any.
    #[must_use]
    pub fn missing(&self) -> Option<u64> {
        if self.pending.is_empty() {
            None
        } else {
            self.expected
        }
    }

    /// Number of clusters held back.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes held back.
    #[must_use]
    pub const fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Budget in bytes.
    #[must_use]
    pub const fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Makes `id` the first cluster to deliver unless the sequence already started.
    pub fn start_at(&mut self, id: u64) {
        self.expected.get_or_insert(id);
    }

    /// Accepts `cluster` and appends every cluster now in order to `out`.
    ///
    /// Without [`start_at`](Self::start_at), the first cluster ever pushed
    /// defines the start of the sequence. Clusters below the watermark and
    /// duplicates are dropped. An early cluster that does not fit the budget
    /// is rejected.
    pub fn push(&mut self, cluster: Cluster, out: &mut Vec<Cluster>) -> Result<()> {
        let id = cluster.id();
        let expected = *self.expected.get_or_insert(id);
        if id < expected || self.pending.contains_key(&id) {
            debug!("Dropped stale or duplicate cluster {id:#x}");
            return Ok(());
        }
        let held = self.buffered_bytes + cluster.data_len();
        if id != expected && held > self.budget_bytes {
            return Err(Error::ReorderOverflow {
                held,
                budget: self.budget_bytes,
            });
        }
        self.buffered_bytes = held;
        self.pending.insert(id, cluster);
        self.drain(out);
        Ok(())
    }

    /// Gives up on `lost`: moves the watermark to the next buffered cluster and drains.
    pub fn release_past(&mut self, lost: u64, out: &mut Vec<Cluster>) {
        if self.expected != Some(lost) {
            return;
        }
        self.expected = Some(
            self.pending
                .keys()
                .next()
                .copied()
                .unwrap_or_else(|| lost.wrapping_add(1)),
        );
        self.drain(out);
    }

    fn drain(&mut self, out: &mut Vec<Cluster>) {
        while let Some(expected) = self.expected {
            let Some(cluster) = self.pending.remove(&expected) else {
                break;
            };
            self.buffered_bytes -= cluster.data_len();
            self.expected = Some(successor_id(expected, cluster.is_end_of_cluster()));
            out.push(cluster);
        }
    }
}

/// Callback run on the scheduler thread after a gap event was posted.
pub type ExpiryHook = Arc<dyn Fn() + Send + Sync>;

/// Timer side of the gap detector.
///
/// Timers run on the shared [`Scheduler`] and post [`GapEvent`]s back over a
/// channel; the owner collects them with [`GapTimers::poll`]. An optional
/// [`ExpiryHook`] lets the owner react without waiting for the next poll.
pub struct GapTimers {
    scheduler: Arc<Scheduler>,
    events_tx: Sender<GapEvent>,
    events_rx: Receiver<GapEvent>,
    on_expiry: Option<ExpiryHook>,
    sequence: BTreeMap<u64, TaskHandle>,
    connection: Option<TaskHandle>,
    gap_limit: Duration,
    connection_limit: Duration,
}

impl GapTimers {
    /// Timers with the limits of `config`.
    #[must_use]
    pub fn new(config: &Config, scheduler: Arc<Scheduler>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            scheduler,
            events_tx,
            events_rx,
            on_expiry: None,
            sequence: BTreeMap::new(),
            connection: None,
            gap_limit: Duration::from_millis(config.gap_expiration_limit_ms),
            connection_limit: Duration::from_millis(config.connection_gap_timelimit_ms),
        }
    }

    /// Runs `hook` after every posted event.
    pub fn set_expiry_hook(&mut self, hook: ExpiryHook) {
        self.on_expiry = Some(hook);
    }

    /// Starts the expiry timer for missing cluster `id` unless one runs already.
    pub fn arm_sequence(&mut self, id: u64) {
        if self.sequence.contains_key(&id) {
            return;
        }
        let task = poster(
            self.events_tx.clone(),
            self.on_expiry.clone(),
            GapEvent::SequenceGapExpired(id),
        );
        let handle = self.scheduler.schedule(task, self.gap_limit, None);
        self.sequence.insert(id, handle);
    }

    /// Cancels the timers of every id below `watermark`.
    pub fn disarm_below(&mut self, watermark: u64) {
        let keep = self.sequence.split_off(&watermark);
        for handle in std::mem::replace(&mut self.sequence, keep).into_values() {
            handle.cancel();
        }
    }

    /// Number of running sequence timers.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.sequence.len()
    }

    /// Starts the connection timer.
    pub fn arm_connection(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let task = poster(
            self.events_tx.clone(),
            self.on_expiry.clone(),
            GapEvent::ConnectionTimeout,
        );
        self.connection = Some(self.scheduler.schedule(task, self.connection_limit, None));
    }

    /// Cancels the connection timer.
    pub fn disarm_connection(&mut self) {
        if let Some(handle) = self.connection.take() {
            handle.cancel();
        }
    }

    /// Events posted since the last poll.
    pub fn poll(&self) -> Vec<GapEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Cancels every timer.
    pub fn cancel_all(&mut self) {
        self.disarm_connection();
        for handle in std::mem::take(&mut self.sequence).into_values() {
            handle.cancel();
        }
    }

    const fn connection_limit_ms(&self) -> u64 {
        self.connection_limit.as_millis() as u64
    }
}

fn poster(
    tx: Sender<GapEvent>,
    hook: Option<ExpiryHook>,
    event: GapEvent,
) -> impl FnMut() + Send + 'static {
    move || {
        if tx.send(event).is_ok()
            && let Some(hook) = &hook
        {
            hook();
        }
    }
}

/// Decode-side gap detector: reorder buffer plus its timers.
pub struct GapDetector {
    reorder: ReorderBuffer,
    timers: GapTimers,
    connected: bool,
}

impl GapDetector {
    /// Detector configured from `config`, timing through `scheduler`.
    #[must_use]
    pub fn new(config: &Config, scheduler: Arc<Scheduler>) -> Self {
        Self {
            reorder: ReorderBuffer::new(config.seq_gap_buffer_kb),
            timers: GapTimers::new(config, scheduler),
            connected: false,
        }
    }

    /// Runs `hook` on the scheduler thread whenever a gap timer expires.
    pub fn set_expiry_hook(&mut self, hook: ExpiryHook) {
        self.timers.set_expiry_hook(hook);
    }

    /// Makes `id` the first cluster to deliver.
    pub fn start_at(&mut self, id: u64) {
        self.reorder.start_at(id);
    }

    /// Feeds one received cluster; appends every cluster now in order to `out`.
    ///
    /// `head_position` is the decoder's offset inside its current image
    /// cluster. Returns true when clusters became deliverable.
    pub fn sequences_ctrl(
        &mut self,
        cluster: Cluster,
        out: &mut Vec<Cluster>,
        head_position: usize,
    ) -> Result<bool> {
        let before = out.len();
        self.reorder.push(cluster, out)?;
        if let Some(expected) = self.reorder.expected() {
            self.timers.disarm_below(expected);
        }
        if let Some(missing) = self.reorder.missing() {
            if self.timers.armed() == 0 {
                info!(
                    "Sequence gap at cluster {missing:#x} (decoder at offset {head_position}), {} clusters held",
                    self.reorder.buffered()
                );
            }
            self.timers.arm_sequence(missing);
        }
        Ok(out.len() > before)
    }

    /// Applies expired timers.
    ///
    /// On a sequence gap expiry the lost cluster is skipped, buffered
    /// clusters are released into `out`, and the gap is reported as an error.
    pub fn check_expired(&mut self, out: &mut Vec<Cluster>) -> Result<()> {
        for event in self.timers.poll() {
            match event {
                GapEvent::SequenceGapExpired(id) if self.reorder.missing() == Some(id) => {
                    error!("Cluster {id:#x} lost, sequence gap expired");
                    self.reorder.release_past(id, out);
                    if let Some(expected) = self.reorder.expected() {
                        self.timers.disarm_below(expected);
                    }
                    return Err(Error::SequenceGap { cluster_id: id });
                }
                GapEvent::ConnectionTimeout if !self.connected => {
                    error!("No key package received, connection gap expired");
                    return Err(Error::ConnectionGap {
                        waited_ms: self.timers.connection_limit_ms(),
                    });
                }
                stale => debug!("Ignored stale gap event {stale:?}"),
            }
        }
        Ok(())
    }

    /// Starts waiting for the first key package.
    pub fn start_connection_watch(&mut self) {
        if !self.connected {
            self.timers.arm_connection();
        }
    }

    /// Records that a key package arrived.
    pub fn connection_established(&mut self) {
        if !self.connected {
            debug!("First key package received");
        }
        self.connected = true;
        self.timers.disarm_connection();
    }

    /// True once a key package has been seen.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// The reorder buffer.
    #[must_use]
    pub const fn reorder(&self) -> &ReorderBuffer {
        &self.reorder
    }

    /// Cancels every timer.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
    }
}

/// Encode-side page timer: bounds how long a partial page waits for more data.
pub struct PageDelivery {
    scheduler: Arc<Scheduler>,
    limit: Duration,
    armed: Option<(u64, TaskHandle)>,
}

impl PageDelivery {
    /// Page timer with `limit_ms`; zero means every page is sent at once.
    #[must_use]
    pub const fn new(scheduler: Arc<Scheduler>, limit_ms: u64) -> Self {
        Self {
            scheduler,
            limit: Duration::from_millis(limit_ms),
            armed: None,
        }
    }

    /// True when pages are never held back.
    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        self.limit.is_zero()
    }

    /// Runs `on_due` once the page `page_id` has waited the limit.
    ///
    /// A timer already running for the same page is kept.
    pub fn arm<F>(&mut self, page_id: u64, on_due: F)
    where
        F: FnMut() + Send + 'static,
    {
        if matches!(self.armed, Some((id, _)) if id == page_id) {
            return;
        }
        self.disarm();
        let handle = self.scheduler.schedule(on_due, self.limit, None);
        self.armed = Some((page_id, handle));
    }

    /// Cancels the running timer.
    pub fn disarm(&mut self) {
        if let Some((_, handle)) = self.armed.take() {
            handle.cancel();
        }
    }

    /// Page the timer runs for.
    #[must_use]
    pub fn armed_for(&self) -> Option<u64> {
        self.armed.as_ref().map(|(id, _)| *id)
    }
}

/// Picks the channel of each outgoing cluster.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    method: SendMethod,
    toggle: bool,
}

impl SendPolicy {
    /// Policy following `method`.
    #[must_use]
    pub const fn new(method: SendMethod) -> Self {
        Self {
            method,
            toggle: false,
        }
    }

    /// Channel for the next cluster: always `ChannelOne` or `ChannelTwo`.
    pub fn next_channel(&mut self) -> SendMethod {
        match self.method {
            SendMethod::ChannelOne => SendMethod::ChannelOne,
            SendMethod::ChannelTwo => SendMethod::ChannelTwo,
            SendMethod::Random => {
                if rand::random::<bool>() {
                    SendMethod::ChannelOne
                } else {
                    SendMethod::ChannelTwo
                }
            }
            SendMethod::Different => {
                self.toggle = !self.toggle;
                if self.toggle {
                    SendMethod::ChannelOne
                } else {
                    SendMethod::ChannelTwo
                }
            }
        }
    }
}
