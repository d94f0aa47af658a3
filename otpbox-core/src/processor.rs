// File:    processor.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: OTP processor: combines AES packages with the shared image on the way out and reverses it on the way in.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! OTP processor.
//!
//! Encoding appends each AES package to the current network page, XOR-ed
//! with the pad bytes at the same offset of the current image cluster.
//! Decoding feeds received pages through the gap detector, removes the pad
//! in order, and reassembles the AES packages.
//!
//! Locks: `out` guards the encode cursor and is taken before `out_q`;
//! `inc` guards the decode cursor and is taken before `in_q`. The encode
//! path never takes `inc`.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, FramingError, Result};
use crate::framing::{
    AES_CR_HEADER_LEN, AesKind, AesPackage, CLUSTER_DATALEN, CLUSTER_SLOTS, Cluster,
    DecodeContext, Framed, MagicWord, MarkerKind, RawMessage, SendMethod, SequenceLimits,
    make_cluster_id_from_num, make_cluster_num_from_id,
};
use crate::gap_detector::{GapDetector, PageDelivery, SendPolicy};
use crate::image::{self, ImageCursor, OtpImage, PadCluster};
use crate::key_agent::AesKeyAgent;
use crate::keystore::KeyStore;
use crate::pipeline::{Communicator, SenderType, Sink};
use crate::position::{ImagePosition, load_position, save_position};
use crate::scheduler::Scheduler;
use crate::throughput::ThroughputMeter;

/// Ids of key packages may run this far ahead of the newest image cluster.
const SEQUENCE_LOOKAHEAD: u64 = 0x1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A data package recovered by decoding, with the key bound to its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPackage {
    /// The reassembled AES package.
    pub package: AesPackage,
    /// Key received for the package id, if any.
    pub key: Option<KeyStore>,
}

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing opened yet.
    Uninitialized,
    /// The image is open for encoding.
    OutgoingReady,
    /// The first cluster arrived and the decode side is positioned.
    IncomingReady,
    /// A key package has been decoded.
    Active,
    /// A fatal error occurred or shutdown began.
    ShuttingDown,
    /// Everything is flushed and closed.
    Closed,
}

impl SessionState {
    /// True while the session accepts traffic.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::OutgoingReady | Self::IncomingReady | Self::Active)
    }
}

/// Clusters keyed by id; a cluster pushed under an existing id is merged.
#[derive(Debug, Default)]
struct ClusterStock {
    clusters: BTreeMap<u64, Cluster>,
    bytes: usize,
    budget: usize,
}

impl ClusterStock {
    fn new(budget_kb: usize) -> Self {
        Self {
            budget: budget_kb * 1024,
            ..Self::default()
        }
    }

    fn push(&mut self, cluster: Cluster) -> Result<()> {
        let len = cluster.data_len();
        match self.clusters.get_mut(&cluster.id()) {
            Some(existing) => existing.merge(cluster)?,
            None => {
                self.clusters.insert(cluster.id(), cluster);
            }
        }
        self.bytes += len;
        Ok(())
    }

    fn take_all(&mut self) -> BTreeMap<u64, Cluster> {
        self.bytes = 0;
        std::mem::take(&mut self.clusters)
    }

    fn pending_id(&self) -> Option<u64> {
        self.clusters.keys().next().copied()
    }

    const fn usage(&self) -> (usize, usize) {
        (self.bytes, self.budget)
    }
}

/// One direction's walk over the image.
struct ImageSide {
    image: Option<OtpImage>,
    cursor: ImageCursor,
    head: Option<PadCluster>,
    position: usize,
    clusters_read: u64,
    magic: MagicWord,
}

impl ImageSide {
    const fn new() -> Self {
        Self {
            image: None,
            cursor: ImageCursor::new(1, 0),
            head: None,
            position: 0,
            clusters_read: 0,
            magic: MagicWord::new(0),
        }
    }

    fn attach(&mut self, image: OtpImage, ordinal: u64) {
        self.cursor = ImageCursor::new(image.size_in_clusters(), ordinal);
        self.image = Some(image);
        self.head = None;
        self.position = 0;
    }

    fn load_head(&mut self) -> Result<&PadCluster> {
        if self.head.is_none() {
            let image = self
                .image
                .as_mut()
                .ok_or(Error::InvalidState("OTP image not open"))?;
            let pad = image.read_cluster(self.cursor.file_index())?;
            self.clusters_read += 1;
            self.head = Some(pad);
        }
        self.head
            .as_ref()
            .ok_or(Error::InvalidState("OTP image not open"))
    }

    fn next_cluster(&mut self, direction: &str) {
        if self.cursor.advance() {
            warn!(
                "{direction} OTP image exhausted, reusing it from the first cluster (pass {})",
                self.cursor.rewinds()
            );
        }
        self.head = None;
        self.position = 0;
    }

    fn rewind(&mut self, direction: &str) {
        self.cursor.rewind();
        self.head = None;
        self.position = 0;
        warn!(
            "{direction} OTP image rewound to the first cluster (pass {})",
            self.cursor.rewinds()
        );
    }
}

struct OutgoingSide {
    side: ImageSide,
    slot: u64,
    page_timer: PageDelivery,
    policy: SendPolicy,
}

struct IncomingSide {
    side: ImageSide,
    carried: usize,
    first_cluster_id: u64,
    detector: GapDetector,
}

struct Shared {
    me: Weak<Shared>,
    config: Arc<Config>,
    key_agent: Arc<AesKeyAgent>,
    scheduler: Arc<Scheduler>,
    state: Mutex<SessionState>,
    failure: Mutex<Option<Error>>,
    out: Mutex<OutgoingSide>,
    out_q: Mutex<ClusterStock>,
    inc: Mutex<IncomingSide>,
    in_q: Mutex<ClusterStock>,
    out_ordinal: AtomicU64,
    cluster_sink: Arc<dyn Sink<Cluster>>,
    package_sink: Arc<dyn Sink<DecodedPackage>>,
    encode_meter: ThroughputMeter,
    decode_meter: ThroughputMeter,
}

/// OTP processor of one tunnel session.
///
/// Cloning yields another handle on the same session.
#[derive(Clone)]
pub struct OtpProcessor {
    shared: Arc<Shared>,
}

impl OtpProcessor {
    /// Processor sending encoded clusters to `cluster_sink` and decoded data to `package_sink`.
    pub fn new(
        config: Arc<Config>,
        key_agent: Arc<AesKeyAgent>,
        cluster_sink: Arc<dyn Sink<Cluster>>,
        package_sink: Arc<dyn Sink<DecodedPackage>>,
    ) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::start()?);
        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let mut detector = GapDetector::new(&config, Arc::clone(&scheduler));
            let owner = me.clone();
            detector.set_expiry_hook(Arc::new(move || {
                if let Some(shared) = owner.upgrade() {
                    shared.expire_gaps();
                }
            }));
            Shared {
                me: me.clone(),
                out: Mutex::new(OutgoingSide {
                    side: ImageSide::new(),
                    slot: 0,
                    page_timer: PageDelivery::new(
                        Arc::clone(&scheduler),
                        config.page_delivery_timelimit_ms,
                    ),
                    policy: SendPolicy::new(config.send_method),
                }),
                out_q: Mutex::new(ClusterStock::new(config.otp_out_buffer_kb)),
                inc: Mutex::new(IncomingSide {
                    side: ImageSide::new(),
                    carried: 0,
                    first_cluster_id: 0,
                    detector,
                }),
                in_q: Mutex::new(ClusterStock::new(config.otp_in_buffer_kb)),
                out_ordinal: AtomicU64::new(0),
                state: Mutex::new(SessionState::Uninitialized),
                failure: Mutex::new(None),
                scheduler,
                config,
                key_agent,
                cluster_sink,
                package_sink,
                encode_meter: ThroughputMeter::new(),
                decode_meter: ThroughputMeter::new(),
            }
        });
        Ok(Self { shared })
    }

    /// Creates a fresh image of `size_mb` MiB at the configured path.
    pub fn create_image(&self, size_mb: u32) -> Result<u64> {
        image::create_image(&self.shared.config.otp_image_path, size_mb)
    }

    /// Opens the image for encoding and restores the saved position.
    pub fn init_otp_outgoing(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if *state != SessionState::Uninitialized {
            return Err(Error::InvalidState("outgoing side already initialised"));
        }
        let image = OtpImage::open(&shared.config.otp_image_path)?;
        let clusters = image.size_in_clusters();
        let ordinal = match load_position(&shared.config.otp_position_path)? {
            Some(saved) if saved.image_clusters == clusters => saved.out_ordinal,
            Some(saved) => {
                warn!(
                    "Saved position refers to an image of {} clusters, this one has {clusters}; starting over",
                    saved.image_clusters
                );
                0
            }
            None => 0,
        };
        let mut out = lock(&shared.out);
        out.side.attach(image, ordinal);
        out.slot = 0;
        shared.out_ordinal.store(ordinal, Ordering::Relaxed);
        drop(out);
        self.create_out_magic(&KeyStore::from_password(&shared.config.aes_first_key_password));
        *state = SessionState::OutgoingReady;
        info!(
            "OTP image {} open for encoding at cluster {ordinal} of {clusters}",
            shared.config.otp_image_path.display()
        );
        Ok(())
    }

    /// Sets the magic word stamped on outgoing key packages, derived from `key`.
    pub fn create_out_magic(&self, key: &KeyStore) -> MagicWord {
        let magic = key.magic();
        lock(&self.shared.out).side.magic = magic;
        magic
    }

    /// Sets the magic word expected in incoming key packages, derived from `key`.
    pub fn create_in_magic(&self, key: &KeyStore) -> MagicWord {
        let magic = key.magic();
        lock(&self.shared.inc).side.magic = magic;
        magic
    }

    /// Loads the pad of the current image cluster of one side.
    pub fn read_otp_cluster(&self, decode: bool) -> Result<()> {
        if decode {
            lock(&self.shared.inc).side.load_head().map(|_| ())
        } else {
            lock(&self.shared.out).side.load_head().map(|_| ())
        }
    }

    /// Moves one side to the first cluster of the next pass over the image.
    pub fn rewind_otp(&self, decode: bool) {
        if decode {
            let mut inc = lock(&self.shared.inc);
            inc.side.rewind("Incoming");
            inc.carried = 0;
        } else {
            let mut out = lock(&self.shared.out);
            out.side.rewind("Outgoing");
            out.slot = 0;
            self.shared
                .out_ordinal
                .store(out.side.cursor.ordinal(), Ordering::Relaxed);
        }
    }

    /// Encodes one AES package and dispatches the pages it completes.
    ///
    /// Returns the number of package bytes encoded.
    pub fn process_encode(&self, package: AesPackage) -> Result<usize> {
        let shared = &self.shared;
        shared.require_running()?;
        let mut out = lock(&shared.out);
        let result = shared.encode(&mut out, package);
        drop(out);
        result.map_err(|e| shared.fail(e))
    }

    /// Decodes one received cluster.
    ///
    /// Clusters are released in sequence by the gap detector; every data
    /// package completed by them is delivered with its key. Returns the
    /// payload bytes decoded.
    pub fn process_decode(&self, cluster: Cluster) -> Result<usize> {
        let shared = &self.shared;
        shared.require_running()?;
        let mut inc = lock(&shared.inc);
        let result = shared.decode(&mut inc, cluster);
        drop(inc);
        result.map_err(|e| shared.fail(e))
    }

    /// Surfaces expired gap timers without waiting for the next cluster.
    pub fn poll_timers(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inc = lock(&shared.inc);
        let mut released = Vec::new();
        let result = inc.detector.check_expired(&mut released);
        drop(inc);
        result.map_err(|e| shared.fail(e))
    }

    /// Adds an encoded page to the outgoing stock, merging with a page of the same id.
    pub fn push_outgoing(&self, cluster: Cluster) -> Result<()> {
        lock(&self.shared.out_q).push(cluster)
    }

    /// Adds a decoded page to the reassembly stock, merging with a page of the same id.
    pub fn push_incoming(&self, cluster: Cluster) -> Result<()> {
        lock(&self.shared.in_q).push(cluster)
    }

    /// Reassembles every complete AES package from the reassembly stock into `out`.
    pub fn extract_wellformed_aes(&self, out: &mut Vec<AesPackage>) -> Result<()> {
        self.shared.extract_wellformed_aes(out)
    }

    /// Flushes the pending page, saves the image position, stops timers and the key agent.
    pub fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::ShuttingDown;
        }
        {
            let mut out = lock(&shared.out);
            if let Err(e) = shared.dispatch_pending(&mut out, true) {
                debug!("Pending page not flushed at shutdown: {e}");
            }
            out.page_timer.disarm();
        }
        lock(&shared.inc).detector.shutdown();
        shared.scheduler.shutdown();

        let mut out = lock(&shared.out);
        let mut inc = lock(&shared.inc);
        if let Some(image) = out.side.image.take() {
            let position = ImagePosition {
                out_ordinal: out.side.cursor.ordinal(),
                in_ordinal: inc.side.cursor.ordinal(),
                image_clusters: image.size_in_clusters(),
            };
            save_position(&shared.config.otp_position_path, &position)?;
            debug!("Saved image position {position:?}");
        }
        inc.side.image = None;
        drop(inc);
        drop(out);

        shared.key_agent.shutdown()?;
        *lock(&shared.state) = SessionState::Closed;
        info!("OTP session closed");
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Image cluster ordinal the encoder writes to next.
    #[must_use]
    pub fn get_out_clusters_position(&self) -> u64 {
        lock(&self.shared.out).side.cursor.ordinal()
    }

    /// Image cluster ordinal the decoder reads next.
    #[must_use]
    pub fn get_in_clusters_position(&self) -> u64 {
        lock(&self.shared.inc).side.cursor.ordinal()
    }

    /// Passes the encoder has made over the image.
    #[must_use]
    pub fn out_rewinds(&self) -> u64 {
        lock(&self.shared.out).side.cursor.rewinds()
    }

    /// Passes the decoder has made over the image.
    #[must_use]
    pub fn in_rewinds(&self) -> u64 {
        lock(&self.shared.inc).side.cursor.rewinds()
    }

    /// Image clusters read for encoding.
    #[must_use]
    pub fn out_clusters_read(&self) -> u64 {
        lock(&self.shared.out).side.clusters_read
    }

    /// Image clusters read for decoding.
    #[must_use]
    pub fn in_clusters_read(&self) -> u64 {
        lock(&self.shared.inc).side.clusters_read
    }

    /// Bytes held for decoding (reassembly and reorder buffers) and their budget.
    #[must_use]
    pub fn get_tunnel_buffers_usage(&self) -> (usize, usize) {
        let held = lock(&self.shared.inc).detector.reorder().buffered_bytes();
        let (used, budget) = lock(&self.shared.in_q).usage();
        (used + held, budget)
    }

    /// Bytes held in the outgoing page stock and its budget.
    #[must_use]
    pub fn get_otp_out_buffers_usage(&self) -> (usize, usize) {
        lock(&self.shared.out_q).usage()
    }

    /// Encoded bytes per second over the last window.
    #[must_use]
    pub fn encode_throughput(&self) -> u32 {
        self.shared.encode_meter.throughput()
    }

    /// Decoded bytes per second over the last window.
    #[must_use]
    pub fn decode_throughput(&self) -> u32 {
        self.shared.decode_meter.throughput()
    }

    /// The key agent serving this session.
    #[must_use]
    pub fn key_agent(&self) -> &Arc<AesKeyAgent> {
        &self.shared.key_agent
    }
}

impl Communicator for OtpProcessor {
    fn do_perform(&self, msg: RawMessage, from: SenderType) -> Result<usize> {
        match from {
            SenderType::AesModule | SenderType::Gateway => {
                let package = AesPackage::cast(msg.kind(), msg.into_bytes())?;
                self.process_encode(package)
            }
            SenderType::SslChannelOne | SenderType::SslChannelTwo => {
                if !msg.kind().is_cluster() {
                    return Err(FramingError::InvalidType(msg.kind().bits()).into());
                }
                let mut cluster = Cluster::cast(msg.into_bytes())?;
                cluster.set_send_method(if from == SenderType::SslChannelTwo {
                    SendMethod::ChannelTwo
                } else {
                    SendMethod::ChannelOne
                });
                self.process_decode(cluster)
            }
            SenderType::Invalid | SenderType::OtpModule => {
                Err(FramingError::InvalidType(msg.kind().bits()).into())
            }
        }
    }

    fn sender_type(&self) -> SenderType {
        SenderType::OtpModule
    }
}

impl Shared {
    fn require_running(&self) -> Result<()> {
        let state = *lock(&self.state);
        match state {
            SessionState::Uninitialized => Err(Error::InvalidState("OTP image not initialised")),
            SessionState::ShuttingDown | SessionState::Closed => {
                Err(lock(&self.failure).take().unwrap_or(Error::Closed))
            }
            _ => Ok(()),
        }
    }

    /// Fails the session from a timer; the next caller receives `e`.
    fn fail_later(&self, e: Error) {
        let e = self.fail(e);
        if e.is_fatal() {
            lock(&self.failure).get_or_insert(e);
        }
    }

    fn expire_gaps(&self) {
        if !lock(&self.state).is_running() {
            return;
        }
        let mut inc = lock(&self.inc);
        let mut released = Vec::new();
        let result = inc.detector.check_expired(&mut released);
        drop(inc);
        if let Err(e) = result {
            debug!("Discarding {} clusters released after the gap", released.len());
            self.fail_later(e);
        }
    }

    fn fail(&self, e: Error) -> Error {
        if e.is_fatal() {
            let mut state = lock(&self.state);
            if state.is_running() {
                error!("OTP session failed: {e}");
                *state = SessionState::ShuttingDown;
            }
        }
        e
    }

    fn encode(&self, out: &mut OutgoingSide, mut package: AesPackage) -> Result<usize> {
        if package.kind().is_key_material() {
            package.set_magic(out.side.magic)?;
        }
        if CLUSTER_DATALEN - out.side.position < AES_CR_HEADER_LEN {
            self.close_with_filler(out)?;
        }
        if package.kind() == AesKind::PreSend {
            let cluster_id = self
                .key_agent
                .assign_to_cluster(package.id(), out.side.cursor.ordinal())?;
            package.set_id(cluster_id)?;
        }
        let bytes = package.into_bytes();
        for page in Cluster::from_raw_aes(&bytes, out.side.position)? {
            self.place_page(out, page)?;
        }
        let pending = lock(&self.out_q).pending_id();
        if let Some(pending) = pending {
            if out.page_timer.is_immediate() {
                self.dispatch_pending(out, false)?;
            } else {
                let me = self.me.clone();
                out.page_timer.arm(pending, move || {
                    if let Some(shared) = me.upgrade() {
                        shared.flush_page(pending);
                    }
                });
            }
        }
        self.encode_meter.record(bytes.len());
        Ok(bytes.len())
    }

    fn close_with_filler(&self, out: &mut OutgoingSide) -> Result<()> {
        let room = CLUSTER_DATALEN - out.side.position;
        debug!("Closing image cluster {} with {room} filler bytes", out.side.cursor.ordinal());
        let mut filler = Cluster::new(0);
        filler.set_data(&vec![0; room]);
        filler.set_end_of_cluster(true);
        self.place_page(out, filler)
    }

    fn place_page(&self, out: &mut OutgoingSide, mut page: Cluster) -> Result<()> {
        let id = make_cluster_id_from_num(out.side.cursor.ordinal()) | out.slot;
        page.set_id(id);
        let offset = out.side.position;
        let pad = out.side.load_head()?;
        page.encode(pad, offset)?;
        out.side.position += page.data_len();
        if out.side.position == CLUSTER_DATALEN {
            page.set_end_of_cluster(true);
        }
        let closes = page.is_end_of_cluster();
        lock(&self.out_q).push(page)?;
        if closes {
            self.dispatch_pending(out, true)?;
        }
        Ok(())
    }

    fn dispatch_pending(&self, out: &mut OutgoingSide, close_image: bool) -> Result<()> {
        let pages = lock(&self.out_q).take_all();
        out.page_timer.disarm();
        for (_, mut page) in pages {
            if close_image || out.slot == CLUSTER_SLOTS - 1 {
                page.set_end_of_cluster(true);
            }
            page.set_send_method(out.policy.next_channel());
            let closes = page.is_end_of_cluster();
            debug!("Dispatching {page:?}");
            self.cluster_sink.deliver(page)?;
            if closes {
                out.side.next_cluster("Outgoing");
                out.slot = 0;
                self.out_ordinal
                    .store(out.side.cursor.ordinal(), Ordering::Relaxed);
            } else {
                out.slot += 1;
            }
        }
        Ok(())
    }

    fn flush_page(&self, page_id: u64) {
        let mut out = lock(&self.out);
        let pending = lock(&self.out_q).pending_id();
        if pending != Some(page_id) {
            return;
        }
        debug!("Page delivery time limit reached for {page_id:#x}");
        if let Err(e) = self.dispatch_pending(&mut out, true) {
            drop(out);
            self.fail_later(e);
        }
    }

    fn decode(&self, inc: &mut IncomingSide, cluster: Cluster) -> Result<usize> {
        if inc.side.image.is_none() {
            self.init_otp_incoming(inc, cluster.id())?;
        }
        let mut ready = Vec::new();
        if let Err(e) = inc.detector.check_expired(&mut ready) {
            debug!("Discarding {} clusters released after the gap", ready.len());
            return Err(e);
        }
        let position = inc.side.position;
        inc.detector.sequences_ctrl(cluster, &mut ready, position)?;

        let mut bytes = 0;
        for page in ready {
            bytes += page.data_len();
            self.decode_page(inc, page)?;
        }
        self.decode_meter.record(bytes);
        Ok(bytes)
    }

    fn init_otp_incoming(&self, inc: &mut IncomingSide, first_id: u64) -> Result<()> {
        let image = OtpImage::open(&self.config.otp_image_path)?;
        let ordinal = make_cluster_num_from_id(first_id);
        inc.side.attach(image, ordinal);
        inc.side.magic =
            KeyStore::from_password(&self.config.aes_first_key_password).magic();
        inc.first_cluster_id = make_cluster_id_from_num(ordinal);
        inc.carried = 0;
        inc.detector.start_at(inc.first_cluster_id);
        inc.detector.start_connection_watch();
        let mut state = lock(&self.state);
        if *state == SessionState::OutgoingReady {
            *state = SessionState::IncomingReady;
        }
        info!("Decoding from image cluster {ordinal}");
        Ok(())
    }

    fn sequence_limits(&self, inc: &IncomingSide) -> SequenceLimits {
        let newest = inc
            .side
            .cursor
            .ordinal()
            .max(self.out_ordinal.load(Ordering::Relaxed));
        SequenceLimits {
            low: inc.first_cluster_id,
            high: make_cluster_id_from_num(newest).saturating_add(SEQUENCE_LOOKAHEAD),
        }
    }

    fn decode_page(&self, inc: &mut IncomingSide, mut page: Cluster) -> Result<()> {
        let ordinal = make_cluster_num_from_id(page.id());
        if ordinal != inc.side.cursor.ordinal() {
            inc.side.cursor.seek(ordinal);
            inc.side.head = None;
            inc.side.position = 0;
        }
        let ctx = DecodeContext {
            magic: inc.side.magic,
            limits: self.sequence_limits(inc),
            carried: inc.carried,
        };
        let offset = inc.side.position;
        let pad = inc.side.load_head()?;
        page.decode(pad, offset, &ctx)?;
        inc.side.position += page.data_len();
        inc.carried = page.owed_bytes();
        if page.is_end_of_cluster() {
            inc.side.next_cluster("Incoming");
        }

        {
            let mut stock = lock(&self.in_q);
            stock.push(page)?;
            let (used, budget) = stock.usage();
            if used > budget {
                warn!("Reassembly stock holds {used} bytes, over its {budget} byte budget");
            }
        }
        if inc.carried == 0 {
            let mut packages = Vec::new();
            self.extract_wellformed_aes(&mut packages)?;
            self.route(inc, packages)?;
        }
        Ok(())
    }

    fn extract_wellformed_aes(&self, out: &mut Vec<AesPackage>) -> Result<()> {
        let clusters = lock(&self.in_q).take_all();
        let mut chain: Option<Cluster> = None;
        for cluster in clusters.into_values() {
            for (index, marker) in cluster.markers().iter().enumerate() {
                match marker.kind {
                    MarkerKind::Filler => {}
                    MarkerKind::Continuation => {
                        let acc = chain.as_mut().filter(|_| index == 0).ok_or_else(|| {
                            Error::DataIntegrity(format!(
                                "continuation in cluster {:#x} without a chain head",
                                cluster.id()
                            ))
                        })?;
                        acc.add_cluster(&cluster)?;
                        if acc.is_chain_complete()
                            && let Some(done) = chain.take()
                        {
                            out.push(finish_chain(&done)?);
                        }
                    }
                    kind if marker.complete => {
                        out.push(cast_region(&cluster, kind, marker.range.clone())?);
                    }
                    _ => {
                        if chain.is_some() {
                            return Err(Error::DataIntegrity(format!(
                                "cluster {:#x} opens a chain while another is open",
                                cluster.id()
                            )));
                        }
                        chain = Some(cluster.start_chain()?);
                    }
                }
            }
        }
        match chain {
            Some(open) => Err(Error::DataIntegrity(format!(
                "chain ending at {:#x} left incomplete",
                open.id()
            ))),
            None => Ok(()),
        }
    }

    fn route(&self, inc: &mut IncomingSide, packages: Vec<AesPackage>) -> Result<()> {
        let limits = self.sequence_limits(inc);
        for package in packages {
            if package.kind().is_key_material() {
                if !limits.admits(package.id()) {
                    return Err(FramingError::SequenceOutOfRange(package.id()).into());
                }
                self.key_agent.accept_incoming(&package)?;
                if !inc.detector.is_connected() {
                    inc.detector.connection_established();
                    let mut state = lock(&self.state);
                    if state.is_running() {
                        *state = SessionState::Active;
                    }
                }
                continue;
            }
            let key = self.key_agent.get_for_decrypto(package.id())?;
            if key.is_none() {
                debug!("No key bound to package {:#x}", package.id());
            }
            self.package_sink.deliver(DecodedPackage { package, key })?;
        }
        Ok(())
    }
}

fn finish_chain(acc: &Cluster) -> Result<AesPackage> {
    let kind = acc
        .markers()
        .first()
        .map_or(MarkerKind::CrData, |head| head.kind);
    cast_region(acc, kind, 0..acc.data_len())
}

fn cast_region(cluster: &Cluster, kind: MarkerKind, range: Range<usize>) -> Result<AesPackage> {
    let aes = kind
        .aes_kind()
        .ok_or_else(|| Error::DataIntegrity(format!("region of kind {kind:?} is not a package")))?;
    let bytes = cluster
        .data()
        .get(range)
        .ok_or_else(|| Error::DataIntegrity(format!("region outside cluster {:#x}", cluster.id())))?;
    Ok(AesPackage::cast(aes.package_type(), bytes.to_vec())?)
}
