// File:    bench.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Loopback benchmark: two OTP processors on one image, linked by a byte queue and worker.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use otpbox_core::backlog::MemoryBacklog;
use otpbox_core::framing::{AesPackage, Cluster};
use otpbox_core::key_agent::AesKeyAgent;
use otpbox_core::pipeline::{ByteQueue, Communicator, Sink, Worker};
use otpbox_core::{Config, DecodedPackage, Error, OtpProcessor, Result};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one benchmark run.
pub(crate) struct Report {
    sent: usize,
    received: usize,
    keyed: usize,
    bytes: usize,
    elapsed: Duration,
    out_clusters: u64,
    in_clusters: u64,
    keys_sent: u32,
    keys_received: u32,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.elapsed.as_millis().max(1);
        let rate = self.bytes as u128 * 1000 / millis / 1024;
        writeln!(f, "Packages sent:     {}", self.sent)?;
        writeln!(f, "Packages received: {}", self.received)?;
        writeln!(f, "With key:          {}", self.keyed)?;
        writeln!(f, "Keys sent/recv:    {}/{}", self.keys_sent, self.keys_received)?;
        writeln!(f, "Image clusters:    {} out, {} in", self.out_clusters, self.in_clusters)?;
        writeln!(f, "Elapsed:           {millis} ms")?;
        write!(f, "Throughput:        {rate} KiB/s")
    }
}

fn peer_config(config: &Config, name: &str) -> Arc<Config> {
    let mut peer = config.clone();
    peer.otp_position_path = config
        .otp_position_path
        .with_extension(format!("bench-{name}.json"));
    Arc::new(peer)
}

fn processor(
    config: Arc<Config>,
    clusters: Arc<dyn Sink<Cluster>>,
    packages: Arc<dyn Sink<DecodedPackage>>,
) -> Result<OtpProcessor> {
    let agent = Arc::new(AesKeyAgent::new(
        Arc::clone(&config),
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    ));
    let processor = OtpProcessor::new(config, agent, clusters, packages)?;
    processor.init_otp_outgoing()?;
    Ok(processor)
}

fn next_bundle(agent: &AesKeyAgent) -> Result<AesPackage> {
    if let Some(bundle) = agent.get_for_presend(1)?.pop() {
        return Ok(bundle);
    }
    agent.prepare_presend()?;
    agent.get_for_presend(1)?.pop().ok_or(Error::KeyExhaustion)
}

/// Sends `packages` data packages of `size` bytes from one processor to the other.
pub(crate) fn run(config: Config, packages: usize, size: usize, key_every: usize) -> Result<Report> {
    config.validate()?;
    let link = Arc::new(ByteQueue::new(config.otp_out_buffer_kb * 1024));
    let received: Arc<Mutex<Vec<DecodedPackage>>> = Arc::new(Mutex::new(Vec::new()));

    let receiver_sink: Arc<dyn Sink<Cluster>> = Arc::new(Mutex::new(Vec::<Cluster>::new()));
    let delivered: Arc<dyn Sink<DecodedPackage>> = received.clone();
    let receiver = processor(peer_config(&config, "b"), receiver_sink, delivered)?;

    let sender_sink: Arc<dyn Sink<Cluster>> = link.clone();
    let unused: Arc<dyn Sink<DecodedPackage>> = Arc::new(Mutex::new(Vec::<DecodedPackage>::new()));
    let sender = processor(peer_config(&config, "a"), sender_sink, unused)?;

    let target: Arc<dyn Communicator> = Arc::new(receiver.clone());
    let worker = Worker::spawn("otpbox-bench-link", Arc::clone(&link), target)?;

    info!("Sending {packages} packages of {size} bytes");
    let payload = vec![0xA5; size];
    let agent = Arc::clone(sender.key_agent());
    let start = Instant::now();
    let mut bytes = 0;
    for n in 0..packages {
        let id = if key_every > 0 && n % key_every == 0 {
            sender.process_encode(next_bundle(&agent)?)?;
            agent.get_for_crypto()?.0
        } else {
            n as u64
        };
        bytes += sender.process_encode(AesPackage::cr_data(id, &payload)?)?;
    }
    sender.shutdown()?;
    worker.join();

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while received.lock().map_or(0, |r| r.len()) < packages && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let elapsed = start.elapsed();
    let decoded = std::mem::take(&mut *received.lock().map_err(|_| Error::Closed)?);
    if decoded.len() < packages {
        warn!("Only {} of {packages} packages arrived", decoded.len());
    }
    debug!("Receiver buffers: {:?}", receiver.get_tunnel_buffers_usage());

    let report = Report {
        sent: packages,
        received: decoded.len(),
        keyed: decoded.iter().filter(|d| d.key.is_some()).count(),
        bytes,
        elapsed,
        out_clusters: sender.out_clusters_read(),
        in_clusters: receiver.in_clusters_read(),
        keys_sent: agent.out_keys_sent(),
        keys_received: receiver.key_agent().in_keys_received(),
    };
    receiver.shutdown()?;
    Ok(report)
}
