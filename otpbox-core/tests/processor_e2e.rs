#![allow(missing_docs)]
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use otpbox_core::backlog::MemoryBacklog;
use otpbox_core::framing::{
    AesPackage, Cluster, Framed, PackageType, RawMessage, make_cluster_id_from_num,
};
use otpbox_core::image::create_image;
use otpbox_core::key_agent::AesKeyAgent;
use otpbox_core::keystore::KeyStore;
use otpbox_core::pipeline::{Communicator, SenderType, Sink};
use otpbox_core::{Config, DecodedPackage, Error, FramingError, OtpProcessor, SessionState};
use tempfile::tempdir;

struct Peer {
    processor: OtpProcessor,
    clusters: Arc<Mutex<Vec<Cluster>>>,
    packages: Arc<Mutex<Vec<DecodedPackage>>>,
}

impl Peer {
    fn new(dir: &Path, name: &str, page_limit_ms: u64) -> Self {
        Self::with_config(dir, name, |config| {
            config.page_delivery_timelimit_ms = page_limit_ms;
        })
    }

    fn with_config(dir: &Path, name: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config {
            otp_image_path: dir.join("image.otp"),
            otp_position_path: dir.join(format!("{name}.position")),
            backlog_dir: dir.join("backlog"),
            aes_presend_keys_num: 4,
            ..Config::default()
        };
        tweak(&mut config);
        let config = Arc::new(config);
        let agent = Arc::new(AesKeyAgent::new(
            Arc::clone(&config),
            Box::new(MemoryBacklog::new()),
            Box::new(MemoryBacklog::new()),
        ));
        let clusters = Arc::new(Mutex::new(Vec::new()));
        let packages = Arc::new(Mutex::new(Vec::new()));
        let cluster_sink: Arc<dyn Sink<Cluster>> = clusters.clone();
        let package_sink: Arc<dyn Sink<DecodedPackage>> = packages.clone();
        let processor =
            OtpProcessor::new(config, agent, cluster_sink, package_sink).expect("create processor");
        processor.init_otp_outgoing().expect("open image");
        Self {
            processor,
            clusters,
            packages,
        }
    }

    fn wait_for_clusters(&self, count: usize) -> Vec<Cluster> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while self.clusters.lock().expect("lock").len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        std::mem::take(&mut *self.clusters.lock().expect("lock"))
    }

    fn feed(&self, cluster: &Cluster) -> otpbox_core::Result<usize> {
        self.processor
            .do_perform(cluster.to_message(), SenderType::SslChannelOne)
    }

    fn decoded(&self) -> Vec<DecodedPackage> {
        std::mem::take(&mut *self.packages.lock().expect("lock"))
    }

    fn wait_for_state(&self, state: SessionState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while self.processor.state() != state {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

fn setup(page_limit_ms: u64) -> (tempfile::TempDir, Peer, Peer) {
    let dir = tempdir().expect("tempdir");
    create_image(&dir.path().join("image.otp"), 10).expect("create image");
    let a = Peer::new(dir.path(), "a", page_limit_ms);
    let b = Peer::new(dir.path(), "b", page_limit_ms);
    (dir, a, b)
}

#[test]
fn test_data_package_crosses_the_tunnel() {
    let (_dir, a, b) = setup(20);
    let data: Vec<u8> = (0..512).map(|i| (i % 256) as u8).collect();
    let package = AesPackage::cr_data(42, &data).expect("build package");
    assert_eq!(a.processor.process_encode(package).expect("encode"), 528);

    let clusters = a.wait_for_clusters(1);
    assert_eq!(clusters.len(), 1);
    assert!(clusters[0].is_encoded());
    assert!(clusters[0].is_end_of_cluster());
    assert_eq!(clusters[0].id(), make_cluster_id_from_num(0));
    assert_eq!(a.processor.get_out_clusters_position(), 1);

    assert_eq!(b.processor.get_in_clusters_position(), 0);
    b.feed(&clusters[0]).expect("decode");
    let decoded = b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].package.id(), 42);
    assert_eq!(decoded[0].package.data(), &data[..]);
    assert!(decoded[0].key.is_none());
    assert_eq!(b.processor.get_in_clusters_position(), 1);
    assert_eq!(b.processor.state(), SessionState::IncomingReady);
}

#[test]
fn test_presend_key_reaches_peer_with_data() {
    let (_dir, a, b) = setup(20);
    let agent = a.processor.key_agent();
    agent.prepare_presend().expect("prepare keys");
    let bundle = agent
        .get_for_presend(1)
        .expect("presend")
        .pop()
        .expect("one bundle");
    a.processor.process_encode(bundle).expect("encode bundle");
    let (cluster_id, key) = agent.get_for_crypto().expect("crypto key");
    assert_eq!(cluster_id, make_cluster_id_from_num(0));
    let package = AesPackage::cr_data(cluster_id, b"ciphered payload").expect("build package");
    a.processor.process_encode(package).expect("encode data");

    let clusters = a.wait_for_clusters(1);
    assert_eq!(clusters.len(), 1);
    b.feed(&clusters[0]).expect("decode");

    let decoded = b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].package.data(), b"ciphered payload");
    assert_eq!(decoded[0].key.as_ref(), Some(&key));
    assert_eq!(b.processor.state(), SessionState::Active);
    assert_eq!(b.processor.key_agent().in_keys_received(), 1);
}

#[test]
fn test_chained_package_out_of_order() {
    let (_dir, a, b) = setup(0);
    let data = vec![0x5A; 10_000];
    let package = AesPackage::cr_data(7, &data).expect("build package");
    a.processor.process_encode(package).expect("encode");

    let clusters = a.wait_for_clusters(3);
    assert_eq!(clusters.len(), 3);
    assert_eq!(clusters[2].id(), make_cluster_id_from_num(2));
    assert!(!clusters[2].is_end_of_cluster());

    b.feed(&clusters[0]).expect("first page");
    b.feed(&clusters[2]).expect("third page");
    assert!(b.decoded().is_empty());
    b.feed(&clusters[1]).expect("second page");

    let decoded = b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].package.data(), &data[..]);
    assert_eq!(b.processor.get_in_clusters_position(), 2);
}

#[test]
fn test_short_tail_is_closed_with_filler() {
    let (_dir, a, b) = setup(0);
    // 12-byte header plus 4078 aligned bytes leaves six bytes in the image cluster.
    let first = AesPackage::cr_data(1, &[1; 4077]).expect("build package");
    assert_eq!(first.as_bytes().len(), 4090);
    a.processor.process_encode(first).expect("encode first");
    let second = AesPackage::cr_data(2, &[2; 100]).expect("build package");
    a.processor.process_encode(second).expect("encode second");

    let clusters = a.wait_for_clusters(3);
    assert_eq!(clusters.len(), 3);
    assert_eq!(clusters[1].data_len(), 6);
    assert!(clusters[1].is_end_of_cluster());
    assert_eq!(clusters[2].id(), make_cluster_id_from_num(1));

    for cluster in &clusters {
        b.feed(cluster).expect("decode");
    }
    let ids: Vec<u64> = b.decoded().iter().map(|d| d.package.id()).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_ssl_channel_rejects_non_cluster_messages() {
    let (_dir, _a, b) = setup(20);
    let msg = RawMessage::new(PackageType::CR_DATA, vec![0; 32]);
    assert!(matches!(
        b.processor.do_perform(msg, SenderType::SslChannelTwo),
        Err(Error::Framing(FramingError::InvalidType(5)))
    ));
    assert_eq!(b.processor.state(), SessionState::OutgoingReady);
}

#[test]
fn test_position_survives_restart() {
    let dir = tempdir().expect("tempdir");
    create_image(&dir.path().join("image.otp"), 10).expect("create image");
    let a = Peer::new(dir.path(), "a", 0);
    for id in 0..3 {
        let package = AesPackage::cr_data(id, &[0; 4000]).expect("build package");
        a.processor.process_encode(package).expect("encode");
    }
    a.wait_for_clusters(3);
    let position = a.processor.get_out_clusters_position();
    assert!(position >= 2);
    a.processor.shutdown().expect("shutdown");
    assert_eq!(a.processor.state(), SessionState::Closed);
    assert!(matches!(
        a.processor.process_encode(AesPackage::cr_data(9, &[0; 8]).expect("build package")),
        Err(Error::Closed)
    ));

    let restarted = Peer::new(dir.path(), "a", 0);
    assert_eq!(restarted.processor.get_out_clusters_position(), position);
}

#[test]
fn test_encode_before_init_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let config = Arc::new(Config {
        otp_image_path: dir.path().join("missing.otp"),
        ..Config::default()
    });
    let agent = Arc::new(AesKeyAgent::new(
        Arc::clone(&config),
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    ));
    let clusters: Arc<dyn Sink<Cluster>> = Arc::new(Mutex::new(Vec::<Cluster>::new()));
    let packages: Arc<dyn Sink<DecodedPackage>> =
        Arc::new(Mutex::new(Vec::<DecodedPackage>::new()));
    let processor = OtpProcessor::new(config, agent, clusters, packages).expect("create processor");
    assert!(matches!(
        processor.process_encode(AesPackage::cr_data(1, &[0; 8]).expect("build package")),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(processor.init_otp_outgoing(), Err(Error::ImageIo(_))));
}

#[test]
fn test_rewound_encoder_is_followed_by_decoder() {
    let (_dir, a, b) = setup(20);
    a.processor.read_otp_cluster(false).expect("load pad");
    a.processor.read_otp_cluster(false).expect("cached pad");
    assert_eq!(a.processor.out_clusters_read(), 1);
    assert!(matches!(
        b.processor.read_otp_cluster(true),
        Err(Error::InvalidState(_))
    ));

    // 10 MiB hold 2560 image clusters.
    a.processor.rewind_otp(false);
    assert_eq!(a.processor.out_rewinds(), 1);
    assert_eq!(a.processor.get_out_clusters_position(), 2560);

    let data = vec![0x5A; 100];
    a.processor
        .process_encode(AesPackage::cr_data(7, &data).expect("build package"))
        .expect("encode");
    let clusters = a.wait_for_clusters(1);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].id(), make_cluster_id_from_num(2560));
    assert_eq!(a.processor.out_clusters_read(), 2);

    b.feed(&clusters[0]).expect("decode");
    let decoded = b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].package.data(), &data[..]);
    assert_eq!(b.processor.in_rewinds(), 1);
    assert_eq!(b.processor.in_clusters_read(), 1);
    assert_eq!(b.processor.encode_throughput(), 0);
    assert_eq!(b.processor.decode_throughput(), 0);
}

#[test]
fn test_stocks_merge_and_report_usage() {
    let (_dir, a, _b) = setup(20);
    let id = make_cluster_id_from_num(9);
    for len in [10, 20] {
        let mut page = Cluster::new(id);
        page.set_data(&vec![1; len]);
        a.processor.push_outgoing(page).expect("push outgoing");
    }
    assert_eq!(a.processor.get_otp_out_buffers_usage(), (30, 0));

    let mut page = Cluster::new(id);
    page.set_data(&[2; 40]);
    a.processor.push_incoming(page).expect("push incoming");
    assert_eq!(a.processor.get_tunnel_buffers_usage(), (40, 5120 * 1024));
    a.processor.poll_timers().expect("no timers due");
}

#[test]
fn test_rebound_magic_still_recognises_keys() {
    let (_dir, a, b) = setup(20);
    let opening = AesPackage::cr_data(1, &[9; 100]).expect("build package");
    a.processor.process_encode(opening).expect("encode");
    let clusters = a.wait_for_clusters(1);
    b.feed(&clusters[0]).expect("decode");
    assert_eq!(b.decoded().len(), 1);

    let session = KeyStore::from_password("second session");
    assert_eq!(
        a.processor.create_out_magic(&session),
        b.processor.create_in_magic(&session)
    );

    let agent = a.processor.key_agent();
    agent.prepare_presend().expect("prepare keys");
    let bundle = agent
        .get_for_presend(1)
        .expect("presend")
        .pop()
        .expect("one bundle");
    a.processor.process_encode(bundle).expect("encode bundle");
    let (cluster_id, key) = agent.get_for_crypto().expect("crypto key");
    assert_eq!(cluster_id, make_cluster_id_from_num(1));
    let package = AesPackage::cr_data(cluster_id, b"after rebinding").expect("build package");
    a.processor.process_encode(package).expect("encode data");

    let clusters = a.wait_for_clusters(1);
    assert_eq!(clusters.len(), 1);
    b.feed(&clusters[0]).expect("decode");
    let decoded = b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].key.as_ref(), Some(&key));
    assert_eq!(b.processor.state(), SessionState::Active);
}

#[test]
fn test_immediate_pages_do_not_block_encode() {
    let (_dir, a, _b) = setup(0);
    let processor = a.processor.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let package = AesPackage::cr_data(5, &[3; 64]).expect("build package");
        let _ = tx.send(processor.process_encode(package).map_err(|e| e.to_string()));
    });
    let encoded = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("encode returned");
    assert_eq!(encoded, Ok(80));
    let clusters = a.wait_for_clusters(1);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].id(), make_cluster_id_from_num(0));
}

#[test]
fn test_second_slot_arriving_first_is_held() {
    let (_dir, a, b) = setup(0);
    for id in [1, 2] {
        let package = AesPackage::cr_data(id, &[id as u8; 100]).expect("build package");
        a.processor.process_encode(package).expect("encode");
    }
    let clusters = a.wait_for_clusters(2);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].id(), 0x8000_0000_0000_0000);
    assert_eq!(clusters[1].id(), 0x8000_0000_0000_0001);

    b.feed(&clusters[1]).expect("held page");
    assert!(b.decoded().is_empty());
    b.feed(&clusters[0]).expect("first page");

    let ids: Vec<u64> = b.decoded().iter().map(|d| d.package.id()).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(b.processor.state().is_running());
}

#[test]
fn test_each_presend_key_gets_its_own_slot() {
    let (_dir, a, b) = setup(0);
    let agent = a.processor.key_agent();
    agent.prepare_presend().expect("prepare keys");
    let mut bound = Vec::new();
    for payload in [&b"first"[..], &b"second"[..]] {
        let bundle = agent
            .get_for_presend(1)
            .expect("presend")
            .pop()
            .expect("one bundle");
        a.processor.process_encode(bundle).expect("encode bundle");
        let (cluster_id, key) = agent.get_for_crypto().expect("crypto key");
        let package = AesPackage::cr_data(cluster_id, payload).expect("build package");
        a.processor.process_encode(package).expect("encode data");
        bound.push((cluster_id, key));
    }
    assert_ne!(bound[0].0, bound[1].0);
    assert_ne!(bound[0].1, bound[1].1);

    let clusters = a.wait_for_clusters(4);
    assert_eq!(clusters.len(), 4);
    for cluster in &clusters {
        b.feed(cluster).expect("decode");
    }
    let decoded = b.decoded();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].package.data(), b"first");
    assert_eq!(decoded[0].key.as_ref(), Some(&bound[0].1));
    assert_eq!(decoded[1].package.data(), b"second");
    assert_eq!(decoded[1].key.as_ref(), Some(&bound[1].1));
}

#[test]
fn test_connection_gap_fails_session_without_traffic() {
    let dir = tempdir().expect("tempdir");
    create_image(&dir.path().join("image.otp"), 10).expect("create image");
    let a = Peer::new(dir.path(), "a", 0);
    let b = Peer::with_config(dir.path(), "b", |config| {
        config.connection_gap_timelimit_ms = 50;
    });
    for id in [1, 2] {
        let package = AesPackage::cr_data(id, &[1; 32]).expect("build package");
        a.processor.process_encode(package).expect("encode");
    }
    let clusters = a.wait_for_clusters(2);
    assert_eq!(clusters.len(), 2);
    b.feed(&clusters[0]).expect("decode");
    assert_eq!(b.decoded().len(), 1);

    assert!(b.wait_for_state(SessionState::ShuttingDown));
    assert!(matches!(
        b.feed(&clusters[1]),
        Err(Error::ConnectionGap { waited_ms: 50 })
    ));
    assert!(matches!(b.feed(&clusters[1]), Err(Error::Closed)));
    assert!(b.decoded().is_empty());
}

#[test]
fn test_sequence_gap_fails_session_without_traffic() {
    let dir = tempdir().expect("tempdir");
    create_image(&dir.path().join("image.otp"), 10).expect("create image");
    let a = Peer::new(dir.path(), "a", 0);
    let b = Peer::with_config(dir.path(), "b", |config| {
        config.gap_expiration_limit_ms = 50;
    });
    for id in 1..=3 {
        let package = AesPackage::cr_data(id, &[id as u8; 100]).expect("build package");
        a.processor.process_encode(package).expect("encode");
    }
    let clusters = a.wait_for_clusters(3);
    assert_eq!(clusters.len(), 3);

    b.feed(&clusters[0]).expect("first page");
    b.feed(&clusters[2]).expect("held page");
    assert_eq!(b.decoded().len(), 1);

    assert!(b.wait_for_state(SessionState::ShuttingDown));
    let lost = clusters[1].id();
    assert!(matches!(
        b.feed(&clusters[1]),
        Err(Error::SequenceGap { cluster_id }) if cluster_id == lost
    ));
}
