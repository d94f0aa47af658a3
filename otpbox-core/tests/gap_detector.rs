#![allow(missing_docs)]
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use otpbox_core::framing::{Cluster, SendMethod, make_cluster_id_from_num};
use otpbox_core::gap_detector::{GapDetector, PageDelivery, ReorderBuffer, SendPolicy};
use otpbox_core::scheduler::Scheduler;
use otpbox_core::throughput::ThroughputMeter;
use otpbox_core::{Config, Error};

fn page(id: u64) -> Cluster {
    let mut cluster = Cluster::new(id);
    cluster.set_data(&[0; 16]);
    cluster
}

fn ids(clusters: &[Cluster]) -> Vec<u64> {
    clusters.iter().map(Cluster::id).collect()
}

#[test]
fn test_reorder_releases_in_sequence() {
    let mut buffer = ReorderBuffer::new(64);
    let mut out = Vec::new();
    buffer.push(page(1), &mut out).expect("push");
    buffer.push(page(3), &mut out).expect("push");
    assert_eq!(ids(&out), vec![1]);
    assert_eq!(buffer.missing(), Some(2));
    assert_eq!(buffer.buffered(), 1);

    buffer.push(page(2), &mut out).expect("push");
    assert_eq!(ids(&out), vec![1, 2, 3]);
    assert_eq!(buffer.missing(), None);
    assert_eq!(buffer.buffered_bytes(), 0);
}

#[test]
fn test_reorder_drops_duplicates_and_stale() {
    let mut buffer = ReorderBuffer::new(64);
    let mut out = Vec::new();
    buffer.push(page(10), &mut out).expect("push");
    buffer.push(page(10), &mut out).expect("push");
    buffer.push(page(9), &mut out).expect("push");
    assert_eq!(ids(&out), vec![10]);
    assert_eq!(buffer.expected(), Some(11));
}

#[test]
fn test_reorder_interleaved_arrivals() {
    let mut buffer = ReorderBuffer::new(64);
    let mut out = Vec::new();
    for id in [1, 3, 2, 5, 4] {
        buffer.push(page(id), &mut out).expect("push");
    }
    assert_eq!(ids(&out), vec![1, 2, 3, 4, 5]);
    assert_eq!(buffer.buffered(), 0);
    assert_eq!(buffer.expected(), Some(6));
}

#[test]
fn test_reorder_start_waits_for_first_slot() {
    let base = make_cluster_id_from_num(0);
    let mut buffer = ReorderBuffer::new(64);
    let mut out = Vec::new();
    buffer.start_at(base);
    buffer.push(page(base | 1), &mut out).expect("push");
    assert!(out.is_empty());
    assert_eq!(buffer.missing(), Some(base));

    buffer.push(page(base), &mut out).expect("push");
    assert_eq!(ids(&out), vec![base, base | 1]);

    buffer.start_at(base | 5);
    assert_eq!(buffer.expected(), Some(base | 2));
}

#[test]
fn test_reorder_rejects_over_budget() {
    let mut buffer = ReorderBuffer::new(1);
    let mut out = Vec::new();
    let mut big = Cluster::new(3);
    big.set_data(&[0; 600]);
    buffer.push(page(1), &mut out).expect("push");
    buffer.push(big, &mut out).expect("within budget");

    let mut bigger = Cluster::new(4);
    bigger.set_data(&[0; 600]);
    let result = buffer.push(bigger, &mut out);
    assert!(matches!(
        result,
        Err(Error::ReorderOverflow { held: 1200, budget: 1024 })
    ));
    assert_eq!(buffer.buffered(), 1);
    assert_eq!(buffer.buffered_bytes(), 600);

    buffer.push(page(2), &mut out).expect("expected cluster always fits");
    assert_eq!(ids(&out), vec![1, 2, 3]);
}

#[test]
fn test_reorder_follows_end_of_cluster() {
    let mut buffer = ReorderBuffer::new(64);
    let mut out = Vec::new();
    let mut first = page(make_cluster_id_from_num(0) | 2);
    first.set_end_of_cluster(true);
    buffer.push(first, &mut out).expect("push");
    buffer.push(page(make_cluster_id_from_num(1)), &mut out).expect("push");
    assert_eq!(out.len(), 2);
}

#[test]
fn test_sequence_gap_expiry_releases_and_reports() {
    let config = Config {
        gap_expiration_limit_ms: 50,
        ..Config::default()
    };
    let scheduler = Arc::new(Scheduler::start().expect("start scheduler"));
    let mut detector = GapDetector::new(&config, scheduler);
    let mut out = Vec::new();
    assert!(detector.sequences_ctrl(page(1), &mut out, 0).expect("in order"));
    assert!(!detector.sequences_ctrl(page(3), &mut out, 16).expect("held"));
    assert_eq!(ids(&out), vec![1]);

    thread::sleep(Duration::from_millis(200));
    let mut released = Vec::new();
    let result = detector.check_expired(&mut released);
    assert!(matches!(result, Err(Error::SequenceGap { cluster_id: 2 })));
    assert_eq!(ids(&released), vec![3]);
    detector.shutdown();
}

#[test]
fn test_expiry_hook_runs_on_timer() {
    let config = Config {
        gap_expiration_limit_ms: 30,
        ..Config::default()
    };
    let scheduler = Arc::new(Scheduler::start().expect("start scheduler"));
    let mut detector = GapDetector::new(&config, scheduler);
    let (tx, rx) = std::sync::mpsc::channel();
    detector.set_expiry_hook(Arc::new(move || {
        let _ = tx.send(());
    }));
    let mut out = Vec::new();
    detector.sequences_ctrl(page(1), &mut out, 0).expect("in order");
    detector.sequences_ctrl(page(3), &mut out, 16).expect("held");

    rx.recv_timeout(Duration::from_secs(2)).expect("hook fired");
    let mut released = Vec::new();
    assert!(matches!(
        detector.check_expired(&mut released),
        Err(Error::SequenceGap { cluster_id: 2 })
    ));
    detector.shutdown();
}

#[test]
fn test_connection_gap_expires_without_key() {
    let config = Config {
        connection_gap_timelimit_ms: 30,
        ..Config::default()
    };
    let scheduler = Arc::new(Scheduler::start().expect("start scheduler"));
    let mut detector = GapDetector::new(&config, Arc::clone(&scheduler));
    detector.start_connection_watch();
    thread::sleep(Duration::from_millis(150));
    let mut out = Vec::new();
    assert!(matches!(
        detector.check_expired(&mut out),
        Err(Error::ConnectionGap { waited_ms: 30 })
    ));

    let mut connected = GapDetector::new(&config, scheduler);
    connected.start_connection_watch();
    connected.connection_established();
    thread::sleep(Duration::from_millis(150));
    assert!(connected.check_expired(&mut out).is_ok());
    assert!(connected.is_connected());
}

#[test]
fn test_page_delivery_fires_once() {
    let scheduler = Arc::new(Scheduler::start().expect("start scheduler"));
    let (tx, rx) = std::sync::mpsc::channel();
    let mut timer = PageDelivery::new(scheduler, 20);
    assert!(!timer.is_immediate());
    timer.arm(7, move || {
        let _ = tx.send(7u64);
    });
    assert_eq!(timer.armed_for(), Some(7));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(7));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_page_delivery_disarm_cancels() {
    let scheduler = Arc::new(Scheduler::start().expect("start scheduler"));
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let mut timer = PageDelivery::new(Arc::clone(&scheduler), 30);
    timer.arm(1, move || {
        let _ = tx.send(());
    });
    timer.disarm();
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    assert_eq!(timer.armed_for(), None);
    assert!(PageDelivery::new(scheduler, 0).is_immediate());
}

#[test]
fn test_send_policy() {
    let mut different = SendPolicy::new(SendMethod::Different);
    let picks: Vec<SendMethod> = (0..4).map(|_| different.next_channel()).collect();
    assert_eq!(
        picks,
        vec![
            SendMethod::ChannelOne,
            SendMethod::ChannelTwo,
            SendMethod::ChannelOne,
            SendMethod::ChannelTwo
        ]
    );

    let mut fixed = SendPolicy::new(SendMethod::ChannelTwo);
    assert_eq!(fixed.next_channel(), SendMethod::ChannelTwo);

    let mut random = SendPolicy::new(SendMethod::Random);
    for _ in 0..32 {
        assert!(matches!(
            random.next_channel(),
            SendMethod::ChannelOne | SendMethod::ChannelTwo
        ));
    }
}

#[test]
fn test_scheduler_repeats_until_cancelled() {
    let scheduler = Scheduler::start().expect("start scheduler");
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = scheduler.schedule(
        move || {
            let _ = tx.send(());
        },
        Duration::from_millis(5),
        Some(Duration::from_millis(5)),
    );
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(2)).expect("tick");
    }
    handle.cancel();
    assert!(handle.is_cancelled());
    scheduler.shutdown();
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_throughput_window() {
    let start = Instant::now();
    let meter = ThroughputMeter::starting_at(start);
    meter.record_at(1000, start);
    assert_eq!(meter.throughput(), 0);
    meter.record_at(1000, start + Duration::from_secs(10));
    assert_eq!(meter.throughput(), 200);
    assert_eq!(meter.total_bytes(), 2000);
}
