#![allow(missing_docs)]
use std::sync::Arc;

use otpbox_core::backlog::{BacklogStore, FileBacklog, MemoryBacklog};
use otpbox_core::framing::{
    AesKind, AesPackage, CLUSTER_SLOTS, FIRST_ASSIGNED_CLUSTER_ID, Framed,
    make_cluster_id_from_num,
};
use otpbox_core::key_agent::AesKeyAgent;
use otpbox_core::key_queue::{KeyDirection, KeyQueue};
use otpbox_core::keystore::{INCOMING_WIRE_LEN, KeyStore};
use otpbox_core::{Config, Error};
use tempfile::tempdir;

fn key(password: &str) -> KeyStore {
    KeyStore::from_password(password)
}

fn outgoing(keep_kb: usize) -> KeyQueue {
    KeyQueue::new(KeyDirection::Outgoing, keep_kb, Box::new(MemoryBacklog::new()))
}

/// Store whose writes always fail.
struct ReadOnlyBacklog;

impl BacklogStore for ReadOnlyBacklog {
    fn put(&mut self, _id: u64, _bytes: Vec<u8>) -> Result<(), Error> {
        Err(Error::Backlog("store is read-only".into()))
    }

    fn get_range(&self, _lo: u64, _hi: u64) -> Result<Vec<(u64, Vec<u8>)>, Error> {
        Ok(Vec::new())
    }

    fn remove(&mut self, _id: u64) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }

    fn len(&self) -> usize {
        0
    }
}

#[test]
fn test_presend_reserves_in_order() {
    let mut queue = outgoing(64);
    assert_eq!(queue.push_new(key("a")), 1);
    assert_eq!(queue.push_new(key("b")), 2);
    assert_eq!(queue.unreserved(), 2);

    let (first, k1) = queue
        .give_me_next_outgoing(true)
        .expect("reserve")
        .expect("first key");
    assert_eq!(first, 1);
    assert_eq!(k1, key("a"));
    assert_eq!(queue.unreserved(), 1);
    // Reserved keys stay queued until bound to a cluster.
    assert_eq!(queue.len(), 2);

    let (second, _) = queue
        .give_me_next_outgoing(true)
        .expect("reserve")
        .expect("second key");
    assert_eq!(second, 2);
    assert!(queue.give_me_next_outgoing(true).expect("reserve").is_none());
}

#[test]
fn test_assign_cluster_id_takes_next_slot() {
    let mut queue = outgoing(64);
    let a = queue.push_new(key("a"));
    let b = queue.push_new(key("b"));
    let base = make_cluster_id_from_num(4);

    assert_eq!(queue.assign_cluster_id(a, 4).expect("assign"), base);
    assert_eq!(queue.assign_cluster_id(b, 4).expect("assign"), base | 1);
    assert!(matches!(
        queue.assign_cluster_id(a, 4),
        Err(Error::KeyNotAssigned { order_id }) if order_id == a
    ));
}

#[test]
fn test_assign_cluster_id_never_reissues_taken_slot() {
    let mut queue = outgoing(64);
    let a = queue.push_new(key("a"));
    let id_a = queue.assign_cluster_id(a, 0).expect("assign");
    let (taken, k) = queue
        .give_me_next_outgoing(false)
        .expect("take")
        .expect("key");
    assert_eq!((taken, k), (id_a, key("a")));

    let b = queue.push_new(key("b"));
    let id_b = queue.assign_cluster_id(b, 0).expect("assign");
    assert_eq!(id_b, id_a | 1);

    // A new image cluster starts at slot zero again.
    let c = queue.push_new(key("c"));
    assert_eq!(
        queue.assign_cluster_id(c, 1).expect("assign"),
        make_cluster_id_from_num(1)
    );
}

#[test]
fn test_assign_cluster_id_fails_when_slots_are_full() {
    let mut queue = outgoing(1024);
    for slot in 0..CLUSTER_SLOTS {
        let order = queue.push_new(key("k"));
        assert_eq!(
            queue.assign_cluster_id(order, 0).expect("assign"),
            FIRST_ASSIGNED_CLUSTER_ID | slot
        );
    }
    let extra = queue.push_new(key("extra"));
    assert!(matches!(
        queue.assign_cluster_id(extra, 0),
        Err(Error::DataIntegrity(_))
    ));
    // The key stays available under its order id.
    assert!(queue.get_mut(extra).is_some());
}

#[test]
fn test_crypto_keys_come_out_oldest_first() {
    let mut queue = outgoing(64);
    let a = queue.push_new(key("a"));
    let b = queue.push_new(key("b"));
    let id_b = queue.assign_cluster_id(b, 2).expect("assign");
    let id_a = queue.assign_cluster_id(a, 1).expect("assign");
    assert!(id_a < id_b);

    let (first, k) = queue
        .give_me_next_outgoing(false)
        .expect("take")
        .expect("key");
    assert_eq!((first, k), (id_a, key("a")));
    let (second, _) = queue
        .give_me_next_outgoing(false)
        .expect("take")
        .expect("key");
    assert_eq!(second, id_b);
    assert!(queue.give_me_next_outgoing(false).expect("take").is_none());
}

#[test]
fn test_backlog_spills_oldest_and_take_finds_them() {
    // One KiB keeps nine keys in memory.
    let mut queue = outgoing(1);
    let keep = queue.keep_num();
    let ids: Vec<u64> = (0..keep + 3).map(|i| queue.push_new(key(&format!("k{i}")))).collect();

    assert!(queue.backlog(u64::MAX).expect("spill"));
    assert_eq!(queue.len(), keep);
    assert_eq!(queue.backlog_len(), 3);

    let restored = queue.take(ids[0]).expect("take").expect("spilled key");
    assert_eq!(restored, key("k0"));
    assert_eq!(queue.backlog_len(), 2);
}

#[test]
fn test_failed_spill_keeps_keys_in_memory() {
    let mut queue = KeyQueue::new(KeyDirection::Outgoing, 1, Box::new(ReadOnlyBacklog));
    let keep = queue.keep_num();
    let ids: Vec<u64> = (0..keep + 2).map(|i| queue.push_new(key(&format!("k{i}")))).collect();

    assert!(matches!(queue.backlog(u64::MAX), Err(Error::Backlog(_))));
    assert_eq!(queue.len(), keep + 2);
    assert!(matches!(queue.flush_all(), Err(Error::Backlog(_))));
    assert!(matches!(queue.backup(ids[0]), Err(Error::Backlog(_))));

    let restored = queue.take(ids[0]).expect("take").expect("key still held");
    assert_eq!(restored, key("k0"));
}

#[test]
fn test_incoming_spill_uses_short_form() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("in.json");
    let store = FileBacklog::open(&path, 1024).expect("open backlog");
    let mut queue = KeyQueue::new(KeyDirection::Incoming, 64, Box::new(store));
    let k = KeyStore::generate().expect("generate key");
    queue.insert(FIRST_ASSIGNED_CLUSTER_ID, k.clone());
    assert_eq!(queue.flush_all().expect("flush"), 1);

    let reopened = FileBacklog::open(&path, 1024).expect("reopen backlog");
    let entries = reopened
        .get_range(FIRST_ASSIGNED_CLUSTER_ID, FIRST_ASSIGNED_CLUSTER_ID)
        .expect("range");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.len(), INCOMING_WIRE_LEN);

    let restored = queue
        .take(FIRST_ASSIGNED_CLUSTER_ID)
        .expect("take")
        .expect("key");
    assert_eq!(restored.key, k.key);
    assert_eq!(restored.iv, k.iv);
}

#[test]
fn test_agent_presend_assign_and_crypto() {
    let config = Arc::new(Config {
        aes_presend_keys_num: 4,
        ..Config::default()
    });
    let agent = AesKeyAgent::new(
        config,
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    );
    assert!(matches!(agent.get_for_crypto(), Err(Error::KeyExhaustion)));

    assert_eq!(agent.prepare_presend().expect("prepare"), 4);
    let bundles = agent.get_for_presend(2).expect("presend");
    assert_eq!(bundles.len(), 2);
    assert!(bundles.iter().all(|p| p.kind() == AesKind::PreSend));
    assert_eq!(bundles[0].magic_tag(), Some(agent.magic().get()));

    let cluster_id = agent.assign_to_cluster(bundles[0].id(), 0).expect("assign");
    assert_eq!(cluster_id, FIRST_ASSIGNED_CLUSTER_ID);
    let (id, k) = agent.get_for_crypto().expect("crypto key");
    assert_eq!(id, cluster_id);
    assert_eq!(k, bundles[0].key_store().expect("bundle key"));
    assert_eq!(agent.out_keys_created(), 4);
    assert_eq!(agent.out_keys_sent(), 1);
}

#[test]
fn test_agent_merges_key_and_iv_packages() {
    let agent = AesKeyAgent::new(
        Arc::new(Config::default()),
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    );
    let k = KeyStore::generate().expect("generate key");
    let id = make_cluster_id_from_num(3) | 5;
    agent
        .accept_incoming(&AesPackage::key_only(&k, id, agent.magic()))
        .expect("key part");
    agent
        .accept_incoming(&AesPackage::iv_only(&k, id, agent.magic()))
        .expect("iv part");
    assert_eq!(agent.in_keys_received(), 2);
    assert_eq!(agent.in_queue_usage(), (104, 2048 * 1024));

    let stored = agent.get_for_decrypto(id).expect("lookup").expect("key");
    assert_eq!(stored.key, k.key);
    assert_eq!(stored.iv, k.iv);
    assert!(agent.get_for_decrypto(id).expect("lookup").is_none());
    assert_eq!(agent.in_keys_applied(), 1);

    let data = AesPackage::cr_data(id, b"payload").expect("build package");
    assert!(matches!(
        agent.accept_incoming(&data),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_agent_keepsize_and_backup_spill_keys() {
    let config = Arc::new(Config {
        aes_presend_keys_num: 12,
        ..Config::default()
    });
    let agent = AesKeyAgent::new(
        config,
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    );
    agent.prepare_presend().expect("prepare");
    assert_eq!(agent.out_queue_usage(), (12 * 104, 1024 * 1024));

    // One KiB keeps nine keys; the next batch pushes the oldest out.
    agent.set_outgoing_keepsize(1);
    agent.prepare_presend().expect("prepare");
    assert_eq!(agent.outgoing_size(), 9);

    assert!(agent.backup_outgoing_key(20).expect("backup"));
    assert_eq!(agent.outgoing_size(), 8);
    assert!(!agent.backup_outgoing_key(1).expect("already spilled"));
    assert_eq!(agent.out_keys_created(), 24);
}

#[test]
fn test_agent_tops_up_in_background() {
    let config = Arc::new(Config {
        aes_presend_keys_num: 8,
        ..Config::default()
    });
    let agent = Arc::new(AesKeyAgent::new(
        config,
        Box::new(MemoryBacklog::new()),
        Box::new(MemoryBacklog::new()),
    ));
    agent.start().expect("start agent");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while agent.outgoing_size() < 8 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(agent.outgoing_size() >= 8);
    agent.shutdown().expect("shutdown");
}

#[test]
fn test_agent_open_spills_into_session_files() {
    let dir = tempdir().expect("tempdir");
    let config = Arc::new(Config {
        backlog_dir: dir.path().join("backlog"),
        aes_presend_keys_num: 2,
        ..Config::default()
    });
    let session = uuid::Uuid::new_v4();
    let agent = AesKeyAgent::open(config, session).expect("open agent");
    agent.prepare_presend().expect("prepare keys");
    agent.shutdown().expect("shutdown");

    let out_path = dir.path().join("backlog").join(format!("{session}.out.json"));
    let reopened = FileBacklog::open(&out_path, 1024).expect("reopen backlog");
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.path(), out_path.as_path());
}
