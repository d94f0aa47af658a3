// File:    key_agent.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: AES key agent: generates, binds, hands out and receives key material for both directions.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! AES key agent.
//!
//! Outgoing keys are generated in batches, announced to the peer inside
//! pre-send bundles, bound to the image cluster that carried the bundle, and
//! finally handed to the cipher. Incoming keys are stored under the cluster
//! id they arrived with until the matching data package is decrypted.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::backlog::{BacklogStore, FileBacklog};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framing::{AesKind, AesPackage, Framed, MagicWord};
use crate::key_queue::{KeyDirection, KeyQueue};
use crate::keystore::KeyStore;

const TOP_UP_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key counters since the agent was created.
#[derive(Debug, Default)]
struct KeyCounters {
    out_created: AtomicU32,
    out_sent: AtomicU32,
    in_received: AtomicU32,
    in_applied: AtomicU32,
}

#[derive(Default)]
struct Wakeup {
    stop: Mutex<bool>,
    signal: Condvar,
}

/// Owner of both key queues.
pub struct AesKeyAgent {
    config: Arc<Config>,
    magic: MagicWord,
    outgoing: Mutex<KeyQueue>,
    incoming: Mutex<KeyQueue>,
    counters: KeyCounters,
    wakeup: Arc<Wakeup>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AesKeyAgent {
    /// Agent spilling into the given backlog stores.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        out_store: Box<dyn BacklogStore>,
        in_store: Box<dyn BacklogStore>,
    ) -> Self {
        let magic = Self::create_out_magic(&KeyStore::from_password(&config.aes_first_key_password));
        Self {
            outgoing: Mutex::new(KeyQueue::new(
                KeyDirection::Outgoing,
                config.aes_out_keystorage_kb,
                out_store,
            )),
            incoming: Mutex::new(KeyQueue::new(
                KeyDirection::Incoming,
                config.aes_in_keystorage_kb,
                in_store,
            )),
            config,
            magic,
            counters: KeyCounters::default(),
            wakeup: Arc::new(Wakeup::default()),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Agent spilling into backlog files of session `session` under the configured directory.
    pub fn open(config: Arc<Config>, session: Uuid) -> Result<Self> {
        fs::create_dir_all(&config.backlog_dir)
            .map_err(|e| Error::Backlog(format!("{}: {e}", config.backlog_dir.display())))?;
        let limit = config.aes_backlog_key_limit_kb;
        let out_store =
            FileBacklog::open(&config.backlog_dir.join(format!("{session}.out.json")), limit)?;
        let in_store =
            FileBacklog::open(&config.backlog_dir.join(format!("{session}.in.json")), limit)?;
        info!("Key backlog for session {session} in {}", config.backlog_dir.display());
        Ok(Self::new(config, Box::new(out_store), Box::new(in_store)))
    }

    /// Magic word derived from `key`.
    #[must_use]
    pub fn create_out_magic(key: &KeyStore) -> MagicWord {
        key.magic()
    }

    /// Session magic word stamped on outgoing key packages.
    #[must_use]
    pub const fn magic(&self) -> MagicWord {
        self.magic
    }

    /// Generates one batch of keys into the outgoing queue. Returns the batch size.
    pub fn prepare_presend(&self) -> Result<usize> {
        let batch = self.config.aes_presend_keys_num;
        let keys = (0..batch)
            .map(|_| KeyStore::generate())
            .collect::<std::io::Result<Vec<_>>>()?;
        let mut outgoing = lock(&self.outgoing);
        for key in keys {
            outgoing.push_new(key);
        }
        outgoing.backlog(u64::MAX)?;
        drop(outgoing);
        self.counters
            .out_created
            .fetch_add(u32::try_from(batch).unwrap_or(u32::MAX), Ordering::Relaxed);
        debug!("Prepared {batch} pre-send keys");
        Ok(batch)
    }

    /// Up to `num` pre-send bundles for keys not yet announced.
    pub fn get_for_presend(&self, num: usize) -> Result<Vec<AesPackage>> {
        let mut outgoing = lock(&self.outgoing);
        let mut packages = Vec::with_capacity(num);
        while packages.len() < num {
            let Some((order_id, key)) = outgoing.give_me_next_outgoing(true)? else {
                break;
            };
            packages.push(AesPackage::pre_send(&key, order_id, self.magic));
        }
        drop(outgoing);
        if packages.len() < num {
            self.wakeup.signal.notify_one();
        }
        Ok(packages)
    }

    /// Removes and returns the oldest key bound to a cluster, with that cluster id.
    pub fn get_for_crypto(&self) -> Result<(u64, KeyStore)> {
        lock(&self.outgoing)
            .give_me_next_outgoing(false)?
            .ok_or(Error::KeyExhaustion)
    }

    /// Removes and returns the incoming key stored under `cluster_id`.
    pub fn get_for_decrypto(&self, cluster_id: u64) -> Result<Option<KeyStore>> {
        let key = lock(&self.incoming).take(cluster_id)?;
        if key.is_some() {
            self.counters.in_applied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(key)
    }

    /// Stores the key material of a decoded key package.
    ///
    /// Key-only and IV-only packages with the same id fill in one entry.
    pub fn accept_incoming(&self, package: &AesPackage) -> Result<()> {
        let id = package.id();
        let mut incoming = lock(&self.incoming);
        match package.kind() {
            AesKind::PreSend => incoming.insert(id, package.key_store()?),
            AesKind::Key | AesKind::Iv => {
                if incoming.get_mut(id).is_none() {
                    let partial = incoming.take(id)?.unwrap_or_else(KeyStore::empty);
                    incoming.insert(id, partial);
                }
                if let Some(entry) = incoming.get_mut(id) {
                    if let Some(key) = package.key_bytes() {
                        entry.key = key;
                    }
                    if let Some(iv) = package.iv_bytes() {
                        entry.iv = iv;
                    }
                }
            }
            AesKind::CrData | AesKind::DcData => {
                return Err(Error::InvalidState("data package offered as key material"));
            }
        }
        incoming.backlog(u64::MAX)?;
        drop(incoming);
        self.counters.in_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Binds the announced key `order_id` to image cluster `cluster_num`.
    pub fn assign_to_cluster(&self, order_id: u64, cluster_num: u64) -> Result<u64> {
        let id = lock(&self.outgoing).assign_cluster_id(order_id, cluster_num)?;
        self.counters.out_sent.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Moves an outgoing key into the backlog store.
    pub fn backup_outgoing_key(&self, cluster_id: u64) -> Result<bool> {
        lock(&self.outgoing).backup(cluster_id)
    }

    /// Changes the in-memory budget of the outgoing queue.
    pub fn set_outgoing_keepsize(&self, keep_kb: usize) {
        lock(&self.outgoing).set_new_keepsize(keep_kb);
    }

    /// Keys in the outgoing queue.
    #[must_use]
    pub fn outgoing_size(&self) -> usize {
        lock(&self.outgoing).len()
    }

    /// Bytes used by and budget of the incoming queue.
    #[must_use]
    pub fn in_queue_usage(&self) -> (usize, usize) {
        (
            lock(&self.incoming).size_in_bytes(),
            self.config.aes_in_keystorage_kb * 1024,
        )
    }

    /// Bytes used by and budget of the outgoing queue.
    #[must_use]
    pub fn out_queue_usage(&self) -> (usize, usize) {
        (
            lock(&self.outgoing).size_in_bytes(),
            self.config.aes_out_keystorage_kb * 1024,
        )
    }

    /// Keys generated.
    #[must_use]
    pub fn out_keys_created(&self) -> u32 {
        self.counters.out_created.load(Ordering::Relaxed)
    }

    /// Keys bound to a cluster and thus sent.
    #[must_use]
    pub fn out_keys_sent(&self) -> u32 {
        self.counters.out_sent.load(Ordering::Relaxed)
    }

    /// Key packages received.
    #[must_use]
    pub fn in_keys_received(&self) -> u32 {
        self.counters.in_received.load(Ordering::Relaxed)
    }

    /// Incoming keys handed out for decryption.
    #[must_use]
    pub fn in_keys_applied(&self) -> u32 {
        self.counters.in_applied.load(Ordering::Relaxed)
    }

    /// Starts the thread keeping at least one unannounced batch in the outgoing queue.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(Error::InvalidState("key agent already started"));
        }
        *lock(&self.wakeup.stop) = false;
        let agent: Weak<Self> = Arc::downgrade(self);
        let wakeup = Arc::clone(&self.wakeup);
        let handle = thread::Builder::new()
            .name("otpbox-key-agent".into())
            .spawn(move || top_up_loop(&agent, &wakeup))?;
        *lock(&self.worker) = Some(handle);
        info!("Key agent started");
        Ok(())
    }

    /// Stops the thread and flushes both queues to the backlog.
    pub fn shutdown(&self) -> Result<()> {
        *lock(&self.wakeup.stop) = true;
        self.wakeup.signal.notify_all();
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker
            && handle.join().is_err()
        {
            warn!("Key agent thread panicked");
        }
        self.running.store(false, Ordering::Relaxed);
        let flushed_out = lock(&self.outgoing).flush_all()?;
        let flushed_in = lock(&self.incoming).flush_all()?;
        info!("Key agent stopped, flushed {flushed_out} outgoing and {flushed_in} incoming keys");
        Ok(())
    }
}

fn top_up_loop(agent: &Weak<AesKeyAgent>, wakeup: &Wakeup) {
    loop {
        {
            let stop = lock(&wakeup.stop);
            if *stop {
                return;
            }
            let (stop, _) = wakeup
                .signal
                .wait_timeout(stop, TOP_UP_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            if *stop {
                return;
            }
        }
        let Some(agent) = agent.upgrade() else {
            return;
        };
        let short = lock(&agent.outgoing).unreserved() < agent.config.aes_presend_keys_num;
        if short && let Err(e) = agent.prepare_presend() {
            warn!("Key generation failed: {e}");
        }
    }
}
