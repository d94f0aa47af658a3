// File:    key_queue.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Ordered, bounded key queue with spill-over into a backlog store.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Key queues.
//!
//! Entries are keyed either by an order id (a small positive counter handed
//! out by [`KeyQueue::push_new`]) or, once bound to an image cluster, by a
//! cluster id with bit 63 set. Order ids therefore always sort before
//! cluster ids.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::backlog::BacklogStore;
use crate::config::keep_num;
use crate::error::{Error, Result};
use crate::framing::{
    CLUSTER_SLOTS, FIRST_ASSIGNED_CLUSTER_ID, UNASSIGNED_CLUSTER_ID, make_cluster_id_from_num,
};
use crate::keystore::{KEY_STORE_WIRE_LEN, KeyStore};

/// Which side of the tunnel a queue serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// Keys received from the peer; spilled without password and salt.
    Incoming,
    /// Keys generated locally.
    Outgoing,
}

/// Bounded map of key material with a backlog store behind it.
pub struct KeyQueue {
    direction: KeyDirection,
    entries: BTreeMap<u64, KeyStore>,
    keep_num: usize,
    next_order: u64,
    reserved_upto: u64,
    next_slot: Option<(u64, u64)>,
    store: Box<dyn BacklogStore>,
}

impl KeyQueue {
    /// Empty queue keeping `keep_kb` KiB of entries in memory.
    #[must_use]
    pub fn new(direction: KeyDirection, keep_kb: usize, store: Box<dyn BacklogStore>) -> Self {
        Self {
            direction,
            entries: BTreeMap::new(),
            keep_num: keep_num(keep_kb),
            next_order: 1,
            reserved_upto: UNASSIGNED_CLUSTER_ID,
            next_slot: None,
            store,
        }
    }

    /// Changes the in-memory budget.
    pub const fn set_new_keepsize(&mut self, keep_kb: usize) {
        self.keep_num = keep_num(keep_kb);
    }

    /// Entries kept in memory before spilling.
    #[must_use]
    pub const fn keep_num(&self) -> usize {
        self.keep_num
    }

    /// Entries in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry is in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes accounted for the in-memory entries.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.entries.len() * (KEY_STORE_WIRE_LEN + 8)
    }

    /// Order-keyed entries not yet handed out for pre-sending.
    #[must_use]
    pub fn unreserved(&self) -> usize {
        self.entries
            .range(self.reserved_upto + 1..FIRST_ASSIGNED_CLUSTER_ID)
            .count()
    }

    /// Entries held by the backlog store.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.store.len()
    }

    /// In-memory entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &KeyStore)> {
        self.entries.iter().map(|(id, key)| (*id, key))
    }

    /// Inserts `key` under the next order id and returns that id.
    pub fn push_new(&mut self, key: KeyStore) -> u64 {
        let id = self.next_order;
        self.next_order += 1;
        self.entries.insert(id, key);
        id
    }

    /// Inserts `key` under an explicit id, replacing an earlier entry.
    pub fn insert(&mut self, id: u64, key: KeyStore) {
        self.entries.insert(id, key);
    }

    /// Mutable access to an in-memory entry.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut KeyStore> {
        self.entries.get_mut(&id)
    }

    /// Hands out the next key.
    ///
    /// With `pre_send` the oldest unreserved order-keyed entry is reserved
    /// and a copy returned; it stays queued until bound to a cluster. Without
    /// it the oldest cluster-bound entry is removed and returned.
    pub fn give_me_next_outgoing(&mut self, pre_send: bool) -> Result<Option<(u64, KeyStore)>> {
        if pre_send {
            while self.reserved_upto + 1 < self.next_order {
                let id = self.reserved_upto + 1;
                self.reserved_upto = id;
                if let Some(key) = self.entries.get(&id) {
                    return Ok(Some((id, key.clone())));
                }
                if let Some((_, bytes)) = self.store.get_range(id, id)?.pop() {
                    return Ok(Some((id, parse(&bytes)?)));
                }
                debug!("Order id {id} no longer held, skipped");
            }
            return Ok(None);
        }

        let in_memory = self
            .entries
            .range(FIRST_ASSIGNED_CLUSTER_ID..)
            .next()
            .map(|(id, _)| *id);
        let upper = in_memory.map_or(u64::MAX, |id| id - 1);
        let spilled = self
            .store
            .get_range(FIRST_ASSIGNED_CLUSTER_ID, upper)?
            .first()
            .map(|(id, _)| *id);
        match spilled.or(in_memory) {
            Some(id) => Ok(self.take(id)?.map(|key| (id, key))),
            None => Ok(None),
        }
    }

    /// Binds the key under `order_id` to the next unissued slot of image cluster `cluster_num`.
    ///
    /// A slot is issued once per image cluster, even after its key was taken.
    /// Returns the cluster id the key is now stored under.
    pub fn assign_cluster_id(&mut self, order_id: u64, cluster_num: u64) -> Result<u64> {
        let key = self
            .take(order_id)?
            .ok_or(Error::KeyNotAssigned { order_id })?;
        let base = make_cluster_id_from_num(cluster_num);
        let spilled: Vec<u64> = self
            .store
            .get_range(base, base | (CLUSTER_SLOTS - 1))?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let first = match self.next_slot {
            Some((num, slot)) if num == cluster_num => slot,
            _ => 0,
        };
        let free = (first..CLUSTER_SLOTS)
            .map(|slot| base | slot)
            .find(|id| !self.entries.contains_key(id) && !spilled.contains(id));
        let Some(id) = free else {
            self.entries.insert(order_id, key);
            return Err(Error::DataIntegrity(format!(
                "image cluster {cluster_num} has no free key slot"
            )));
        };
        self.next_slot = Some((cluster_num, (id & (CLUSTER_SLOTS - 1)) + 1));
        self.entries.insert(id, key);
        Ok(id)
    }

    /// Removes and returns the entry under `id`, looking in the backlog store as well.
    pub fn take(&mut self, id: u64) -> Result<Option<KeyStore>> {
        if let Some(key) = self.entries.remove(&id) {
            return Ok(Some(key));
        }
        match self.store.remove(id)? {
            Some(bytes) => parse(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Moves the oldest entries below `below` into the backlog store until the budget holds.
    ///
    /// Returns true when entries were moved.
    pub fn backlog(&mut self, below: u64) -> Result<bool> {
        let surplus = self.entries.len().saturating_sub(self.keep_num);
        if surplus == 0 {
            return Ok(false);
        }
        let ids: Vec<u64> = self
            .entries
            .range(..below)
            .take(surplus)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Ok(false);
        }
        let moved = self.spill(&ids)?;
        debug!("Spilled {moved} {:?} keys to the backlog", self.direction);
        Ok(true)
    }

    /// Moves one entry into the backlog store.
    pub fn backup(&mut self, id: u64) -> Result<bool> {
        Ok(self.spill(&[id])? > 0)
    }

    /// Moves every in-memory entry into the backlog store.
    pub fn flush_all(&mut self) -> Result<usize> {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        let moved = self.spill(&ids)?;
        if moved > 0 {
            info!("Flushed {moved} {:?} keys to the backlog", self.direction);
        }
        Ok(moved)
    }

    /// Entries leave memory only after the store accepted them.
    fn spill(&mut self, ids: &[u64]) -> Result<usize> {
        let direction = self.direction;
        let batch: Vec<(u64, Vec<u8>)> = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|key| (*id, key)))
            .map(|(id, key)| {
                let bytes = match direction {
                    KeyDirection::Incoming => key.to_incoming_bytes().to_vec(),
                    KeyDirection::Outgoing => key.to_bytes().to_vec(),
                };
                (id, bytes)
            })
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let stored: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
        self.store.put_many(batch)?;
        for id in &stored {
            self.entries.remove(id);
        }
        Ok(stored.len())
    }
}

fn parse(bytes: &[u8]) -> Result<KeyStore> {
    KeyStore::from_bytes(bytes).map_err(|e| Error::Backlog(format!("corrupt backlog entry: {e}")))
}
