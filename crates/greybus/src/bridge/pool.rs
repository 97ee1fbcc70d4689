//! Bounded pool of reusable transfer buffers.
//!
//! Leasing never blocks and never fails: when every slot is busy the caller
//! gets a one-off buffer instead, and a warning is logged. A lease returns its
//! slot to the pool when dropped. Once the pool is killed every slot ends up
//! `Killed` and is never handed out again.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::bytes::BytesMut;

use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Leased,
    /// Transfer finished; completion is being reported.
    Completing,
    Killed,
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub leased: usize,
    pub completing: usize,
    pub killed: usize,
    /// One-off buffers handed out because every slot was busy.
    pub fallbacks: u64,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<SlotState>,
    buffers: Vec<Option<BytesMut>>,
    killed: bool,
    fallbacks: u64,
}

#[derive(Debug)]
pub struct TransferPool {
    name: &'static str,
    buffer_size: usize,
    state: Mutex<PoolState>,
}

impl TransferPool {
    pub fn new(name: &'static str, capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            buffer_size,
            state: Mutex::new(PoolState {
                slots: vec![SlotState::Free; capacity],
                buffers: (0..capacity).map(|_| None).collect(),
                killed: false,
                fallbacks: 0,
            }),
        })
    }

    /// Lease the first free slot, or a one-off buffer if none is free.
    pub fn lease(self: &Arc<Self>) -> TransferLease {
        if let Some(lease) = self.try_lease() {
            return lease;
        }

        let fallbacks = {
            let mut state = lock(&self.state, "transfer pool");
            state.fallbacks += 1;
            state.fallbacks
        };
        tracing::warn!(
            pool = self.name,
            fallbacks,
            "Transfer pool exhausted, using one-off buffer"
        );
        TransferLease {
            pool: Arc::clone(self),
            slot: None,
            buffer: Some(BytesMut::with_capacity(self.buffer_size)),
        }
    }

    /// Lease the first free slot, if any.
    pub fn try_lease(self: &Arc<Self>) -> Option<TransferLease> {
        let mut state = lock(&self.state, "transfer pool");
        let slot = state.slots.iter().position(|s| *s == SlotState::Free)?;
        state.slots[slot] = SlotState::Leased;
        let mut buffer = state.buffers[slot]
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        drop(state);

        buffer.clear();
        tracing::trace!(pool = self.name, slot, "Leased transfer slot");
        Some(TransferLease {
            pool: Arc::clone(self),
            slot: Some(slot),
            buffer: Some(buffer),
        })
    }

    /// Retire every slot. Outstanding leases retire theirs when dropped.
    pub fn kill(&self) {
        let mut state = lock(&self.state, "transfer pool");
        state.killed = true;
        for slot in state.slots.iter_mut() {
            if matches!(slot, SlotState::Free | SlotState::Leased) {
                *slot = SlotState::Killed;
            }
        }
        state.buffers.iter_mut().for_each(|b| *b = None);
        tracing::debug!(pool = self.name, "Transfer pool killed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state, "transfer pool");
        let count = |wanted: SlotState| state.slots.iter().filter(|s| **s == wanted).count();
        PoolStats {
            capacity: state.slots.len(),
            free: count(SlotState::Free),
            leased: count(SlotState::Leased),
            completing: count(SlotState::Completing),
            killed: count(SlotState::Killed),
            fallbacks: state.fallbacks,
        }
    }

    fn set_completing(&self, slot: usize) {
        let mut state = lock(&self.state, "transfer pool");
        if state.slots[slot] == SlotState::Leased {
            state.slots[slot] = SlotState::Completing;
        }
    }

    fn release(&self, slot: usize, buffer: Option<BytesMut>) {
        let mut state = lock(&self.state, "transfer pool");
        let (current, killed) = (state.slots[slot], state.killed);
        match current {
            SlotState::Leased | SlotState::Completing if !killed => {
                state.slots[slot] = SlotState::Free;
                state.buffers[slot] = buffer;
            }
            SlotState::Leased | SlotState::Completing | SlotState::Killed => {
                state.slots[slot] = SlotState::Killed;
            }
            SlotState::Free => {
                tracing::error!(pool = self.name, slot, "Releasing a slot that is not leased");
                debug_assert!(false, "transfer slot {slot} released twice");
            }
        }
    }
}

/// Exclusive use of one transfer buffer.
///
/// The buffer can be taken out while the transfer is in flight and restored
/// when it completes; a buffer that never comes back is reallocated lazily.
#[derive(Debug)]
pub struct TransferLease {
    pool: Arc<TransferPool>,
    slot: Option<usize>,
    buffer: Option<BytesMut>,
}

impl TransferLease {
    /// Pool slot index, or `None` for a one-off buffer.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buffer
            .get_or_insert_with(|| BytesMut::with_capacity(self.pool.buffer_size))
    }

    pub fn take_buffer(&mut self) -> BytesMut {
        self.buffer
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.pool.buffer_size))
    }

    pub fn restore(&mut self, mut buffer: BytesMut) {
        buffer.clear();
        self.buffer = Some(buffer);
    }

    /// Mark the transfer as finished while its status is being reported.
    pub fn set_completing(&self) {
        if let Some(slot) = self.slot {
            self.pool.set_completing(slot);
        }
    }
}

impl Drop for TransferLease {
    fn drop(&mut self) {
        match self.slot {
            Some(slot) => self.pool.release(slot, self.buffer.take()),
            None => tracing::trace!(pool = self.pool.name, "Dropping one-off transfer buffer"),
        }
    }
}
