// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Directional channel engine over one shared ring descriptor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 15 unit tests, 2 property tests
//!
//! The producer owns the write index, the consumer owns the read index; both
//! are free-running little-endian `u32` words inside the shared region and
//! every comparison goes through `wrapping_sub`, so the counters wrap without
//! ever being reset. `write - read` never exceeds the ring capacity (buffers
//! in packet mode, bytes in stream mode).
//!
//! Ordering: payload bytes and the packet size word are written before the
//! write index is stored (release); the read index is stored only after the
//! consumer is done with the slot. Doorbells are raised after the index store
//! and carry no data: a peer re-reads the indices on every raised bit, so a
//! doorbell without an index change is harmless.

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nexus_hal::{Doorbell, SharedMemory};
use parking_lot::{Mutex, MutexGuard};

use crate::config::{is_open_word, Geometry, LaneConfig, Mode};
use crate::error::{ConfigError, RingError};

/// Handle to the shared region.
pub type SharedRegion = Arc<dyn SharedMemory + Send + Sync>;
/// Handle to the doorbell transport toward the peer.
pub type DoorbellHandle = Arc<dyn Doorbell + Send + Sync>;

const WORD: usize = 4;

/// Every buffer of the lane is owned by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Snapshot of the shared indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStats {
    pub read_index: u32,
    pub write_index: u32,
    /// Published units not yet released.
    pub pending: u32,
}

#[derive(Debug, Default)]
struct ConsumerState {
    /// Units handed out by the last `consume`.
    held: Option<u32>,
    /// A `release(more = true)` skipped its doorbell.
    done_deferred: bool,
}

/// One direction of a channel.
pub struct Lane {
    cfg: LaneConfig,
    region: SharedRegion,
    doorbell: DoorbellHandle,
    producer: Mutex<()>,
    consumer: Mutex<ConsumerState>,
}

impl Lane {
    /// Binds a validated descriptor to the region and doorbell.
    pub fn new(
        name: &'static str,
        cfg: LaneConfig,
        region: SharedRegion,
        doorbell: DoorbellHandle,
    ) -> Result<Self, ConfigError> {
        cfg.validate(name, region.len())?;
        Ok(Self {
            cfg,
            region,
            doorbell,
            producer: Mutex::new(()),
            consumer: Mutex::new(ConsumerState::default()),
        })
    }

    pub fn config(&self) -> &LaneConfig {
        &self.cfg
    }

    pub fn mode(&self) -> Mode {
        self.cfg.mode()
    }

    fn read_index(&self) -> u32 {
        self.region.load_le32(self.cfg.read)
    }

    fn write_index(&self) -> u32 {
        self.region.load_le32(self.cfg.write)
    }

    pub fn stats(&self) -> LaneStats {
        let read_index = self.read_index();
        let write_index = self.write_index();
        LaneStats { read_index, write_index, pending: write_index.wrapping_sub(read_index) }
    }

    /// Published units the consumer has not released yet.
    pub fn pending(&self) -> u32 {
        self.stats().pending
    }

    /// Largest payload one publish may carry.
    pub fn max_payload(&self) -> usize {
        self.cfg.max_payload()
    }

    /// Claims the next free buffer for the producer.
    ///
    /// No index moves until [`WriteSlot::publish`]; dropping the slot abandons
    /// the claim. The slot holds the producer side of the lane, so concurrent
    /// senders are serialized for the whole acquire/write/publish sequence.
    pub fn acquire_for_write(&self) -> Result<WriteSlot<'_>, Busy> {
        let guard = self.producer.lock();
        let write = self.write_index();
        let used = write.wrapping_sub(self.read_index());
        let capacity = self.cfg.ring_capacity();
        if used >= capacity {
            return Err(Busy);
        }
        let room = match self.cfg.geometry {
            Geometry::Packet { .. } => self.cfg.max_payload(),
            Geometry::Stream => (capacity - used) as usize,
        };
        Ok(WriteSlot { lane: self, _guard: guard, index: write, room })
    }

    /// Asks the peer to re-read the write index.
    ///
    /// Skipped when the transport reports the bit as still pending: the peer
    /// has not drained it yet and will observe the new index when it does.
    pub fn ring_doorbell(&self) {
        fence(Ordering::SeqCst);
        if self.doorbell.is_pending(self.cfg.xfer_bit) {
            debug!("xshm: xfer bit {} already pending, coalesced", self.cfg.xfer_bit);
            return;
        }
        self.doorbell.raise(self.cfg.xfer_bit);
    }

    /// Returns the oldest published buffer, or `None` when nothing is pending.
    ///
    /// In stream mode the view covers every pending byte. Calling `consume`
    /// again before [`release`](Lane::release) returns the same buffer.
    pub fn consume(&self) -> Result<Option<BufferView<'_>>, RingError> {
        let mut state = self.consumer.lock();
        let read = self.read_index();
        let write = self.write_index();
        let avail = self.checked_pending(read, write)?;
        if avail == 0 {
            state.held = None;
            return Ok(None);
        }
        let view = match self.cfg.geometry {
            Geometry::Packet { buf_size, .. } => {
                let slot = self.slot_of(read);
                let len = self.region.load_le32(buf_size + slot * WORD) as usize;
                if len > self.cfg.max_payload() {
                    warn!("xshm: peer recorded {len} bytes in slot {slot}, limit {}", self.cfg.max_payload());
                    return Err(RingError::Corrupt { read, write });
                }
                state.held = Some(1);
                BufferView { lane: self, index: read, len, segments: [(self.slot_offset(slot), len), (0, 0)] }
            }
            Geometry::Stream => {
                state.held = Some(avail);
                let len = avail as usize;
                BufferView { lane: self, index: read, len, segments: self.stream_span(read, len) }
            }
        };
        Ok(Some(view))
    }

    /// Hands the oldest consumed buffer back to the producer.
    ///
    /// Releases one buffer (packet mode) or the bytes returned by the last
    /// [`consume`](Lane::consume) (stream mode), then raises `xfer_done_bit`.
    /// With `more` set the doorbell is deferred while published units remain,
    /// so the release that drains the lane always notifies the producer. The
    /// read index moves either way.
    pub fn release(&self, more: bool) -> Result<(), RingError> {
        let mut state = self.consumer.lock();
        let read = self.read_index();
        let write = self.write_index();
        let avail = self.checked_pending(read, write)?;
        let step = match (state.held.take(), self.cfg.geometry) {
            (Some(held), _) => held.min(avail),
            (None, Geometry::Packet { .. }) => avail.min(1),
            (None, Geometry::Stream) => avail,
        };
        if step == 0 {
            return Err(RingError::Empty);
        }
        self.region.store_le32(self.cfg.read, read.wrapping_add(step));

        if more && avail > step {
            state.done_deferred = true;
            debug!("xshm: done bit {} deferred", self.cfg.xfer_done_bit);
        } else {
            if std::mem::take(&mut state.done_deferred) {
                debug!("xshm: done bit {} covers a deferred batch", self.cfg.xfer_done_bit);
            }
            self.doorbell.raise(self.cfg.xfer_done_bit);
        }
        Ok(())
    }

    /// Drops every published unit; returns how many were pending.
    ///
    /// Used when a session starts so nothing left by an earlier one is
    /// delivered. No doorbell is raised.
    pub fn discard(&self) -> Result<u32, RingError> {
        let mut state = self.consumer.lock();
        let read = self.read_index();
        let write = self.write_index();
        let avail = self.checked_pending(read, write)?;
        state.held = None;
        state.done_deferred = false;
        if avail > 0 {
            self.region.store_le32(self.cfg.read, write);
            debug!("xshm: dropped {avail} stale units");
        }
        Ok(avail)
    }

    /// Stores a state word (see [`state_word`](crate::config::state_word)) in the lane's shared state cell.
    pub fn set_state_word(&self, word: u32) {
        self.region.store_le32(self.cfg.state, word);
    }

    pub fn state_word(&self) -> u32 {
        self.region.load_le32(self.cfg.state)
    }

    pub fn open_state(&self) -> bool {
        is_open_word(self.state_word())
    }

    fn checked_pending(&self, read: u32, write: u32) -> Result<u32, RingError> {
        let avail = write.wrapping_sub(read);
        if avail > self.cfg.ring_capacity() {
            warn!("xshm: lane indices out of bounds (read {read}, write {write})");
            return Err(RingError::Corrupt { read, write });
        }
        Ok(avail)
    }

    fn slot_of(&self, index: u32) -> usize {
        (index & (self.cfg.buffers - 1)) as usize
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.cfg.base + slot * self.cfg.buffer_capacity()
    }

    /// Physical segments covering `len` bytes of the stream starting at `index`.
    fn stream_span(&self, index: u32, len: usize) -> [(usize, usize); 2] {
        let size = self.cfg.ch_size as usize;
        let start = (index & (self.cfg.ch_size - 1)) as usize;
        let first = len.min(size - start);
        [(self.cfg.base + start, first), (self.cfg.base, len - first)]
    }

    fn copy_in(&self, index: u32, pos: usize, data: &[u8]) {
        match self.cfg.geometry {
            Geometry::Packet { .. } => {
                let offset = self.slot_offset(self.slot_of(index)) + pos;
                self.region.write(offset, data);
            }
            Geometry::Stream => {
                let [(a, a_len), (b, _)] = self.stream_span(index.wrapping_add(pos as u32), data.len());
                self.region.write(a, &data[..a_len]);
                if a_len < data.len() {
                    self.region.write(b, &data[a_len..]);
                }
            }
        }
    }
}

/// A buffer claimed by the producer.
pub struct WriteSlot<'a> {
    lane: &'a Lane,
    _guard: MutexGuard<'a, ()>,
    index: u32,
    room: usize,
}

impl WriteSlot<'_> {
    /// Write index this slot will publish.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes that may be written and published through this slot.
    pub fn capacity(&self) -> usize {
        self.room
    }

    /// Copies `data` at byte `pos` of the payload area.
    pub fn write(&mut self, pos: usize, data: &[u8]) -> Result<(), RingError> {
        let end = pos.saturating_add(data.len());
        if end > self.room {
            return Err(RingError::TooLarge { len: end, limit: self.room });
        }
        self.lane.copy_in(self.index, pos, data);
        Ok(())
    }

    /// Makes `len` payload bytes visible to the consumer.
    ///
    /// Packet mode records `len` in the slot's size word and advances the
    /// write index by one; stream mode advances it by `len`. Does not ring
    /// the doorbell.
    pub fn publish(self, len: usize) -> Result<(), RingError> {
        if len > self.room {
            return Err(RingError::TooLarge { len, limit: self.room });
        }
        let lane = self.lane;
        let next = match lane.cfg.geometry {
            Geometry::Packet { buf_size, .. } => {
                let slot = lane.slot_of(self.index);
                lane.region.store_le32(buf_size + slot * WORD, len as u32);
                self.index.wrapping_add(1)
            }
            Geometry::Stream => self.index.wrapping_add(len as u32),
        };
        lane.region.store_le32(lane.cfg.write, next);
        Ok(())
    }
}

/// Read-only view of a published buffer.
pub struct BufferView<'a> {
    lane: &'a Lane,
    index: u32,
    len: usize,
    segments: [(usize, usize); 2],
}

impl BufferView<'_> {
    /// Read index of the buffer.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies up to `buf.len()` payload bytes and returns how many were copied.
    pub fn read_into(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for &(offset, len) in &self.segments {
            let n = len.min(buf.len() - copied);
            if n == 0 {
                continue;
            }
            self.lane.region.read(offset, &mut buf[copied..copied + n]);
            copied += n;
        }
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        self.read_into(&mut out);
        out
    }

    /// Whether the view was taken from `lane`.
    pub fn belongs_to(&self, lane: &Lane) -> bool {
        ptr::eq(self.lane, lane)
    }
}
