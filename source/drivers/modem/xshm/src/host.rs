// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host backends for the HAL seams.
//!
//! Both processors become threads of one process: the region is a slice of
//! atomic words and the doorbell is a pending-bit latch. Used by tests and by
//! host-first bring-up of drivers sitting on top of the channels.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use log::{trace, warn};
use nexus_hal::{Doorbell, SharedMemory};

use crate::config::bit_mask;

const WORD: usize = 4;

/// In-process shared region.
///
/// Byte `i` lives in bits `(i % 4) * 8` of word `i / 4`, which makes the byte
/// view of every word little-endian independent of the host byte order.
pub struct HostSharedMemory {
    words: Box<[AtomicU32]>,
    len: usize,
}

impl HostSharedMemory {
    /// Creates a zero-filled region of `len` bytes.
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(WORD)).map(|_| AtomicU32::new(0)).collect();
        Self { words, len }
    }

    /// Raw byte view of the whole region.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.len];
        self.read(0, &mut bytes);
        bytes
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access {offset:#x}+{len} outside region of {} bytes",
            self.len
        );
    }
}

impl SharedMemory for HostSharedMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn load_le32(&self, offset: usize) -> u32 {
        self.check(offset, WORD);
        debug_assert_eq!(offset % WORD, 0, "unaligned word load");
        self.words[offset / WORD].load(Ordering::Acquire)
    }

    fn store_le32(&self, offset: usize, value: u32) {
        self.check(offset, WORD);
        debug_assert_eq!(offset % WORD, 0, "unaligned word store");
        self.words[offset / WORD].store(value, Ordering::Release);
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        let mut i = 0;
        while i < buf.len() {
            let at = offset + i;
            let word = self.words[at / WORD].load(Ordering::Relaxed);
            if at % WORD == 0 && buf.len() - i >= WORD {
                buf[i..i + WORD].copy_from_slice(&word.to_le_bytes());
                i += WORD;
            } else {
                buf[i] = (word >> ((at % WORD) * 8)) as u8;
                i += 1;
            }
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        let mut i = 0;
        while i < data.len() {
            let at = offset + i;
            let cell = &self.words[at / WORD];
            if at % WORD == 0 && data.len() - i >= WORD {
                let word = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
                cell.store(word, Ordering::Relaxed);
                i += WORD;
            } else {
                // Neighbouring bytes may belong to the other lane's producer.
                let shift = (at % WORD) * 8;
                let mask = 0xffu32 << shift;
                let byte = u32::from(data[i]) << shift;
                let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some((w & !mask) | byte));
                i += 1;
            }
        }
    }
}

/// Pending-bit doorbell carrying one direction of a host simulation.
///
/// Raising a bit that is already pending is coalesced; the receiving side
/// drains the whole mask with [`take`](DoorbellLatch::take) and re-polls the
/// indices of every lane whose bit was set.
#[derive(Debug, Default)]
pub struct DoorbellLatch {
    pending: AtomicU32,
}

impl DoorbellLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `bit`; returns `true` on an unset-to-set edge.
    pub fn ring(&self, bit: u8) -> bool {
        let Some(mask) = bit_mask(bit) else {
            warn!("xshm: doorbell bit {bit} out of range");
            return false;
        };
        self.pending.fetch_or(mask, Ordering::SeqCst) & mask == 0
    }

    /// Drains every pending bit.
    pub fn take(&self) -> u32 {
        let bits = self.pending.swap(0, Ordering::SeqCst);
        // Pairs with the fence in `Lane::ring_doorbell`: index loads after a
        // drain see every store announced by a coalesced ring.
        fence(Ordering::SeqCst);
        bits
    }

    pub fn peek(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Doorbell for DoorbellLatch {
    fn raise(&self, bit: u8) {
        if !self.ring(bit) {
            trace!("xshm: doorbell bit {bit} already pending");
        }
    }

    fn is_pending(&self, bit: u8) -> bool {
        bit_mask(bit).is_some_and(|mask| self.peek() & mask != 0)
    }
}
