// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams for drivers that talk to a peer processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 unit tests
//!
//! PUBLIC API:
//!   - SharedMemory: word and byte access to a window shared with a peer
//!   - Doorbell: out-of-band bit signalling toward the peer

#![cfg_attr(not(test), no_std)]

/// Access to a memory window that another processor reads and writes.
///
/// Offsets are byte offsets from the start of the window. Word cells are
/// 32 bits wide, little-endian in memory and 4-byte aligned.
///
/// Ordering contract: [`store_le32`](SharedMemory::store_le32) must make all
/// earlier [`write`](SharedMemory::write) calls visible to a peer that observes
/// the stored value through [`load_le32`](SharedMemory::load_le32).
pub trait SharedMemory {
    /// Size of the window in bytes.
    fn len(&self) -> usize;

    /// Returns `true` for an empty window.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads a little-endian word with acquire semantics.
    fn load_le32(&self, offset: usize) -> u32;

    /// Stores a little-endian word with release semantics.
    fn store_le32(&self, offset: usize, value: u32);

    /// Copies bytes out of the window.
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copies bytes into the window.
    fn write(&self, offset: usize, data: &[u8]);
}

/// Raises single-bit notifications toward the peer processor.
pub trait Doorbell {
    fn raise(&self, bit: u8);

    /// Returns `true` when `bit` was raised and the peer has not drained it yet.
    ///
    /// Transports that cannot tell report `false`, which disables coalescing.
    fn is_pending(&self, _bit: u8) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{Doorbell, SharedMemory};
    use std::cell::{Cell, RefCell};

    struct MockWindow(RefCell<[u8; 8]>);

    impl SharedMemory for MockWindow {
        fn len(&self) -> usize {
            8
        }

        fn load_le32(&self, offset: usize) -> u32 {
            let mem = self.0.borrow();
            u32::from_le_bytes([mem[offset], mem[offset + 1], mem[offset + 2], mem[offset + 3]])
        }

        fn store_le32(&self, offset: usize, value: u32) {
            self.0.borrow_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn read(&self, offset: usize, buf: &mut [u8]) {
            buf.copy_from_slice(&self.0.borrow()[offset..offset + buf.len()]);
        }

        fn write(&self, offset: usize, data: &[u8]) {
            self.0.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    struct MockBell(Cell<u32>);

    impl Doorbell for MockBell {
        fn raise(&self, bit: u8) {
            self.0.set(self.0.get() | 1 << bit);
        }
    }

    #[test]
    fn word_store_is_little_endian() {
        let window = MockWindow(RefCell::new([0; 8]));
        window.store_le32(4, 0x0102_0304);
        let mut raw = [0u8; 4];
        window.read(4, &mut raw);
        assert_eq!(raw, [4, 3, 2, 1]);
        assert!(!window.is_empty());
    }

    #[test]
    fn doorbell_sets_bit() {
        let bell = MockBell(Cell::new(0));
        bell.raise(3);
        assert_eq!(bell.0.get(), 0b1000);
        assert!(!bell.is_pending(3));
    }
}
