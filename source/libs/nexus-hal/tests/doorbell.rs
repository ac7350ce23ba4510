//! CONTEXT: Tests for HAL traits: SharedMemory/Doorbell stubs
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCOPE:
//!   - Word/byte access through the SharedMemory trait object
//!   - Doorbell bit signalling
//!
//! TEST_SCENARIOS:
//!   - word_roundtrip(): store then load a word through a trait object
//!   - doorbell_raise(): raised bits are recorded
//!
//! DEPENDENCIES:
//!   - nexus_hal::{Doorbell, SharedMemory}: HAL trait definitions
//!   - WindowStub, BellStub: Test implementations

use nexus_hal::{Doorbell, SharedMemory};
use std::sync::atomic::{AtomicU32, Ordering};

struct WindowStub([AtomicU32; 2]);

impl SharedMemory for WindowStub {
    fn len(&self) -> usize {
        8
    }

    fn load_le32(&self, offset: usize) -> u32 {
        self.0[offset / 4].load(Ordering::Acquire)
    }

    fn store_le32(&self, offset: usize, value: u32) {
        self.0[offset / 4].store(value, Ordering::Release);
    }

    fn read(&self, _offset: usize, buf: &mut [u8]) {
        buf.fill(0);
    }

    fn write(&self, _offset: usize, _data: &[u8]) {}
}

struct BellStub;
static RAISED: AtomicU32 = AtomicU32::new(0);

impl Doorbell for BellStub {
    fn raise(&self, bit: u8) {
        RAISED.fetch_or(1 << bit, Ordering::SeqCst);
    }
}

#[test]
fn word_roundtrip() {
    let window = WindowStub([AtomicU32::new(0), AtomicU32::new(0)]);
    let dyn_window: &dyn SharedMemory = &window;
    dyn_window.store_le32(4, 7);
    assert_eq!(dyn_window.load_le32(4), 7);
    assert_eq!(dyn_window.load_le32(0), 0);
}

#[test]
fn doorbell_raise() {
    BellStub.raise(0);
    BellStub.raise(5);
    assert_eq!(RAISED.load(Ordering::SeqCst), 0b10_0001);
}
