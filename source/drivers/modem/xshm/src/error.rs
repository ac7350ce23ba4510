// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for channel configuration, ring access and device lifecycle.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceState;

/// Result alias for device and registry operations.
pub type Result<T> = core::result::Result<T, DeviceError>;

/// Malformed or incompatible ring/channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Channel names are 1..=16 bytes.
    #[error("channel name must be 1..={max} bytes, got {len}")]
    InvalidName { len: usize, max: usize },
    #[error("{lane}: buffer count must be non-zero")]
    NoBuffers { lane: &'static str },
    #[error("{lane}: {what} {value} is not a power of two")]
    NotPowerOfTwo { lane: &'static str, what: &'static str, value: u32 },
    #[error("{lane}: base offset {base:#x} is not aligned to {alignment}")]
    UnalignedBase { lane: &'static str, base: usize, alignment: u32 },
    #[error("{lane}: {buffers} buffers do not fit in {ch_size} bytes")]
    ChannelTooSmall { lane: &'static str, buffers: u32, ch_size: u32 },
    #[error("{lane}: packet mode requires non-zero mtu and packet count")]
    NoPacketGeometry { lane: &'static str },
    #[error("{lane}: mtu {mtu} x {packets} packets exceeds buffer capacity {capacity}")]
    PacketsExceedBuffer { lane: &'static str, mtu: u32, packets: u32, capacity: usize },
    #[error("{lane}: stream mode uses a single ring, got {buffers} buffers")]
    StreamBuffers { lane: &'static str, buffers: u32 },
    #[error("{lane}: stream size {ch_size} is not a multiple of alignment {alignment}")]
    StreamMisaligned { lane: &'static str, ch_size: u32, alignment: u32 },
    #[error("{lane}: {cell} cell at {offset:#x} is misaligned, out of the region or overlaps")]
    BadCell { lane: &'static str, cell: &'static str, offset: usize },
    #[error("{lane}: doorbell bit {bit} out of range")]
    BadDoorbellBit { lane: &'static str, bit: u8 },
    #[error("{lane}: data area {start:#x}..{end:#x} exceeds region of {region} bytes")]
    OutOfRegion { lane: &'static str, start: usize, end: usize, region: usize },
    #[error("rx and tx data areas overlap")]
    LaneOverlap,
    #[error("rx and tx lanes disagree on mode")]
    ModeMismatch,
    #[error("unknown channel mode {0}")]
    UnknownMode(u32),
    #[error("region exhausted: need {needed} bytes, {available} left")]
    RegionExhausted { needed: usize, available: usize },
}

/// Failures reported by a directional lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Nothing is outstanding on the consumer side.
    #[error("ring is empty")]
    Empty,
    /// A payload does not fit the buffer or the ring.
    #[error("payload of {len} bytes exceeds limit {limit}")]
    TooLarge { len: usize, limit: usize },
    /// The peer published indices or sizes that violate the ring bounds.
    #[error("peer indices out of bounds: read {read}, write {write}")]
    Corrupt { read: u32, write: u32 },
}

/// Errors produced by devices and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("invalid channel configuration: {0}")]
    Config(#[from] ConfigError),
    /// The exclusivity group is held by another open device.
    #[error("exclusivity group {group} held by {holder}")]
    ResourceConflict { group: u32, holder: String },
    #[error("device {0} already registered")]
    DuplicateName(String),
    #[error("device {0} not registered")]
    NotFound(String),
    #[error("operation not permitted in state {0}")]
    InvalidState(DeviceState),
    #[error("ring failure: {0}")]
    Ring(#[from] RingError),
}

/// Errors raised while reading channel tables from TOML.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read channel table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse channel table {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse channel table: {0}")]
    Syntax(#[from] toml::de::Error),
}
