// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: External shared memory (xshm) channels between the host and a modem processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests per module; host two-sided integration tests under tests/
//!
//! PUBLIC API:
//! - `Lane`: single-producer/single-consumer ring inside the shared region
//! - `Channel`: named rx/tx lane pair
//! - `Device` / `ChannelOps` / `DriverCallbacks`: channel lifecycle toward drivers
//! - `Registry`: device set with exclusivity groups and link readiness
//! - `XshmConfig` / `RegionPlanner`: channel tables and region layout
//! - `HostSharedMemory` / `DoorbellLatch`: in-process backends for the HAL seams
//!
//! NOTE:
//! - Mapping the region and wiring the doorbell interrupt are board glue; this
//!   crate only sees them through `nexus_hal::{SharedMemory, Doorbell}`.
//! - Every shared word is little-endian.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod lane;
pub mod layout;
pub mod registry;

pub use channel::{Channel, Link};
pub use config::{
    is_open_word, state_word, ChannelConfig, Geometry, LaneConfig, Mode, XshmConfig, DOORBELL_BITS, NAME_MAX,
    XSHM_CLOSED, XSHM_OPEN,
};
pub use device::{ChannelOps, Device, DeviceState, DriverCallbacks, TxStatus};
pub use error::{ConfigError, ConfigLoadError, DeviceError, Result, RingError};
pub use host::{DoorbellLatch, HostSharedMemory};
pub use lane::{BufferView, Busy, DoorbellHandle, Lane, LaneStats, SharedRegion, WriteSlot};
pub use layout::{LaneShape, RegionPlanner};
pub use registry::{LinkReadiness, Registry, RegistryHandle};
