// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sequential carving of a shared region into lane descriptors.
//!
//! Each planned lane gets its control words first (state, read, write and,
//! in packet mode, one size word per buffer) followed by its aligned data area.

use crate::config::{Geometry, LaneConfig};
use crate::error::ConfigError;

const WORD: usize = 4;

/// Requested shape of one lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneShape {
    Packet { buffers: u32, ch_size: u32, alignment: u32, mtu: u32, packets: u32 },
    Stream { ch_size: u32, alignment: u32 },
}

/// Bump allocator over a region of fixed size.
#[derive(Debug)]
pub struct RegionPlanner {
    size: usize,
    cursor: usize,
}

impl RegionPlanner {
    pub fn new(size: usize) -> Self {
        Self { size, cursor: 0 }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    /// Total region size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn take(&mut self, len: usize, align: usize) -> Result<usize, ConfigError> {
        let align = align.max(1);
        let start = self.cursor.div_ceil(align) * align;
        let end = start.checked_add(len).filter(|&end| end <= self.size).ok_or(
            ConfigError::RegionExhausted { needed: (start - self.cursor) + len, available: self.remaining() },
        )?;
        self.cursor = end;
        Ok(start)
    }

    /// Reserves control words and data area for a lane and returns its descriptor.
    ///
    /// The descriptor is not validated; [`LaneConfig::validate`] still applies.
    pub fn plan_lane(
        &mut self,
        shape: LaneShape,
        xfer_bit: u8,
        xfer_done_bit: u8,
    ) -> Result<LaneConfig, ConfigError> {
        let state = self.take(WORD, WORD)?;
        let read = self.take(WORD, WORD)?;
        let write = self.take(WORD, WORD)?;
        let (buffers, ch_size, alignment, geometry) = match shape {
            LaneShape::Packet { buffers, ch_size, alignment, mtu, packets } => {
                let buf_size = self.take(buffers as usize * WORD, WORD)?;
                (buffers, ch_size, alignment, Geometry::Packet { mtu, packets, buf_size })
            }
            LaneShape::Stream { ch_size, alignment } => (1, ch_size, alignment, Geometry::Stream),
        };
        let base = self.take(ch_size as usize, alignment as usize)?;
        Ok(LaneConfig {
            base,
            buffers,
            ch_size,
            alignment,
            xfer_bit,
            xfer_done_bit,
            state,
            read,
            write,
            geometry,
        })
    }
}
