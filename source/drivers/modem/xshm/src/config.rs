// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Static channel configuration: one [`LaneConfig`] per direction, paired in a
//! [`ChannelConfig`], and TOML loading of whole channel tables.
//!
//! All offsets are byte offsets from the start of the shared region. The
//! region itself is allocated and mapped by the boot glue; these types only
//! describe how a channel is laid out inside it.

use std::fs;
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::error::{ConfigError, ConfigLoadError};

/// Maximum length of a channel name in bytes.
pub const NAME_MAX: usize = 16;

/// Value of a lane state cell while its producer has the channel open.
pub const XSHM_OPEN: u32 = 1;
/// Value of a lane state cell while its producer has the channel closed.
pub const XSHM_CLOSED: u32 = 0;

/// Builds a lane state cell value.
///
/// Bit 0 holds [`XSHM_OPEN`] or [`XSHM_CLOSED`]; the remaining bits count the
/// producer's sessions, so a peer can tell a close-then-reopen it never saw
/// from the session it confirmed.
pub const fn state_word(session: u32, open: bool) -> u32 {
    session.wrapping_shl(1) | if open { XSHM_OPEN } else { XSHM_CLOSED }
}

/// Whether a state cell value announces an open producer.
pub const fn is_open_word(word: u32) -> bool {
    word & XSHM_OPEN != 0
}

/// Number of distinct doorbell bits.
pub const DOORBELL_BITS: u8 = 32;

const WORD: usize = 4;

/// Mask for a doorbell bit, `None` when out of range.
pub fn bit_mask(bit: u8) -> Option<u32> {
    (bit < DOORBELL_BITS).then(|| 1u32 << bit)
}

/// Transfer discipline of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Discrete buffer slots with a recorded payload length each.
    Packet,
    /// One byte ring without framing.
    Stream,
}

impl Mode {
    /// Decodes the numeric mode used by platform tables (1 = packet, 2 = stream).
    pub fn from_raw(raw: u32) -> Result<Self, ConfigError> {
        match raw {
            1 => Ok(Self::Packet),
            2 => Ok(Self::Stream),
            other => Err(ConfigError::UnknownMode(other)),
        }
    }

    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Packet => 1,
            Self::Stream => 2,
        }
    }
}

/// Mode-specific geometry of a lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geometry {
    /// `mtu` bytes per packet, at most `packets` packets per buffer, and the
    /// offset of the per-buffer size array.
    Packet { mtu: u32, packets: u32, buf_size: usize },
    Stream,
}

/// Shared ring descriptor for one direction of a channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaneConfig {
    /// Start of the data area.
    pub base: usize,
    /// Buffer slots (packet mode) or 1 (stream mode).
    pub buffers: u32,
    /// Size of the data area in bytes.
    pub ch_size: u32,
    /// Alignment of every payload start.
    pub alignment: u32,
    /// Bit raised by the producer after moving the write index.
    pub xfer_bit: u8,
    /// Bit raised by the consumer after moving the read index.
    pub xfer_done_bit: u8,
    /// Offset of the open/closed state cell.
    pub state: usize,
    /// Offset of the read index cell.
    pub read: usize,
    /// Offset of the write index cell.
    pub write: usize,
    pub geometry: Geometry,
}

impl LaneConfig {
    pub fn mode(&self) -> Mode {
        match self.geometry {
            Geometry::Packet { .. } => Mode::Packet,
            Geometry::Stream => Mode::Stream,
        }
    }

    /// Bytes available to one buffer slot.
    ///
    /// Packet slots are `ch_size / buffers` rounded down to the alignment;
    /// stream mode has a single slot spanning the whole data area.
    pub fn buffer_capacity(&self) -> usize {
        match self.geometry {
            Geometry::Packet { .. } => {
                if self.buffers == 0 || self.alignment == 0 {
                    return 0;
                }
                let raw = (self.ch_size / self.buffers) as usize;
                raw - raw % self.alignment as usize
            }
            Geometry::Stream => self.ch_size as usize,
        }
    }

    /// Largest payload a single publish may carry.
    pub fn max_payload(&self) -> usize {
        match self.geometry {
            Geometry::Packet { mtu, packets, .. } => {
                (u64::from(mtu) * u64::from(packets)).min(self.buffer_capacity() as u64) as usize
            }
            Geometry::Stream => self.ch_size as usize,
        }
    }

    /// Number of units the ring holds: buffers in packet mode, bytes in stream mode.
    pub fn ring_capacity(&self) -> u32 {
        match self.geometry {
            Geometry::Packet { .. } => self.buffers,
            Geometry::Stream => self.ch_size,
        }
    }

    pub(crate) fn data_end(&self) -> usize {
        self.base.saturating_add(self.ch_size as usize)
    }

    /// Checks the descriptor against a region of `region_len` bytes.
    pub fn validate(&self, lane: &'static str, region_len: usize) -> Result<(), ConfigError> {
        if self.buffers == 0 {
            return Err(ConfigError::NoBuffers { lane });
        }
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { lane, what: "alignment", value: self.alignment });
        }
        if self.base % self.alignment as usize != 0 {
            return Err(ConfigError::UnalignedBase { lane, base: self.base, alignment: self.alignment });
        }
        for bit in [self.xfer_bit, self.xfer_done_bit] {
            if bit >= DOORBELL_BITS {
                return Err(ConfigError::BadDoorbellBit { lane, bit });
            }
        }
        if self.data_end() > region_len {
            return Err(ConfigError::OutOfRegion {
                lane,
                start: self.base,
                end: self.data_end(),
                region: region_len,
            });
        }

        match self.geometry {
            Geometry::Packet { mtu, packets, .. } => {
                if mtu == 0 || packets == 0 {
                    return Err(ConfigError::NoPacketGeometry { lane });
                }
                // Indices are free-running u32 counters; the slot is index & (buffers - 1).
                if !self.buffers.is_power_of_two() {
                    return Err(ConfigError::NotPowerOfTwo { lane, what: "buffer count", value: self.buffers });
                }
                let capacity = self.buffer_capacity();
                if capacity == 0 {
                    return Err(ConfigError::ChannelTooSmall {
                        lane,
                        buffers: self.buffers,
                        ch_size: self.ch_size,
                    });
                }
                if u64::from(mtu) * u64::from(packets) > capacity as u64 {
                    return Err(ConfigError::PacketsExceedBuffer { lane, mtu, packets, capacity });
                }
            }
            Geometry::Stream => {
                if self.buffers != 1 {
                    return Err(ConfigError::StreamBuffers { lane, buffers: self.buffers });
                }
                if self.ch_size == 0 {
                    return Err(ConfigError::ChannelTooSmall { lane, buffers: 1, ch_size: 0 });
                }
                if !self.ch_size.is_power_of_two() {
                    return Err(ConfigError::NotPowerOfTwo { lane, what: "stream size", value: self.ch_size });
                }
                if self.ch_size % self.alignment != 0 {
                    return Err(ConfigError::StreamMisaligned {
                        lane,
                        ch_size: self.ch_size,
                        alignment: self.alignment,
                    });
                }
            }
        }

        self.validate_cells(lane, region_len)
    }

    fn cells(&self) -> Vec<(&'static str, usize, usize)> {
        let mut cells = vec![
            ("state", self.state, WORD),
            ("read", self.read, WORD),
            ("write", self.write, WORD),
        ];
        if let Geometry::Packet { buf_size, .. } = self.geometry {
            cells.push(("buf_size", buf_size, self.buffers as usize * WORD));
        }
        cells
    }

    fn validate_cells(&self, lane: &'static str, region_len: usize) -> Result<(), ConfigError> {
        let cells = self.cells();
        for (i, &(cell, offset, len)) in cells.iter().enumerate() {
            let end = offset.saturating_add(len);
            let bad = offset % WORD != 0
                || end > region_len
                || overlaps(offset, end, self.base, self.data_end())
                || cells[..i].iter().any(|&(_, o, l)| overlaps(offset, end, o, o + l));
            if bad {
                return Err(ConfigError::BadCell { lane, cell, offset });
            }
        }
        Ok(())
    }
}

fn overlaps(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}

/// A bidirectional channel: two lanes under one identity.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub mode: Mode,
    /// Channels sharing a group are never open at the same time.
    #[serde(default)]
    pub excl_group: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub latency: u32,
    /// Modem to host.
    pub rx: LaneConfig,
    /// Host to modem.
    pub tx: LaneConfig,
}

impl ChannelConfig {
    /// Validates the name, the lane pair and each lane against the region.
    pub fn validate(&self, region_len: usize) -> Result<(), ConfigError> {
        let len = self.name.len();
        if len == 0 || len > NAME_MAX {
            return Err(ConfigError::InvalidName { len, max: NAME_MAX });
        }
        if self.rx.mode() != self.mode || self.tx.mode() != self.mode {
            return Err(ConfigError::ModeMismatch);
        }
        self.rx.validate("rx", region_len)?;
        self.tx.validate("tx", region_len)?;
        if overlaps(self.rx.base, self.rx.data_end(), self.tx.base, self.tx.data_end()) {
            return Err(ConfigError::LaneOverlap);
        }
        for (lane, this, other) in [("rx", &self.rx, &self.tx), ("tx", &self.tx, &self.rx)] {
            let taken = other.cells();
            for (cell, offset, len) in this.cells() {
                let end = offset + len;
                let hit = overlaps(offset, end, other.base, other.data_end())
                    || taken.iter().any(|&(_, o, l)| overlaps(offset, end, o, o + l));
                if hit {
                    return Err(ConfigError::BadCell { lane, cell, offset });
                }
            }
        }
        Ok(())
    }

    /// The same channel as seen from the other processor: rx and tx swapped.
    pub fn mirrored(&self) -> Self {
        Self { rx: self.tx.clone(), tx: self.rx.clone(), ..self.clone() }
    }
}

/// A table of channels, as shipped in a platform TOML file.
///
/// ```toml
/// [[channel]]
/// name = "caif0"
/// mode = "stream"
/// excl_group = 1
///
/// [channel.rx]
/// base = 64
/// # ...
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XshmConfig {
    #[serde(rename = "channel", default)]
    pub channels: Vec<ChannelConfig>,
}

impl XshmConfig {
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigLoadError> {
        Ok(toml::from_str(data)?)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigLoadError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&data).map_err(|source| ConfigLoadError::Parse { path: path.to_path_buf(), source })
    }

    /// Validates every channel; the first failure is returned with its channel name.
    pub fn validate(&self, region_len: usize) -> Result<(), (String, ConfigError)> {
        for channel in &self.channels {
            if let Err(err) = channel.validate(region_len) {
                warn!("xshm: channel {} rejected: {err}", channel.name);
                return Err((channel.name.clone(), err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_lane(base: usize, ctrl: usize) -> LaneConfig {
        LaneConfig {
            base,
            buffers: 4,
            ch_size: 1024,
            alignment: 8,
            xfer_bit: 0,
            xfer_done_bit: 1,
            state: ctrl,
            read: ctrl + 4,
            write: ctrl + 8,
            geometry: Geometry::Packet { mtu: 128, packets: 2, buf_size: ctrl + 12 },
        }
    }

    fn channel() -> ChannelConfig {
        let mut tx = packet_lane(2048, 32);
        tx.xfer_bit = 2;
        tx.xfer_done_bit = 3;
        ChannelConfig {
            name: "caif0".into(),
            mode: Mode::Packet,
            excl_group: 1,
            priority: 0,
            latency: 0,
            rx: packet_lane(1024, 0),
            tx,
        }
    }

    #[test]
    fn valid_channel_passes() {
        channel().validate(4096).expect("valid");
    }

    #[test]
    fn buffer_capacity_rounds_to_alignment() {
        let mut lane = packet_lane(1024, 0);
        lane.ch_size = 1000;
        assert_eq!(lane.buffer_capacity(), 248);
        assert_eq!(lane.max_payload(), 248);
    }

    #[test]
    fn packets_exceeding_buffer_rejected() {
        let mut cfg = channel();
        cfg.rx.geometry = Geometry::Packet { mtu: 200, packets: 2, buf_size: 12 };
        assert_eq!(
            cfg.validate(4096),
            Err(ConfigError::PacketsExceedBuffer { lane: "rx", mtu: 200, packets: 2, capacity: 256 })
        );
    }

    #[test]
    fn mode_mismatch_rejected() {
        let mut cfg = channel();
        cfg.tx.geometry = Geometry::Stream;
        cfg.tx.buffers = 1;
        assert_eq!(cfg.validate(4096), Err(ConfigError::ModeMismatch));
    }

    #[test]
    fn cell_inside_data_area_rejected() {
        let mut cfg = channel();
        cfg.rx.read = 1028;
        assert_eq!(
            cfg.validate(4096),
            Err(ConfigError::BadCell { lane: "rx", cell: "read", offset: 1028 })
        );
    }

    #[test]
    fn overlapping_cells_rejected() {
        let mut cfg = channel();
        cfg.tx.write = cfg.tx.read;
        assert!(matches!(cfg.validate(4096), Err(ConfigError::BadCell { cell: "write", .. })));
    }

    #[test]
    fn cell_inside_other_lane_data_rejected() {
        let mut cfg = channel();
        cfg.rx.read = 2048;
        assert_eq!(
            cfg.validate(4096),
            Err(ConfigError::BadCell { lane: "rx", cell: "read", offset: 2048 })
        );
    }

    #[test]
    fn cells_shared_between_lanes_rejected() {
        let mut cfg = channel();
        cfg.tx.state = cfg.rx.write;
        assert_eq!(
            cfg.validate(4096),
            Err(ConfigError::BadCell { lane: "rx", cell: "write", offset: 8 })
        );
    }

    #[test]
    fn state_word_packs_session_above_flag() {
        assert_eq!(state_word(0, true), XSHM_OPEN);
        assert_eq!(state_word(0, false), XSHM_CLOSED);
        assert_eq!(state_word(2, true), 5);
        assert!(is_open_word(state_word(7, true)));
        assert!(!is_open_word(state_word(7, false)));
    }

    #[test]
    fn lane_outside_region_rejected() {
        assert!(matches!(channel().validate(2048), Err(ConfigError::OutOfRegion { lane: "tx", .. })));
    }

    #[test]
    fn name_length_enforced() {
        let mut cfg = channel();
        cfg.name = "a-very-long-channel-name".into();
        assert!(matches!(cfg.validate(4096), Err(ConfigError::InvalidName { .. })));
        cfg.name.clear();
        assert!(matches!(cfg.validate(4096), Err(ConfigError::InvalidName { len: 0, .. })));
    }

    #[test]
    fn stream_lane_requires_single_ring() {
        let mut cfg = channel();
        cfg.mode = Mode::Stream;
        cfg.rx.geometry = Geometry::Stream;
        cfg.tx.geometry = Geometry::Stream;
        assert_eq!(
            cfg.validate(4096),
            Err(ConfigError::StreamBuffers { lane: "rx", buffers: 4 })
        );
        cfg.rx.buffers = 1;
        cfg.tx.buffers = 1;
        cfg.validate(4096).expect("stream channel valid");
    }

    #[test]
    fn raw_modes_decode() {
        assert_eq!(Mode::from_raw(1), Ok(Mode::Packet));
        assert_eq!(Mode::from_raw(2), Ok(Mode::Stream));
        assert_eq!(Mode::from_raw(7), Err(ConfigError::UnknownMode(7)));
        assert_eq!(Mode::Stream.as_raw(), 2);
    }

    #[test]
    fn mirrored_swaps_lanes() {
        let cfg = channel();
        let peer = cfg.mirrored();
        assert_eq!(peer.rx, cfg.tx);
        assert_eq!(peer.tx, cfg.rx);
        assert_eq!(peer.name, cfg.name);
    }

    #[test]
    fn parses_toml_table() {
        let table = r#"
            [[channel]]
            name = "at0"
            mode = "stream"
            excl_group = 3
            priority = 1

            [channel.rx]
            base = 64
            buffers = 1
            ch_size = 256
            alignment = 4
            xfer_bit = 0
            xfer_done_bit = 1
            state = 0
            read = 4
            write = 8
            geometry = "stream"

            [channel.tx]
            base = 320
            buffers = 1
            ch_size = 256
            alignment = 4
            xfer_bit = 2
            xfer_done_bit = 3
            state = 12
            read = 16
            write = 20
            geometry = "stream"
        "#;
        let cfg = XshmConfig::from_toml_str(table).expect("parses");
        assert_eq!(cfg.channels.len(), 1);
        let channel = &cfg.channels[0];
        assert_eq!(channel.excl_group, 3);
        assert_eq!(channel.latency, 0);
        assert_eq!(channel.tx.mode(), Mode::Stream);
        cfg.validate(1024).expect("valid table");
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let err = XshmConfig::from_toml_str("[[channel]]\nname = \"x\"\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Syntax(_)));
    }
}
