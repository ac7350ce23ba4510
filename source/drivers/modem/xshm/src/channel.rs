// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional channel: an rx and a tx lane under one name.

use crate::config::{bit_mask, ChannelConfig, Mode};
use crate::error::ConfigError;
use crate::lane::{DoorbellHandle, Lane, SharedRegion};

/// Shared region and doorbell transport a channel runs over.
#[derive(Clone)]
pub struct Link {
    pub region: SharedRegion,
    pub doorbell: DoorbellHandle,
}

impl Link {
    pub fn new(region: SharedRegion, doorbell: DoorbellHandle) -> Self {
        Self { region, doorbell }
    }
}

/// A validated pair of lanes.
pub struct Channel {
    config: ChannelConfig,
    rx: Lane,
    tx: Lane,
}

impl Channel {
    /// Validates `config` against the link's region and binds both lanes.
    pub fn new(config: ChannelConfig, link: &Link) -> Result<Self, ConfigError> {
        config.validate(link.region.len())?;
        let rx = Lane::new("rx", config.rx.clone(), link.region.clone(), link.doorbell.clone())?;
        let tx = Lane::new("tx", config.tx.clone(), link.region.clone(), link.doorbell.clone())?;
        Ok(Self { config, rx, tx })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn excl_group(&self) -> u32 {
        self.config.excl_group
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn latency(&self) -> u32 {
        self.config.latency
    }

    /// Peer to local lane.
    pub fn rx(&self) -> &Lane {
        &self.rx
    }

    /// Local to peer lane.
    pub fn tx(&self) -> &Lane {
        &self.tx
    }

    /// Doorbell bits the peer raises toward this channel.
    pub fn inbound_bits(&self) -> u32 {
        bit_mask(self.config.rx.xfer_bit).unwrap_or(0) | bit_mask(self.config.tx.xfer_done_bit).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Geometry;
    use crate::host::{DoorbellLatch, HostSharedMemory};
    use crate::layout::{LaneShape, RegionPlanner};
    use std::sync::Arc;

    fn stream_config() -> ChannelConfig {
        let mut planner = RegionPlanner::new(1024);
        let shape = LaneShape::Stream { ch_size: 128, alignment: 4 };
        ChannelConfig {
            name: "at0".into(),
            mode: Mode::Stream,
            excl_group: 2,
            priority: 3,
            latency: 4,
            rx: planner.plan_lane(shape, 0, 1).unwrap(),
            tx: planner.plan_lane(shape, 2, 3).unwrap(),
        }
    }

    fn link() -> Link {
        Link::new(Arc::new(HostSharedMemory::new(1024)), Arc::new(DoorbellLatch::new()))
    }

    #[test]
    fn exposes_identity_and_lanes() {
        let channel = Channel::new(stream_config(), &link()).expect("valid");
        assert_eq!(channel.name(), "at0");
        assert_eq!((channel.excl_group(), channel.priority(), channel.latency()), (2, 3, 4));
        assert_eq!(channel.mode(), Mode::Stream);
        assert_eq!(channel.rx().config().xfer_bit, 0);
        assert_eq!(channel.tx().config().xfer_bit, 2);
        assert_eq!(channel.inbound_bits(), 0b1001);
    }

    #[test]
    fn mismatched_lane_modes_rejected() {
        let mut cfg = stream_config();
        cfg.tx.geometry = Geometry::Packet { mtu: 16, packets: 1, buf_size: 0 };
        assert_eq!(Channel::new(cfg, &link()).err(), Some(ConfigError::ModeMismatch));
    }

    #[test]
    fn peer_sees_local_tx_as_rx() {
        let link = link();
        let local = Channel::new(stream_config(), &link).unwrap();
        let peer = Channel::new(stream_config().mirrored(), &link).unwrap();
        let mut slot = local.tx().acquire_for_write().unwrap();
        slot.write(0, b"ping").unwrap();
        slot.publish(4).unwrap();
        let view = peer.rx().consume().unwrap().expect("data visible to peer");
        assert_eq!(view.to_vec(), b"ping");
    }
}
