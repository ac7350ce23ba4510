// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Open/close lifecycle of one shared memory channel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 14 unit tests
//!
//! PUBLIC API:
//!   - Device: state machine Closed -> Opening -> Open -> Active -> Closed
//!   - ChannelOps: local operations (open, close, ipc_tx, ipc_rx_release)
//!   - DriverCallbacks: notifications toward the driver bound to the channel
//!
//! Each side announces itself by writing an open state word into the state
//! cell of its outbound lane and ringing that lane's xfer bit. The word carries
//! a session count next to the open flag. A device leaves Opening once the
//! peer's state cell (our rx lane) reads open under a session it has not
//! already confirmed, and drops to Closed when the peer word changes while Open
//! or Active: either closed, or reopened behind our back.
//!
//! Closing bumps the local session, and opening drops whatever the peer left
//! in the rx lane, so no payload crosses from one session into the next.
//!
//! Callbacks run without any device lock held, so drivers may call back into
//! the device from inside them. They must not block.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::channel::{Channel, Link};
use crate::config::{bit_mask, is_open_word, state_word, ChannelConfig};
use crate::error::{DeviceError, Result, RingError};
use crate::lane::Busy;
use crate::registry::RegistryHandle;

/// Lifecycle state of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// No client uses the channel.
    Closed,
    /// Opened locally, waiting for the peer.
    Opening,
    /// Both sides open, no payload moved yet.
    Open,
    /// Payload has been published or consumed.
    Active,
}

impl DeviceState {
    /// Whether payload may move in this state.
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Open | Self::Active)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// Notifications delivered to the driver bound to a device.
pub trait DriverCallbacks: Send + Sync {
    /// The peer confirmed the open; the channel is usable.
    fn open_cb(&self);

    /// The peer closed the channel; no further payload may move.
    fn close_cb(&self);

    /// The peer published data on the rx lane. Consume it, then hand each
    /// buffer back with `ipc_rx_release`.
    fn ipc_rx_cb(&self);

    /// The peer released tx buffers. `more` is set when `ipc_rx_cb` follows
    /// immediately.
    fn ipc_tx_release_cb(&self, more: bool);
}

enum Handshake {
    Confirmed,
    RemoteClosed,
}

/// Outcome of a transmit attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Sent,
    /// No tx buffer is free; retry after the next release notification.
    Busy,
}

/// Operations the local driver invokes on a channel.
pub trait ChannelOps {
    /// Takes the channel into use.
    ///
    /// Fails on inconsistent configuration or when the exclusivity group is
    /// held by another open channel; the device then stays closed.
    fn open(&self) -> Result<()>;

    /// Stops using the channel.
    fn close(&self) -> Result<()>;

    /// Queues one payload toward the peer.
    fn ipc_tx(&self, payload: &[u8]) -> Result<TxStatus>;

    /// Returns the oldest received buffer to the peer.
    fn ipc_rx_release(&self, more: bool) -> Result<()>;
}

struct Inner {
    state: DeviceState,
    channel: Option<Arc<Channel>>,
    registered: bool,
    /// Local session count published in our state word.
    session: u32,
    /// Peer word confirmed for the current session.
    peer_word: Option<u32>,
    /// Peer word of an earlier session, until the peer is seen closed.
    stale_peer: Option<u32>,
}

impl Inner {
    fn confirms(&self, peer: u32) -> bool {
        is_open_word(peer) && self.stale_peer != Some(peer)
    }
}

/// One channel and its lifecycle.
pub struct Device {
    config: ChannelConfig,
    link: Link,
    callbacks: Arc<dyn DriverCallbacks>,
    registry: RegistryHandle,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("excl_group", &self.config.excl_group)
            .field("state", &self.state())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        config: ChannelConfig,
        link: Link,
        callbacks: Arc<dyn DriverCallbacks>,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            config,
            link,
            callbacks,
            registry,
            inner: Mutex::new(Inner {
                state: DeviceState::Closed,
                channel: None,
                registered: true,
                session: 0,
                peer_word: None,
                stale_peer: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Static configuration; readable in every state.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// The bound channel while the device is not closed.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.lock().channel.clone()
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.registered {
            return Err(DeviceError::NotFound(self.config.name.clone()));
        }
        if inner.state != DeviceState::Closed {
            return Err(DeviceError::InvalidState(inner.state));
        }
        let channel = Channel::new(self.config.clone(), &self.link).map_err(|err| {
            warn!("xshm: {} rejected: {err}", self.config.name);
            err
        })?;
        self.registry.reserve(self.config.excl_group, &self.config.name)?;
        if let Err(err) = channel.rx().discard() {
            self.registry.release(self.config.excl_group, &self.config.name);
            return Err(err.into());
        }

        let channel = Arc::new(channel);
        channel.tx().set_state_word(state_word(inner.session, true));
        channel.tx().ring_doorbell();
        let peer = channel.rx().state_word();
        if !is_open_word(peer) {
            inner.stale_peer = None;
        }
        let confirmed = inner.confirms(peer);
        inner.state = if confirmed { DeviceState::Open } else { DeviceState::Opening };
        inner.peer_word = confirmed.then_some(peer);
        inner.channel = Some(channel);
        drop(inner);

        info!("xshm: {} opening (group {})", self.config.name, self.config.excl_group);
        if confirmed {
            debug!("xshm: {} peer already open", self.config.name);
            self.callbacks.open_cb();
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let channel = {
            let mut inner = self.inner.lock();
            if inner.state == DeviceState::Closed {
                return Err(DeviceError::InvalidState(DeviceState::Closed));
            }
            // The peer may still show this word when we reopen.
            if let Some(peer) = inner.peer_word.take() {
                inner.stale_peer = Some(peer);
            }
            self.shut_down(&mut inner)
        };
        if let Some(channel) = channel {
            channel.tx().ring_doorbell();
        }
        info!("xshm: {} closed", self.config.name);
        Ok(())
    }

    pub fn ipc_tx(&self, payload: &[u8]) -> Result<TxStatus> {
        let channel = self.usable_channel()?;
        let tx = channel.tx();
        if payload.len() > tx.max_payload() {
            return Err(RingError::TooLarge { len: payload.len(), limit: tx.max_payload() }.into());
        }
        let mut slot = match tx.acquire_for_write() {
            Ok(slot) if slot.capacity() >= payload.len() => slot,
            Ok(_) | Err(Busy) => {
                debug!("xshm: {} tx backpressure", self.config.name);
                return Ok(TxStatus::Busy);
            }
        };
        slot.write(0, payload)?;
        slot.publish(payload.len())?;
        tx.ring_doorbell();
        self.mark_active();
        Ok(TxStatus::Sent)
    }

    /// Copies out the oldest received buffer; `None` when the rx lane is empty.
    ///
    /// The buffer stays owned by this side until [`ipc_rx_release`](Device::ipc_rx_release).
    pub fn consume(&self) -> Result<Option<Vec<u8>>> {
        let channel = self.usable_channel()?;
        let data = channel.rx().consume()?.map(|view| view.to_vec());
        if data.is_some() {
            self.mark_active();
        }
        Ok(data)
    }

    pub fn ipc_rx_release(&self, more: bool) -> Result<()> {
        let channel = self.usable_channel()?;
        channel.rx().release(more)?;
        self.mark_active();
        Ok(())
    }

    /// Notification path: reacts to drained doorbell `bits`.
    ///
    /// Confirms a pending open, detects a remote close, then reports released
    /// tx buffers and pending rx data to the driver. Bits without a matching
    /// state or index change are ignored.
    pub fn handle_doorbell(&self, bits: u32) {
        let (handshake, state, channel) = {
            let mut inner = self.inner.lock();
            let Some(channel) = inner.channel.clone() else {
                return;
            };
            if bits & channel.inbound_bits() == 0 {
                return;
            }
            let peer = channel.rx().state_word();
            if !is_open_word(peer) {
                inner.stale_peer = None;
                // Whatever the peer left behind belongs to a finished session.
                if inner.state == DeviceState::Opening {
                    if let Err(err) = channel.rx().discard() {
                        warn!("xshm: {} rx lane: {err}", self.config.name);
                    }
                }
            }
            let handshake = match inner.state {
                DeviceState::Opening if inner.confirms(peer) => {
                    inner.state = DeviceState::Open;
                    inner.peer_word = Some(peer);
                    Some(Handshake::Confirmed)
                }
                DeviceState::Open | DeviceState::Active if inner.peer_word != Some(peer) => {
                    inner.peer_word = None;
                    inner.stale_peer = None;
                    self.shut_down(&mut inner);
                    Some(Handshake::RemoteClosed)
                }
                _ => None,
            };
            (handshake, inner.state, channel)
        };

        let mut acted = false;
        match handshake {
            Some(Handshake::Confirmed) => {
                info!("xshm: {} open", self.config.name);
                self.callbacks.open_cb();
                acted = true;
            }
            Some(Handshake::RemoteClosed) => {
                // Lets the peer re-read our closed word.
                channel.tx().ring_doorbell();
                info!("xshm: {} closed by peer", self.config.name);
                self.callbacks.close_cb();
                return;
            }
            None => {}
        }
        if state.is_usable() {
            let lanes = channel.config();
            let rx_bit = bit_mask(lanes.rx.xfer_bit).unwrap_or(0);
            let done_bit = bit_mask(lanes.tx.xfer_done_bit).unwrap_or(0);
            let rx_pending = bits & rx_bit != 0 && channel.rx().pending() > 0;
            if bits & done_bit != 0 {
                self.callbacks.ipc_tx_release_cb(rx_pending);
                acted = true;
            }
            if rx_pending {
                self.callbacks.ipc_rx_cb();
                acted = true;
            }
        }
        if !acted {
            trace!("xshm: {} spurious doorbell {bits:#x}", self.config.name);
        }
    }

    fn usable_channel(&self) -> Result<Arc<Channel>> {
        let inner = self.inner.lock();
        match (&inner.channel, inner.state.is_usable()) {
            (Some(channel), true) => Ok(channel.clone()),
            _ => Err(DeviceError::InvalidState(inner.state)),
        }
    }

    fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        true
    }

    fn mark_active(&self) {
        if self.transition(DeviceState::Open, DeviceState::Active) {
            debug!("xshm: {} active", self.config.name);
        }
    }

    /// Moves to Closed with `inner` held: the group hold and the state cell
    /// change together with the state, so a racing `open` sees all or none.
    fn shut_down(&self, inner: &mut Inner) -> Option<Arc<Channel>> {
        let session = inner.session;
        inner.session = session.wrapping_add(1);
        inner.state = DeviceState::Closed;
        self.registry.release(self.config.excl_group, &self.config.name);
        let channel = inner.channel.take();
        if let Some(channel) = &channel {
            channel.tx().set_state_word(state_word(session, false));
        }
        channel
    }

    /// Marks the device unregistered; only legal while closed.
    pub(crate) fn detach(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != DeviceState::Closed {
            return Err(DeviceError::InvalidState(inner.state));
        }
        inner.registered = false;
        Ok(())
    }
}

impl ChannelOps for Device {
    fn open(&self) -> Result<()> {
        Device::open(self)
    }

    fn close(&self) -> Result<()> {
        Device::close(self)
    }

    fn ipc_tx(&self, payload: &[u8]) -> Result<TxStatus> {
        Device::ipc_tx(self, payload)
    }

    fn ipc_rx_release(&self, more: bool) -> Result<()> {
        Device::ipc_rx_release(self, more)
    }
}
