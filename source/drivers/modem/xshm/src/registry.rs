// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Device registry, exclusivity groups and link readiness
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 10 unit tests, 1 property test
//!
//! The registry owns every device created for a region. Devices reach back
//! into it through a [`RegistryHandle`] to reserve their exclusivity group on
//! open and hand it back on close. Readiness flags record that the modem
//! finished booting the link layers; they are process-wide and only cleared
//! by [`Registry::reset`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::channel::Link;
use crate::config::ChannelConfig;
use crate::device::{Device, DeviceState, DriverCallbacks};
use crate::error::{DeviceError, Result};

/// One-way readiness flags of the link.
#[derive(Debug, Default)]
pub struct LinkReadiness {
    ipc: AtomicBool,
    caif: AtomicBool,
}

impl LinkReadiness {
    /// Marks the IPC layer ready; returns `true` on the first call.
    pub fn notify_ipc_ready(&self) -> bool {
        !self.ipc.swap(true, Ordering::AcqRel)
    }

    /// Marks the CAIF layer ready; returns `true` on the first call.
    pub fn notify_caif_ready(&self) -> bool {
        !self.caif.swap(true, Ordering::AcqRel)
    }

    pub fn ipc_ready(&self) -> bool {
        self.ipc.load(Ordering::Acquire)
    }

    pub fn caif_ready(&self) -> bool {
        self.caif.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.ipc.store(false, Ordering::Release);
        self.caif.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Shared {
    /// Exclusivity group -> name of the device holding it.
    groups: Mutex<HashMap<u32, String>>,
    readiness: LinkReadiness,
}

/// State shared between a registry and its devices.
#[derive(Clone, Default)]
pub struct RegistryHandle {
    shared: Arc<Shared>,
}

impl RegistryHandle {
    /// Takes `group` for `name`, failing while any device holds it, `name`
    /// included.
    pub(crate) fn reserve(&self, group: u32, name: &str) -> Result<()> {
        let mut groups = self.shared.groups.lock();
        if let Some(holder) = groups.get(&group) {
            warn!("xshm: {name} blocked, group {group} held by {holder}");
            return Err(DeviceError::ResourceConflict { group, holder: holder.clone() });
        }
        groups.insert(group, name.to_string());
        Ok(())
    }

    /// Drops `name`'s hold on `group`. Holds of other devices are left alone.
    pub(crate) fn release(&self, group: u32, name: &str) -> bool {
        let mut groups = self.shared.groups.lock();
        match groups.get(&group) {
            Some(holder) if holder == name => {
                groups.remove(&group);
                true
            }
            _ => false,
        }
    }

    /// Name of the device currently holding `group`.
    pub fn group_holder(&self, group: u32) -> Option<String> {
        self.shared.groups.lock().get(&group).cloned()
    }

    pub fn readiness(&self) -> &LinkReadiness {
        &self.shared.readiness
    }
}

#[derive(Default)]
struct DeviceTable {
    by_name: HashMap<String, Arc<Device>>,
    /// Registration order.
    order: Vec<String>,
}

/// Set of devices sharing one region and one group namespace.
#[derive(Default)]
pub struct Registry {
    handle: RegistryHandle,
    devices: Mutex<DeviceTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> &RegistryHandle {
        &self.handle
    }

    /// Creates a closed device for `config`.
    ///
    /// The configuration is validated when the device is opened.
    pub fn register(
        &self,
        config: ChannelConfig,
        link: Link,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<Arc<Device>> {
        let mut table = self.devices.lock();
        if table.by_name.contains_key(&config.name) {
            warn!("xshm: duplicate device {}", config.name);
            return Err(DeviceError::DuplicateName(config.name));
        }
        let name = config.name.clone();
        debug!("xshm: register {name} ({:?}, group {})", config.mode, config.excl_group);
        let device = Arc::new(Device::new(config, link, callbacks, self.handle.clone()));
        table.order.push(name.clone());
        table.by_name.insert(name, device.clone());
        Ok(device)
    }

    /// Removes a closed device.
    pub fn unregister(&self, name: &str) -> Result<Arc<Device>> {
        let mut table = self.devices.lock();
        let device = table.by_name.get(name).cloned().ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
        device.detach()?;
        table.by_name.remove(name);
        table.order.retain(|entry| entry != name);
        debug!("xshm: unregister {name}");
        Ok(device)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.lock().by_name.get(name).cloned()
    }

    /// All devices in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let table = self.devices.lock();
        table.order.iter().filter_map(|name| table.by_name.get(name).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group_holder(&self, group: u32) -> Option<String> {
        self.handle.group_holder(group)
    }

    /// Records that the modem IPC layer is up; `true` the first time.
    pub fn notify_ipc_ready(&self) -> bool {
        let first = self.handle.readiness().notify_ipc_ready();
        if first {
            info!("xshm: ipc ready");
        }
        first
    }

    /// Records that the modem CAIF layer is up; `true` the first time.
    pub fn notify_caif_ready(&self) -> bool {
        let first = self.handle.readiness().notify_caif_ready();
        if first {
            info!("xshm: caif ready");
        }
        first
    }

    pub fn ipc_ready(&self) -> bool {
        self.handle.readiness().ipc_ready()
    }

    pub fn caif_ready(&self) -> bool {
        self.handle.readiness().caif_ready()
    }

    /// Routes drained doorbell bits to every device.
    ///
    /// Each device filters the bits it listens to; no registry lock is held
    /// while driver callbacks run.
    pub fn dispatch(&self, bits: u32) {
        if bits == 0 {
            return;
        }
        for device in self.devices() {
            device.handle_doorbell(bits);
        }
    }

    /// Closes every device that is not closed; returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for device in self.devices() {
            if device.state() == DeviceState::Closed {
                continue;
            }
            match device.close() {
                Ok(()) => closed += 1,
                // Raced with a remote close.
                Err(err) => debug!("xshm: {} already closed: {err}", device.name()),
            }
        }
        closed
    }

    /// Closes and unregisters every device; returns how many were removed.
    pub fn remove_all(&self) -> usize {
        self.close_all();
        let names: Vec<String> = self.devices.lock().order.clone();
        names.iter().filter(|name| self.unregister(name).is_ok()).count()
    }

    /// Returns the registry to its boot state: no devices, no held groups and
    /// cleared readiness.
    pub fn reset(&self) {
        let removed = self.remove_all();
        self.handle.shared.groups.lock().clear();
        self.handle.readiness().clear();
        info!("xshm: registry reset, {removed} devices removed");
    }
}
