// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The adapter: disk registry, SCSI address allocation, disk lifecycle and
//! the control operations exposed to management callers.

use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use base::error;
use base::info;
use base::warn;
use sync::Condvar;
use sync::Mutex;

use crate::device::DiskDevice;
use crate::device::DiskProperties;
use crate::device::NbdWorkerHandles;
use crate::device::MAX_NAME_LENGTH;
use crate::device::MAX_OWNER_LENGTH;
use crate::nbd;
use crate::options::OptionsStore;
use crate::port::StoragePort;
use crate::port::DEFAULT_BLOCK_SIZE;
use crate::port::MAX_BUSES;
use crate::port::MAX_LUNS_PER_TARGET;
use crate::port::MAX_TARGETS_PER_BUS;
use crate::rundown::RundownRef;
use crate::scsi;
use crate::scsi::ScsiAddress;
use crate::scsi::Srb;
use crate::stats::DiskStatsSnapshot;
use crate::userio;
use crate::Error;
use crate::Result;

const SLOT_COUNT: usize =
    MAX_BUSES as usize * MAX_TARGETS_PER_BUS as usize * MAX_LUNS_PER_TARGET as usize;

/// Resolved identity of a mapped disk, returned by create, show and list.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub properties: DiskProperties,
    pub bus: u8,
    pub target: u8,
    pub lun: u8,
    pub connection_id: u64,
    pub disk_number: i32,
    pub pnp_device_id: String,
}

impl ConnectionInfo {
    fn from_device(device: &DiskDevice) -> ConnectionInfo {
        let address = device.address();
        ConnectionInfo {
            properties: device.current_properties(),
            bus: address.bus,
            target: address.target,
            lun: address.lun,
            connection_id: device.connection_id(),
            disk_number: device.disk_number(),
            pnp_device_id: device.pnp_device_id(),
        }
    }
}

/// A registry lookup result holding the disk's rundown reference; dropping
/// the guard releases it. Unacquired devices must not be used.
pub struct DiskRef {
    device: Arc<DiskDevice>,
}

impl Deref for DiskRef {
    type Target = DiskDevice;

    fn deref(&self) -> &DiskDevice {
        &self.device
    }
}

impl Drop for DiskRef {
    fn drop(&mut self) {
        self.device.rundown.release();
    }
}

struct Registry {
    devices: Vec<Arc<DiskDevice>>,
    slots: [bool; SLOT_COUNT],
}

impl Default for Registry {
    fn default() -> Registry {
        Registry {
            devices: Vec::new(),
            slots: [false; SLOT_COUNT],
        }
    }
}

impl Registry {
    fn allocate_slot(&mut self) -> Option<ScsiAddress> {
        let index = self.slots.iter().position(|used| !used)?;
        self.slots[index] = true;
        let luns = MAX_LUNS_PER_TARGET as usize;
        let targets = MAX_TARGETS_PER_BUS as usize;
        Some(ScsiAddress {
            bus: (index / (targets * luns)) as u8,
            target: (index / luns % targets) as u8,
            lun: (index % luns) as u8,
        })
    }

    fn release_slot(&mut self, address: ScsiAddress) {
        let luns = MAX_LUNS_PER_TARGET as usize;
        let targets = MAX_TARGETS_PER_BUS as usize;
        let index = (address.bus as usize * targets + address.target as usize) * luns
            + address.lun as usize;
        self.slots[index] = false;
    }
}

struct AdapterInner {
    port: Arc<dyn StoragePort>,
    options: Arc<OptionsStore>,
    registry: Mutex<Registry>,
    rundown: RundownRef,
    global_removal: AtomicBool,
    next_connection_id: AtomicU64,
    active_creations: Mutex<u64>,
    creations_idle: Condvar,
}

/// The virtual storage adapter. One per process; owns every mapped disk.
///
/// `Adapter` is a cheap handle; clones share the same state, which the
/// per-disk monitor threads hold on to for the duration of their disk.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    pub fn new(port: Arc<dyn StoragePort>, options: Arc<OptionsStore>) -> Adapter {
        Adapter {
            inner: Arc::new(AdapterInner {
                port,
                options,
                registry: Mutex::new(Registry::default()),
                rundown: RundownRef::new(),
                global_removal: AtomicBool::new(false),
                next_connection_id: AtomicU64::new(0),
                active_creations: Mutex::new(0),
                creations_idle: Condvar::new(),
            }),
        }
    }

    pub fn options(&self) -> &OptionsStore {
        &self.inner.options
    }

    pub(crate) fn port(&self) -> &dyn StoragePort {
        self.inner.port.as_ref()
    }

    fn port_handle(&self) -> Arc<dyn StoragePort> {
        self.inner.port.clone()
    }

    /// Entry point for every SRB submitted by the host storage port.
    pub fn start_io(&self, srb: Srb) {
        scsi::start_io(self, srb);
    }

    fn acquire(device: &Arc<DiskDevice>) -> Option<DiskRef> {
        device.rundown.try_acquire().then(|| DiskRef {
            device: device.clone(),
        })
    }

    /// Looks a disk up by SCSI address, acquiring its rundown reference.
    /// Disks in teardown behave as if they did not exist.
    pub fn find_by_address(&self, address: ScsiAddress) -> Option<DiskRef> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .find(|device| device.address() == address)
            .and_then(Self::acquire)
    }

    pub fn find_by_connection_id(&self, connection_id: u64) -> Option<DiskRef> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .find(|device| device.connection_id() == connection_id)
            .and_then(Self::acquire)
    }

    pub fn find_by_instance_name(&self, instance_name: &str) -> Option<DiskRef> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .find(|device| device.instance_name() == instance_name)
            .and_then(Self::acquire)
    }

    fn instance_name_in_use(&self, instance_name: &str) -> bool {
        self.inner
            .registry
            .lock()
            .devices
            .iter()
            .any(|device| device.instance_name() == instance_name)
    }

    fn validate_properties(props: &DiskProperties, negotiated_geometry: bool) -> Result<()> {
        if props.instance_name.is_empty() || props.instance_name.len() >= MAX_NAME_LENGTH {
            return Err(Error::InvalidParameter(
                "invalid instance name".to_string(),
            ));
        }
        if props.serial_number.len() >= MAX_NAME_LENGTH {
            return Err(Error::InvalidParameter(
                "serial number too long".to_string(),
            ));
        }
        if props.owner.len() >= MAX_OWNER_LENGTH {
            return Err(Error::InvalidParameter("owner string too long".to_string()));
        }
        if negotiated_geometry {
            // Geometry is filled in by NBD negotiation.
            return Ok(());
        }
        if props.block_size == 0 || !props.block_size.is_power_of_two() {
            return Err(Error::InvalidParameter(format!(
                "invalid block size: {}",
                props.block_size
            )));
        }
        if props.block_count == 0 || props.block_count > u64::MAX / props.block_size as u64 {
            return Err(Error::InvalidParameter(format!(
                "invalid block count: {}",
                props.block_count
            )));
        }
        Ok(())
    }

    /// Maps a new disk and publishes it to the host storage port.
    pub fn create_disk(&self, mut props: DiskProperties) -> Result<ConnectionInfo> {
        let _creation_gate = self.enter_creation_gate();

        if !self.inner.options.get_bool("NewMappingsAllowed") {
            warn!(
                "new mappings are not currently allowed; check the NewMappingsAllowed option"
            );
            return Err(Error::ShutdownInProgress);
        }
        // The adapter reference is handed over to the disk's monitor on
        // success and released on every error path below.
        if self.inner.global_removal.load(Ordering::Acquire) || !self.inner.rundown.try_acquire()
        {
            warn!("the adapter is being removed");
            return Err(Error::ShutdownInProgress);
        }

        match self.create_disk_slotted(&mut props) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.inner.rundown.release();
                Err(e)
            }
        }
    }

    fn create_disk_slotted(&self, props: &mut DiskProperties) -> Result<ConnectionInfo> {
        let negotiate = props.flags.use_nbd
            && props.nbd.as_ref().map_or(true, |nbd| !nbd.skip_negotiation);
        Self::validate_properties(props, negotiate)?;

        if props.serial_number.is_empty() {
            props.serial_number = props.instance_name.clone();
        }

        if self.instance_name_in_use(&props.instance_name) {
            return Err(Error::NameCollision(props.instance_name.clone()));
        }

        let Some(address) = self.inner.registry.lock().allocate_slot() else {
            return Err(Error::ResourceExhausted(
                "no free SCSI address slots".to_string(),
            ));
        };

        match self.setup_disk(props, address) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.inner.registry.lock().release_slot(address);
                Err(e)
            }
        }
    }

    fn setup_disk(
        &self,
        props: &mut DiskProperties,
        address: ScsiAddress,
    ) -> Result<ConnectionInfo> {
        let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "new device address: {}, connection id: {}, instance name: {}",
            address, connection_id, props.instance_name
        );

        let mut socket = None;
        if props.flags.use_nbd {
            let nbd_props = props.nbd.clone().ok_or_else(|| {
                Error::InvalidParameter("NBD connection properties required".to_string())
            })?;
            info!(
                "connecting to NBD server {}:{}, export name: {}",
                nbd_props.hostname, nbd_props.port, nbd_props.export_name
            );
            let mut sock = nbd::client::connect(&nbd_props.hostname, nbd_props.port)?;
            if !nbd_props.skip_negotiation {
                let export = nbd::client::negotiate(&mut sock, &nbd_props.export_name)?;
                info!("negotiated export size: {}", export.size);
                if props.block_size == 0 {
                    props.block_size = DEFAULT_BLOCK_SIZE;
                }
                props.block_count = export.size / props.block_size as u64;
                export.apply_to(&mut props.flags);
            }
            Self::validate_properties(props, false)?;
            socket = Some(sock);
        }

        let device = Arc::new(DiskDevice::new(props.clone(), address, connection_id));

        if let Some(sock) = socket {
            device.install_socket(sock);
            device.preallocate_buffers();
            self.start_nbd_workers(&device)?;
        }
        if let Err(e) = self.start_monitor(&device) {
            // The workers are already running; wind them down before
            // unwinding the creation.
            device.request_removal(true);
            device.disconnect_socket();
            device.join_workers();
            device.close_socket();
            return Err(e);
        }

        self.inner.registry.lock().devices.push(device.clone());
        self.inner.port.bus_change_detected();

        // A disk slipping in during adapter shutdown must still observe the
        // global removal.
        if self.inner.global_removal.load(Ordering::Acquire) {
            device.removal_event().signal();
        }

        Ok(ConnectionInfo::from_device(&device))
    }

    fn start_nbd_workers(&self, device: &Arc<DiskDevice>) -> Result<()> {
        let request_result = {
            let device = device.clone();
            let port = self.port_handle();
            thread::Builder::new()
                .name("sbridge_nbd_req".to_string())
                .spawn(move || nbd::dispatch::run_request_worker(device, port))
        };
        let request = match request_result {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to spawn the NBD request worker: {}", e);
                return Err(Error::ResourceExhausted(format!(
                    "could not spawn the NBD request worker: {}",
                    e
                )));
            }
        };

        let reply_done = base::Event::new();
        let reply_result = {
            let device = device.clone();
            let port = self.port_handle();
            let reply_done = reply_done.clone();
            thread::Builder::new()
                .name("sbridge_nbd_reply".to_string())
                .spawn(move || {
                    nbd::dispatch::run_reply_worker(device, port);
                    reply_done.signal();
                })
        };
        let reply = match reply_result {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to spawn the NBD reply worker: {}", e);
                // Wind the request worker down before reporting the failure.
                device.request_removal(true);
                if request.join().is_err() {
                    error!(
                        "disk {}: request worker panicked",
                        device.instance_name()
                    );
                }
                device.close_socket();
                return Err(Error::ResourceExhausted(format!(
                    "could not spawn the NBD reply worker: {}",
                    e
                )));
            }
        };

        *device.workers.lock() = Some(NbdWorkerHandles {
            request,
            reply,
            reply_done,
        });
        Ok(())
    }

    /// Starts the per-disk monitor, which owns the teardown sequence from
    /// the removal signal to the registry removal.
    fn start_monitor(&self, device: &Arc<DiskDevice>) -> Result<()> {
        let adapter = self.clone();
        let device = device.clone();
        match thread::Builder::new()
            .name("sbridge_monitor".to_string())
            .spawn(move || adapter.run_monitor(device))
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("failed to spawn the disk monitor: {}", e);
                Err(Error::ResourceExhausted(format!(
                    "could not spawn the disk monitor: {}",
                    e
                )))
            }
        }
    }

    fn run_monitor(self, device: Arc<DiskDevice>) {
        device.removal_event().wait();

        info!("cleaning up device connection: {}", device.instance_name());

        // Past this point the removal is not graceful anymore; whoever wanted
        // a soft removal has already quiesced the disk.
        device.request_removal(true);
        device.disconnect_socket();

        // Wait until nothing is actively touching the device.
        device.rundown.wait_for_release();

        if device.flags().use_nbd {
            device.join_workers();
        }

        let submitted = device.queues.drain_submitted();
        device.abort_requests(&submitted, true, self.port());
        let pending = device.queues.drain_pending();
        device.abort_requests(&pending, false, self.port());

        device.close_socket();

        {
            let mut registry = self.inner.registry.lock();
            registry
                .devices
                .retain(|other| !Arc::ptr_eq(other, &device));
            registry.release_slot(device.address());
        }
        self.inner.port.bus_change_detected();

        device.departed_event().signal();

        // Allow the adapter to unload once the last disk is gone.
        self.inner.rundown.release();
    }

    /// Requests removal of a disk and waits until it has been torn down and
    /// unregistered. A second removal of the same name reports not-found.
    pub fn remove_disk(&self, instance_name: &str, hard: bool) -> Result<()> {
        let device = self
            .find_by_instance_name(instance_name)
            .ok_or(Error::NotFound)?;
        info!("disconnecting disk: {} (hard: {})", instance_name, hard);
        let departed = device.departed_event().clone();
        if hard {
            device.request_removal(true);
        } else {
            device.removal_event().signal();
        }
        drop(device);
        departed.wait();
        Ok(())
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .map(|device| ConnectionInfo::from_device(device))
            .collect()
    }

    pub fn show(&self, instance_name: &str) -> Result<ConnectionInfo> {
        let device = self
            .find_by_instance_name(instance_name)
            .ok_or(Error::NotFound)?;
        Ok(ConnectionInfo::from_device(&device))
    }

    pub fn stats(&self, instance_name: &str) -> Result<DiskStatsSnapshot> {
        let device = self
            .find_by_instance_name(instance_name)
            .ok_or(Error::NotFound)?;
        Ok(device.stats.snapshot())
    }

    /// Updates the block count of a live disk.
    pub fn set_disk_size(&self, connection_id: u64, block_count: u64) -> Result<()> {
        let device = self
            .find_by_connection_id(connection_id)
            .ok_or(Error::NotFound)?;
        if block_count == 0 || block_count > u64::MAX / device.block_size() as u64 {
            return Err(Error::InvalidParameter(format!(
                "invalid block count: {}",
                block_count
            )));
        }
        info!(
            "resized disk {}: block count {} -> {}",
            device.instance_name(),
            device.block_count(),
            block_count
        );
        device.set_block_count(block_count);
        Ok(())
    }

    /// Fetches the next IO request of a user-space backed disk. See
    /// [`crate::IoRequest`].
    pub fn fetch_request(
        &self,
        caller_pid: u32,
        connection_id: u64,
        data_buf: &mut [u8],
    ) -> Result<userio::IoRequest> {
        let device = self
            .find_by_connection_id(connection_id)
            .ok_or(Error::NotFound)?;
        userio::fetch_request(&device, self.port(), caller_pid, data_buf)
    }

    /// Submits a backend response for a previously fetched request. See
    /// [`crate::IoResponse`].
    pub fn send_response(
        &self,
        caller_pid: u32,
        connection_id: u64,
        response: &userio::IoResponse,
        data_buf: &[u8],
    ) -> Result<()> {
        let device = self
            .find_by_connection_id(connection_id)
            .ok_or(Error::NotFound)?;
        userio::send_response(&device, self.port(), caller_pid, response, data_buf)
    }

    fn enter_creation_gate(&self) -> CreationGate {
        *self.inner.active_creations.lock() += 1;
        CreationGate { inner: &self.inner }
    }

    /// Blocks until no create operation is in flight. Used when disabling
    /// new mappings, so that the disable does not race an ongoing create.
    pub fn wait_creations_idle(&self) {
        let mut active = self.inner.active_creations.lock();
        while *active > 0 {
            active = self.inner.creations_idle.wait(active);
        }
    }

    /// Tears down every disk and blocks until the adapter is quiescent.
    /// New creates are rejected from the moment this starts.
    pub fn shutdown(&self) {
        self.inner.global_removal.store(true, Ordering::Release);
        let devices: Vec<_> = self.inner.registry.lock().devices.clone();
        for device in &devices {
            device.removal_event().signal();
        }
        self.inner.rundown.wait_for_release();
        if !self.inner.registry.lock().devices.is_empty() {
            error!("adapter shutdown finished with devices still registered");
        }
    }
}

struct CreationGate<'a> {
    inner: &'a AdapterInner,
}

impl Drop for CreationGate<'_> {
    fn drop(&mut self) {
        let mut active = self.inner.active_creations.lock();
        *active -= 1;
        if *active == 0 {
            self.inner.creations_idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::device::DiskFlags;
    use crate::testing::NullPort;

    use super::*;

    fn adapter() -> Adapter {
        Adapter::new(Arc::new(NullPort::default()), Arc::new(OptionsStore::new()))
    }

    fn props(name: &str) -> DiskProperties {
        DiskProperties {
            instance_name: name.to_string(),
            block_count: 2048,
            block_size: 512,
            pid: 42,
            flags: DiskFlags::default(),
            ..Default::default()
        }
    }

    #[test]
    fn create_show_remove_cycle() {
        let adapter = adapter();
        let info = adapter.create_disk(props("disk-a")).unwrap();
        assert_eq!(info.connection_id, 1);
        assert_eq!((info.bus, info.target, info.lun), (0, 0, 0));
        assert_eq!(info.properties.serial_number, "disk-a");

        let shown = adapter.show("disk-a").unwrap();
        assert_eq!(shown.properties, info.properties);

        adapter.remove_disk("disk-a", true).unwrap();
        assert!(matches!(adapter.show("disk-a"), Err(Error::NotFound)));
        assert!(matches!(
            adapter.remove_disk("disk-a", true),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn duplicate_instance_name_is_rejected() {
        let adapter = adapter();
        adapter.create_disk(props("disk-a")).unwrap();
        assert!(matches!(
            adapter.create_disk(props("disk-a")),
            Err(Error::NameCollision(_))
        ));
        adapter.remove_disk("disk-a", true).unwrap();
    }

    #[test]
    fn addresses_are_reused_after_removal() {
        let adapter = adapter();
        let a = adapter.create_disk(props("disk-a")).unwrap();
        let b = adapter.create_disk(props("disk-b")).unwrap();
        assert_eq!((a.bus, a.target, a.lun), (0, 0, 0));
        assert_eq!((b.bus, b.target, b.lun), (0, 0, 1));

        adapter.remove_disk("disk-a", true).unwrap();
        let c = adapter.create_disk(props("disk-c")).unwrap();
        assert_eq!((c.bus, c.target, c.lun), (0, 0, 0));
        // Connection ids are never reused.
        assert_eq!(c.connection_id, 3);
    }

    #[test]
    fn slot_indexing_covers_targets() {
        let mut registry = Registry::default();
        for lun in 0..MAX_LUNS_PER_TARGET {
            let address = registry.allocate_slot().unwrap();
            assert_eq!(address, ScsiAddress::new(0, 0, lun));
        }
        assert_eq!(registry.allocate_slot().unwrap(), ScsiAddress::new(0, 1, 0));
        registry.release_slot(ScsiAddress::new(0, 0, 7));
        assert_eq!(registry.allocate_slot().unwrap(), ScsiAddress::new(0, 0, 7));
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let adapter = adapter();
        let mut bad = props("disk-a");
        bad.block_size = 0;
        assert!(matches!(
            adapter.create_disk(bad),
            Err(Error::InvalidParameter(_))
        ));
        let mut bad = props("disk-a");
        bad.block_size = 513;
        assert!(adapter.create_disk(bad).is_err());
        let mut bad = props("disk-a");
        bad.block_count = u64::MAX / 2;
        assert!(adapter.create_disk(bad).is_err());
    }

    #[test]
    fn create_rejected_when_mappings_disallowed() {
        let options = Arc::new(OptionsStore::new());
        options
            .set(
                "NewMappingsAllowed",
                crate::options::OptionValue::Bool(false),
                false,
            )
            .unwrap();
        let adapter = Adapter::new(Arc::new(NullPort::default()), options);
        assert!(matches!(
            adapter.create_disk(props("disk-a")),
            Err(Error::ShutdownInProgress)
        ));
    }

    #[test]
    fn shutdown_removes_all_disks() {
        let adapter = adapter();
        adapter.create_disk(props("disk-a")).unwrap();
        adapter.create_disk(props("disk-b")).unwrap();
        adapter.shutdown();
        assert!(adapter.list().is_empty());
        assert!(matches!(
            adapter.create_disk(props("disk-c")),
            Err(Error::ShutdownInProgress)
        ));
    }

    #[test]
    fn set_disk_size_updates_geometry() {
        let adapter = adapter();
        let info = adapter.create_disk(props("disk-a")).unwrap();
        adapter.set_disk_size(info.connection_id, 4096).unwrap();
        let shown = adapter.show("disk-a").unwrap();
        assert_eq!(shown.properties.block_count, 4096);
        assert!(matches!(
            adapter.set_disk_size(999, 4096),
            Err(Error::NotFound)
        ));
        adapter.remove_disk("disk-a", true).unwrap();
    }
}
