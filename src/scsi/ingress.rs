// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SRB ingress: the entry point the host storage port drives for every
//! request on the adapter. Classifies by SRB function, resolves the target
//! disk and either answers inline, queues backend IO, or runs the abort and
//! reset paths.

use base::debug;
use base::info;
use base::warn;
use zerocopy::IntoBytes;

use crate::adapter::Adapter;
use crate::device::DiskDevice;
use crate::scsi::constants::*;
use crate::scsi::operation;
use crate::scsi::Srb;
use crate::scsi::SrbFunction;
use crate::stats;

/// Minimal device capabilities answered to PNP queries: a removable virtual
/// disk that tolerates surprise removal.
#[repr(C)]
#[derive(Copy, Clone, Default, zerocopy::FromBytes, zerocopy::Immutable, zerocopy::IntoBytes, zerocopy::KnownLayout)]
struct DeviceCapabilities {
    version: u32,
    default_write_cache_enabled: u32,
    silent_install: u32,
    surprise_removal_ok: u32,
    removable: u32,
}

/// Entry point for every SRB the host storage port submits. The SRB is
/// always handed back through the port's `request_complete`, either from
/// this call or later from a dispatcher path.
pub(crate) fn start_io(adapter: &Adapter, mut srb: Srb) {
    debug!(
        "received {:?} request, address {}",
        srb.function(),
        srb.address()
    );

    match srb.function() {
        SrbFunction::ExecuteScsi => {
            if let Some(srb) = execute_scsi(adapter, srb) {
                adapter.port().request_complete(srb);
            }
            return;
        }
        SrbFunction::AbortCommand | SrbFunction::ResetLogicalUnit => {
            let status = drain_device_queues(adapter, &srb);
            srb.set_srb_status(status);
        }
        SrbFunction::ResetDevice => {
            // Kept from the original behavior: a device reset bulk-completes
            // with TIMEOUT rather than aborting record by record.
            let address = srb.address();
            adapter
                .port()
                .complete_all(address.bus, address.target, SRB_STATUS_TIMEOUT);
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        }
        SrbFunction::ResetBus => {
            let address = srb.address();
            adapter
                .port()
                .complete_all(address.bus, address.target, SRB_STATUS_BUS_RESET);
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        }
        SrbFunction::Flush | SrbFunction::Shutdown => {
            // The disk is virtual; backend flushes only happen through
            // SYNCHRONIZE_CACHE.
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        }
        SrbFunction::Pnp => {
            let status = pnp(&mut srb);
            srb.set_srb_status(status);
        }
        SrbFunction::IoControl => {
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        }
    }
    adapter.port().request_complete(srb);
}

/// Handles an EXECUTE_SCSI SRB. Returns the SRB if it completed inline.
fn execute_scsi(adapter: &Adapter, mut srb: Srb) -> Option<Srb> {
    let Some(device) = adapter.find_by_address(srb.address()) else {
        info!("could not find device at {}", srb.address());
        srb.set_srb_status(SRB_STATUS_NO_DEVICE);
        return Some(srb);
    };

    if device.soft_terminated() {
        warn!(
            "disk {} is marked for removal",
            device.instance_name()
        );
        srb.set_srb_status(SRB_STATUS_NO_DEVICE);
        return Some(srb);
    }

    // The lookup reference is held for the whole call, so teardown cannot
    // free the device while a record is being queued against it.
    operation::handle_srb_operation(&device, srb)
}

/// ABORT_COMMAND / RESET_LOGICAL_UNIT: completes everything not yet sent to
/// the backend and marks what was sent as aborted, leaving those records in
/// place until their replies drain (two-stage cancellation).
fn drain_device_queues(adapter: &Adapter, srb: &Srb) -> u8 {
    let Some(device) = adapter.find_by_address(srb.address()) else {
        info!("could not find device at {}", srb.address());
        return SRB_STATUS_NO_DEVICE;
    };

    let pending = device.queues.drain_pending();
    device.abort_requests(&pending, false, adapter.port());
    abort_submitted_requests(&device, adapter);
    SRB_STATUS_SUCCESS
}

/// Marks every submitted record aborted and notifies the host port, without
/// removing the records: a backend that already received the request may
/// still reply, and the reply path must find the record to consume the
/// payload.
fn abort_submitted_requests(device: &DiskDevice, adapter: &Adapter) {
    for req in device.queues.submitted_records() {
        req.with_srb(|srb| {
            srb.set_data_transfer_length(0);
            srb.set_srb_status(SRB_STATUS_ABORTED);
        });
        if req.mark_aborted() {
            stats::inc(&device.stats.aborted_submitted_io_requests);
            device.complete_request(&req, adapter.port());
        }
    }
}

fn pnp(srb: &mut Srb) -> u8 {
    if srb.pnp_adapter_request() {
        warn!("untreated adapter-level PNP request");
        return SRB_STATUS_INVALID_REQUEST;
    }
    let caps = DeviceCapabilities {
        version: 1,
        default_write_cache_enabled: 1,
        silent_install: 1,
        surprise_removal_ok: 1,
        removable: 1,
    };
    if srb.data().len() < std::mem::size_of::<DeviceCapabilities>() {
        return SRB_STATUS_INVALID_REQUEST;
    }
    srb.write_data(caps.as_bytes());
    srb.set_data_transfer_length(std::mem::size_of::<DeviceCapabilities>() as u32);
    SRB_STATUS_SUCCESS
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zerocopy::FromBytes;

    use crate::device::DiskProperties;
    use crate::options::OptionsStore;
    use crate::testing::NullPort;

    use super::*;

    fn adapter_with_port() -> (Arc<NullPort>, Adapter) {
        let port = Arc::new(NullPort::default());
        let adapter = Adapter::new(port.clone(), Arc::new(OptionsStore::new()));
        (port, adapter)
    }

    fn create_disk(adapter: &Adapter) -> crate::ConnectionInfo {
        adapter
            .create_disk(DiskProperties {
                instance_name: "disk-0".to_string(),
                block_count: 2048,
                block_size: 512,
                pid: 1,
                ..Default::default()
            })
            .unwrap()
    }

    fn read10(address: crate::scsi::ScsiAddress, lba: u8, blocks: u8) -> Srb {
        Srb::execute_scsi(
            address,
            &[READ_10, 0, 0, 0, 0, lba, 0, 0, blocks, 0],
            blocks as usize * 512,
        )
    }

    #[test]
    fn missing_device_reports_no_device() {
        let (port, adapter) = adapter_with_port();
        adapter.start_io(read10(crate::scsi::ScsiAddress::new(0, 0, 9), 0, 1));
        let completed = port.completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].srb_status(), SRB_STATUS_NO_DEVICE);
    }

    #[test]
    fn reset_device_bulk_completes_with_timeout() {
        let (port, adapter) = adapter_with_port();
        let info = create_disk(&adapter);
        let address = crate::scsi::ScsiAddress::new(info.bus, info.target, info.lun);

        adapter.start_io(Srb::with_function(SrbFunction::ResetDevice, address));
        assert_eq!(
            port.bulk_completions.lock()[..],
            [(0, 0, SRB_STATUS_TIMEOUT)]
        );

        adapter.start_io(Srb::with_function(SrbFunction::ResetBus, address));
        assert_eq!(
            port.bulk_completions.lock()[1],
            (0, 0, SRB_STATUS_BUS_RESET)
        );
    }

    #[test]
    fn flush_and_shutdown_succeed_immediately() {
        let (port, adapter) = adapter_with_port();
        let info = create_disk(&adapter);
        let address = crate::scsi::ScsiAddress::new(info.bus, info.target, info.lun);

        adapter.start_io(Srb::with_function(SrbFunction::Flush, address));
        adapter.start_io(Srb::with_function(SrbFunction::Shutdown, address));
        let completed = port.completed.lock();
        assert!(completed
            .iter()
            .all(|srb| srb.srb_status() == SRB_STATUS_SUCCESS));
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn abort_drains_pending_and_marks_submitted() {
        let (port, adapter) = adapter_with_port();
        let info = create_disk(&adapter);
        let address = crate::scsi::ScsiAddress::new(info.bus, info.target, info.lun);

        adapter.start_io(read10(address, 0, 1));
        adapter.start_io(read10(address, 1, 1));
        assert_eq!(port.completed.lock().len(), 0);

        adapter.start_io(Srb::with_function(SrbFunction::AbortCommand, address));

        let completed = port.completed.lock();
        // Two aborted IO requests plus the abort SRB itself.
        assert_eq!(completed.len(), 3);
        assert_eq!(
            completed
                .iter()
                .filter(|srb| srb.srb_status() == SRB_STATUS_ABORTED)
                .count(),
            2
        );
        assert!(completed
            .iter()
            .any(|srb| srb.srb_status() == SRB_STATUS_SUCCESS));
    }

    #[test]
    fn pnp_answers_device_capabilities() {
        let (port, adapter) = adapter_with_port();
        let info = create_disk(&adapter);
        let address = crate::scsi::ScsiAddress::new(info.bus, info.target, info.lun);

        let mut srb = Srb::with_function(SrbFunction::Pnp, address);
        srb.set_data_buffer(vec![0; std::mem::size_of::<DeviceCapabilities>()]);
        adapter.start_io(srb);

        let completed = port.completed.lock();
        assert_eq!(completed[0].srb_status(), SRB_STATUS_SUCCESS);
        let caps = DeviceCapabilities::read_from_bytes(completed[0].data()).unwrap();
        assert_eq!(caps.removable, 1);
        assert_eq!(caps.surprise_removal_ok, 1);
    }
}
