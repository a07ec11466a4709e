// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The user-space IO exchange: a process that owns a disk plays the backend
//! role through a pair of coarse operations, fetching one request at a time
//! and submitting one response at a time. Payloads travel through a caller
//! supplied data buffer in both directions.

use std::sync::Arc;

use base::debug;
use base::warn;
use static_assertions::const_assert_eq;
use zerocopy::IntoBytes;

use crate::device::DiskDevice;
use crate::port::StoragePort;
use crate::scsi::cdb;
use crate::scsi::cdb::BackendOp;
use crate::scsi::constants::*;
use crate::scsi::SenseData;
use crate::stats;
use crate::Error;
use crate::Result;

/// One deallocation range delivered through the data buffer of an unmap
/// request. Only one descriptor is sent at a time.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    zerocopy::FromBytes,
    zerocopy::Immutable,
    zerocopy::IntoBytes,
    zerocopy::KnownLayout,
)]
pub struct UnmapDescriptor {
    pub block_address: u64,
    pub block_count: u32,
    pub reserved: u32,
}
const_assert_eq!(std::mem::size_of::<UnmapDescriptor>(), 16);

/// Request descriptor returned by [`fetch_request`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoRequestCmd {
    Read {
        block_address: u64,
        block_count: u32,
        fua: bool,
    },
    Write {
        block_address: u64,
        block_count: u32,
        fua: bool,
    },
    Flush {
        block_address: u64,
        block_count: u32,
    },
    Unmap {
        count: u32,
        anchor: bool,
    },
    PersistResIn {
        service_action: u8,
        allocation_length: u16,
    },
    PersistResOut {
        service_action: u8,
        scope: u8,
        res_type: u8,
        parameter_list_length: u16,
    },
    /// The disk is going away; the caller should stop fetching and clean up.
    Disconnect,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoRequest {
    pub tag: u64,
    pub cmd: IoRequestCmd,
}

/// SCSI-level outcome reported by the backend for one request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoStatus {
    pub scsi_status: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoResponse {
    pub tag: u64,
    pub status: IoStatus,
}

fn check_caller(device: &DiskDevice, caller_pid: u32) -> Result<()> {
    if device.pid() != caller_pid {
        debug!(
            "disk {}: control call from pid {} rejected, owner is {}",
            device.instance_name(),
            caller_pid,
            device.pid()
        );
        return Err(Error::AccessDenied);
    }
    if device.flags().use_nbd {
        debug!(
            "disk {}: direct IO is not allowed on NBD devices",
            device.instance_name()
        );
        return Err(Error::AccessDenied);
    }
    Ok(())
}

/// Blocks until an IO request is available on the disk and returns its
/// descriptor, delivering any write payload through `data_buf`.
///
/// Requests that fail validation are completed inline and skipped. When the
/// disk is being removed a synthetic [`IoRequestCmd::Disconnect`] descriptor
/// is returned so the caller can exit cleanly.
pub(crate) fn fetch_request(
    device: &DiskDevice,
    port: &dyn StoragePort,
    caller_pid: u32,
    data_buf: &mut [u8],
) -> Result<IoRequest> {
    check_caller(device, caller_pid)?;

    while !device.hard_terminated() {
        let Some(req) = device.queues.wait_pending() else {
            break;
        };

        if device.hard_terminated() {
            // Teardown raced the dequeue; the record would otherwise escape
            // the queue drains.
            device.abort_requests(&[req], false, port);
            stats::dec(&device.stats.unsubmitted_io_requests);
            break;
        }

        req.set_tag(device.next_tag());
        debug!(
            "disk {}: dispatching request, tag {:#x}, type {:?}",
            device.instance_name(),
            req.tag(),
            req.op()
        );

        if !device.validate_io(req.op()) {
            req.with_srb(|srb| {
                srb.set_data_transfer_length(0);
                srb.set_srb_status(SRB_STATUS_INVALID_REQUEST);
            });
            device.complete_request(&req, port);
            stats::dec(&device.stats.unsubmitted_io_requests);
            continue;
        }

        let block_size = device.block_size() as u64;
        let fua_supported = device.flags().fua_supported;
        let cmd = match req.op() {
            BackendOp::Read => IoRequestCmd::Read {
                block_address: req.offset() / block_size,
                block_count: (req.length() as u64 / block_size) as u32,
                fua: req.fua() && fua_supported,
            },
            BackendOp::Write => IoRequestCmd::Write {
                block_address: req.offset() / block_size,
                block_count: (req.length() as u64 / block_size) as u32,
                fua: req.fua() && fua_supported,
            },
            BackendOp::Flush => IoRequestCmd::Flush {
                block_address: req.offset() / block_size,
                block_count: (req.length() as u64 / block_size) as u32,
            },
            BackendOp::Unmap => {
                // The data buffer must fit the descriptor; it is sized by the
                // maximum transfer length in any sane caller.
                let descriptor = UnmapDescriptor {
                    block_address: req.offset() / block_size,
                    block_count: (req.length() as u64 / block_size) as u32,
                    reserved: 0,
                };
                let needed = std::mem::size_of::<UnmapDescriptor>();
                if data_buf.len() < needed {
                    fail_and_complete(device, &req, port, SRB_STATUS_INTERNAL_ERROR);
                    return Err(Error::BufferTooSmall {
                        required: needed as u64,
                    });
                }
                data_buf[..needed].copy_from_slice(descriptor.as_bytes());
                let anchor = req
                    .with_srb(|srb| cdb::unmap_anchor(srb.cdb()))
                    .unwrap_or(false);
                IoRequestCmd::Unmap { count: 1, anchor }
            }
            BackendOp::PersistResIn => {
                let (service_action, allocation_length) = req
                    .with_srb(|srb| cdb::persist_res_in_fields(srb.cdb()))
                    .unwrap_or_default();
                IoRequestCmd::PersistResIn {
                    service_action,
                    allocation_length,
                }
            }
            BackendOp::PersistResOut => {
                let (service_action, scope, res_type, parameter_list_length) = req
                    .with_srb(|srb| cdb::persist_res_out_fields(srb.cdb()))
                    .unwrap_or_default();
                IoRequestCmd::PersistResOut {
                    service_action,
                    scope,
                    res_type,
                    parameter_list_length,
                }
            }
        };

        // Outbound payloads are copied into the caller's buffer.
        if matches!(req.op(), BackendOp::Write | BackendOp::PersistResOut) {
            let length = req.length() as usize;
            if data_buf.len() < length {
                fail_and_complete(device, &req, port, SRB_STATUS_INTERNAL_ERROR);
                return Err(Error::BufferTooSmall {
                    required: length as u64,
                });
            }
            let copied =
                req.with_srb(|srb| data_buf[..length].copy_from_slice(&srb.data()[..length]));
            if copied.is_none() {
                // Completed out from under us; skip it.
                stats::dec(&device.stats.unsubmitted_io_requests);
                continue;
            }
        }

        device.queues.push_submitted(req.clone());
        stats::inc(&device.stats.total_submitted_io_requests);
        stats::inc(&device.stats.pending_submitted_io_requests);
        stats::dec(&device.stats.unsubmitted_io_requests);

        return Ok(IoRequest {
            tag: req.tag(),
            cmd,
        });
    }

    Ok(IoRequest {
        tag: 0,
        cmd: IoRequestCmd::Disconnect,
    })
}

fn fail_and_complete(
    device: &DiskDevice,
    req: &Arc<crate::request::Request>,
    port: &dyn StoragePort,
    status: u8,
) {
    req.with_srb(|srb| srb.set_srb_status(status));
    device.complete_request(req, port);
    stats::dec(&device.stats.unsubmitted_io_requests);
}

/// Submits the backend's response for a previously fetched request,
/// correlating by tag. Read-style payloads are copied out of `data_buf`,
/// zero-filling whatever the backend did not provide.
pub(crate) fn send_response(
    device: &DiskDevice,
    port: &dyn StoragePort,
    caller_pid: u32,
    response: &IoResponse,
    data_buf: &[u8],
) -> Result<()> {
    check_caller(device, caller_pid)?;

    let Some(req) = device.queues.remove_submitted(response.tag) else {
        debug!(
            "disk {}: received response with no matching request tag: {:#x}",
            device.instance_name(),
            response.tag
        );
        return Err(Error::NotFound);
    };

    if req.is_aborted() {
        debug!(
            "disk {}: received response for aborted request, tag {:#x}",
            device.instance_name(),
            response.tag
        );
    }

    let data_in = matches!(req.op(), BackendOp::Read | BackendOp::PersistResIn);
    if response.status.scsi_status == GOOD && data_in && !req.is_aborted() {
        let length = req.length() as usize;
        let provided = data_buf.len().min(length);
        req.with_srb(|srb| {
            srb.data_mut()[..provided].copy_from_slice(&data_buf[..provided]);
            if provided < length {
                srb.data_mut()[provided..length].fill(0);
            }
        });
    }

    if response.status.scsi_status != GOOD {
        warn!(
            "disk {}: response carries scsi status {:#04x} for tag {:#x}",
            device.instance_name(),
            response.status.scsi_status,
            response.tag
        );
        req.with_srb(|srb| {
            srb.fail(
                SRB_STATUS_ERROR,
                Some(SenseData {
                    key: response.status.sense_key,
                    asc: response.status.asc,
                    ascq: response.status.ascq,
                    information: response.status.information,
                }),
            );
        });
    } else {
        let length = req.length();
        req.with_srb(|srb| {
            srb.set_data_transfer_length(length);
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        });
    }

    stats::inc(&device.stats.total_received_io_replies);
    stats::dec(&device.stats.pending_submitted_io_requests);
    if req.is_aborted() {
        stats::inc(&device.stats.completed_aborted_io_requests);
    }
    device.complete_request(&req, port);
    Ok(())
}
