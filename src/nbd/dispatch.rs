// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-disk NBD dispatcher: a request worker draining the pending queue
//! onto the socket and a reply worker matching server replies back to the
//! submitted records.

use std::sync::Arc;

use base::debug;
use base::error;
use base::warn;
use nbd_sys::*;

use crate::device::DiskDevice;
use crate::nbd::client;
use crate::port::StoragePort;
use crate::request::Request;
use crate::scsi::cdb::BackendOp;
use crate::scsi::constants::*;
use crate::stats;

fn nbd_request_type(op: BackendOp) -> Option<u32> {
    match op {
        BackendOp::Read => Some(NBD_CMD_READ),
        BackendOp::Write => Some(NBD_CMD_WRITE),
        BackendOp::Flush => Some(NBD_CMD_FLUSH),
        BackendOp::Unmap => Some(NBD_CMD_TRIM),
        // Reservations have no NBD transport encoding.
        BackendOp::PersistResIn | BackendOp::PersistResOut => None,
    }
}

/// Transmits one record on the worker's duplicated socket handle. The
/// record must already be on the submitted queue so that a fast reply always
/// finds it.
fn transmit(
    device: &DiskDevice,
    sock: &std::net::TcpStream,
    req: &Request,
    request_type: u32,
) -> client::Result<()> {
    // Re-check the live slot so no new transmission starts once a disconnect
    // pulled the socket; an in-flight send is interrupted by the shutdown.
    if !device.live_socket_present() {
        return Err(client::Error::Disconnected(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "socket closed",
        )));
    }
    if req.op() == BackendOp::Write {
        let mut scratch = device.write_buffer.lock();
        req.with_srb(|srb| {
            client::send_write(
                sock,
                request_type,
                req.tag(),
                req.offset(),
                &srb.data()[..req.length() as usize],
                &mut scratch,
            )
        })
        // The SRB vanishes only after a completion, which cannot have
        // happened for a record we have not transmitted yet.
        .unwrap_or_else(|| {
            Err(client::Error::Disconnected(std::io::Error::new(
                std::io::ErrorKind::Other,
                "request completed before transmission",
            )))
        })
    } else {
        client::send_command(sock, request_type, req.tag(), req.offset(), req.length())
    }
}

/// Request worker: dequeues pending records, assigns tags, inserts them into
/// the submitted queue and transmits them in order.
pub(crate) fn run_request_worker(device: Arc<DiskDevice>, port: Arc<dyn StoragePort>) {
    let Some(sock) = device.clone_live_socket() else {
        return;
    };
    while !device.hard_terminated() {
        let Some(req) = device.queues.wait_pending() else {
            break;
        };

        req.set_tag(device.next_tag());
        debug!(
            "disk {}: processing request, tag {:#x}",
            device.instance_name(),
            req.tag()
        );

        // Capabilities may have changed since ingress accepted the request.
        if !device.validate_io(req.op()) {
            req.with_srb(|srb| {
                srb.set_data_transfer_length(0);
                srb.set_srb_status(SRB_STATUS_INVALID_REQUEST);
            });
            device.complete_request(&req, port.as_ref());
            stats::dec(&device.stats.unsubmitted_io_requests);
            continue;
        }

        let Some(mut request_type) = nbd_request_type(req.op()) else {
            req.with_srb(|srb| srb.set_srb_status(SRB_STATUS_INVALID_REQUEST));
            device.complete_request(&req, port.as_ref());
            stats::dec(&device.stats.unsubmitted_io_requests);
            continue;
        };
        if matches!(req.op(), BackendOp::Write | BackendOp::Unmap)
            && req.fua()
            && device.flags().fua_supported
        {
            request_type |= NBD_CMD_FLAG_FUA;
        }

        if device.hard_terminated() {
            return;
        }

        // Insert before sending: the reply must never race an untracked
        // record.
        device.queues.push_submitted(req.clone());

        let result = transmit(&device, &sock, &req, request_type);
        stats::dec(&device.stats.unsubmitted_io_requests);
        stats::inc(&device.stats.total_submitted_io_requests);
        stats::inc(&device.stats.pending_submitted_io_requests);

        if let Err(e) = result {
            warn!(
                "disk {}: transmission failed for tag {:#x}: {}",
                device.instance_name(),
                req.tag(),
                e
            );
            device.disconnect_async(true);
            break;
        }
    }
}

enum ReplyOutcome {
    Continue,
    Shutdown,
}

fn process_one_reply(
    device: &DiskDevice,
    sock: &std::net::TcpStream,
    port: &dyn StoragePort,
) -> ReplyOutcome {
    let (nbd_error, tag) = match client::read_reply(sock) {
        Ok(reply) => reply,
        Err(e) => {
            debug!("disk {}: reply read failed: {}", device.instance_name(), e);
            device.disconnect_async(true);
            return ReplyOutcome::Shutdown;
        }
    };

    let Some(req) = device.queues.remove_submitted(tag) else {
        error!(
            "disk {}: received reply with no matching request tag: {:#x}",
            device.instance_name(),
            tag
        );
        device.disconnect_async(true);
        return ReplyOutcome::Shutdown;
    };

    if req.is_aborted() {
        warn!(
            "disk {}: received reply for aborted request, tag {:#x}",
            device.instance_name(),
            tag
        );
    }

    if nbd_error == 0 && req.op() == BackendOp::Read {
        // The payload must be consumed even for aborted records; it belongs
        // to this reply regardless of who still wants it.
        let mut scratch = device.read_buffer.lock();
        let length = req.length() as usize;
        if scratch.len() < length {
            scratch.resize(length, 0);
        }
        if let Err(e) = client::read_payload(sock, &mut scratch[..length]) {
            error!(
                "disk {}: failed receiving reply payload for tag {:#x}: {}",
                device.instance_name(),
                tag,
                e
            );
            req.with_srb(|srb| {
                srb.set_data_transfer_length(0);
                srb.set_srb_status(SRB_STATUS_INTERNAL_ERROR);
            });
            device.disconnect_async(true);
            finish_reply(device, &req, port);
            return ReplyOutcome::Shutdown;
        }
        if !req.is_aborted() {
            req.with_srb(|srb| {
                srb.write_data(&scratch[..length]);
            });
        }
    }

    if nbd_error != 0 {
        debug!(
            "disk {}: NBD reply carries error {} for tag {:#x}",
            device.instance_name(),
            nbd_error,
            tag
        );
        req.with_srb(|srb| {
            srb.set_data_transfer_length(0);
            srb.set_srb_status(SRB_STATUS_ABORTED);
        });
    } else {
        let length = req.length();
        req.with_srb(|srb| {
            srb.set_data_transfer_length(length);
            srb.set_srb_status(SRB_STATUS_SUCCESS);
        });
    }

    finish_reply(device, &req, port);
    ReplyOutcome::Continue
}

fn finish_reply(device: &DiskDevice, req: &Arc<Request>, port: &dyn StoragePort) {
    stats::inc(&device.stats.total_received_io_replies);
    stats::dec(&device.stats.pending_submitted_io_requests);
    if req.is_aborted() {
        stats::inc(&device.stats.completed_aborted_io_requests);
    }
    device.complete_request(req, port);
}

/// Reply worker: reads one reply header at a time off a duplicated socket
/// handle and routes it to the submitted record carrying the echoed tag.
pub(crate) fn run_reply_worker(device: Arc<DiskDevice>, port: Arc<dyn StoragePort>) {
    let Some(sock) = device.clone_live_socket() else {
        return;
    };
    while !device.hard_terminated() {
        match process_one_reply(&device, &sock, port.as_ref()) {
            ReplyOutcome::Continue => {}
            ReplyOutcome::Shutdown => break,
        }
    }
}
