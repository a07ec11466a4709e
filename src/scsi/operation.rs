// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! EXECUTE_SCSI handling: inline responses for the discovery commands and
//! the pend path that turns IO commands into queued backend requests.

use std::sync::Arc;

use base::debug;
use base::warn;

use crate::device::DiskDevice;
use crate::port::MAX_TRANSFER_LENGTH;
use crate::request::Request;
use crate::scsi::cdb;
use crate::scsi::cdb::BackendOp;
use crate::scsi::constants::*;
use crate::scsi::SenseData;
use crate::scsi::Srb;
use crate::stats;

const INQUIRY_VENDOR_ID: &str = "WNBD";
const INQUIRY_PRODUCT_ID: &str = "WNBD_DISK";

/// Handles one EXECUTE_SCSI request against `device`. Inline commands come
/// back as `Some(srb)` for the caller to complete; IO commands are queued and
/// the SRB ownership moves into the pending record (`None`).
pub(crate) fn handle_srb_operation(device: &DiskDevice, mut srb: Srb) -> Option<Srb> {
    let opcode = srb.opcode();
    debug!(
        "disk {}: processing {} command ({:#04x})",
        device.instance_name(),
        opcode_str(opcode),
        opcode
    );

    match opcode {
        READ_6 | READ_10 | READ_12 | READ_16 | WRITE_6 | WRITE_10 | WRITE_12 | WRITE_16
        | SYNCHRONIZE_CACHE_10 | SYNCHRONIZE_CACHE_16 | UNMAP | PERSISTENT_RESERVE_IN
        | PERSISTENT_RESERVE_OUT => pend_operation(device, srb),

        INQUIRY => {
            inquiry(device, &mut srb);
            Some(srb)
        }
        MODE_SENSE_6 | MODE_SENSE_10 => {
            mode_sense(&mut srb);
            Some(srb)
        }
        READ_CAPACITY_10 | READ_CAPACITY_16 => {
            read_capacity(device, &mut srb);
            Some(srb)
        }
        TEST_UNIT_READY | VERIFY_10 => {
            srb.set_srb_status(SRB_STATUS_SUCCESS);
            Some(srb)
        }
        _ => {
            debug!(
                "disk {}: unsupported operation {:#04x}",
                device.instance_name(),
                opcode
            );
            srb.fail(
                SRB_STATUS_INVALID_REQUEST,
                Some(SenseData::new(
                    ILLEGAL_REQUEST,
                    ASC_INVALID_COMMAND_OPERATION_CODE,
                    0,
                )),
            );
            Some(srb)
        }
    }
}

/// Derives the backend byte range requested by an IO command.
fn io_range(device: &DiskDevice, srb: &Srb, op: BackendOp) -> Result<(u64, u32, bool), ()> {
    let block_size = device.block_size() as u64;
    let byte_range = |lba: u64, blocks: u32| -> Result<(u64, u32), ()> {
        let offset = lba.checked_mul(block_size).ok_or(())?;
        let length = blocks as u64 * block_size;
        if length > u32::MAX as u64 {
            return Err(());
        }
        Ok((offset, length as u32))
    };
    match op {
        BackendOp::Read | BackendOp::Write | BackendOp::Flush => {
            let range = cdb::transfer_range(srb.cdb()).ok_or(())?;
            let (offset, length) = byte_range(range.lba, range.blocks)?;
            Ok((offset, length, range.fua))
        }
        BackendOp::Unmap => {
            let (lba, blocks) = cdb::unmap_descriptor(srb.data()).ok_or(())?;
            let (offset, length) = byte_range(lba, blocks)?;
            Ok((offset, length, false))
        }
        BackendOp::PersistResIn => {
            let (_, allocation_length) = cdb::persist_res_in_fields(srb.cdb());
            Ok((0, allocation_length as u32, false))
        }
        BackendOp::PersistResOut => {
            let (_, _, _, parameter_list_length) = cdb::persist_res_out_fields(srb.cdb());
            Ok((0, parameter_list_length as u32, false))
        }
    }
}

fn pend_operation(device: &DiskDevice, mut srb: Srb) -> Option<Srb> {
    let op = match cdb::backend_op(srb.opcode()) {
        Some(op) => op,
        None => {
            srb.fail(SRB_STATUS_INVALID_REQUEST, None);
            return Some(srb);
        }
    };

    if !device.validate_io(op) {
        srb.fail(
            SRB_STATUS_INVALID_REQUEST,
            Some(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)),
        );
        return Some(srb);
    }

    let (offset, length, fua) = match io_range(device, &srb, op) {
        Ok(range) => range,
        Err(()) => {
            srb.fail(
                SRB_STATUS_INVALID_REQUEST,
                Some(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)),
            );
            return Some(srb);
        }
    };

    // A synchronize-cache may legitimately cover zero blocks; everything
    // else must fit the advertised limits and the disk.
    let range_checked = matches!(op, BackendOp::Read | BackendOp::Write | BackendOp::Unmap);
    if range_checked {
        let disk_size = device.disk_size();
        let end = offset.checked_add(length as u64);
        if length > MAX_TRANSFER_LENGTH || end.is_none() || end.unwrap() > disk_size {
            warn!(
                "disk {}: request range {}+{} exceeds disk size {}",
                device.instance_name(),
                offset,
                length,
                disk_size
            );
            srb.fail(
                SRB_STATUS_INVALID_REQUEST,
                Some(SenseData::new(ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0)),
            );
            return Some(srb);
        }
    }

    // Writes must come with the payload the CDB promises.
    if matches!(op, BackendOp::Read | BackendOp::Write)
        && (srb.data().len() as u32) < length
    {
        warn!(
            "disk {}: data buffer too small: {} < {}",
            device.instance_name(),
            srb.data().len(),
            length
        );
        srb.fail(SRB_STATUS_ABORTED, None);
        return Some(srb);
    }

    stats::inc(&device.stats.total_received_io_requests);
    stats::inc(&device.stats.unsubmitted_io_requests);
    stats::inc(&device.stats.outstanding_io_count);

    let req = Arc::new(Request::new(op, offset, length, fua, srb));
    device.queues.push_pending(req);
    None
}

fn inquiry(device: &DiskDevice, srb: &mut Srb) {
    let evpd = srb.cdb()[1] & 0x01 != 0;
    let page_code = srb.cdb()[2];

    if !evpd {
        if page_code != 0 {
            srb.fail(
                SRB_STATUS_INVALID_REQUEST,
                Some(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)),
            );
            return;
        }
        standard_inquiry(srb);
        return;
    }

    match page_code {
        VPD_SUPPORTED_PAGES => vpd_supported_pages(srb),
        VPD_SERIAL_NUMBER => vpd_serial_number(device, srb),
        _ => {
            warn!("unknown VPD page: {:#04x}", page_code);
            srb.fail(
                SRB_STATUS_INVALID_REQUEST,
                Some(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)),
            );
        }
    }
}

fn standard_inquiry(srb: &mut Srb) {
    let mut data = [0u8; INQUIRY_DATA_SIZE];
    // Byte 0: direct access block device, attached.
    data[0] = 0x00;
    // Version: SPC-3.
    data[2] = 0x05;
    // Response data format 2.
    data[3] = 0x02;
    // Additional length: bytes past byte 4.
    data[4] = (INQUIRY_DATA_SIZE - 5) as u8;
    // Byte 7: command queuing and 32-bit wide transfers.
    data[7] = 0x22;
    copy_padded(&mut data[8..16], INQUIRY_VENDOR_ID.as_bytes());
    copy_padded(&mut data[16..32], INQUIRY_PRODUCT_ID.as_bytes());
    let revision = format!(
        "{}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR")
    );
    copy_padded(&mut data[32..36], revision.as_bytes());

    write_response(srb, &data);
}

/// Copies `src` into `dst`, space-padding the tail like INQUIRY ASCII fields
/// require.
fn copy_padded(dst: &mut [u8], src: &[u8]) {
    dst.fill(b' ');
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
}

fn vpd_supported_pages(srb: &mut Srb) {
    let data = [
        0x00, // device type
        VPD_SUPPORTED_PAGES,
        0x00,
        2, // page length
        VPD_SUPPORTED_PAGES,
        VPD_SERIAL_NUMBER,
    ];
    write_response(srb, &data);
}

fn vpd_serial_number(device: &DiskDevice, srb: &mut Srb) {
    let serial = device.serial_number().as_bytes();
    let mut data = Vec::with_capacity(4 + serial.len());
    data.push(0x00); // device type
    data.push(VPD_SERIAL_NUMBER);
    data.push(0x00);
    data.push(serial.len() as u8);
    data.extend_from_slice(serial);
    write_response(srb, &data);
}

fn mode_sense(srb: &mut Srb) {
    let opcode = srb.opcode();
    let page_code = srb.cdb()[2] & 0x3f;
    if page_code != MODE_PAGE_CACHING && page_code != MODE_PAGE_ALL {
        srb.fail(
            SRB_STATUS_INVALID_REQUEST,
            Some(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)),
        );
        return;
    }

    // Caching mode page: reads uncached (RCD=1), writes uncached (WCE=0).
    let mut page = [0u8; 20];
    page[0] = MODE_PAGE_CACHING;
    page[1] = (page.len() - 2) as u8;
    page[2] = 0x01;

    let mut data = Vec::with_capacity(8 + page.len());
    if opcode == MODE_SENSE_6 {
        let total = 4 + page.len();
        data.extend_from_slice(&[(total - 1) as u8, 0, 0, 0]);
    } else {
        let total = 8 + page.len();
        data.extend_from_slice(&((total - 2) as u16).to_be_bytes());
        data.extend_from_slice(&[0; 6]);
    }
    data.extend_from_slice(&page);
    write_response(srb, &data);
}

fn read_capacity(device: &DiskDevice, srb: &mut Srb) {
    let block_count = device.block_count();
    let block_size = device.block_size();
    if srb.opcode() == READ_CAPACITY_10 {
        let mut data = [0u8; 8];
        let count32 = u32::try_from(block_count).unwrap_or(u32::MAX);
        data[0..4].copy_from_slice(&count32.to_be_bytes());
        data[4..8].copy_from_slice(&block_size.to_be_bytes());
        write_response(srb, &data);
    } else {
        let mut data = [0u8; 32];
        data[0..8].copy_from_slice(&block_count.to_be_bytes());
        data[8..12].copy_from_slice(&block_size.to_be_bytes());
        write_response(srb, &data);
    }
}

/// Copies an inline response into the SRB data buffer, failing with
/// DATA_OVERRUN if the buffer cannot take it whole.
fn write_response(srb: &mut Srb, data: &[u8]) {
    if srb.data().len() < data.len() {
        srb.fail(SRB_STATUS_DATA_OVERRUN, None);
        return;
    }
    srb.write_data(data);
    srb.set_data_transfer_length(data.len() as u32);
    srb.set_srb_status(SRB_STATUS_SUCCESS);
}
