// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SCSI operation codes and status values used by the virtual port.

#![allow(dead_code)]

// Operation codes.
pub const TEST_UNIT_READY: u8 = 0x00;
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0a;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const VERIFY_10: u8 = 0x2f;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
pub const UNMAP: u8 = 0x42;
pub const MODE_SENSE_10: u8 = 0x5a;
pub const PERSISTENT_RESERVE_IN: u8 = 0x5e;
pub const PERSISTENT_RESERVE_OUT: u8 = 0x5f;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8a;
pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
pub const READ_CAPACITY_16: u8 = 0x9e;
pub const READ_12: u8 = 0xa8;
pub const WRITE_12: u8 = 0xaa;

// SCSI status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;

// Sense keys.
pub const NO_SENSE: u8 = 0x00;
pub const MEDIUM_ERROR: u8 = 0x03;
pub const ILLEGAL_REQUEST: u8 = 0x05;

// Additional sense codes.
pub const ASC_INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;

// SRB status values reported back to the host storage port.
pub const SRB_STATUS_PENDING: u8 = 0x00;
pub const SRB_STATUS_SUCCESS: u8 = 0x01;
pub const SRB_STATUS_ABORTED: u8 = 0x02;
pub const SRB_STATUS_ABORT_FAILED: u8 = 0x03;
pub const SRB_STATUS_ERROR: u8 = 0x04;
pub const SRB_STATUS_BUSY: u8 = 0x05;
pub const SRB_STATUS_INVALID_REQUEST: u8 = 0x06;
pub const SRB_STATUS_NO_DEVICE: u8 = 0x08;
pub const SRB_STATUS_TIMEOUT: u8 = 0x09;
pub const SRB_STATUS_BUS_RESET: u8 = 0x0e;
pub const SRB_STATUS_DATA_OVERRUN: u8 = 0x12;
pub const SRB_STATUS_INTERNAL_ERROR: u8 = 0x30;
// Flag OR-ed into the status byte when the sense buffer holds valid data.
pub const SRB_STATUS_AUTOSENSE_VALID: u8 = 0x80;

/// Masks the autosense flag off a status byte.
pub fn srb_status_code(status: u8) -> u8 {
    status & !SRB_STATUS_AUTOSENSE_VALID
}

// Vital product data pages served by the inline INQUIRY handler.
pub const VPD_SUPPORTED_PAGES: u8 = 0x00;
pub const VPD_SERIAL_NUMBER: u8 = 0x80;

pub const MODE_PAGE_CACHING: u8 = 0x08;
pub const MODE_PAGE_ALL: u8 = 0x3f;

/// Size of the standard INQUIRY response.
pub const INQUIRY_DATA_SIZE: usize = 36;

pub fn opcode_str(opcode: u8) -> &'static str {
    match opcode {
        TEST_UNIT_READY => "TEST_UNIT_READY",
        READ_6 => "READ_6",
        WRITE_6 => "WRITE_6",
        INQUIRY => "INQUIRY",
        MODE_SENSE_6 => "MODE_SENSE_6",
        READ_CAPACITY_10 => "READ_CAPACITY_10",
        READ_10 => "READ_10",
        WRITE_10 => "WRITE_10",
        VERIFY_10 => "VERIFY_10",
        SYNCHRONIZE_CACHE_10 => "SYNCHRONIZE_CACHE_10",
        UNMAP => "UNMAP",
        MODE_SENSE_10 => "MODE_SENSE_10",
        PERSISTENT_RESERVE_IN => "PERSISTENT_RESERVE_IN",
        PERSISTENT_RESERVE_OUT => "PERSISTENT_RESERVE_OUT",
        READ_16 => "READ_16",
        WRITE_16 => "WRITE_16",
        SYNCHRONIZE_CACHE_16 => "SYNCHRONIZE_CACHE_16",
        READ_CAPACITY_16 => "READ_CAPACITY_16",
        READ_12 => "READ_12",
        WRITE_12 => "WRITE_12",
        _ => "UNKNOWN",
    }
}

pub fn srb_status_str(status: u8) -> &'static str {
    match srb_status_code(status) {
        SRB_STATUS_PENDING => "SRB_STATUS_PENDING",
        SRB_STATUS_SUCCESS => "SRB_STATUS_SUCCESS",
        SRB_STATUS_ABORTED => "SRB_STATUS_ABORTED",
        SRB_STATUS_ABORT_FAILED => "SRB_STATUS_ABORT_FAILED",
        SRB_STATUS_ERROR => "SRB_STATUS_ERROR",
        SRB_STATUS_BUSY => "SRB_STATUS_BUSY",
        SRB_STATUS_INVALID_REQUEST => "SRB_STATUS_INVALID_REQUEST",
        SRB_STATUS_NO_DEVICE => "SRB_STATUS_NO_DEVICE",
        SRB_STATUS_TIMEOUT => "SRB_STATUS_TIMEOUT",
        SRB_STATUS_BUS_RESET => "SRB_STATUS_BUS_RESET",
        SRB_STATUS_DATA_OVERRUN => "SRB_STATUS_DATA_OVERRUN",
        SRB_STATUS_INTERNAL_ERROR => "SRB_STATUS_INTERNAL_ERROR",
        _ => "UNKNOWN",
    }
}
