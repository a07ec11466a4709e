// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The binary control surface: fixed-layout command structures and a
//! dispatcher routing them to the adapter operations.
//!
//! The structures are laid out for binary compatibility with existing
//! management callers, hence the fixed-size string fields, explicit padding
//! and compile-time size assertions. List-style commands use a two-call
//! pattern: a too-small output buffer succeeds and reports the required size
//! as the returned length.

use base::debug;
use base::warn;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::adapter::Adapter;
use crate::adapter::ConnectionInfo;
use crate::device::DiskFlags;
use crate::device::DiskProperties;
use crate::device::NbdConnectionProperties;
use crate::device::MAX_NAME_LENGTH;
use crate::device::MAX_OWNER_LENGTH;
use crate::options::OptionValue;
use crate::stats::DiskStatsSnapshot;
use crate::userio;
use crate::userio::IoRequestCmd;
use crate::Error;
use crate::Result;

pub const MAX_OPT_NAME_LENGTH: usize = 64;
pub const MAX_VERSION_STR_LENGTH: usize = 128;

// Control command selectors.
pub const CMD_PING: u32 = 1;
pub const CMD_CREATE: u32 = 2;
pub const CMD_REMOVE: u32 = 3;
pub const CMD_FETCH_REQ: u32 = 4;
pub const CMD_SEND_RSP: u32 = 5;
pub const CMD_LIST: u32 = 6;
pub const CMD_STATS: u32 = 7;
pub const CMD_RELOAD_CONFIG: u32 = 8;
pub const CMD_VERSION: u32 = 9;
pub const CMD_SHOW: u32 = 10;
pub const CMD_GET_DRV_OPT: u32 = 11;
pub const CMD_SET_DRV_OPT: u32 = 12;
pub const CMD_RESET_DRV_OPT: u32 = 13;
pub const CMD_LIST_DRV_OPT: u32 = 14;
pub const CMD_SET_DISK_SIZE: u32 = 15;

// Disk capability flag bits.
pub const FLAG_READ_ONLY: u32 = 1 << 0;
pub const FLAG_FLUSH_SUPPORTED: u32 = 1 << 1;
pub const FLAG_FUA_SUPPORTED: u32 = 1 << 2;
pub const FLAG_UNMAP_SUPPORTED: u32 = 1 << 3;
pub const FLAG_UNMAP_ANCHOR_SUPPORTED: u32 = 1 << 4;
pub const FLAG_USE_NBD: u32 = 1 << 5;
pub const FLAG_PERSIST_RES_SUPPORTED: u32 = 1 << 6;

// NBD connection flag bits.
pub const NBD_FLAG_SKIP_NEGOTIATION: u32 = 1 << 0;

// Remove command flag bits.
pub const REMOVE_FLAG_HARD: u32 = 1 << 0;

// Request descriptor types.
pub const REQ_TYPE_UNKNOWN: u32 = 0;
pub const REQ_TYPE_READ: u32 = 1;
pub const REQ_TYPE_WRITE: u32 = 2;
pub const REQ_TYPE_FLUSH: u32 = 3;
pub const REQ_TYPE_UNMAP: u32 = 4;
pub const REQ_TYPE_DISCONNECT: u32 = 5;
pub const REQ_TYPE_PERSIST_RES_IN: u32 = 6;
pub const REQ_TYPE_PERSIST_RES_OUT: u32 = 7;

// Per-command flag bits inside the request descriptors.
pub const REQ_FLAG_FUA: u32 = 1 << 0;
pub const REQ_FLAG_ANCHOR: u32 = 1 << 0;

// Option value types.
pub const OPT_TYPE_BOOL: u32 = 1;
pub const OPT_TYPE_INT64: u32 = 2;
pub const OPT_TYPE_WSTR: u32 = 3;

// Status flag bits.
pub const STATUS_FLAG_INFORMATION_VALID: u32 = 1 << 8;

/// Identity of the process issuing a control call.
#[derive(Copy, Clone, Debug)]
pub struct CallerContext {
    pub pid: u32,
}

fn str_from_fixed(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn str_to_fixed(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let bytes = src.as_bytes();
    // Always leave room for the terminator.
    let len = bytes.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
}

fn wstr_from_fixed(units: &[u16]) -> String {
    let len = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..len])
}

fn wstr_to_fixed(dst: &mut [u16], src: &str) {
    dst.fill(0);
    let len = dst.len() - 1;
    for (slot, unit) in dst[..len].iter_mut().zip(src.encode_utf16()) {
        *slot = unit;
    }
}

fn flags_to_wire(flags: DiskFlags) -> u32 {
    let mut wire = 0;
    if flags.read_only {
        wire |= FLAG_READ_ONLY;
    }
    if flags.flush_supported {
        wire |= FLAG_FLUSH_SUPPORTED;
    }
    if flags.fua_supported {
        wire |= FLAG_FUA_SUPPORTED;
    }
    if flags.unmap_supported {
        wire |= FLAG_UNMAP_SUPPORTED;
    }
    if flags.unmap_anchor_supported {
        wire |= FLAG_UNMAP_ANCHOR_SUPPORTED;
    }
    if flags.use_nbd {
        wire |= FLAG_USE_NBD;
    }
    if flags.persist_res_supported {
        wire |= FLAG_PERSIST_RES_SUPPORTED;
    }
    wire
}

fn flags_from_wire(wire: u32) -> DiskFlags {
    DiskFlags {
        read_only: wire & FLAG_READ_ONLY != 0,
        flush_supported: wire & FLAG_FLUSH_SUPPORTED != 0,
        fua_supported: wire & FLAG_FUA_SUPPORTED != 0,
        unmap_supported: wire & FLAG_UNMAP_SUPPORTED != 0,
        unmap_anchor_supported: wire & FLAG_UNMAP_ANCHOR_SUPPORTED != 0,
        use_nbd: wire & FLAG_USE_NBD != 0,
        persist_res_supported: wire & FLAG_PERSIST_RES_SUPPORTED != 0,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireNbdProperties {
    pub hostname: [u8; MAX_NAME_LENGTH],
    pub port_number: u32,
    pub export_name: [u8; MAX_NAME_LENGTH],
    pub flags: u32,
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireNbdProperties>(), 552);

impl Default for WireNbdProperties {
    fn default() -> WireNbdProperties {
        WireNbdProperties::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireDiskProperties {
    pub instance_name: [u8; MAX_NAME_LENGTH],
    pub serial_number: [u8; MAX_NAME_LENGTH],
    pub owner: [u8; MAX_OWNER_LENGTH],
    pub flags: u32,
    _pad0: u32,
    pub block_count: u64,
    pub block_size: u32,
    pub max_unmap_desc_count: u32,
    pub pid: u32,
    pub nbd: WireNbdProperties,
    pub reserved: [u8; 256],
    _pad1: u32,
}
const_assert_eq!(std::mem::size_of::<WireDiskProperties>(), 1368);

impl Default for WireDiskProperties {
    fn default() -> WireDiskProperties {
        WireDiskProperties::new_zeroed()
    }
}

impl WireDiskProperties {
    pub fn to_properties(&self) -> DiskProperties {
        let flags = flags_from_wire(self.flags);
        let nbd = flags.use_nbd.then(|| NbdConnectionProperties {
            hostname: str_from_fixed(&self.nbd.hostname),
            port: self.nbd.port_number as u16,
            export_name: str_from_fixed(&self.nbd.export_name),
            skip_negotiation: self.nbd.flags & NBD_FLAG_SKIP_NEGOTIATION != 0,
        });
        DiskProperties {
            instance_name: str_from_fixed(&self.instance_name),
            serial_number: str_from_fixed(&self.serial_number),
            owner: str_from_fixed(&self.owner),
            flags,
            block_count: self.block_count,
            block_size: self.block_size,
            max_unmap_desc_count: self.max_unmap_desc_count,
            pid: self.pid,
            nbd,
        }
    }

    pub fn from_properties(props: &DiskProperties) -> WireDiskProperties {
        let mut wire = WireDiskProperties::new_zeroed();
        str_to_fixed(&mut wire.instance_name, &props.instance_name);
        str_to_fixed(&mut wire.serial_number, &props.serial_number);
        str_to_fixed(&mut wire.owner, &props.owner);
        wire.flags = flags_to_wire(props.flags);
        wire.block_count = props.block_count;
        wire.block_size = props.block_size;
        wire.max_unmap_desc_count = props.max_unmap_desc_count;
        wire.pid = props.pid;
        if let Some(nbd) = &props.nbd {
            str_to_fixed(&mut wire.nbd.hostname, &nbd.hostname);
            wire.nbd.port_number = nbd.port as u32;
            str_to_fixed(&mut wire.nbd.export_name, &nbd.export_name);
            if nbd.skip_negotiation {
                wire.nbd.flags |= NBD_FLAG_SKIP_NEGOTIATION;
            }
        }
        wire
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireConnectionInfo {
    pub properties: WireDiskProperties,
    pub connection_flags: u32,
    pub bus_number: u16,
    pub target_id: u16,
    pub lun: u16,
    _pad0: [u8; 6],
    pub connection_id: u64,
    pub disk_number: i32,
    pub pnp_device_id: [u16; MAX_NAME_LENGTH],
    pub reserved: [u8; 124],
}
const_assert_eq!(std::mem::size_of::<WireConnectionInfo>(), 2032);

impl WireConnectionInfo {
    pub fn from_connection_info(info: &ConnectionInfo) -> WireConnectionInfo {
        let mut wire = WireConnectionInfo::new_zeroed();
        wire.properties = WireDiskProperties::from_properties(&info.properties);
        wire.bus_number = info.bus as u16;
        wire.target_id = info.target as u16;
        wire.lun = info.lun as u16;
        wire.connection_id = info.connection_id;
        wire.disk_number = info.disk_number;
        wstr_to_fixed(&mut wire.pnp_device_id, &info.pnp_device_id);
        wire
    }
}

/// Header of the variable-length connection list.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireListHeader {
    pub element_size: u32,
    pub count: u32,
}
const_assert_eq!(std::mem::size_of::<WireListHeader>(), 8);

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireDriverStats {
    pub total_received_io_requests: i64,
    pub total_submitted_io_requests: i64,
    pub total_received_io_replies: i64,
    pub unsubmitted_io_requests: i64,
    pub pending_submitted_io_requests: i64,
    pub aborted_submitted_io_requests: i64,
    pub aborted_unsubmitted_io_requests: i64,
    pub completed_aborted_io_requests: i64,
    pub outstanding_io_count: i64,
    pub reserved: [i64; 15],
}
const_assert_eq!(std::mem::size_of::<WireDriverStats>(), 192);

impl WireDriverStats {
    fn from_snapshot(stats: &DiskStatsSnapshot) -> WireDriverStats {
        WireDriverStats {
            total_received_io_requests: stats.total_received_io_requests,
            total_submitted_io_requests: stats.total_submitted_io_requests,
            total_received_io_replies: stats.total_received_io_replies,
            unsubmitted_io_requests: stats.unsubmitted_io_requests,
            pending_submitted_io_requests: stats.pending_submitted_io_requests,
            aborted_submitted_io_requests: stats.aborted_submitted_io_requests,
            aborted_unsubmitted_io_requests: stats.aborted_unsubmitted_io_requests,
            completed_aborted_io_requests: stats.completed_aborted_io_requests,
            outstanding_io_count: stats.outstanding_io_count,
            reserved: [0; 15],
        }
    }
}

/// SCSI-level completion status carried in a response descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireStatus {
    pub scsi_status: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    _pad0: [u8; 4],
    pub information: u64,
    pub reserved_csi: u64,
    pub reserved_sks: u32,
    pub flags: u32,
}
const_assert_eq!(std::mem::size_of::<WireStatus>(), 32);

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireReadCmd {
    pub block_address: u64,
    pub block_count: u32,
    pub flags: u32,
}

pub type WireWriteCmd = WireReadCmd;
pub type WireFlushCmd = WireReadCmd;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireUnmapCmd {
    pub count: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WirePersistResInCmd {
    pub service_action: u8,
    _pad0: u8,
    pub allocation_length: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WirePersistResOutCmd {
    pub service_action: u8,
    /// Scope in the low nibble, reservation type in the high nibble.
    pub scope_type: u8,
    pub parameter_list_length: u16,
}

/// One IO request as delivered to a user-space backend.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireIoRequest {
    pub request_handle: u64,
    pub request_type: u32,
    _pad0: u32,
    cmd: [u8; 16],
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireIoRequest>(), 64);

impl WireIoRequest {
    pub fn from_io_request(request: &userio::IoRequest) -> WireIoRequest {
        let mut wire = WireIoRequest::new_zeroed();
        wire.request_handle = request.tag;
        match request.cmd {
            IoRequestCmd::Read {
                block_address,
                block_count,
                fua,
            } => {
                wire.request_type = REQ_TYPE_READ;
                wire.set_cmd(WireReadCmd {
                    block_address,
                    block_count,
                    flags: if fua { REQ_FLAG_FUA } else { 0 },
                });
            }
            IoRequestCmd::Write {
                block_address,
                block_count,
                fua,
            } => {
                wire.request_type = REQ_TYPE_WRITE;
                wire.set_cmd(WireWriteCmd {
                    block_address,
                    block_count,
                    flags: if fua { REQ_FLAG_FUA } else { 0 },
                });
            }
            IoRequestCmd::Flush {
                block_address,
                block_count,
            } => {
                wire.request_type = REQ_TYPE_FLUSH;
                wire.set_cmd(WireFlushCmd {
                    block_address,
                    block_count,
                    flags: 0,
                });
            }
            IoRequestCmd::Unmap { count, anchor } => {
                wire.request_type = REQ_TYPE_UNMAP;
                wire.set_cmd(WireUnmapCmd {
                    count,
                    flags: if anchor { REQ_FLAG_ANCHOR } else { 0 },
                });
            }
            IoRequestCmd::PersistResIn {
                service_action,
                allocation_length,
            } => {
                wire.request_type = REQ_TYPE_PERSIST_RES_IN;
                wire.set_cmd(WirePersistResInCmd {
                    service_action,
                    _pad0: 0,
                    allocation_length,
                });
            }
            IoRequestCmd::PersistResOut {
                service_action,
                scope,
                res_type,
                parameter_list_length,
            } => {
                wire.request_type = REQ_TYPE_PERSIST_RES_OUT;
                wire.set_cmd(WirePersistResOutCmd {
                    service_action,
                    scope_type: (res_type << 4) | (scope & 0x0f),
                    parameter_list_length,
                });
            }
            IoRequestCmd::Disconnect => {
                wire.request_type = REQ_TYPE_DISCONNECT;
            }
        }
        wire
    }

    fn set_cmd<T: IntoBytes + Immutable>(&mut self, cmd: T) {
        let bytes = cmd.as_bytes();
        self.cmd[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_cmd(&self) -> WireReadCmd {
        WireReadCmd::read_from_prefix(&self.cmd).unwrap().0
    }

    pub fn unmap_cmd(&self) -> WireUnmapCmd {
        WireUnmapCmd::read_from_prefix(&self.cmd).unwrap().0
    }

    pub fn persist_res_in_cmd(&self) -> WirePersistResInCmd {
        WirePersistResInCmd::read_from_prefix(&self.cmd).unwrap().0
    }

    pub fn persist_res_out_cmd(&self) -> WirePersistResOutCmd {
        WirePersistResOutCmd::read_from_prefix(&self.cmd).unwrap().0
    }
}

/// One IO response as submitted by a user-space backend.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireIoResponse {
    pub request_handle: u64,
    pub request_type: u32,
    _pad0: u32,
    pub status: WireStatus,
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireIoResponse>(), 80);

impl WireIoResponse {
    pub fn success(request_handle: u64) -> WireIoResponse {
        WireIoResponse {
            request_handle,
            ..Default::default()
        }
    }

    fn to_io_response(&self) -> userio::IoResponse {
        userio::IoResponse {
            tag: self.request_handle,
            status: userio::IoStatus {
                scsi_status: self.status.scsi_status,
                sense_key: self.status.sense_key,
                asc: self.status.asc,
                ascq: self.status.ascq,
                information: (self.status.flags & STATUS_FLAG_INFORMATION_VALID != 0)
                    .then_some(self.status.information),
            },
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireOptionValue {
    pub value_type: u32,
    _pad0: u32,
    data: [u8; 512],
    pub reserved: [u8; 64],
}
const_assert_eq!(std::mem::size_of::<WireOptionValue>(), 584);

impl Default for WireOptionValue {
    fn default() -> WireOptionValue {
        WireOptionValue::new_zeroed()
    }
}

impl WireOptionValue {
    pub fn from_option_value(value: &OptionValue) -> WireOptionValue {
        let mut wire = WireOptionValue::new_zeroed();
        match value {
            OptionValue::Bool(b) => {
                wire.value_type = OPT_TYPE_BOOL;
                wire.data[0] = *b as u8;
            }
            OptionValue::Int64(i) => {
                wire.value_type = OPT_TYPE_INT64;
                wire.data[..8].copy_from_slice(&i.to_le_bytes());
            }
            OptionValue::String(s) => {
                wire.value_type = OPT_TYPE_WSTR;
                let units: Vec<u16> = s.encode_utf16().collect();
                for (slot, unit) in wire.data.chunks_exact_mut(2).take(255).zip(units) {
                    slot.copy_from_slice(&unit.to_le_bytes());
                }
            }
        }
        wire
    }

    pub fn to_option_value(&self) -> Result<OptionValue> {
        match self.value_type {
            OPT_TYPE_BOOL => Ok(OptionValue::Bool(self.data[0] != 0)),
            OPT_TYPE_INT64 => Ok(OptionValue::Int64(i64::from_le_bytes(
                self.data[..8].try_into().unwrap(),
            ))),
            OPT_TYPE_WSTR => {
                let units: Vec<u16> = self
                    .data
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes(pair.try_into().unwrap()))
                    .collect();
                Ok(OptionValue::String(wstr_from_fixed(&units)))
            }
            other => Err(Error::InvalidParameter(format!(
                "unknown option value type: {}",
                other
            ))),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireOption {
    pub name: [u16; MAX_OPT_NAME_LENGTH],
    pub value_type: u32,
    _pad0: u32,
    pub default: WireOptionValue,
    pub value: WireOptionValue,
    pub reserved: [u8; 64],
}
const_assert_eq!(std::mem::size_of::<WireOption>(), 1368);

fn option_value_type(value: &OptionValue) -> u32 {
    match value {
        OptionValue::Bool(_) => OPT_TYPE_BOOL,
        OptionValue::Int64(_) => OPT_TYPE_INT64,
        OptionValue::String(_) => OPT_TYPE_WSTR,
    }
}

// Command structures.

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireBaseCommand {
    pub io_control_code: u32,
}
const_assert_eq!(std::mem::size_of::<WireBaseCommand>(), 4);

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireCreateCommand {
    pub io_control_code: u32,
    _pad0: u32,
    pub properties: WireDiskProperties,
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireCreateCommand>(), 1408);

impl WireCreateCommand {
    pub fn new(properties: WireDiskProperties) -> WireCreateCommand {
        let mut cmd = WireCreateCommand::new_zeroed();
        cmd.io_control_code = CMD_CREATE;
        cmd.properties = properties;
        cmd
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireRemoveCommand {
    pub io_control_code: u32,
    pub instance_name: [u8; MAX_NAME_LENGTH],
    pub flags: u32,
    pub options_reserved: [u8; 80],
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireRemoveCommand>(), 376);

impl WireRemoveCommand {
    pub fn new(instance_name: &str, hard: bool) -> WireRemoveCommand {
        let mut cmd = WireRemoveCommand::new_zeroed();
        cmd.io_control_code = CMD_REMOVE;
        str_to_fixed(&mut cmd.instance_name, instance_name);
        if hard {
            cmd.flags |= REMOVE_FLAG_HARD;
        }
        cmd
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireNamedCommand {
    pub io_control_code: u32,
    pub instance_name: [u8; MAX_NAME_LENGTH],
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireNamedCommand>(), 292);

impl WireNamedCommand {
    pub fn new(io_control_code: u32, instance_name: &str) -> WireNamedCommand {
        let mut cmd = WireNamedCommand::new_zeroed();
        cmd.io_control_code = io_control_code;
        str_to_fixed(&mut cmd.instance_name, instance_name);
        cmd
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireSetSizeCommand {
    pub io_control_code: u32,
    _pad0: u32,
    pub connection_id: u64,
    pub block_count: u64,
    pub reserved: [u8; 32],
}
const_assert_eq!(std::mem::size_of::<WireSetSizeCommand>(), 56);

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub description: [u8; MAX_VERSION_STR_LENGTH],
    pub reserved: [u8; 256],
}
const_assert_eq!(std::mem::size_of::<WireVersion>(), 396);

impl Default for WireVersion {
    fn default() -> WireVersion {
        WireVersion::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireGetOptCommand {
    pub io_control_code: u32,
    pub name: [u16; MAX_NAME_LENGTH],
    pub persistent: u8,
    pub reserved: [u8; 32],
    _pad0: [u8; 3],
}
const_assert_eq!(std::mem::size_of::<WireGetOptCommand>(), 552);

pub type WireResetOptCommand = WireGetOptCommand;

impl WireGetOptCommand {
    pub fn new(io_control_code: u32, name: &str, persistent: bool) -> WireGetOptCommand {
        let mut cmd = WireGetOptCommand::new_zeroed();
        cmd.io_control_code = io_control_code;
        wstr_to_fixed(&mut cmd.name, name);
        cmd.persistent = persistent as u8;
        cmd
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireSetOptCommand {
    pub io_control_code: u32,
    pub name: [u16; MAX_NAME_LENGTH],
    _pad0: u32,
    pub value: WireOptionValue,
    pub persistent: u8,
    pub reserved: [u8; 32],
    _pad1: [u8; 7],
}
const_assert_eq!(std::mem::size_of::<WireSetOptCommand>(), 1144);

impl WireSetOptCommand {
    pub fn new(name: &str, value: &OptionValue, persistent: bool) -> WireSetOptCommand {
        let mut cmd = WireSetOptCommand::new_zeroed();
        cmd.io_control_code = CMD_SET_DRV_OPT;
        wstr_to_fixed(&mut cmd.name, name);
        cmd.value = WireOptionValue::from_option_value(value);
        cmd.persistent = persistent as u8;
        cmd
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct WireListOptCommand {
    pub io_control_code: u32,
    pub persistent: u8,
    pub reserved: [u8; 32],
    _pad0: [u8; 3],
}
const_assert_eq!(std::mem::size_of::<WireListOptCommand>(), 40);

fn read_command<T: FromBytes>(input: &[u8]) -> Result<T> {
    T::read_from_prefix(input)
        .map(|(cmd, _)| cmd)
        .map_err(|_| Error::InvalidParameter("command buffer too small".to_string()))
}

fn write_output<T: IntoBytes + Immutable>(output: &mut [u8], value: &T) -> Result<usize> {
    let bytes = value.as_bytes();
    if output.len() < bytes.len() {
        return Err(Error::BufferTooSmall {
            required: bytes.len() as u64,
        });
    }
    output[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Dispatches one buffered control command, mirroring the single entry point
/// a driver exposes for management callers. Returns the number of output
/// bytes, or, for the list commands with a too-small buffer, the required
/// buffer size (the two-call pattern).
///
/// The IO exchange commands carry payload pointers that cannot travel
/// through plain byte buffers; they use the typed [`fetch_request`] and
/// [`send_response`] entry points instead.
pub fn dispatch(
    adapter: &Adapter,
    caller: &CallerContext,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    let base: WireBaseCommand = read_command(input)?;
    debug!("control command: {}", base.io_control_code);

    match base.io_control_code {
        CMD_PING => Ok(0),

        CMD_CREATE => {
            let cmd: WireCreateCommand = read_command(input)?;
            let mut props = cmd.properties.to_properties();
            if props.instance_name.is_empty() {
                warn!("create: invalid instance name");
                return Err(Error::InvalidParameter("invalid instance name".to_string()));
            }
            if props.pid == 0 {
                props.pid = caller.pid;
            }
            let info = adapter.create_disk(props)?;
            write_output(output, &WireConnectionInfo::from_connection_info(&info))
        }

        CMD_REMOVE => {
            let cmd: WireRemoveCommand = read_command(input)?;
            let name = str_from_fixed(&cmd.instance_name);
            if name.is_empty() {
                warn!("remove: invalid instance name");
                return Err(Error::InvalidParameter("invalid instance name".to_string()));
            }
            adapter.remove_disk(&name, cmd.flags & REMOVE_FLAG_HARD != 0)?;
            Ok(0)
        }

        CMD_LIST => {
            let connections = adapter.list();
            let entry_size = std::mem::size_of::<WireConnectionInfo>();
            let required = std::mem::size_of::<WireListHeader>() + connections.len() * entry_size;
            if output.len() < required {
                return Ok(required);
            }
            let header = WireListHeader {
                element_size: entry_size as u32,
                count: connections.len() as u32,
            };
            let mut offset = write_output(output, &header)?;
            for info in &connections {
                offset += write_output(
                    &mut output[offset..],
                    &WireConnectionInfo::from_connection_info(info),
                )?;
            }
            Ok(offset)
        }

        CMD_SHOW => {
            let cmd: WireNamedCommand = read_command(input)?;
            let name = str_from_fixed(&cmd.instance_name);
            if name.is_empty() {
                return Err(Error::InvalidParameter("invalid instance name".to_string()));
            }
            let info = adapter.show(&name)?;
            write_output(output, &WireConnectionInfo::from_connection_info(&info))
        }

        CMD_STATS => {
            let cmd: WireNamedCommand = read_command(input)?;
            let name = str_from_fixed(&cmd.instance_name);
            if name.is_empty() {
                return Err(Error::InvalidParameter("invalid instance name".to_string()));
            }
            let stats = adapter.stats(&name)?;
            write_output(output, &WireDriverStats::from_snapshot(&stats))
        }

        CMD_RELOAD_CONFIG => {
            adapter.options().reload();
            Ok(0)
        }

        CMD_VERSION => {
            let mut version = WireVersion {
                major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
                minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
                patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
                ..Default::default()
            };
            str_to_fixed(
                &mut version.description,
                concat!("scsibridge ", env!("CARGO_PKG_VERSION")),
            );
            write_output(output, &version)
        }

        CMD_SET_DISK_SIZE => {
            let cmd: WireSetSizeCommand = read_command(input)?;
            adapter.set_disk_size(cmd.connection_id, cmd.block_count)?;
            Ok(0)
        }

        CMD_GET_DRV_OPT => {
            let cmd: WireGetOptCommand = read_command(input)?;
            let name = wstr_from_fixed(&cmd.name);
            let value = adapter.options().get(&name, cmd.persistent != 0)?;
            write_output(output, &WireOptionValue::from_option_value(&value))
        }

        CMD_SET_DRV_OPT => {
            let cmd: WireSetOptCommand = read_command(input)?;
            let name = wstr_from_fixed(&cmd.name);
            let value = cmd.value.to_option_value()?;
            adapter
                .options()
                .set(&name, value.clone(), cmd.persistent != 0)?;
            if name.eq_ignore_ascii_case("NewMappingsAllowed")
                && value == OptionValue::Bool(false)
            {
                // Let in-flight creates finish before reporting the disable.
                adapter.wait_creations_idle();
            }
            Ok(0)
        }

        CMD_RESET_DRV_OPT => {
            let cmd: WireResetOptCommand = read_command(input)?;
            let name = wstr_from_fixed(&cmd.name);
            adapter.options().reset(&name, cmd.persistent != 0)?;
            Ok(0)
        }

        CMD_LIST_DRV_OPT => {
            let cmd: WireListOptCommand = read_command(input)?;
            let entries = adapter.options().list(cmd.persistent != 0);
            let entry_size = std::mem::size_of::<WireOption>();
            let required = std::mem::size_of::<WireListHeader>() + entries.len() * entry_size;
            if output.len() < required {
                return Ok(required);
            }
            let header = WireListHeader {
                element_size: entry_size as u32,
                count: entries.len() as u32,
            };
            let mut offset = write_output(output, &header)?;
            for entry in &entries {
                let mut wire = WireOption::new_zeroed();
                wstr_to_fixed(&mut wire.name, entry.name);
                wire.value_type = option_value_type(&entry.default);
                wire.default = WireOptionValue::from_option_value(&entry.default);
                wire.value = WireOptionValue::from_option_value(&entry.value);
                offset += write_output(&mut output[offset..], &wire)?;
            }
            Ok(offset)
        }

        CMD_FETCH_REQ | CMD_SEND_RSP => Err(Error::InvalidParameter(
            "IO exchange commands use the typed entry points".to_string(),
        )),

        other => {
            warn!("unsupported control command: {}", other);
            Err(Error::InvalidParameter(format!(
                "unsupported control command: {}",
                other
            )))
        }
    }
}

/// Typed rendition of the fetch-request command: blocks for the next IO
/// request of the disk identified by `connection_id`, delivering outbound
/// payloads through `data_buf`.
pub fn fetch_request(
    adapter: &Adapter,
    caller: &CallerContext,
    connection_id: u64,
    data_buf: &mut [u8],
) -> Result<WireIoRequest> {
    let request = adapter.fetch_request(caller.pid, connection_id, data_buf)?;
    Ok(WireIoRequest::from_io_request(&request))
}

/// Typed rendition of the send-response command: completes a previously
/// fetched request, reading inbound payloads from `data_buf`.
pub fn send_response(
    adapter: &Adapter,
    caller: &CallerContext,
    connection_id: u64,
    response: &WireIoResponse,
    data_buf: &[u8],
) -> Result<()> {
    adapter.send_response(
        caller.pid,
        connection_id,
        &response.to_io_response(),
        data_buf,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::options::OptionsStore;
    use crate::testing::NullPort;

    use super::*;

    fn adapter() -> Adapter {
        Adapter::new(Arc::new(NullPort::default()), Arc::new(OptionsStore::new()))
    }

    fn caller() -> CallerContext {
        CallerContext { pid: 42 }
    }

    fn create_command(name: &str) -> WireCreateCommand {
        let mut props = WireDiskProperties::new_zeroed();
        str_to_fixed(&mut props.instance_name, name);
        props.block_count = 2048;
        props.block_size = 512;
        WireCreateCommand::new(props)
    }

    #[test]
    fn ping() {
        let adapter = adapter();
        let len = dispatch(&adapter, &caller(), WireBaseCommand { io_control_code: CMD_PING }.as_bytes(), &mut [])
            .unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn create_defaults_pid_and_serial() {
        let adapter = adapter();
        let mut output = [0u8; std::mem::size_of::<WireConnectionInfo>()];
        let len = dispatch(&adapter, &caller(), create_command("disk-a").as_bytes(), &mut output)
            .unwrap();
        assert_eq!(len, output.len());
        let info = WireConnectionInfo::read_from_bytes(&output[..]).unwrap();
        assert_eq!(info.connection_id, 1);
        assert_eq!(str_from_fixed(&info.properties.serial_number), "disk-a");
        assert_eq!(info.properties.pid, 42);
    }

    #[test]
    fn list_uses_two_call_sizing() {
        let adapter = adapter();
        let mut output = [0u8; std::mem::size_of::<WireConnectionInfo>()];
        dispatch(&adapter, &caller(), create_command("disk-a").as_bytes(), &mut output).unwrap();

        let list_cmd = WireBaseCommand {
            io_control_code: CMD_LIST,
        };
        // First call with a buffer that cannot hold the entry.
        let required = dispatch(&adapter, &caller(), list_cmd.as_bytes(), &mut [0u8; 8]).unwrap();
        assert_eq!(required, 8 + std::mem::size_of::<WireConnectionInfo>());

        let mut list_buf = vec![0u8; required];
        let len = dispatch(&adapter, &caller(), list_cmd.as_bytes(), &mut list_buf).unwrap();
        assert_eq!(len, required);
        let header = WireListHeader::read_from_prefix(&list_buf[..]).unwrap().0;
        assert_eq!(header.count, 1);
        assert_eq!(
            header.element_size as usize,
            std::mem::size_of::<WireConnectionInfo>()
        );
    }

    #[test]
    fn option_commands_round_trip() {
        let adapter = adapter();
        let set = WireSetOptCommand::new(
            "NewMappingsAllowed",
            &OptionValue::Bool(false),
            false,
        );
        dispatch(&adapter, &caller(), set.as_bytes(), &mut []).unwrap();

        let get = WireGetOptCommand::new(CMD_GET_DRV_OPT, "NewMappingsAllowed", false);
        let mut output = [0u8; std::mem::size_of::<WireOptionValue>()];
        dispatch(&adapter, &caller(), get.as_bytes(), &mut output).unwrap();
        let value = WireOptionValue::read_from_bytes(&output[..]).unwrap();
        assert_eq!(value.to_option_value().unwrap(), OptionValue::Bool(false));

        let reset = WireGetOptCommand::new(CMD_RESET_DRV_OPT, "NewMappingsAllowed", false);
        dispatch(&adapter, &caller(), reset.as_bytes(), &mut []).unwrap();
        assert!(adapter.options().get_bool("NewMappingsAllowed"));
    }

    #[test]
    fn list_options_reports_all_defaults() {
        let adapter = adapter();
        let cmd = WireListOptCommand {
            io_control_code: CMD_LIST_DRV_OPT,
            ..Default::default()
        };
        let required = dispatch(&adapter, &caller(), cmd.as_bytes(), &mut []).unwrap();
        let mut output = vec![0u8; required];
        dispatch(&adapter, &caller(), cmd.as_bytes(), &mut output).unwrap();
        let header = WireListHeader::read_from_prefix(&output[..]).unwrap().0;
        assert_eq!(header.count, 5);
    }

    #[test]
    fn wire_properties_round_trip() {
        let props = DiskProperties {
            instance_name: "disk-a".to_string(),
            serial_number: "serial".to_string(),
            owner: "ceph".to_string(),
            flags: DiskFlags {
                read_only: true,
                use_nbd: true,
                ..Default::default()
            },
            block_count: 4096,
            block_size: 4096,
            max_unmap_desc_count: 1,
            pid: 7,
            nbd: Some(NbdConnectionProperties {
                hostname: "localhost".to_string(),
                port: 10809,
                export_name: "export".to_string(),
                skip_negotiation: true,
            }),
        };
        let round_tripped = WireDiskProperties::from_properties(&props).to_properties();
        assert_eq!(round_tripped, props);
    }

    #[test]
    fn io_request_cmd_views() {
        let wire = WireIoRequest::from_io_request(&userio::IoRequest {
            tag: 11,
            cmd: IoRequestCmd::Write {
                block_address: 0x10,
                block_count: 8,
                fua: true,
            },
        });
        assert_eq!(wire.request_type, REQ_TYPE_WRITE);
        let cmd = wire.read_cmd();
        assert_eq!(cmd.block_address, 0x10);
        assert_eq!(cmd.block_count, 8);
        assert_eq!(cmd.flags & REQ_FLAG_FUA, REQ_FLAG_FUA);

        let wire = WireIoRequest::from_io_request(&userio::IoRequest {
            tag: 12,
            cmd: IoRequestCmd::PersistResOut {
                service_action: 0x01,
                scope: 0x02,
                res_type: 0x03,
                parameter_list_length: 0x18,
            },
        });
        let cmd = wire.persist_res_out_cmd();
        assert_eq!(cmd.scope_type & 0x0f, 0x02);
        assert_eq!(cmd.scope_type >> 4, 0x03);
        assert_eq!(cmd.parameter_list_length, 0x18);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let adapter = adapter();
        assert!(matches!(
            dispatch(
                &adapter,
                &caller(),
                WireBaseCommand {
                    io_control_code: 999
                }
                .as_bytes(),
                &mut []
            ),
            Err(Error::InvalidParameter(_))
        ));
    }
}
