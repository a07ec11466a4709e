// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract between the adapter and the host storage port.

use crate::scsi::Srb;

// Addressing limits reported to the host storage port.
pub const MAX_BUSES: u8 = 1;
pub const MAX_TARGETS_PER_BUS: u8 = 2;
pub const MAX_LUNS_PER_TARGET: u8 = 255;

/// Largest single transfer accepted by the adapter. The host storage stack
/// submits zero-sized buffers for anything bigger.
pub const MAX_TRANSFER_LENGTH: u32 = 2 * 1024 * 1024;

/// Block size assumed for NBD-backed disks that negotiate only a byte size.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Initial size of the per-disk read and write scratch buffers. Grown on
/// demand, never shrunk.
pub const PREALLOC_BUFFER_SIZE: usize = MAX_TRANSFER_LENGTH as usize;

/// Callbacks into the host storage port consumed by the adapter.
///
/// Every SRB accepted by [`crate::Adapter::start_io`] is eventually handed
/// back through `request_complete`, exactly once.
pub trait StoragePort: Send + Sync {
    /// Delivers a finished SRB back to the host storage port.
    fn request_complete(&self, srb: Srb);

    /// Bulk-completes every request outstanding on `(bus, target)` with the
    /// given SRB status. Used by device and bus resets.
    fn complete_all(&self, bus: u8, target: u8, srb_status: u8);

    /// Asks the host port to rescan the bus after a LUN appeared or vanished.
    fn bus_change_detected(&self);
}

/// Static adapter characteristics reported when the miniport is bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdapterLimits {
    pub max_transfer_length: u32,
    pub number_of_buses: u8,
    pub targets_per_bus: u8,
    pub luns_per_target: u8,
    pub tagged_queuing: bool,
    pub multiple_request_per_lu: bool,
    pub virtual_device: bool,
}

impl Default for AdapterLimits {
    fn default() -> AdapterLimits {
        AdapterLimits {
            max_transfer_length: MAX_TRANSFER_LENGTH,
            number_of_buses: MAX_BUSES,
            targets_per_bus: MAX_TARGETS_PER_BUS,
            luns_per_target: MAX_LUNS_PER_TARGET,
            tagged_queuing: true,
            multiple_request_per_lu: true,
            virtual_device: true,
        }
    }
}
