// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A virtual SCSI storage port bridging host block IO to user-space or NBD
//! backends.
//!
//! The [`Adapter`] accepts SCSI request blocks from a host storage port (the
//! [`StoragePort`] collaborator), translates them into backend operations and
//! dispatches them either over the built-in NBD client or across the
//! user-space IO exchange, correlating asynchronous replies back to the
//! originating requests. Disk creation, lookup, statistics and teardown are
//! exposed both as typed adapter operations and through the binary
//! [`control`] surface.

pub mod adapter;
pub mod control;
mod device;
pub mod nbd;
mod options;
mod port;
mod queue;
mod request;
mod rundown;
pub mod scsi;
mod stats;
mod userio;

use remain::sorted;
use thiserror::Error as ThisError;

pub use adapter::Adapter;
pub use adapter::ConnectionInfo;
pub use adapter::DiskRef;
pub use device::DiskFlags;
pub use device::DiskProperties;
pub use device::NbdConnectionProperties;
pub use device::MAX_NAME_LENGTH;
pub use device::MAX_OWNER_LENGTH;
pub use options::OptionEntry;
pub use options::OptionValue;
pub use options::OptionsStore;
pub use port::AdapterLimits;
pub use port::StoragePort;
pub use port::DEFAULT_BLOCK_SIZE;
pub use port::MAX_TRANSFER_LENGTH;
pub use scsi::ScsiAddress;
pub use scsi::SenseData;
pub use scsi::Srb;
pub use scsi::SrbFunction;
pub use stats::DiskStatsSnapshot;
pub use userio::IoRequest;
pub use userio::IoRequestCmd;
pub use userio::IoResponse;
pub use userio::IoStatus;
pub use userio::UnmapDescriptor;

/// Errors reported at the control boundary. IO failures are reported on the
/// originating SRB instead and never show up here.
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("access denied")]
    AccessDenied,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: u64 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("disk name already in use: {0}")]
    NameCollision(String),
    #[error("NBD backend error: {0}")]
    Nbd(nbd::Error),
    #[error("not found")]
    NotFound,
    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl From<nbd::Error> for Error {
    fn from(e: nbd::Error) -> Error {
        match e {
            // A policy rejection during the handshake is an authorization
            // failure, not a transport one.
            nbd::Error::AccessDenied(_) => Error::AccessDenied,
            other => Error::Nbd(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use sync::Mutex;

    use crate::port::StoragePort;
    use crate::scsi::Srb;

    /// A storage port double collecting completions.
    #[derive(Default)]
    pub struct NullPort {
        pub completed: Mutex<Vec<Srb>>,
        pub bus_changes: AtomicUsize,
        pub bulk_completions: Mutex<Vec<(u8, u8, u8)>>,
    }

    impl StoragePort for NullPort {
        fn request_complete(&self, srb: Srb) {
            self.completed.lock().push(srb);
        }

        fn complete_all(&self, bus: u8, target: u8, srb_status: u8) {
            self.bulk_completions.lock().push((bus, target, srb_status));
        }

        fn bus_change_detected(&self) {
            self.bus_changes.fetch_add(1, Ordering::Relaxed);
        }
    }
}
