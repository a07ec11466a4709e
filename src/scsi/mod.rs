// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SCSI front end: the request blocks handed over by the host storage port,
//! CDB decoding, the inline command stubs, and the ingress entry points.

pub mod cdb;
pub mod constants;
mod ingress;
mod operation;
mod srb;

pub(crate) use ingress::start_io;
pub use srb::ScsiAddress;
pub use srb::SenseData;
pub use srb::Srb;
pub use srb::SrbFunction;
