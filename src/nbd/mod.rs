// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The built-in NBD backend: connection establishment, option negotiation
//! and the per-disk dispatcher workers.

pub mod client;
pub(crate) mod dispatch;

pub use client::Error;
pub use client::ExportInfo;
