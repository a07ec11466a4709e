// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small platform utilities shared by the workspace: a waitable event plus
//! the `log` macros re-exported so that consumers only need a `base`
//! dependency for logging.

mod event;

pub use event::Event;
pub use event::EventWaitResult;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
