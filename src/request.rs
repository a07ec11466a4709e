// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use sync::Mutex;

use crate::scsi::cdb::BackendOp;
use crate::scsi::Srb;

/// One in-flight IO request: the queue element tying a pended SRB to the
/// backend operation dispatched for it.
///
/// A record lives on at most one of the per-disk queues at any instant. The
/// `completed` flag is the single-completion guard: whichever path flips it
/// first takes the SRB and is responsible for notifying the host port.
#[derive(Debug)]
pub struct Request {
    op: BackendOp,
    /// Byte offset of the transfer on the disk.
    offset: u64,
    /// Byte length of the transfer.
    length: u32,
    fua: bool,
    /// Backend tag; assigned by the dispatcher just before submission.
    tag: AtomicU64,
    aborted: AtomicBool,
    completed: AtomicBool,
    accepted_at: Instant,
    srb: Mutex<Option<Srb>>,
}

impl Request {
    pub fn new(op: BackendOp, offset: u64, length: u32, fua: bool, srb: Srb) -> Request {
        Request {
            op,
            offset,
            length,
            fua,
            tag: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            accepted_at: Instant::now(),
            srb: Mutex::new(Some(srb)),
        }
    }

    pub fn op(&self) -> BackendOp {
        self.op
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn fua(&self) -> bool {
        self.fua
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    pub fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Marks the record aborted. Returns whether this call was the one that
    /// aborted it.
    pub fn mark_aborted(&self) -> bool {
        !self.aborted.swap(true, Ordering::AcqRel)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Single-completion gate: the first caller gets the SRB back and must
    /// notify the host port; later callers get `None`.
    pub fn try_complete(&self) -> Option<Srb> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.srb.lock().take()
    }

    /// Runs `f` against the SRB if it has not been taken by a completion yet.
    pub fn with_srb<R>(&self, f: impl FnOnce(&mut Srb) -> R) -> Option<R> {
        self.srb.lock().as_mut().map(f)
    }
}
