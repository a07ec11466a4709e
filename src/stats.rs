// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// Per-disk request counters, updated lock-free from the ingress, dispatcher
/// and completion paths.
///
/// The counters satisfy, at any quiescent point:
/// `total_received == total_replies + aborted + outstanding`.
#[derive(Debug, Default)]
pub struct DiskStats {
    pub total_received_io_requests: AtomicI64,
    pub total_submitted_io_requests: AtomicI64,
    pub total_received_io_replies: AtomicI64,
    pub unsubmitted_io_requests: AtomicI64,
    pub pending_submitted_io_requests: AtomicI64,
    pub aborted_submitted_io_requests: AtomicI64,
    pub aborted_unsubmitted_io_requests: AtomicI64,
    pub completed_aborted_io_requests: AtomicI64,
    pub outstanding_io_count: AtomicI64,
}

/// Point-in-time copy of [`DiskStats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskStatsSnapshot {
    pub total_received_io_requests: i64,
    pub total_submitted_io_requests: i64,
    pub total_received_io_replies: i64,
    pub unsubmitted_io_requests: i64,
    pub pending_submitted_io_requests: i64,
    pub aborted_submitted_io_requests: i64,
    pub aborted_unsubmitted_io_requests: i64,
    pub completed_aborted_io_requests: i64,
    pub outstanding_io_count: i64,
}

impl DiskStats {
    pub fn snapshot(&self) -> DiskStatsSnapshot {
        DiskStatsSnapshot {
            total_received_io_requests: self.total_received_io_requests.load(Ordering::Relaxed),
            total_submitted_io_requests: self.total_submitted_io_requests.load(Ordering::Relaxed),
            total_received_io_replies: self.total_received_io_replies.load(Ordering::Relaxed),
            unsubmitted_io_requests: self.unsubmitted_io_requests.load(Ordering::Relaxed),
            pending_submitted_io_requests: self
                .pending_submitted_io_requests
                .load(Ordering::Relaxed),
            aborted_submitted_io_requests: self
                .aborted_submitted_io_requests
                .load(Ordering::Relaxed),
            aborted_unsubmitted_io_requests: self
                .aborted_unsubmitted_io_requests
                .load(Ordering::Relaxed),
            completed_aborted_io_requests: self
                .completed_aborted_io_requests
                .load(Ordering::Relaxed),
            outstanding_io_count: self.outstanding_io_count.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn inc(counter: &AtomicI64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn dec(counter: &AtomicI64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}
