// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;

use sync::Condvar;
use sync::Mutex;

use crate::request::Request;

#[derive(Debug, Default)]
struct PendingState {
    queue: VecDeque<Arc<Request>>,
    interrupted: bool,
}

/// The two per-disk request FIFOs.
///
/// The pending queue is filled by SRB ingress and drained by the dispatcher;
/// waiters block on it jointly with the interrupt signal raised at teardown.
/// The submitted queue tracks records already sent to the backend and is
/// searched by tag when the matching reply arrives. Backends may reply out of
/// order, so ordering is only guaranteed on the pending side.
#[derive(Debug, Default)]
pub struct RequestQueues {
    pending: Mutex<PendingState>,
    avail: Condvar,
    submitted: Mutex<VecDeque<Arc<Request>>>,
}

impl RequestQueues {
    pub fn new() -> RequestQueues {
        RequestQueues::default()
    }

    pub fn push_pending(&self, req: Arc<Request>) {
        let mut pending = self.pending.lock();
        pending.queue.push_back(req);
        self.avail.notify_one();
    }

    /// Blocks until a pending record is available or the queue is
    /// interrupted. The interrupt is sticky; once raised, every present and
    /// future waiter returns `None` as soon as the queue runs dry.
    pub fn wait_pending(&self) -> Option<Arc<Request>> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(req) = pending.queue.pop_front() {
                return Some(req);
            }
            if pending.interrupted {
                return None;
            }
            pending = self.avail.wait(pending);
        }
    }

    pub fn try_pop_pending(&self) -> Option<Arc<Request>> {
        self.pending.lock().queue.pop_front()
    }

    /// Wakes all pending waiters for teardown.
    pub fn interrupt(&self) {
        let mut pending = self.pending.lock();
        pending.interrupted = true;
        self.avail.notify_all();
    }

    pub fn push_submitted(&self, req: Arc<Request>) {
        self.submitted.lock().push_back(req);
    }

    /// Removes and returns the submitted record carrying `tag`.
    pub fn remove_submitted(&self, tag: u64) -> Option<Arc<Request>> {
        let mut submitted = self.submitted.lock();
        let pos = submitted.iter().position(|req| req.tag() == tag)?;
        submitted.remove(pos)
    }

    pub fn drain_pending(&self) -> Vec<Arc<Request>> {
        self.pending.lock().queue.drain(..).collect()
    }

    pub fn drain_submitted(&self) -> Vec<Arc<Request>> {
        self.submitted.lock().drain(..).collect()
    }

    /// Snapshot of the submitted queue, used to mark records aborted without
    /// removing them (their replies are still expected).
    pub fn submitted_records(&self) -> Vec<Arc<Request>> {
        self.submitted.lock().iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().queue.len()
    }

    pub fn submitted_len(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::scsi::cdb::BackendOp;
    use crate::scsi::constants::READ_10;
    use crate::scsi::ScsiAddress;
    use crate::scsi::Srb;

    use super::*;

    fn request(offset: u64) -> Arc<Request> {
        let srb = Srb::execute_scsi(ScsiAddress::new(0, 0, 0), &[READ_10], 512);
        Arc::new(Request::new(BackendOp::Read, offset, 512, false, srb))
    }

    #[test]
    fn fifo_order() {
        let queues = RequestQueues::new();
        queues.push_pending(request(0));
        queues.push_pending(request(512));
        assert_eq!(queues.wait_pending().unwrap().offset(), 0);
        assert_eq!(queues.wait_pending().unwrap().offset(), 512);
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let queues = Arc::new(RequestQueues::new());
        let queues2 = queues.clone();
        let waiter = thread::spawn(move || queues2.wait_pending());
        queues.interrupt();
        assert!(waiter.join().unwrap().is_none());
        // Sticky: later waits return immediately too.
        assert!(queues.wait_pending().is_none());
    }

    #[test]
    fn interrupted_queue_still_drains() {
        let queues = RequestQueues::new();
        queues.push_pending(request(0));
        queues.interrupt();
        // A queued record is still handed out ahead of the interrupt.
        assert!(queues.wait_pending().is_some());
        assert!(queues.wait_pending().is_none());
    }

    #[test]
    fn submitted_lookup_by_tag() {
        let queues = RequestQueues::new();
        let req = request(0);
        req.set_tag(7);
        queues.push_submitted(req);
        assert!(queues.remove_submitted(9).is_none());
        let found = queues.remove_submitted(7).unwrap();
        assert_eq!(found.tag(), 7);
        assert_eq!(queues.submitted_len(), 0);
    }
}
