// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::net::Shutdown;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base::debug;
use base::error;
use base::info;
use base::warn;
use base::Event;
use base::EventWaitResult;
use sync::Mutex;

use crate::port::StoragePort;
use crate::port::PREALLOC_BUFFER_SIZE;
use crate::queue::RequestQueues;
use crate::request::Request;
use crate::rundown::RundownRef;
use crate::scsi::cdb::BackendOp;
use crate::stats;
use crate::stats::DiskStats;

/// How long the monitor waits for the reply worker before giving up on the
/// join. The reply worker normally exits as soon as the socket is shut down.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum length of an instance name, serial number, hostname or export
/// name, including the terminator on the binary control surface.
pub const MAX_NAME_LENGTH: usize = 256;
/// Maximum length of the owner string, including the terminator.
pub const MAX_OWNER_LENGTH: usize = 16;

/// Disk capability flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskFlags {
    pub read_only: bool,
    pub flush_supported: bool,
    pub fua_supported: bool,
    pub unmap_supported: bool,
    pub unmap_anchor_supported: bool,
    pub persist_res_supported: bool,
    /// Backed by the built-in NBD client rather than a user-space handler.
    pub use_nbd: bool,
}

/// NBD server coordinates for disks created with `use_nbd`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NbdConnectionProperties {
    pub hostname: String,
    pub port: u16,
    pub export_name: String,
    /// Skip negotiation and jump directly to the transmission phase. The
    /// caller must then provide the geometry and capability flags itself.
    pub skip_negotiation: bool,
}

/// Properties supplied when mapping a disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskProperties {
    /// Unique disk identifier.
    pub instance_name: String,
    /// Exposed through the serial number VPD page; defaults to the instance
    /// name when empty.
    pub serial_number: String,
    /// Free-form string identifying the owner of the disk.
    pub owner: String,
    pub flags: DiskFlags,
    pub block_count: u64,
    pub block_size: u32,
    pub max_unmap_desc_count: u32,
    /// The user-space process driving this disk's IO when `use_nbd` is off.
    pub pid: u32,
    pub nbd: Option<NbdConnectionProperties>,
}

#[derive(Debug, Default)]
struct SocketSlots {
    /// The socket senders transmit on. Swapped out at disconnect so that no
    /// further requests hit a half-closed connection.
    live: Option<TcpStream>,
    /// The handle parked by `disconnect_socket` for `close_socket` to close.
    to_close: Option<TcpStream>,
}

pub(crate) struct NbdWorkerHandles {
    pub request: JoinHandle<()>,
    pub reply: JoinHandle<()>,
    /// Signaled by the reply worker on exit; lets the monitor bound its join.
    pub reply_done: Event,
}

/// One mapped disk: identity, geometry, queues, backend binding and teardown
/// state.
pub struct DiskDevice {
    props: DiskProperties,
    address: crate::scsi::ScsiAddress,
    connection_id: u64,
    /// Updated when geometry changes at runtime.
    block_count: AtomicU64,
    /// Assigned by the OS once the disk is brought online; -1 until then.
    disk_number: AtomicI32,
    pnp_device_id: Mutex<String>,

    pub(crate) queues: RequestQueues,
    pub(crate) stats: DiskStats,
    pub(crate) rundown: RundownRef,

    /// Raised when removal of this disk has been requested.
    removal_event: Event,
    /// Raised when the disk has been fully torn down and unregistered.
    departed_event: Event,
    soft_terminate: AtomicBool,
    hard_terminate: AtomicBool,

    socket: Mutex<SocketSlots>,
    next_tag: AtomicU64,
    pub(crate) read_buffer: Mutex<Vec<u8>>,
    pub(crate) write_buffer: Mutex<Vec<u8>>,
    pub(crate) workers: Mutex<Option<NbdWorkerHandles>>,
}

impl DiskDevice {
    pub(crate) fn new(
        props: DiskProperties,
        address: crate::scsi::ScsiAddress,
        connection_id: u64,
    ) -> DiskDevice {
        let block_count = props.block_count;
        DiskDevice {
            props,
            address,
            connection_id,
            block_count: AtomicU64::new(block_count),
            disk_number: AtomicI32::new(-1),
            pnp_device_id: Mutex::new(String::new()),
            queues: RequestQueues::new(),
            stats: DiskStats::default(),
            rundown: RundownRef::new(),
            removal_event: Event::new(),
            departed_event: Event::new(),
            soft_terminate: AtomicBool::new(false),
            hard_terminate: AtomicBool::new(false),
            socket: Mutex::new(SocketSlots::default()),
            next_tag: AtomicU64::new(0),
            read_buffer: Mutex::new(Vec::new()),
            write_buffer: Mutex::new(Vec::new()),
            workers: Mutex::new(None),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.props.instance_name
    }

    pub fn serial_number(&self) -> &str {
        &self.props.serial_number
    }

    pub fn owner(&self) -> &str {
        &self.props.owner
    }

    pub fn pid(&self) -> u32 {
        self.props.pid
    }

    pub fn flags(&self) -> DiskFlags {
        self.props.flags
    }

    pub fn address(&self) -> crate::scsi::ScsiAddress {
        self.address
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn block_size(&self) -> u32 {
        self.props.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn set_block_count(&self, block_count: u64) {
        self.block_count.store(block_count, Ordering::Release);
    }

    pub fn disk_size(&self) -> u64 {
        self.block_count() * self.props.block_size as u64
    }

    pub fn disk_number(&self) -> i32 {
        self.disk_number.load(Ordering::Acquire)
    }

    pub fn set_disk_number(&self, disk_number: i32) {
        self.disk_number.store(disk_number, Ordering::Release);
    }

    pub fn pnp_device_id(&self) -> String {
        self.pnp_device_id.lock().clone()
    }

    pub fn set_pnp_device_id(&self, id: String) {
        *self.pnp_device_id.lock() = id;
    }

    /// Properties as they currently stand, including runtime geometry
    /// updates.
    pub fn current_properties(&self) -> DiskProperties {
        let mut props = self.props.clone();
        props.block_count = self.block_count();
        props
    }

    pub(crate) fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn soft_terminated(&self) -> bool {
        self.soft_terminate.load(Ordering::Acquire)
    }

    pub fn hard_terminated(&self) -> bool {
        self.hard_terminate.load(Ordering::Acquire)
    }

    pub(crate) fn removal_event(&self) -> &Event {
        &self.removal_event
    }

    pub(crate) fn departed_event(&self) -> &Event {
        &self.departed_event
    }

    /// Marks the disk for removal and wakes everything that might be waiting:
    /// queue waiters, the user-space fetch path and the monitor.
    pub(crate) fn request_removal(&self, hard: bool) {
        self.soft_terminate.store(true, Ordering::Release);
        if hard {
            self.hard_terminate.store(true, Ordering::Release);
        }
        self.queues.interrupt();
        self.removal_event.signal();
    }

    /// Asynchronous teardown used by the dispatcher paths on backend errors.
    pub(crate) fn disconnect_async(&self, hard: bool) {
        info!(
            "disk {}: requesting async disconnect (hard: {})",
            self.props.instance_name, hard
        );
        self.request_removal(hard);
    }

    pub(crate) fn install_socket(&self, sock: TcpStream) {
        self.socket.lock().live = Some(sock);
    }

    /// Whether the live socket slot is still populated. Senders check this
    /// under the socket lock before each transmission so they never start a
    /// send after a disconnect was initiated; the transmission itself runs
    /// on a duplicated handle outside the lock, where a shutdown can
    /// interrupt it.
    pub(crate) fn live_socket_present(&self) -> bool {
        self.socket.lock().live.is_some()
    }

    /// Duplicates the live socket handle for the workers, which must block
    /// in `read`/`write` without holding the socket lock.
    pub(crate) fn clone_live_socket(&self) -> Option<TcpStream> {
        let slots = self.socket.lock();
        slots.live.as_ref().and_then(|s| s.try_clone().ok())
    }

    /// Pulls the live socket out from under the senders and shuts it down,
    /// waking the reply worker. The handle is parked in the to-close slot
    /// until [`close_socket`](Self::close_socket) runs.
    pub(crate) fn disconnect_socket(&self) {
        let sock = self.socket.lock().live.take();
        if let Some(sock) = sock {
            info!(
                "disk {}: shutting down backend connection",
                self.props.instance_name
            );
            if let Err(e) = sock.shutdown(Shutdown::Both) {
                warn!(
                    "disk {}: socket shutdown failed: {}",
                    self.props.instance_name, e
                );
            }
            self.socket.lock().to_close = Some(sock);
        }
    }

    pub(crate) fn close_socket(&self) {
        let mut slots = self.socket.lock();
        slots.live = None;
        slots.to_close = None;
    }

    /// Preallocates the transfer scratch buffers used by the NBD workers.
    pub(crate) fn preallocate_buffers(&self) {
        self.read_buffer.lock().resize(PREALLOC_BUFFER_SIZE, 0);
        self.write_buffer.lock().resize(PREALLOC_BUFFER_SIZE, 0);
    }

    /// Checks an IO request against the disk's current capability flags.
    ///
    /// Performed at ingress and again by the dispatchers, since NBD
    /// negotiation may adjust the flags after a request was accepted.
    pub(crate) fn validate_io(&self, op: BackendOp) -> bool {
        let flags = self.props.flags;
        match op {
            BackendOp::Write | BackendOp::Flush | BackendOp::Unmap if flags.read_only => {
                warn!(
                    "disk {}: write, flush or unmap requested on a read-only disk",
                    self.props.instance_name
                );
                false
            }
            BackendOp::Unmap if !flags.unmap_supported => false,
            BackendOp::Flush if !flags.flush_supported => false,
            BackendOp::PersistResIn | BackendOp::PersistResOut
                if !flags.persist_res_supported || flags.use_nbd =>
            {
                false
            }
            _ => true,
        }
    }

    /// Completes `req` towards the host port if no other path got there
    /// first. The single-completion guard inside the record keeps a racing
    /// drain and reply from both notifying.
    pub(crate) fn complete_request(&self, req: &Request, port: &dyn StoragePort) {
        if let Some(srb) = req.try_complete() {
            debug!(
                "disk {}: completing request, tag {:#x}, status {}, {:?} after accept",
                self.props.instance_name,
                req.tag(),
                crate::scsi::constants::srb_status_str(srb.srb_status()),
                req.accepted_at().elapsed()
            );
            stats::dec(&self.stats.outstanding_io_count);
            port.request_complete(srb);
        }
    }

    /// Completes every record in `records` as aborted. `submitted` selects
    /// which abort counter is incremented.
    pub(crate) fn abort_requests(
        &self,
        records: &[Arc<Request>],
        submitted: bool,
        port: &dyn StoragePort,
    ) {
        for req in records {
            req.with_srb(|srb| {
                srb.set_data_transfer_length(0);
                srb.set_srb_status(crate::scsi::constants::SRB_STATUS_ABORTED);
            });
            if req.mark_aborted() {
                if submitted {
                    stats::inc(&self.stats.aborted_submitted_io_requests);
                } else {
                    stats::inc(&self.stats.aborted_unsubmitted_io_requests);
                }
            }
            self.complete_request(req, port);
        }
    }

    /// Joins the NBD workers, bounding the reply-side join by
    /// [`WORKER_JOIN_TIMEOUT`].
    pub(crate) fn join_workers(&self) {
        let Some(handles) = self.workers.lock().take() else {
            return;
        };
        if handles.request.join().is_err() {
            error!(
                "disk {}: request worker panicked",
                self.props.instance_name
            );
        }
        match handles.reply_done.wait_timeout(WORKER_JOIN_TIMEOUT) {
            EventWaitResult::Signaled => {
                if handles.reply.join().is_err() {
                    error!("disk {}: reply worker panicked", self.props.instance_name);
                }
            }
            EventWaitResult::TimedOut => {
                // The thread is stuck in a socket read that shutdown did not
                // interrupt; it exits on its own once the read fails.
                warn!(
                    "disk {}: timed out waiting for the reply worker",
                    self.props.instance_name
                );
            }
        }
    }
}

impl std::fmt::Debug for DiskDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DiskDevice")
            .field("instance_name", &self.props.instance_name)
            .field("address", &self.address)
            .field("connection_id", &self.connection_id)
            .field("use_nbd", &self.props.flags.use_nbd)
            .finish()
    }
}
