// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared fixture for the end-to-end tests: a storage port double that
//! records completions, a user-space backend daemon serving IO from memory,
//! and a miniature in-process NBD server.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use nbd_sys::*;
use scsibridge::Adapter;
use scsibridge::IoRequestCmd;
use scsibridge::IoResponse;
use scsibridge::IoStatus;
use scsibridge::Srb;
use scsibridge::StoragePort;
use sync::Condvar;
use sync::Mutex;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

pub const TEST_BLOCK_SIZE: u32 = 512;

/// A storage port double collecting completed SRBs, with blocking waits for
/// the test side.
#[derive(Default)]
pub struct TestPort {
    completed: Mutex<Vec<Srb>>,
    completion_posted: Condvar,
    bulk_completions: Mutex<Vec<(u8, u8, u8)>>,
}

impl TestPort {
    pub fn new() -> Arc<TestPort> {
        Arc::new(TestPort::default())
    }

    /// Waits until `count` completions have been collected and drains them.
    pub fn wait_for_completions(&self, count: usize, timeout: Duration) -> Vec<Srb> {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while completed.len() < count {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for {} completions", count);
            let (guard, _) = self
                .completion_posted
                .wait_timeout(completed, deadline - now);
            completed = guard;
        }
        completed.drain(..).collect()
    }

    pub fn completion_count(&self) -> usize {
        self.completed.lock().len()
    }

    pub fn bulk_completions(&self) -> Vec<(u8, u8, u8)> {
        self.bulk_completions.lock().clone()
    }
}

impl StoragePort for TestPort {
    fn request_complete(&self, srb: Srb) {
        self.completed.lock().push(srb);
        self.completion_posted.notify_all();
    }

    fn complete_all(&self, bus: u8, target: u8, srb_status: u8) {
        self.bulk_completions.lock().push((bus, target, srb_status));
    }

    fn bus_change_detected(&self) {}
}

/// In-memory disk contents shared between a test and its backend.
pub type SharedDisk = Arc<Mutex<Vec<u8>>>;

pub fn shared_disk(blocks: u64) -> SharedDisk {
    Arc::new(Mutex::new(vec![0u8; (blocks * TEST_BLOCK_SIZE as u64) as usize]))
}

/// Runs a user-space backend for `connection_id`, serving requests from
/// `disk` until it receives the disconnect descriptor.
pub fn spawn_userspace_daemon(
    adapter: Adapter,
    connection_id: u64,
    pid: u32,
    disk: SharedDisk,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut data_buf = vec![0u8; 2 * 1024 * 1024];
        loop {
            let request = match adapter.fetch_request(pid, connection_id, &mut data_buf) {
                Ok(request) => request,
                Err(_) => break,
            };
            let ok = IoResponse {
                tag: request.tag,
                status: IoStatus::default(),
            };
            match request.cmd {
                IoRequestCmd::Disconnect => break,
                IoRequestCmd::Read {
                    block_address,
                    block_count,
                    ..
                } => {
                    let offset = block_address as usize * TEST_BLOCK_SIZE as usize;
                    let length = block_count as usize * TEST_BLOCK_SIZE as usize;
                    let payload = disk.lock()[offset..offset + length].to_vec();
                    let _ = adapter.send_response(pid, connection_id, &ok, &payload);
                }
                IoRequestCmd::Write {
                    block_address,
                    block_count,
                    ..
                } => {
                    let offset = block_address as usize * TEST_BLOCK_SIZE as usize;
                    let length = block_count as usize * TEST_BLOCK_SIZE as usize;
                    disk.lock()[offset..offset + length].copy_from_slice(&data_buf[..length]);
                    let _ = adapter.send_response(pid, connection_id, &ok, &[]);
                }
                IoRequestCmd::Flush { .. } | IoRequestCmd::Unmap { .. } => {
                    let _ = adapter.send_response(pid, connection_id, &ok, &[]);
                }
                IoRequestCmd::PersistResIn { .. } | IoRequestCmd::PersistResOut { .. } => {
                    let _ = adapter.send_response(pid, connection_id, &ok, &[]);
                }
            }
        }
    })
}

/// What the miniature NBD server does once the transmission phase starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NbdServerBehavior {
    /// Serve IO from the shared disk until the client disconnects.
    Serve,
    /// Drop the connection as soon as `after_requests` requests arrived,
    /// without replying to them.
    DropAfter { after_requests: usize },
}

pub struct NbdTestServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl NbdTestServer {
    /// Starts a server exporting `disk` with the given transmission flags.
    pub fn start(
        disk: SharedDisk,
        transmission_flags: u16,
        behavior: NbdServerBehavior,
    ) -> NbdTestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let size = disk.lock().len() as u64;
            if handshake(&mut sock, size, transmission_flags).is_err() {
                return;
            }
            let _ = serve(&mut sock, &disk, behavior);
        });
        NbdTestServer { addr, handle }
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn handshake(
    sock: &mut std::net::TcpStream,
    size: u64,
    transmission_flags: u16,
) -> std::io::Result<()> {
    sock.write_all(&NBD_INIT_PASSWD)?;
    sock.write_all(&NBD_OPTION_MAGIC.to_be_bytes())?;
    sock.write_all(&(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes())?;

    let mut client_flags = [0u8; 4];
    sock.read_exact(&mut client_flags)?;

    // One option is expected: NBD_OPT_GO with the export name.
    let mut header = [0u8; 16];
    sock.read_exact(&mut header)?;
    let header = nbd_option_header::read_from_bytes(&header[..]).unwrap();
    let mut data = vec![0u8; header.length.get() as usize];
    sock.read_exact(&mut data)?;
    assert_eq!(header.option.get(), NBD_OPT_GO);

    let mut info = Vec::new();
    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
    info.extend_from_slice(&size.to_be_bytes());
    info.extend_from_slice(&transmission_flags.to_be_bytes());
    write_option_reply(sock, NBD_REP_INFO, &info)?;
    write_option_reply(sock, NBD_REP_ACK, &[])
}

fn write_option_reply(
    sock: &mut std::net::TcpStream,
    reply_type: u32,
    data: &[u8],
) -> std::io::Result<()> {
    let header = nbd_option_reply_header {
        magic: NBD_REP_MAGIC.into(),
        option: NBD_OPT_GO.into(),
        reply_type: reply_type.into(),
        length: (data.len() as u32).into(),
    };
    sock.write_all(header.as_bytes())?;
    sock.write_all(data)
}

fn serve(
    sock: &mut std::net::TcpStream,
    disk: &SharedDisk,
    behavior: NbdServerBehavior,
) -> std::io::Result<()> {
    let mut served = 0usize;
    loop {
        let mut request = [0u8; 28];
        sock.read_exact(&mut request)?;
        let request = nbd_request::read_from_bytes(&request[..]).unwrap();
        assert_eq!(request.magic.get(), NBD_REQUEST_MAGIC);

        served += 1;
        if let NbdServerBehavior::DropAfter { after_requests } = behavior {
            if served >= after_requests {
                // Consume a write payload so the client's send does not
                // block, then drop the socket without replying.
                if request.request_type.get() & 0xffff == NBD_CMD_WRITE {
                    let mut payload = vec![0u8; request.length.get() as usize];
                    sock.read_exact(&mut payload)?;
                }
                return Ok(());
            }
        }

        let offset = request.offset.get() as usize;
        let length = request.length.get() as usize;
        match request.request_type.get() & 0xffff {
            NBD_CMD_READ => {
                let payload = disk.lock()[offset..offset + length].to_vec();
                write_reply(sock, request.handle, 0)?;
                sock.write_all(&payload)?;
            }
            NBD_CMD_WRITE => {
                let mut payload = vec![0u8; length];
                sock.read_exact(&mut payload)?;
                disk.lock()[offset..offset + length].copy_from_slice(&payload);
                write_reply(sock, request.handle, 0)?;
            }
            NBD_CMD_FLUSH | NBD_CMD_TRIM => {
                write_reply(sock, request.handle, 0)?;
            }
            NBD_CMD_DISC => return Ok(()),
            other => {
                write_reply(sock, request.handle, other)?;
            }
        }
    }
}

fn write_reply(
    sock: &mut std::net::TcpStream,
    handle: [u8; 8],
    error: u32,
) -> std::io::Result<()> {
    let reply = nbd_reply {
        magic: NBD_REPLY_MAGIC.into(),
        error: error.into(),
        handle,
    };
    sock.write_all(reply.as_bytes())
}

/// Polls `f` until it returns true or the timeout elapses.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
