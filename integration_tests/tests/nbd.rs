// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end IO through the built-in NBD client against an in-process
//! server, including negotiation and transport-failure teardown.

use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use integration_tests::shared_disk;
use integration_tests::wait_until;
use integration_tests::NbdServerBehavior;
use integration_tests::NbdTestServer;
use integration_tests::TestPort;
use nbd_sys::*;
use scsibridge::scsi::constants::*;
use scsibridge::Adapter;
use scsibridge::DiskFlags;
use scsibridge::DiskProperties;
use scsibridge::Error;
use scsibridge::NbdConnectionProperties;
use scsibridge::OptionsStore;
use scsibridge::ScsiAddress;
use scsibridge::Srb;
use zerocopy::IntoBytes;

const TIMEOUT: Duration = Duration::from_secs(10);

fn nbd_props(server: &NbdTestServer) -> DiskProperties {
    DiskProperties {
        instance_name: "disk-nbd".to_string(),
        pid: 100,
        flags: DiskFlags {
            use_nbd: true,
            ..Default::default()
        },
        nbd: Some(NbdConnectionProperties {
            hostname: server.addr.ip().to_string(),
            port: server.addr.port(),
            export_name: "export-a".to_string(),
            skip_negotiation: false,
        }),
        ..Default::default()
    }
}

fn read10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![READ_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

fn write10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = read10_cdb(lba, blocks);
    cdb[0] = WRITE_10;
    cdb
}

#[test]
fn negotiated_io_round_trip() {
    let disk = shared_disk(2048);
    let server = NbdTestServer::start(
        disk.clone(),
        NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA | NBD_FLAG_SEND_TRIM,
        NbdServerBehavior::Serve,
    );

    let port = TestPort::new();
    let adapter = Adapter::new(port.clone(), Arc::new(OptionsStore::new()));
    let info = adapter.create_disk(nbd_props(&server)).unwrap();

    // Geometry and capabilities come out of the negotiation.
    assert_eq!(info.properties.block_size, 512);
    assert_eq!(info.properties.block_count, 2048);
    assert!(info.properties.flags.flush_supported);
    assert!(info.properties.flags.fua_supported);
    assert!(info.properties.flags.unmap_supported);
    assert!(!info.properties.flags.read_only);

    let address = ScsiAddress::new(info.bus, info.target, info.lun);

    let payload: Vec<u8> = (0..4 * 512).map(|i| (i % 253) as u8).collect();
    let mut srb = Srb::execute_scsi(address, &write10_cdb(16, 4), payload.len());
    srb.data_mut().copy_from_slice(&payload);
    adapter.start_io(srb);
    let completions = port.wait_for_completions(1, TIMEOUT);
    assert_eq!(completions[0].srb_status(), SRB_STATUS_SUCCESS);

    // The server saw the write land in its backing store.
    assert_eq!(&disk.lock()[16 * 512..20 * 512], &payload[..]);

    let srb = Srb::execute_scsi(address, &read10_cdb(16, 4), payload.len());
    adapter.start_io(srb);
    let completions = port.wait_for_completions(1, TIMEOUT);
    assert_eq!(completions[0].srb_status(), SRB_STATUS_SUCCESS);
    assert_eq!(completions[0].data(), &payload[..]);

    let srb = Srb::execute_scsi(address, &[SYNCHRONIZE_CACHE_10], 0);
    adapter.start_io(srb);
    let completions = port.wait_for_completions(1, TIMEOUT);
    assert_eq!(completions[0].srb_status(), SRB_STATUS_SUCCESS);

    adapter.remove_disk("disk-nbd", true).unwrap();
    server.join();
}

#[test]
fn read_only_export_rejects_writes() {
    let disk = shared_disk(2048);
    let server = NbdTestServer::start(
        disk,
        NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY,
        NbdServerBehavior::Serve,
    );

    let port = TestPort::new();
    let adapter = Adapter::new(port.clone(), Arc::new(OptionsStore::new()));
    let info = adapter.create_disk(nbd_props(&server)).unwrap();
    assert!(info.properties.flags.read_only);

    let address = ScsiAddress::new(info.bus, info.target, info.lun);
    let srb = Srb::execute_scsi(address, &write10_cdb(0, 1), 512);
    adapter.start_io(srb);
    let completions = port.wait_for_completions(1, TIMEOUT);
    assert_eq!(
        srb_status_code(completions[0].srb_status()),
        SRB_STATUS_INVALID_REQUEST
    );

    adapter.remove_disk("disk-nbd", true).unwrap();
    server.join();
}

#[test]
fn transport_disconnect_aborts_in_flight_requests() {
    let disk = shared_disk(2048);
    let server = NbdTestServer::start(
        disk,
        NBD_FLAG_HAS_FLAGS,
        NbdServerBehavior::DropAfter { after_requests: 1 },
    );

    let port = TestPort::new();
    let adapter = Adapter::new(port.clone(), Arc::new(OptionsStore::new()));
    let info = adapter.create_disk(nbd_props(&server)).unwrap();
    let address = ScsiAddress::new(info.bus, info.target, info.lun);

    for lba in 0..3u32 {
        let srb = Srb::execute_scsi(address, &read10_cdb(lba, 1), 512);
        adapter.start_io(srb);
    }

    // The dropped connection must hard-tear-down the disk on its own.
    assert!(wait_until(TIMEOUT, || matches!(
        adapter.show("disk-nbd"),
        Err(Error::NotFound)
    )));

    let completions = port.wait_for_completions(3, TIMEOUT);
    assert_eq!(completions.len(), 3);
    for srb in &completions {
        assert_eq!(srb.srb_status(), SRB_STATUS_ABORTED);
        assert_eq!(srb.data_transfer_length(), 0);
    }
    server.join();
}

#[test]
fn policy_rejection_fails_create_with_access_denied() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(&NBD_INIT_PASSWD).unwrap();
        sock.write_all(&NBD_OPTION_MAGIC.to_be_bytes()).unwrap();
        sock.write_all(&NBD_FLAG_FIXED_NEWSTYLE.to_be_bytes())
            .unwrap();

        let mut client_flags = [0u8; 4];
        sock.read_exact(&mut client_flags).unwrap();
        let mut header = [0u8; 16];
        sock.read_exact(&mut header).unwrap();
        let length = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let mut data = vec![0u8; length as usize];
        sock.read_exact(&mut data).unwrap();

        let reply = nbd_option_reply_header {
            magic: NBD_REP_MAGIC.into(),
            option: NBD_OPT_GO.into(),
            reply_type: NBD_REP_ERR_POLICY.into(),
            length: 0u32.into(),
        };
        sock.write_all(reply.as_bytes()).unwrap();
    });

    let adapter = Adapter::new(TestPort::new(), Arc::new(OptionsStore::new()));
    let result = adapter.create_disk(DiskProperties {
        instance_name: "disk-nbd".to_string(),
        pid: 100,
        flags: DiskFlags {
            use_nbd: true,
            ..Default::default()
        },
        nbd: Some(NbdConnectionProperties {
            hostname: addr.ip().to_string(),
            port: addr.port(),
            export_name: "export-a".to_string(),
            skip_negotiation: false,
        }),
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::AccessDenied)));
    // Nothing was published.
    assert!(adapter.list().is_empty());
    server.join().unwrap();
}
