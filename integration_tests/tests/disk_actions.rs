// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Disk lifecycle scenarios driven through the adapter and the binary
//! control surface.

use std::sync::Arc;

use integration_tests::TestPort;
use scsibridge::control;
use scsibridge::control::CallerContext;
use scsibridge::control::WireBaseCommand;
use scsibridge::control::WireConnectionInfo;
use scsibridge::control::WireCreateCommand;
use scsibridge::control::WireDiskProperties;
use scsibridge::control::WireListHeader;
use scsibridge::control::WireRemoveCommand;
use scsibridge::control::WireSetSizeCommand;
use scsibridge::control::CMD_LIST;
use scsibridge::control::CMD_SET_DISK_SIZE;
use scsibridge::Adapter;
use scsibridge::DiskProperties;
use scsibridge::Error;
use scsibridge::OptionsStore;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

fn adapter() -> Adapter {
    Adapter::new(TestPort::new(), Arc::new(OptionsStore::new()))
}

fn disk_props(name: &str) -> DiskProperties {
    DiskProperties {
        instance_name: name.to_string(),
        block_count: 2048,
        block_size: 512,
        pid: 100,
        ..Default::default()
    }
}

#[test]
fn create_show_remove_cycle() {
    let adapter = adapter();

    let info = adapter.create_disk(disk_props("disk-a")).unwrap();
    assert_eq!(info.connection_id, 1);
    assert_eq!((info.bus, info.target, info.lun), (0, 0, 0));

    let shown = adapter.show("disk-a").unwrap();
    assert_eq!(shown.properties.instance_name, "disk-a");
    assert_eq!(shown.properties.block_count, 2048);
    assert_eq!(shown.properties.block_size, 512);
    assert_eq!(shown.connection_id, 1);

    adapter.remove_disk("disk-a", true).unwrap();
    assert!(matches!(adapter.show("disk-a"), Err(Error::NotFound)));
}

#[test]
fn duplicate_instance_name_is_a_name_collision() {
    let adapter = adapter();
    adapter.create_disk(disk_props("disk-a")).unwrap();

    match adapter.create_disk(disk_props("disk-a")) {
        Err(Error::NameCollision(name)) => assert_eq!(name, "disk-a"),
        other => panic!("expected a name collision, got {:?}", other.map(|_| ())),
    }

    adapter.remove_disk("disk-a", true).unwrap();
}

#[test]
fn remove_is_not_idempotent_across_completion() {
    let adapter = adapter();
    adapter.create_disk(disk_props("disk-a")).unwrap();
    adapter.remove_disk("disk-a", true).unwrap();
    // The second removal races nothing: the first one only returned once the
    // disk was gone.
    assert!(matches!(
        adapter.remove_disk("disk-a", true),
        Err(Error::NotFound)
    ));
}

#[test]
fn fresh_disk_has_zeroed_stats() {
    let adapter = adapter();
    adapter.create_disk(disk_props("disk-a")).unwrap();
    let stats = adapter.stats("disk-a").unwrap();
    assert_eq!(stats.total_received_io_requests, 0);
    assert_eq!(stats.outstanding_io_count, 0);
    adapter.remove_disk("disk-a", true).unwrap();
    assert!(matches!(adapter.stats("disk-a"), Err(Error::NotFound)));
}

#[test]
fn soft_remove_also_tears_down() {
    let adapter = adapter();
    adapter.create_disk(disk_props("disk-a")).unwrap();
    adapter.remove_disk("disk-a", false).unwrap();
    assert!(matches!(adapter.show("disk-a"), Err(Error::NotFound)));
}

#[test]
fn control_surface_create_list_remove() {
    let adapter = adapter();
    let caller = CallerContext { pid: 100 };

    let wire_props = WireDiskProperties::from_properties(&disk_props("disk-ctl"));
    let create = WireCreateCommand::new(wire_props);
    let mut out = [0u8; std::mem::size_of::<WireConnectionInfo>()];
    let len = control::dispatch(&adapter, &caller, create.as_bytes(), &mut out).unwrap();
    assert_eq!(len, out.len());
    let info = WireConnectionInfo::read_from_bytes(&out[..]).unwrap();
    assert_eq!(info.connection_id, 1);

    // List sizing: first call reports the required size.
    let list = WireBaseCommand {
        io_control_code: CMD_LIST,
    };
    let required = control::dispatch(&adapter, &caller, list.as_bytes(), &mut []).unwrap();
    assert_eq!(
        required,
        std::mem::size_of::<WireListHeader>() + std::mem::size_of::<WireConnectionInfo>()
    );
    let mut list_buf = vec![0u8; required];
    control::dispatch(&adapter, &caller, list.as_bytes(), &mut list_buf).unwrap();
    let header = WireListHeader::read_from_prefix(&list_buf[..]).unwrap().0;
    assert_eq!(header.count, 1);

    let remove = WireRemoveCommand::new("disk-ctl", true);
    control::dispatch(&adapter, &caller, remove.as_bytes(), &mut []).unwrap();
    assert!(matches!(adapter.show("disk-ctl"), Err(Error::NotFound)));
}

#[test]
fn control_surface_set_disk_size() {
    let adapter = adapter();
    let caller = CallerContext { pid: 100 };
    let info = adapter.create_disk(disk_props("disk-a")).unwrap();

    let mut cmd = WireSetSizeCommand::default();
    cmd.io_control_code = CMD_SET_DISK_SIZE;
    cmd.connection_id = info.connection_id;
    cmd.block_count = 8192;
    control::dispatch(&adapter, &caller, cmd.as_bytes(), &mut []).unwrap();

    assert_eq!(adapter.show("disk-a").unwrap().properties.block_count, 8192);
    adapter.remove_disk("disk-a", true).unwrap();
}
