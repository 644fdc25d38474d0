//! Device enumeration, connection handles and opening by identifier.

use std::fs::File;
use std::sync::Arc;

use lms_driver::connection::{ConnectionEntry, XillybusEntry};
use lms_driver::mock::{MockBoard, MockConnectionEntry};
use lms_driver::{ConnectionHandle, ConnectionRegistry, DriverConfig, ErrorKind, LmsDevice};
use proptest::prelude::*;

fn config_with_device_dir(dir: &std::path::Path) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.xillybus.device_dir = dir.to_path_buf();
    config
}

#[test]
fn test_empty_registry_finds_nothing() {
    let registry = ConnectionRegistry::new();
    assert!(registry.find_connections(&ConnectionHandle::default()).is_empty());
    let err = LmsDevice::open(&registry, "", &DriverConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[test]
fn test_defaults_without_device_nodes_find_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ConnectionRegistry::with_defaults(&config_with_device_dir(dir.path()));
    assert_eq!(registry.modules(), vec![XillybusEntry::MODULE.to_string()]);
    assert!(registry.find_connections(&ConnectionHandle::default()).is_empty());
}

#[test]
fn test_hint_filters_across_entries() {
    let dir = tempfile::tempdir().unwrap();
    for node in ["xillybus_write_8", "xillybus_read_8"] {
        File::create(dir.path().join(node)).unwrap();
    }
    let board = MockBoard::new();
    let mut registry = ConnectionRegistry::with_defaults(&config_with_device_dir(dir.path()));
    registry.register(Arc::new(board.entry()));

    let all = registry.find_connections(&ConnectionHandle::default());
    assert_eq!(all.len(), 2);

    let pcie = registry.find_connections(&"media=PCIe".parse().unwrap());
    assert_eq!(pcie.len(), 1);
    assert_eq!(pcie[0].module, XillybusEntry::MODULE);
    assert_eq!(pcie[0].addr, dir.path().display().to_string());

    let mock = registry.find_connections(&ConnectionHandle::for_module(MockConnectionEntry::MODULE));
    assert_eq!(mock.len(), 1);
    assert_eq!(mock[0].serial, "00090A0B0C0D0E0F");

    assert!(registry
        .find_connections(&"serial=0000000000000001".parse().unwrap())
        .is_empty());
}

#[test]
fn test_open_by_serial_picks_the_matching_board() {
    let board = MockBoard::new();
    let mut registry = ConnectionRegistry::new();
    registry.register(Arc::new(board.entry()));

    let device = LmsDevice::open(&registry, "serial=00090A0B0C0D0E0F", &DriverConfig::default()).unwrap();
    assert_eq!(device.handle().name, "LimeSDR-Mock");
    assert!(board.is_control_open());
    drop(device);
    assert!(!board.is_control_open());
}

#[test]
fn test_register_replaces_and_unregister_removes() {
    let first = MockBoard::new();
    let second = MockBoard::new();
    let mut registry = ConnectionRegistry::new();
    registry.register(Arc::new(first.entry()));
    registry.register(Arc::new(second.entry()));
    assert_eq!(registry.modules().len(), 1);

    let device = LmsDevice::open(&registry, "", &DriverConfig::default()).unwrap();
    assert!(second.is_control_open());
    assert!(!first.is_control_open());
    device.close();

    assert!(registry.unregister(MockConnectionEntry::MODULE));
    assert!(!registry.unregister(MockConnectionEntry::MODULE));
    let err = registry
        .make_connection(&ConnectionHandle::for_module(MockConnectionEntry::MODULE))
        .unwrap_err();
    assert!(err.is_not_connected());
}

#[test]
fn test_make_without_open_touches_nothing() {
    let board = MockBoard::new();
    let entry = board.entry();
    let handles = entry.enumerate(&ConnectionHandle::default());
    let connection = entry.make(&handles[0]).unwrap();
    assert_eq!(connection.rx_channels, 2);
    assert!(!board.is_control_open());
    assert!(!connection.transport.is_open());
}

#[test]
fn test_malformed_identifier_is_invalid_argument() {
    let registry = ConnectionRegistry::new();
    let err = LmsDevice::open(&registry, "index=first", &DriverConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = "colour=blue".parse::<ConnectionHandle>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

fn field() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_./ ,=\\\\-]{0,12}"
}

proptest! {
    #[test]
    fn handle_survives_display_and_parse(
        module in field(),
        media in field(),
        name in field(),
        addr in field(),
        serial in field(),
        index in proptest::option::of(any::<u32>()),
    ) {
        let handle = ConnectionHandle { module, media, name, addr, serial, index };
        let parsed: ConnectionHandle = handle.to_string().parse().unwrap();
        prop_assert_eq!(&parsed, &handle);
        prop_assert!(handle.matches(&parsed));
    }

    #[test]
    fn empty_hint_matches_every_handle(
        module in field(),
        serial in field(),
        index in proptest::option::of(any::<u32>()),
    ) {
        let handle = ConnectionHandle { module, serial, index, ..ConnectionHandle::default() };
        prop_assert!(handle.matches(&ConnectionHandle::default()));
    }
}
