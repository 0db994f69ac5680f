//! Session lifecycle against a simulated logger

mod common;

use common::{connect, entry, spawn_engine, test_config, within, DEVICE};
use gnss_link_protocol::directory::FatAttributes;
use gnss_link_protocol::{
    BondStore, GnssMaskStatus, JsonBondStore, MemoryBondStore, ProtocolError, SessionState,
};

#[tokio::test]
async fn test_pairing_scan_connect_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let bonds = dir.path().join("bonds.json");
    let (handle, _logger) = spawn_engine(
        test_config(),
        Box::new(JsonBondStore::new(&bonds).unwrap()),
    );

    handle.start_scan(true).await.unwrap();
    let snapshot = within(handle.wait_for(|s| !s.pairing_devices.is_empty()))
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::ScanningPairing);
    assert_eq!(snapshot.pairing_devices[0].id, DEVICE);
    assert_eq!(snapshot.pairing_devices[0].display_name(), "GNSS Logger");

    connect(&handle).await;
    let snapshot = within(handle.wait_for(|s| s.firmware_revision.is_some()))
        .await
        .unwrap();
    assert_eq!(snapshot.connected_device, Some(DEVICE));
    assert_eq!(snapshot.firmware_revision.as_deref(), Some("3.1.0"));
    assert!(snapshot.pairing_devices.is_empty());
    assert!(snapshot.known_devices.iter().any(|d| d.id == DEVICE && d.is_connected));

    // bonding survived to disk
    let store = JsonBondStore::new(&bonds).unwrap();
    assert!(store.is_bonded(&DEVICE).unwrap());
    assert_eq!(store.last_connected_id().unwrap(), Some(DEVICE));

    handle.disconnect().await.unwrap();
    let snapshot = within(handle.wait_for(|s| s.state == SessionState::Idle))
        .await
        .unwrap();
    assert_eq!(snapshot.connected_device, None);
    assert!(snapshot.known_devices.iter().all(|d| !d.is_connected));
}

#[tokio::test]
async fn test_operations_require_connection() {
    let (handle, _logger) = spawn_engine(test_config(), Box::new(MemoryBondStore::new()));

    assert!(matches!(
        handle.list_directory("/").await,
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(
        handle.download("/LOG.UBX", 10).await,
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(
        handle.set_mask(0x07).await,
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(
        handle.disconnect().await,
        Err(ProtocolError::NotConnected)
    ));
}

#[tokio::test]
async fn test_directory_listing_is_sorted() {
    let (handle, logger) = spawn_engine(
        test_config(),
        Box::new(MemoryBondStore::with_bonded([DEVICE])),
    );
    logger.set_listing(vec![
        entry("b.ubx", 4096, FatAttributes::ARCHIVE),
        entry("LOGS", 0, FatAttributes::DIRECTORY),
        entry("A.UBX", 100, FatAttributes::ARCHIVE),
    ]);
    connect(&handle).await;

    handle.list_directory("/").await.unwrap();
    let snapshot = within(handle.wait_for(|s| {
        !s.directory.awaiting_response && !s.directory.entries.is_empty()
    }))
    .await
    .unwrap();

    let names: Vec<_> = snapshot
        .directory
        .entries
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(names, vec!["LOGS", "A.UBX", "b.ubx"]);
    assert_eq!(snapshot.directory.entries[2].size, 4096);
    assert!(snapshot.directory.error.is_none());
}

#[tokio::test]
async fn test_set_mask_without_prior_get_uses_attempted_value() {
    let (handle, logger) = spawn_engine(
        test_config(),
        Box::new(MemoryBondStore::with_bonded([DEVICE])),
    );
    connect(&handle).await;
    within(handle.wait_for(|s| s.gnss_mask == Some(0x1F)))
        .await
        .unwrap();

    handle.set_mask(0x07).await.unwrap();
    let snapshot = within(handle.wait_for(|s| s.gnss_mask == Some(0x07)))
        .await
        .unwrap();
    assert_eq!(snapshot.gnss_mask_status, GnssMaskStatus::Idle);
    assert_eq!(logger.mask(), 0x07);
}

#[tokio::test]
async fn test_forget_removes_bond_and_disconnects() {
    let (handle, _logger) = spawn_engine(
        test_config(),
        Box::new(MemoryBondStore::with_bonded([DEVICE])),
    );
    connect(&handle).await;

    handle.forget(DEVICE).await.unwrap();
    let snapshot = within(handle.wait_for(|s| s.state == SessionState::Idle))
        .await
        .unwrap();
    assert!(snapshot.known_devices.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let (handle, _logger) = spawn_engine(test_config(), Box::new(MemoryBondStore::new()));
    handle.shutdown().unwrap();
    within(async {
        while !matches!(handle.ping().await, Err(ProtocolError::EngineStopped)) {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(matches!(
        handle.start_scan(false).await,
        Err(ProtocolError::EngineStopped)
    ));
}
