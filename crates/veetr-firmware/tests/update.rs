//! End-to-end updates through a session against the simulated unit.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use veetr_core::{Command, LinkConfig, Notice, SessionStatus, TransferConfig};
use veetr_firmware::{FirmwareUpdater, Stage, StaticRelease, TransferError, UpdateError};
use veetr_session::{DisconnectReason, Session, SessionError, SessionEvent};
use veetr_transport::{SimEvent, SimulatedUnit};

fn image(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>())
}

async fn connected(unit: &SimulatedUnit) -> FirmwareUpdater<SimulatedUnit> {
    connected_with(unit, TransferConfig::default()).await
}

async fn connected_with(
    unit: &SimulatedUnit,
    config: TransferConfig,
) -> FirmwareUpdater<SimulatedUnit> {
    let session = Arc::new(Session::new(unit.clone(), LinkConfig::default()));
    session.connect().await.unwrap();
    FirmwareUpdater::new(session, config)
}

fn chunk_indices(unit: &SimulatedUnit) -> Vec<u32> {
    unit.received()
        .iter()
        .filter_map(|c| match c {
            Command::FirmwareChunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_update_installs_image_and_unit_reboots() {
    let unit = SimulatedUnit::new();
    let updater = connected(&unit).await;
    let mut events = updater.session().events();

    let job = tokio_test::assert_ok!(updater.update(image(1000)).await);
    assert_eq!(job.stage(), Stage::Complete);
    assert_eq!(job.chunk_count(), 5);
    assert_eq!(chunk_indices(&unit), vec![0, 1, 2, 3, 4]);
    assert_eq!(unit.installed_image().unwrap(), image(1000).to_vec());

    // the reboot drops the link
    loop {
        if let SessionEvent::Disconnected { reason } = events.recv().await.unwrap() {
            assert_eq!(reason, DisconnectReason::LinkLost);
            break;
        }
    }
    assert_eq!(updater.session().status().await, SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_next_chunk_waits_for_matching_ack() {
    let unit = SimulatedUnit::new();
    unit.send_stale_acks(true);
    unit.drop_acks(3, 1);
    let updater = connected(&unit).await;

    updater.update(image(1100)).await.unwrap();

    // every FW_CHUNK i+1 is preceded by the ack for chunk i
    let events = unit.events();
    for (pos, event) in events.iter().enumerate() {
        if let SimEvent::Received(Command::FirmwareChunk { index, .. }) = event {
            if *index == 0 {
                continue;
            }
            let acked = events[..pos]
                .iter()
                .any(|e| *e == SimEvent::Sent(Notice::ChunkAck { index: index - 1 }));
            assert!(acked, "chunk {index} sent before chunk {} was acked", index - 1);
        }
    }
    assert_eq!(chunk_indices(&unit), vec![0, 1, 2, 3, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_two_never_acked() {
    let unit = SimulatedUnit::new();
    unit.drop_acks(2, 3);
    let updater = connected(&unit).await;

    let err = updater.update(image(1000)).await.unwrap_err();
    let UpdateError::Transfer(TransferError::ChunkTransferFailed { index, cause }) = err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(index, 2);
    assert!(matches!(*cause, TransferError::AckTimeout(2)));
    assert_eq!(chunk_indices(&unit), vec![0, 1, 2, 2, 2]);
    assert!(!unit.received().contains(&Command::VerifyFirmware));

    // the job failed, the session did not
    let snapshot = updater.session().snapshot().await;
    assert_eq!(snapshot.status, SessionStatus::Connected);
    assert!(!snapshot.transfer_active);

    // a fresh attempt restarts from chunk 0
    updater.update(image(1000)).await.unwrap();
    assert_eq!(chunk_indices(&unit)[5..], [0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_verification_failure_never_applies() {
    let unit = SimulatedUnit::new();
    unit.fail_verify("checksum mismatch");
    let updater = connected(&unit).await;

    let err = updater.update(image(1000)).await.unwrap_err();
    assert!(matches!(
        &err,
        UpdateError::Transfer(TransferError::VerificationFailed(reason)) if reason == "checksum mismatch"
    ));
    assert!(!unit.received().contains(&Command::ApplyFirmware));
    assert!(unit.installed_image().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_verification_timeout_is_distinct() {
    let unit = SimulatedUnit::new();
    unit.ignore_verify();
    let updater = connected(&unit).await;

    let err = updater.update(image(10)).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::VerificationTimeout)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_empty_image_sends_nothing() {
    let unit = SimulatedUnit::new();
    let updater = connected(&unit).await;

    let err = updater.update(Bytes::new()).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::InvalidImage(_))
    ));
    assert!(unit.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_requires_connected_session() {
    let unit = SimulatedUnit::new();
    let session = Arc::new(Session::new(unit.clone(), LinkConfig::default()));
    let updater = FirmwareUpdater::new(session, TransferConfig::default());

    let err = updater.update(image(10)).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Session(SessionError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_storage() {
    let unit = SimulatedUnit::new().with_storage(512);
    let updater = connected(&unit).await;

    let err = updater.update(image(1000)).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::InitializationFailed(_))
    ));
    assert!(chunk_indices(&unit).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_transfer() {
    let unit = SimulatedUnit::new();
    unit.drop_acks(1, 3);
    let updater = Arc::new(connected(&unit).await);

    let task = tokio::spawn({
        let updater = Arc::clone(&updater);
        async move { updater.update(image(1000)).await }
    });
    // chunk 1 goes out once the 2 s settle is over
    tokio::time::sleep(Duration::from_secs(3)).await;
    unit.drop_link();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::SessionClosed)
    ));
    assert_eq!(chunk_indices(&unit), vec![0, 1]);

    let snapshot = updater.session().snapshot().await;
    assert_eq!(snapshot.status, SessionStatus::Disconnected);
    assert!(!snapshot.has_channel);
}

#[tokio::test(start_paused = true)]
async fn test_second_update_rejected() {
    let unit = SimulatedUnit::new();
    let updater = Arc::new(connected(&unit).await);

    let first = tokio::spawn({
        let updater = Arc::clone(&updater);
        async move { updater.update(image(1000)).await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = updater.update(image(1000)).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::JobAlreadyInProgress)
    ));
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_check_and_update_from_release() {
    let unit = SimulatedUnit::new().with_version("v0.0.14");
    let updater = connected(&unit).await;
    let release = StaticRelease::new("v0.0.15", image(700));

    let check = updater.check_for_update(&release).await.unwrap();
    assert_eq!(check.current, "v0.0.14");
    assert_eq!(check.latest, "v0.0.15");
    assert!(check.update_available);

    let job = tokio_test::assert_ok!(updater.update_from_release(&release, None).await);
    assert_eq!(job.stage(), Stage::Complete);
    assert_eq!(unit.installed_image().unwrap(), image(700).to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_release_too_large_for_unit() {
    let unit = SimulatedUnit::new();
    let updater = connected_with(
        &unit,
        TransferConfig {
            max_image_bytes: 512,
            ..TransferConfig::default()
        },
    )
    .await;
    let release = StaticRelease::new("v9.0.0", image(513));

    let err = updater
        .update_from_release(&release, Some("v9.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Transfer(TransferError::InvalidImage(_))
    ));
    assert!(unit.received().is_empty());
}
