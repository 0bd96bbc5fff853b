use super::*;

use crate::scsi::disk::DISK_BLOCKSIZE;
use crate::scsi::initiator::{InitiatorError, probe};
use crate::scsi::session::SenseKey;
use crate::scsi::{BusPhase, STATUS_CHECK_CONDITION, STATUS_GOOD};

#[test]
fn scsi1_read6() {
    let image = pattern(4 * 256);
    let mut rig = Rig::disk(
        RamDisk::from_image(&image, 256).unwrap(),
        BoardConfig::default(),
        InitiatorConfig::default(),
    );

    let mut buf = vec![0; 256];
    rig.bus.reset_handshakes();
    assert_eq!(
        rig.engine
            .run_command(0, &[0x08, 0, 0, 1, 1, 0], Some(&mut buf), None),
        Ok(STATUS_GOOD)
    );
    assert_eq!(buf, image[256..512]);
    // CDB, data, status, message
    assert_eq!(rig.bus.handshakes(), 6 + 256 + 1 + 1);
    assert_eq!(
        rig.engine.phase_history(),
        [
            BusPhase::Command,
            BusPhase::DataIn,
            BusPhase::Status,
            BusPhase::MessageIn
        ]
    );
    assert_eq!(rig.engine.messages(), [0x00]);

    let bus = rig.bus.clone();
    let (controller, engine) = rig.finish();
    assert_eq!(controller.bus_phase(), BusPhase::BusFree);
    assert_eq!(controller.session(0).unwrap().compat, CompatMode::Scsi1);
    assert_eq!(controller.stats().selections, 1);
    assert_released(engine.lines());
    assert!(bus.lines().is_empty());
}

#[test]
fn select_absent_target() {
    let mut rig = Rig::disk(
        RamDisk::new(8, DISK_BLOCKSIZE).unwrap(),
        BoardConfig::default(),
        InitiatorConfig {
            selection_timeout_us: 20_000,
            ..Default::default()
        },
    );

    let start = Instant::now();
    assert!(!rig.engine.select_target(3, 7));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(rig.bus.lines().is_empty());
    assert!(!rig.engine.lines().drives_data());

    let err = rig.engine.run_command(3, &[0; 6], None, None).unwrap_err();
    assert_eq!(err, InitiatorError::NoDevice(3));
    assert_eq!(err.code(), -1);

    let (controller, _) = rig.finish();
    assert_eq!(controller.stats().selections, 0);
}

#[test]
fn tur_not_ready_has_no_data_phase() {
    let mut disk = RamDisk::new(8, DISK_BLOCKSIZE).unwrap();
    disk.set_started(false);
    let mut rig = Rig::disk(disk, BoardConfig::default(), InitiatorConfig::default());

    assert_eq!(
        rig.engine.run_command(0, &[0; 6], None, None),
        Ok(STATUS_CHECK_CONDITION)
    );
    assert!(!rig.engine.phase_history().contains(&BusPhase::DataIn));

    assert_eq!(
        probe::request_sense(&mut rig.engine, 0),
        Ok(SenseKey::NotReady)
    );
    // Reading sense clears it
    assert_eq!(
        probe::request_sense(&mut rig.engine, 0),
        Ok(SenseKey::NoSense)
    );

    // Retry policy starts the unit
    assert_eq!(probe::test_unit_ready(&mut rig.engine, 0), Ok(true));
    rig.finish();
}

#[test]
fn write10_read10() {
    let mut rig = Rig::disk(
        RamDisk::new(32, DISK_BLOCKSIZE).unwrap(),
        BoardConfig::default(),
        scsi2_initiator(),
    );
    let data = pattern(2 * DISK_BLOCKSIZE);

    let write = [0x2A, 0, 0, 0, 0, 5, 0, 0, 2, 0];
    assert_eq!(
        rig.engine.run_command(0, &write, None, Some(&data)),
        Ok(STATUS_GOOD)
    );
    assert!(rig.engine.phase_history().contains(&BusPhase::DataOut));

    let mut buf = vec![0; data.len()];
    let read = [0x28, 0, 0, 0, 0, 5, 0, 0, 2, 0];
    assert_eq!(
        rig.engine.run_command(0, &read, Some(&mut buf), None),
        Ok(STATUS_GOOD)
    );
    assert_eq!(buf, data);

    assert_eq!(
        probe::read_capacity(&mut rig.engine, 0),
        Ok(Some((32, DISK_BLOCKSIZE as u32)))
    );
    rig.finish();
}

#[test]
fn missing_buffer_then_reset() {
    let mut rig = Rig::disk(
        RamDisk::new(8, DISK_BLOCKSIZE).unwrap(),
        BoardConfig::default(),
        InitiatorConfig {
            reset_recovery_ms: 10,
            ..Default::default()
        },
    );

    let err = rig
        .engine
        .run_command(0, &[0x12, 0, 0, 0, 36, 0], None, None)
        .unwrap_err();
    assert_eq!(
        err,
        InitiatorError::Sequencing {
            expected: BusPhase::Status,
            observed: BusPhase::DataIn
        }
    );
    assert_eq!(err.code(), -3);
    assert_released(rig.engine.lines());

    // The target is stuck in DataIn until the bus is reset
    rig.engine.bus_reset();
    assert_eq!(rig.engine.run_command(0, &[0; 6], None, None), Ok(STATUS_GOOD));

    let (controller, _) = rig.finish();
    assert_eq!(controller.stats().resets, 1);
}

#[test]
fn invalid_commands() {
    let mut rig = Rig::disk(
        RamDisk::new(8, DISK_BLOCKSIZE).unwrap(),
        BoardConfig::default(),
        scsi2_initiator(),
    );

    // Unsupported opcode
    assert_eq!(
        rig.engine.run_command(0, &[0xC0, 0, 0, 0, 0, 0], None, None),
        Ok(STATUS_CHECK_CONDITION)
    );
    assert_eq!(
        probe::request_sense(&mut rig.engine, 0),
        Ok(SenseKey::IllegalRequest)
    );

    // FLAG without LINK
    assert_eq!(
        rig.engine.run_command(0, &[0, 0, 0, 0, 0, 0x02], None, None),
        Ok(STATUS_CHECK_CONDITION)
    );

    // Beyond the end of the disk
    let mut buf = vec![0; DISK_BLOCKSIZE];
    assert_eq!(
        rig.engine
            .run_command(0, &[0x08, 0, 0, 8, 1, 0], Some(&mut buf), None),
        Ok(STATUS_CHECK_CONDITION)
    );
    assert_eq!(
        probe::request_sense(&mut rig.engine, 0),
        Ok(SenseKey::IllegalRequest)
    );
    rig.finish();
}

#[test]
fn scan_finds_every_disk() {
    let mut router = TargetRouter::new();
    router
        .attach(0, Box::new(RamDisk::new(100, DISK_BLOCKSIZE).unwrap()))
        .unwrap();
    let mut stopped = RamDisk::new(50, 1024).unwrap();
    stopped.set_started(false);
    router.attach(2, Box::new(stopped)).unwrap();

    let mut rig = Rig::start(
        BoardConfig::default(),
        router,
        InitiatorConfig {
            selection_timeout_us: 5_000,
            ..scsi2_initiator()
        },
    );

    let found = probe::scan_bus(&mut rig.engine).unwrap();
    assert_eq!(found.iter().map(|d| d.id).collect::<Vec<_>>(), [0, 2]);
    assert_eq!(found[0].product, "RAM DISK");
    assert_eq!(found[0].capacity, Some((100, 512)));
    assert_eq!(found[1].capacity, Some((50, 1024)));
    assert_eq!(found[1].capacity_bytes(), Some(50 * 1024));

    let (controller, _) = rig.finish();
    assert!(controller.session(2).is_some());
    assert!(controller.session(1).is_none());
}

#[test]
fn stop_with_target_stuck_in_data_phase() {
    let mut rig = Rig::disk(
        RamDisk::new(8, DISK_BLOCKSIZE).unwrap(),
        BoardConfig::default(),
        scsi2_initiator(),
    );

    assert!(
        rig.engine
            .run_command(0, &[0x12, 0, 0, 0, 36, 0], None, None)
            .is_err()
    );
    // Target still owns the bus, waiting on an ACK that never comes
    assert!(rig.bus.lines().bsy());
    assert!(rig.bus.lines().req());

    let bus = rig.bus.clone();
    let (controller, engine) = rig.finish();
    assert_eq!(controller.stats().commands, 1);
    assert_released(engine.lines());
    assert!(!bus.lines().bsy());
    assert!(!bus.lines().req());
}
