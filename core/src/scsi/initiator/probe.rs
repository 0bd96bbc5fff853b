//! Caller-side command helpers for the initiator
//!
//! These carry the recovery policy the engine itself leaves out: sense is
//! requested after CHECK CONDITION, and TEST UNIT READY is retried after
//! waking the device up.

use itertools::Itertools;

use crate::scsi::initiator::{InitiatorEngine, InitiatorError, InitiatorResult};
use crate::scsi::lines::SignalLines;
use crate::scsi::session::SenseKey;
use crate::scsi::{MAX_TARGETS, ScsiStatus};

use num_traits::FromPrimitive;

/// Retries of TEST UNIT READY after the first attempt
const TUR_RETRIES: usize = 2;

/// GOOD status, ignoring the vendor and reserved bits of the status byte
pub fn status_good(status: u8) -> bool {
    ScsiStatus::from_byte(status) == Some(ScsiStatus::Good)
}

/// Identification and capacity of a device found on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: u8,
    pub device_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    /// (sector count, sector size), if READ CAPACITY succeeded
    pub capacity: Option<(u32, u32)>,
}

impl DeviceInfo {
    fn from_inquiry(id: u8, inq: &[u8; 36]) -> Self {
        let field = |r: std::ops::Range<usize>| String::from_utf8_lossy(&inq[r]).trim_end().to_string();
        Self {
            id,
            device_type: inq[0] & 0x1F,
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
            capacity: None,
        }
    }

    pub fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
            .map(|(count, size)| u64::from(count) * u64::from(size))
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ident = [&self.vendor, &self.product, &self.revision]
            .into_iter()
            .filter(|s| !s.is_empty())
            .join(" ");
        write!(f, "ID {}: {}", self.id, ident)?;
        if let Some((count, size)) = self.capacity {
            write!(f, ", {} sectors x {} bytes", count, size)?;
        }
        Ok(())
    }
}

/// REQUEST SENSE, returns the sense key
pub fn request_sense<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
    target_id: u8,
) -> InitiatorResult<SenseKey> {
    let cdb = [0x03, 0, 0, 0, 18, 0];
    let mut response = [0; 18];
    engine.run_command(target_id, &cdb, Some(&mut response), None)?;
    let key = SenseKey::from_u8(response[2] & 0x0F).unwrap_or_default();
    log::debug!("ID {} sense key {:?}", target_id, key);
    Ok(key)
}

/// INQUIRY with the standard 36 byte allocation length
pub fn inquiry<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
    target_id: u8,
) -> InitiatorResult<Option<[u8; 36]>> {
    let cdb = [0x12, 0, 0, 0, 36, 0];
    let mut response = [0; 36];
    let status = engine.run_command(target_id, &cdb, Some(&mut response), None)?;
    Ok(status_good(status).then_some(response))
}

pub fn start_stop_unit<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
    target_id: u8,
    start: bool,
) -> InitiatorResult<bool> {
    let cdb = [0x1B, 0, 0, 0, u8::from(start), 0];
    Ok(status_good(engine.run_command(target_id, &cdb, None, None)?))
}

/// READ CAPACITY(10), returns (sector count, sector size)
pub fn read_capacity<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
    target_id: u8,
) -> InitiatorResult<Option<(u32, u32)>> {
    let cdb = [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let mut response = [0; 8];
    let status = engine.run_command(target_id, &cdb, Some(&mut response), None)?;
    if !status_good(status) {
        return Ok(None);
    }
    let last_lba = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    let sector_size = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
    Ok(Some((last_lba.wrapping_add(1), sector_size)))
}

/// TEST UNIT READY. On CHECK CONDITION the sense is read, a UNIT ATTENTION
/// is answered with INQUIRY and NOT READY with START STOP UNIT before
/// trying again.
pub fn test_unit_ready<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
    target_id: u8,
) -> InitiatorResult<bool> {
    let cdb = [0; 6];
    for attempt in 0..=TUR_RETRIES {
        let status = engine.run_command(target_id, &cdb, None, None)?;
        if status_good(status) {
            return Ok(true);
        }
        if attempt == TUR_RETRIES {
            break;
        }

        match request_sense(engine, target_id)? {
            SenseKey::UnitAttention => {
                inquiry(engine, target_id)?;
            }
            SenseKey::NotReady => {
                log::debug!("ID {} not ready, starting", target_id);
                start_stop_unit(engine, target_id, true)?;
            }
            key => {
                log::warn!("ID {} TEST UNIT READY failed: {:?}", target_id, key);
                return Ok(false);
            }
        }
    }
    Ok(false)
}

/// Probes every ID except our own. Absent devices are skipped, any other
/// failure ends the scan.
pub fn scan_bus<L: SignalLines>(
    engine: &mut InitiatorEngine<L>,
) -> InitiatorResult<Vec<DeviceInfo>> {
    let own_id = engine.config().own_id;
    let mut found = vec![];

    for id in (0..MAX_TARGETS as u8).filter(|&id| id != own_id) {
        let inq = match inquiry(engine, id) {
            Ok(Some(inq)) => inq,
            Ok(None) => continue,
            Err(InitiatorError::NoDevice(_)) => continue,
            Err(e) => return Err(e),
        };
        let mut info = DeviceInfo::from_inquiry(id, &inq);
        if test_unit_ready(engine, id)? {
            info.capacity = read_capacity(engine, id)?;
        }
        log::info!("{}", info);
        found.push(info);
    }
    Ok(found)
}
