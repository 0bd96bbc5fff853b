//! Per-target session state and the flags shared with interrupt context

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam::atomic::AtomicCell;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::scsi::MAX_CDB_LEN;

/// Timing/feature profile of the host that selected us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum CompatMode {
    /// Legacy host, or a host that selected without ATN
    #[default]
    Scsi1,
    Scsi2,
}

/// Agreed synchronous transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncAgreement {
    /// REQ/ACK offset, 0 is asynchronous
    pub offset: u8,
    /// Transfer period in 4 ns units
    pub period: u8,
    /// 16-bit data transfers
    pub wide: bool,
}

impl SyncAgreement {
    pub const ASYNC: Self = Self {
        offset: 0,
        period: 0,
        wide: false,
    };

    pub const fn is_sync(&self) -> bool {
        self.offset > 0
    }

    pub const fn period_ns(&self) -> u32 {
        self.period as u32 * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, Serialize, Deserialize)]
pub enum SenseKey {
    #[default]
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    AbortedCommand = 0xB,
}

/// Additional sense codes, ASC in the high byte, ASCQ in the low byte
pub mod asc {
    pub const NO_ADDITIONAL_SENSE_INFORMATION: u16 = 0x0000;
    pub const LOGICAL_UNIT_NOT_READY_INITIALIZING_COMMAND_REQUIRED: u16 = 0x0402;
    pub const INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
    pub const LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE: u16 = 0x2100;
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u16 = 0x2500;
    pub const POWER_ON_RESET_OR_BUS_DEVICE_RESET_OCCURRED: u16 = 0x2900;
    pub const POWER_ON_RESET: u16 = 0x2901;
    pub const SCSI_BUS_RESET: u16 = 0x2902;
    pub const MEDIUM_NOT_PRESENT: u16 = 0x3A00;
    pub const INTERNAL_TARGET_FAILURE: u16 = 0x4400;
    pub const SCSI_PARITY_ERROR: u16 = 0x4700;
}

/// Pending sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u16,
}

impl Sense {
    pub const NONE: Self = Self {
        key: SenseKey::NoSense,
        asc: asc::NO_ADDITIONAL_SENSE_INFORMATION,
    };

    pub const fn new(key: SenseKey, asc: u16) -> Self {
        Self { key, asc }
    }

    /// Fixed format sense data, truncated to `alloc_len`
    pub fn fixed_format(&self, alloc_len: usize) -> Vec<u8> {
        let mut data = vec![0; 18];
        data[0] = 0xF0; // Valid, current error
        data[2] = self.key as u8;
        data[7] = 10; // Additional length
        data[12..14].copy_from_slice(&self.asc.to_be_bytes());
        data.truncate(alloc_len);
        data
    }
}

/// Outcome of a selection latched by the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target_id: u8,
    /// Initiator ID, if exactly one other bit was on the data bus
    pub initiator_id: Option<u8>,
}

/// State shared between the edge interrupt handlers and the foreground loop.
///
/// Every field has exactly one writer per source: the interrupt handlers set
/// `reset` and `selection`, the foreground clears them.
#[derive(Debug, Default)]
pub struct BusFlags {
    reset: AtomicBool,
    selection: AtomicCell<Option<Selection>>,
    bsy_driven: AtomicBool,
    target_mask: AtomicU8,
}

impl BusFlags {
    pub fn new(target_mask: u8) -> Arc<Self> {
        Arc::new(Self {
            target_mask: AtomicU8::new(target_mask),
            ..Default::default()
        })
    }

    pub fn reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub fn raise_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    pub fn clear_reset(&self) {
        self.reset.store(false, Ordering::Release);
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection.load()
    }

    pub fn latch_selection(&self, sel: Selection) {
        self.selection.store(Some(sel));
    }

    pub fn take_selection(&self) -> Option<Selection> {
        self.selection.take()
    }

    /// BSY is driven by us, selection edges are our own
    pub fn bsy_driven(&self) -> bool {
        self.bsy_driven.load(Ordering::Acquire)
    }

    pub fn set_bsy_driven(&self, driven: bool) {
        self.bsy_driven.store(driven, Ordering::Release);
    }

    pub fn target_mask(&self) -> u8 {
        self.target_mask.load(Ordering::Relaxed)
    }
}

/// One physical target slot. Created at power-on and reset, never destroyed.
#[derive(Debug)]
pub struct TargetSession {
    pub id: u8,
    pub compat: CompatMode,
    pub sync: SyncAgreement,
    pub atn: bool,
    pub cdb: ArrayVec<u8, MAX_CDB_LEN>,
    pub sense: Sense,
    /// ASC reported by the next command as UNIT ATTENTION
    pub unit_attention: Option<u16>,
    pub initiator_id: Option<u8>,
    pub lun: Option<u8>,
    /// An SDTR reply was sent and not yet acknowledged
    pub need_sync_ack: bool,
    flags: Arc<BusFlags>,
}

impl TargetSession {
    pub fn new(id: u8, flags: Arc<BusFlags>) -> Self {
        Self {
            id,
            compat: CompatMode::default(),
            sync: SyncAgreement::ASYNC,
            atn: false,
            cdb: ArrayVec::new(),
            sense: Sense::NONE,
            unit_attention: Some(asc::POWER_ON_RESET),
            initiator_id: None,
            lun: None,
            need_sync_ack: false,
            flags,
        }
    }

    pub fn flags(&self) -> &BusFlags {
        &self.flags
    }

    pub fn is_reset(&self) -> bool {
        self.flags.reset()
    }

    /// Returns the session to its power-on defaults after a bus reset
    pub fn reset(&mut self) {
        self.compat = CompatMode::default();
        self.sync = SyncAgreement::ASYNC;
        self.sense = Sense::NONE;
        self.end_command();
        // A power-on attention that was never reported takes precedence
        if self.unit_attention != Some(asc::POWER_ON_RESET) {
            self.unit_attention = Some(asc::SCSI_BUS_RESET);
        }
    }

    /// Clears the per-command state at bus free
    pub fn end_command(&mut self) {
        self.atn = false;
        self.cdb.clear();
        self.lun = None;
        self.initiator_id = None;
        self.need_sync_ack = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_fixed_format() {
        let s = Sense::new(SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT);
        let d = s.fixed_format(18);
        assert_eq!(d.len(), 18);
        assert_eq!(d[0], 0xF0);
        assert_eq!(d[2], 0x02);
        assert_eq!(d[7], 10);
        assert_eq!(&d[12..14], &[0x3A, 0x00]);

        assert_eq!(s.fixed_format(4), vec![0xF0, 0, 0x02, 0]);
    }

    #[test]
    fn reset_keeps_power_on_attention() {
        let flags = BusFlags::new(1);
        let mut s = TargetSession::new(0, flags);
        s.sync = SyncAgreement {
            offset: 8,
            period: 25,
            wide: false,
        };
        s.compat = CompatMode::Scsi2;
        s.reset();
        assert_eq!(s.sync, SyncAgreement::ASYNC);
        assert_eq!(s.compat, CompatMode::Scsi1);
        assert_eq!(s.unit_attention, Some(asc::POWER_ON_RESET));

        s.unit_attention = None;
        s.reset();
        assert_eq!(s.unit_attention, Some(asc::SCSI_BUS_RESET));
    }

    #[test]
    fn selection_latch() {
        let flags = BusFlags::new(0b1000);
        assert_eq!(flags.target_mask(), 0b1000);
        assert!(flags.take_selection().is_none());
        flags.latch_selection(Selection {
            target_id: 3,
            initiator_id: Some(7),
        });
        assert_eq!(flags.selection().map(|s| s.target_id), Some(3));
        assert_eq!(flags.take_selection().map(|s| s.initiator_id), Some(Some(7)));
        assert!(flags.selection().is_none());
    }
}
