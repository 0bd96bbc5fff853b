//! SCSI parallel bus protocol engine
//!
//! Target side: [`controller::TargetController`] drives a command from selection
//! to bus free on top of the [`phy::TargetPhy`] primitives. Initiator side:
//! [`initiator::InitiatorEngine`] selects a remote target and runs a CDB to
//! completion. Both talk to the wire through [`lines::SignalLines`].

pub mod config;
pub mod controller;
pub mod disk;
pub mod handshake;
pub mod initiator;
pub mod lines;
pub mod phase;
pub mod phy;
pub mod selection;
pub mod session;
pub mod simbus;
pub mod sync;
pub mod target;

#[cfg(test)]
mod tests;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;
pub const STATUS_INTERMEDIATE: u8 = 0x10;

/// Maximum CDB length (group 4 commands)
pub const MAX_CDB_LEN: usize = 16;

/// Number of IDs on a narrow bus
pub const MAX_TARGETS: usize = 8;

/// Status byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr)]
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    Intermediate = 0x10,
    IntermediateConditionMet = 0x14,
    ReservationConflict = 0x18,
    CommandTerminated = 0x22,
    TaskSetFull = 0x28,
}

impl ScsiStatus {
    /// Interprets a raw status byte, ignoring the reserved bits
    pub fn from_byte(status: u8) -> Option<Self> {
        Self::from_u8(status & 0x3E)
    }
}

/// Message codes
pub mod msg {
    pub const COMMAND_COMPLETE: u8 = 0x00;
    pub const EXTENDED: u8 = 0x01;
    pub const SAVE_DATA_POINTER: u8 = 0x02;
    pub const RESTORE_POINTERS: u8 = 0x03;
    pub const DISCONNECT: u8 = 0x04;
    pub const INITIATOR_DETECTED_ERROR: u8 = 0x05;
    pub const ABORT: u8 = 0x06;
    pub const MESSAGE_REJECT: u8 = 0x07;
    pub const NOP: u8 = 0x08;
    pub const MESSAGE_PARITY_ERROR: u8 = 0x09;
    pub const LINKED_COMMAND_COMPLETE: u8 = 0x0A;
    pub const LINKED_COMMAND_COMPLETE_WITH_FLAG: u8 = 0x0B;
    pub const BUS_DEVICE_RESET: u8 = 0x0C;
    pub const ABORT_TAG: u8 = 0x0D;
    pub const CLEAR_QUEUE: u8 = 0x0E;
    pub const INITIATE_RECOVERY: u8 = 0x0F;
    pub const RELEASE_RECOVERY: u8 = 0x10;
    pub const IGNORE_WIDE_RESIDUE: u8 = 0x23;
    pub const IDENTIFY: u8 = 0x80;

    /// Extended message codes
    pub const EXT_SDTR: u8 = 0x01;
    pub const EXT_WDTR: u8 = 0x03;
}

// Wire phase signal bits, as packed in `Lines::phase_bits`
pub const PHASE_MSG: u8 = 1 << 0;
pub const PHASE_CD: u8 = 1 << 1;
pub const PHASE_IO: u8 = 1 << 2;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Hash, strum::IntoStaticStr, Serialize, Deserialize,
)]
/// SCSI bus phases
pub enum BusPhase {
    #[default]
    BusFree,
    /// BSY asserted by another device, not selected
    BusBusy,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
}

impl BusPhase {
    /// Encodes the phase as its (MSG, C/D, I/O) line pattern, or None for
    /// phases that have no wire encoding.
    pub const fn wire_code(self) -> Option<u8> {
        match self {
            Self::DataOut => Some(0),
            Self::DataIn => Some(PHASE_IO),
            Self::Command => Some(PHASE_CD),
            Self::Status => Some(PHASE_CD | PHASE_IO),
            Self::MessageOut => Some(PHASE_MSG | PHASE_CD),
            Self::MessageIn => Some(PHASE_MSG | PHASE_CD | PHASE_IO),
            _ => None,
        }
    }

    /// Decodes an (MSG, C/D, I/O) pattern. The two reserved patterns yield None.
    pub const fn from_wire(code: u8) -> Option<Self> {
        match code & 0b111 {
            0 => Some(Self::DataOut),
            PHASE_IO => Some(Self::DataIn),
            PHASE_CD => Some(Self::Command),
            0b110 => Some(Self::Status),
            0b011 => Some(Self::MessageOut),
            0b111 => Some(Self::MessageIn),
            _ => None,
        }
    }

    /// Internal sentinel code for phases that are not visible on the wire
    pub const fn sentinel(self) -> Option<i8> {
        match self {
            Self::BusFree => Some(-1),
            Self::BusBusy => Some(-2),
            Self::Arbitration => Some(-3),
            Self::Selection => Some(-4),
            Self::Reselection => Some(-5),
            _ => None,
        }
    }

    /// Wire code for wire phases, the negative sentinel otherwise
    pub const fn code(self) -> i8 {
        match (self.wire_code(), self.sentinel()) {
            (Some(c), _) => c as i8,
            (None, Some(s)) => s,
            (None, None) => i8::MIN,
        }
    }

    pub const fn is_data(self) -> bool {
        matches!(self, Self::DataIn | Self::DataOut)
    }

    /// I/O line state for this phase, released for non-wire phases
    pub const fn io(self) -> bool {
        match self.wire_code() {
            Some(c) => c & PHASE_IO != 0,
            None => false,
        }
    }
}

/// Length of a CDB, derived from the group code in the opcode
pub const fn scsi_cmd_len(opcode: u8) -> usize {
    const GROUP_LEN: [usize; 8] = [6, 10, 10, 6, 16, 12, 6, 6];
    GROUP_LEN[(opcode >> 5) as usize]
}

/// Result of a command, as decided by the command router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// CHECK CONDITION status with the given sense
    CheckCondition(session::Sense),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// Target-side engine errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyError {
    /// RST was asserted, every wait unwinds to bus free
    #[error("SCSI bus reset")]
    BusReset,
    /// Synchronous parameters could not be applied to the transfer engine
    #[error("sync mode could not be applied, transfer engine busy")]
    SyncNegotiationFailure,
    #[error("transfer already in progress")]
    TransferBusy,
    #[error("no transfer in progress")]
    NoTransfer,
    #[error("buffer of {got} bytes does not match transfer length {expected}")]
    BufferMismatch { expected: usize, got: usize },
}

pub type PhyResult<T> = Result<T, PhyError>;
