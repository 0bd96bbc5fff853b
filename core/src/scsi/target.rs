//! Command routing: from an accepted CDB to a device handler

use anyhow::{Result, bail};

use crate::scsi::session::{Sense, SenseKey, TargetSession, asc};
use crate::scsi::{MAX_TARGETS, STATUS_GOOD, ScsiCmdResult};

/// Maps accepted CDBs to device handlers. The controller calls `cmd` once
/// with `outdata` None; a `DataOut(len)` result makes it collect `len` bytes
/// and call again with them.
pub trait CommandRouter {
    /// Bit mask of the IDs this router answers selection for
    fn id_mask(&self) -> u8;

    fn cmd(
        &mut self,
        session: &TargetSession,
        cdb: &[u8],
        outdata: Option<&[u8]>,
    ) -> Result<ScsiCmdResult>;
}

fn illegal_request(asc: u16) -> Result<ScsiCmdResult> {
    Ok(ScsiCmdResult::CheckCondition(Sense::new(
        SenseKey::IllegalRequest,
        asc,
    )))
}

/// An abstraction of a generic SCSI device
pub trait ScsiTarget: Send {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult>;
    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult>;
    fn start_stop(&mut self, start: bool) -> Result<ScsiCmdResult>;

    // For block devices
    fn blocksize(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;
    fn read(&self, block_offset: usize, block_count: usize) -> &[u8];
    fn write(&mut self, block_offset: usize, data: &[u8]);

    /// Device-specific commands
    fn specific_cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult>;

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.blocksize()? * self.blocks()?)
    }

    fn read_blocks(&mut self, blocknum: usize, blockcnt: usize) -> Result<ScsiCmdResult> {
        let Some(blocks) = self.blocks() else {
            log::warn!("READ command to non-block device");
            return illegal_request(asc::INVALID_COMMAND_OPERATION_CODE);
        };
        if blocknum + blockcnt > blocks {
            log::error!("Reading beyond disk");
            return illegal_request(asc::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE);
        }
        Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt).to_vec()))
    }

    fn write_blocks(
        &mut self,
        blocknum: usize,
        blockcnt: usize,
        outdata: Option<&[u8]>,
    ) -> Result<ScsiCmdResult> {
        let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
            log::warn!("WRITE command to non-block device");
            return illegal_request(asc::INVALID_COMMAND_OPERATION_CODE);
        };
        if blocknum + blockcnt > blocks {
            log::error!("Writing beyond disk");
            return illegal_request(asc::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE);
        }
        if let Some(data) = outdata {
            self.write(blocknum, data);
            Ok(ScsiCmdResult::Status(STATUS_GOOD))
        } else {
            Ok(ScsiCmdResult::DataOut(blockcnt * blocksize))
        }
    }

    fn cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            0x00 => {
                // TEST UNIT READY
                self.unit_ready()
            }
            0x04 => {
                // FORMAT UNIT(6)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x08 => {
                // READ(6)
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
                self.read_blocks(blocknum, blockcnt)
            }
            0x0A => {
                // WRITE(6)
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
                self.write_blocks(blocknum, blockcnt, outdata)
            }
            0x12 => {
                // INQUIRY
                self.inquiry(cmd)
            }
            0x1A => {
                // MODE SENSE(6), header only
                let mut result = vec![3, 0, 0, 0];
                result.truncate(cmd[4] as usize);
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x1B => {
                // START STOP UNIT
                self.start_stop(cmd[4] & 1 != 0)
            }
            0x25 => {
                // READ CAPACITY(10)
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("READ CAPACITY(10) command to non-block device");
                    return illegal_request(asc::INVALID_COMMAND_OPERATION_CODE);
                };
                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&((blocks as u32) - 1).to_be_bytes());
                result[4..8].copy_from_slice(&(blocksize as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x28 => {
                // READ(10)
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                self.read_blocks(blocknum, blockcnt)
            }
            0x2A => {
                // WRITE(10)
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                self.write_blocks(blocknum, blockcnt, outdata)
            }
            0x2F => {
                // VERIFY(10)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            _ => self.specific_cmd(cmd, outdata),
        }
    }
}

/// Routes commands to the device attached at the selected ID
#[derive(Default)]
pub struct TargetRouter {
    targets: [Option<Box<dyn ScsiTarget>>; MAX_TARGETS],
}

impl TargetRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, scsi_id: usize, target: Box<dyn ScsiTarget>) -> Result<()> {
        if scsi_id >= MAX_TARGETS {
            bail!("SCSI ID out of range: {}", scsi_id);
        }
        self.targets[scsi_id] = Some(target);
        Ok(())
    }

    pub fn detach(&mut self, scsi_id: usize) {
        if let Some(slot) = self.targets.get_mut(scsi_id) {
            *slot = None;
        }
    }

    pub fn target(&self, scsi_id: usize) -> Option<&dyn ScsiTarget> {
        self.targets.get(scsi_id)?.as_deref()
    }
}

impl CommandRouter for TargetRouter {
    fn id_mask(&self) -> u8 {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .fold(0, |mask, (id, _)| mask | (1 << id))
    }

    fn cmd(
        &mut self,
        session: &TargetSession,
        cdb: &[u8],
        outdata: Option<&[u8]>,
    ) -> Result<ScsiCmdResult> {
        let Some(target) = self.targets[session.id as usize].as_mut() else {
            bail!("SCSI command to disconnected target ID {}", session.id);
        };
        target.cmd(cdb, outdata)
    }
}
