//! RAM-backed hard disk drive (block device)

use anyhow::{Result, bail};

use crate::scsi::session::{Sense, SenseKey, asc};
use crate::scsi::target::ScsiTarget;
use crate::scsi::{STATUS_GOOD, ScsiCmdResult};

pub const DISK_BLOCKSIZE: usize = 512;

pub struct RamDisk {
    disk: Vec<u8>,
    blocksize: usize,
    /// Spun up, cleared by START STOP UNIT
    started: bool,
}

impl RamDisk {
    pub fn new(blocks: usize, blocksize: usize) -> Result<Self> {
        if blocks == 0 || blocksize == 0 || blocksize % 256 != 0 {
            bail!("Invalid disk geometry: {} blocks of {} bytes", blocks, blocksize);
        }
        Ok(Self {
            disk: vec![0; blocks * blocksize],
            blocksize,
            started: true,
        })
    }

    /// Disk pre-filled with `image`, padded to whole blocks
    pub fn from_image(image: &[u8], blocksize: usize) -> Result<Self> {
        let blocks = image.len().div_ceil(blocksize).max(1);
        let mut disk = Self::new(blocks, blocksize)?;
        disk.disk[..image.len()].copy_from_slice(image);
        Ok(disk)
    }

    /// A stopped disk reports NOT READY until started
    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    pub fn contents(&self) -> &[u8] {
        &self.disk
    }
}

impl ScsiTarget for RamDisk {
    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        if self.started {
            Ok(ScsiCmdResult::Status(STATUS_GOOD))
        } else {
            Ok(ScsiCmdResult::CheckCondition(Sense::new(
                SenseKey::NotReady,
                asc::LOGICAL_UNIT_NOT_READY_INITIALIZING_COMMAND_REQUIRED,
            )))
        }
    }

    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier/device type (0 = direct access)
        // 2 ANSI version (2 = SCSI-2)
        result[2] = 2;
        // 3 Response data format
        result[3] = 2;
        // 4 Additional length
        result[4] = 31;
        // 8..16 Vendor identification
        result[8..16].copy_from_slice(b"SCSIPHY ");
        // 16..32 Product identification
        result[16..32].copy_from_slice(b"RAM DISK        ");
        // 32..36 Revision
        result[32..36].copy_from_slice(b"0001");

        result.truncate(cmd[4] as usize);
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn start_stop(&mut self, start: bool) -> Result<ScsiCmdResult> {
        log::debug!("Disk {}", if start { "started" } else { "stopped" });
        self.started = start;
        Ok(ScsiCmdResult::Status(STATUS_GOOD))
    }

    fn blocksize(&self) -> Option<usize> {
        Some(self.blocksize)
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.len() / self.blocksize)
    }

    fn read(&self, block_offset: usize, block_count: usize) -> &[u8] {
        let start = block_offset * self.blocksize;
        &self.disk[start..start + block_count * self.blocksize]
    }

    fn write(&mut self, block_offset: usize, data: &[u8]) {
        let start = block_offset * self.blocksize;
        self.disk[start..start + data.len()].copy_from_slice(data);
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        log::warn!("Unsupported command {:02X}", cmd[0]);
        Ok(ScsiCmdResult::CheckCondition(Sense::new(
            SenseKey::IllegalRequest,
            asc::INVALID_COMMAND_OPERATION_CODE,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capacity() {
        let mut d = RamDisk::new(100, DISK_BLOCKSIZE).unwrap();
        let Ok(ScsiCmdResult::DataIn(r)) = d.cmd(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], None) else {
            panic!();
        };
        assert_eq!(r, vec![0, 0, 0, 99, 0, 0, 2, 0]);
        assert_eq!(d.capacity(), Some(100 * 512));
    }

    #[test]
    fn image_padded_to_blocks() {
        let d = RamDisk::from_image(&[0xAA; 300], 256).unwrap();
        assert_eq!(d.contents().len(), 512);
        assert!(d.contents()[..300].iter().all(|&b| b == 0xAA));
        assert!(d.contents()[300..].iter().all(|&b| b == 0));
        assert!(RamDisk::new(4, 100).is_err());
    }

    #[test]
    fn write_then_read6() {
        let mut d = RamDisk::new(4, 256).unwrap();
        let cdb = [0x0A, 0, 0, 2, 1, 0];
        assert_eq!(d.cmd(&cdb, None).unwrap(), ScsiCmdResult::DataOut(256));
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(
            d.cmd(&cdb, Some(&data)).unwrap(),
            ScsiCmdResult::Status(STATUS_GOOD)
        );
        assert_eq!(
            d.cmd(&[0x08, 0, 0, 2, 1, 0], None).unwrap(),
            ScsiCmdResult::DataIn(data)
        );
    }

    #[test]
    fn read_out_of_range() {
        let mut d = RamDisk::new(4, 512).unwrap();
        assert_eq!(
            d.cmd(&[0x28, 0, 0, 0, 0, 3, 0, 0, 2, 0], None).unwrap(),
            ScsiCmdResult::CheckCondition(Sense::new(
                SenseKey::IllegalRequest,
                asc::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE
            ))
        );
    }

    #[test]
    fn stopped_disk_not_ready() {
        let mut d = RamDisk::new(4, 512).unwrap();
        d.set_started(false);
        let Ok(ScsiCmdResult::CheckCondition(sense)) = d.cmd(&[0; 6], None) else {
            panic!();
        };
        assert_eq!(sense.key, SenseKey::NotReady);
        d.cmd(&[0x1B, 0, 0, 0, 1, 0], None).unwrap();
        assert_eq!(
            d.cmd(&[0; 6], None).unwrap(),
            ScsiCmdResult::Status(STATUS_GOOD)
        );
    }

    #[test]
    fn inquiry_truncated() {
        let mut d = RamDisk::new(4, 512).unwrap();
        let Ok(ScsiCmdResult::DataIn(r)) = d.cmd(&[0x12, 0, 0, 0, 5, 0], None) else {
            panic!();
        };
        assert_eq!(r, vec![0, 0, 2, 2, 31]);
    }

    #[test]
    fn unsupported_opcode() {
        let mut d = RamDisk::new(4, 512).unwrap();
        let Ok(ScsiCmdResult::CheckCondition(sense)) = d.cmd(&[0xC0, 0, 0, 0, 0, 0], None) else {
            panic!();
        };
        assert_eq!(sense.key, SenseKey::IllegalRequest);
    }
}
