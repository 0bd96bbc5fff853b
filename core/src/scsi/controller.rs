//! Target controller
//!
//! Foreground poll loop of the target role. Each call to
//! [`TargetController::poll`] runs at most one bus phase to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::scsi::config::BoardConfig;
use crate::scsi::lines::{Signal, SignalLines};
use crate::scsi::phy::TargetPhy;
use crate::scsi::session::{CompatMode, Sense, SenseKey, SyncAgreement, TargetSession, asc};
use crate::scsi::target::CommandRouter;
use crate::scsi::{
    BusPhase, MAX_CDB_LEN, MAX_TARGETS, PhyError, PhyResult, STATUS_CHECK_CONDITION, STATUS_GOOD,
    STATUS_INTERMEDIATE, ScsiCmdResult, msg, scsi_cmd_len,
};

const OPCODE_REQUEST_SENSE: u8 = 0x03;
const OPCODE_INQUIRY: u8 = 0x12;

/// Counters for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TargetStats {
    pub selections: usize,
    pub commands: usize,
    pub messages: usize,
    pub resets: usize,
    pub parity_errors: usize,
}

pub struct TargetController<L: SignalLines, R: CommandRouter> {
    phy: TargetPhy<L>,
    router: R,
    config: BoardConfig,

    /// One session per ID the router answers for
    sessions: Vec<TargetSession>,

    /// Index of the selected session
    active: Option<usize>,

    /// Next phase to process
    next: BusPhase,

    status: u8,
    msg_in: u8,

    /// DataIn payload or DataOut buffer
    databuf: Vec<u8>,

    stats: TargetStats,
}

impl<L: SignalLines, R: CommandRouter> TargetController<L, R> {
    pub fn new(lines: L, config: BoardConfig, router: R) -> Self {
        let mask = router.id_mask();
        let phy = TargetPhy::new(lines, &config, mask);
        let sessions = (0..MAX_TARGETS as u8)
            .filter(|id| mask & (1 << id) != 0)
            .map(|id| TargetSession::new(id, Arc::clone(phy.flags())))
            .collect();

        Self {
            phy,
            router,
            config,
            sessions,
            active: None,
            next: BusPhase::BusFree,
            status: STATUS_GOOD,
            msg_in: msg::COMMAND_COMPLETE,
            databuf: vec![],
            stats: TargetStats::default(),
        }
    }

    pub fn phy(&self) -> &TargetPhy<L> {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut TargetPhy<L> {
        &mut self.phy
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    pub fn session(&self, id: u8) -> Option<&TargetSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn stats(&self) -> TargetStats {
        self.stats
    }

    /// Phase currently on the bus
    pub fn bus_phase(&self) -> BusPhase {
        self.phy.phase()
    }

    /// Polls until `stop` is set
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.poll();
        }
    }

    pub fn poll(&mut self) {
        self.phy.poll_edges();
        if self.phy.flags().reset() {
            self.bus_reset();
            return;
        }

        let result = match self.next {
            BusPhase::BusFree | BusPhase::BusBusy => {
                self.idle();
                Ok(())
            }
            BusPhase::Selection => self.process_selection(),
            BusPhase::MessageOut => self.process_message_out(),
            BusPhase::Command if self.atn() => self.process_message_out(),
            BusPhase::Command => self.process_command(),
            phase => {
                let atn = self.phy.lines().get(Signal::Atn);
                if let Some(s) = self.active_session_mut() {
                    s.atn |= atn;
                }
                if self.atn() {
                    self.process_message_out()
                } else {
                    match phase {
                        BusPhase::DataIn => self.process_data_in(),
                        BusPhase::DataOut => self.process_data_out(),
                        BusPhase::Status => self.process_status(),
                        BusPhase::MessageIn => self.process_message_in(),
                        _ => Ok(()),
                    }
                }
            }
        };

        match result {
            Ok(()) => (),
            // Picked up by the next poll
            Err(PhyError::BusReset | PhyError::SyncNegotiationFailure) => (),
            Err(e) => {
                log::error!("Transfer error in {:?}: {}", self.next, e);
                self.release_bus();
            }
        }
    }

    fn active_session_mut(&mut self) -> Option<&mut TargetSession> {
        self.sessions.get_mut(self.active?)
    }

    fn atn(&self) -> bool {
        self.active.is_some_and(|i| self.sessions[i].atn)
    }

    fn idle(&mut self) {
        self.next = if self.phy.flags().selection().is_some() {
            BusPhase::Selection
        } else if self.phy.lines().get(Signal::Bsy) {
            BusPhase::BusBusy
        } else {
            BusPhase::BusFree
        };
    }

    fn bus_reset(&mut self) {
        log::debug!("Bus reset");
        self.stats.resets += 1;
        self.phy.reset();
        for s in &mut self.sessions {
            s.reset();
        }
        self.active = None;
        self.next = BusPhase::BusFree;
        self.databuf.clear();

        while self.phy.lines().get(Signal::Rst) {
            std::hint::spin_loop();
        }
        self.phy.delay_ns(self.config.timing.reset_holdoff_ns);
        self.phy.lines().take_edge(Signal::Rst);
        self.phy.flags().clear_reset();
    }

    /// Goes bus free after the command completed or was abandoned
    fn release_bus(&mut self) {
        let timing = &self.config.timing;
        if let Some(idx) = self.active.take() {
            let session = &mut self.sessions[idx];
            if session.compat == CompatMode::Scsi1 {
                self.phy.delay_ns(timing.scsi1_bus_free_ns);
            }
            self.phy.enter_bus_free(session);
        } else {
            self.phy.reset();
        }
        self.phy.delay_ns(timing.bus_clear_ns);
        self.next = BusPhase::BusFree;
    }

    fn process_selection(&mut self) -> PhyResult<()> {
        let Some(sel) = self.phy.flags().take_selection() else {
            self.next = BusPhase::BusBusy;
            return Ok(());
        };
        let Some(idx) = self.sessions.iter().position(|s| s.id == sel.target_id) else {
            self.next = BusPhase::BusBusy;
            return Ok(());
        };

        let auto_delay = match self.sessions[idx].compat {
            CompatMode::Scsi1 => 1,
            CompatMode::Scsi2 => 0,
        };
        let delay_ms = self.config.selection_delay_ms.unwrap_or(auto_delay);
        self.phy.delay_ns(delay_ms.saturating_mul(1_000_000));

        let session = &mut self.sessions[idx];
        session.end_command();
        session.initiator_id = sel.initiator_id;
        let atn = self.phy.on_sel_confirm(session);
        self.stats.selections += 1;
        self.active = Some(idx);
        self.status = STATUS_GOOD;
        self.databuf.clear();
        log::debug!("ID {} selected by {:?}, ATN {}", session.id, sel.initiator_id, atn);

        let abort = Duration::from_millis(self.config.timing.selection_abort_ms.into());
        let start = Instant::now();
        while self.phy.lines().get(Signal::Sel) {
            if self.phy.flags().reset() {
                return Err(PhyError::BusReset);
            }
            if start.elapsed() >= abort {
                log::warn!("Initiator did not release SEL, abandoning selection");
                self.release_bus();
                return Ok(());
            }
        }

        self.next = BusPhase::Command;
        Ok(())
    }

    fn process_command(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        let parity_check = self.config.enable_parity;
        let session = &mut self.sessions[idx];
        self.phy.enter_phase(session, BusPhase::Command)?;

        let mut cdb = [0; MAX_CDB_LEN];
        let mut parity_error = self.phy.read(&mut cdb[..6], parity_check)?;
        let len = scsi_cmd_len(cdb[0]);
        if len > 6 {
            parity_error |= self.phy.read(&mut cdb[6..len], parity_check)?;
        }

        session.cdb = cdb[..len].iter().copied().collect();
        if session.lun.is_none() {
            session.lun = Some(cdb[1] >> 5);
        }
        self.stats.commands += 1;
        log::debug!("ID {} command: {:02X?}", session.id, &cdb[..len]);

        self.dispatch(idx, parity_error);
        Ok(())
    }

    /// Decides what follows the Command phase
    fn dispatch(&mut self, idx: usize, parity_error: bool) {
        let cdb = self.sessions[idx].cdb.clone();
        let opcode = cdb[0];
        let control = cdb[cdb.len() - 1];

        if parity_error && self.config.enable_parity {
            self.stats.parity_errors += 1;
            return self.check_condition(
                idx,
                Sense::new(SenseKey::AbortedCommand, asc::SCSI_PARITY_ERROR),
            );
        }
        if control & 0x02 != 0 && control & 0x01 == 0 {
            // FLAG without LINK
            return self.check_condition(
                idx,
                Sense::new(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB),
            );
        }
        if opcode == OPCODE_REQUEST_SENSE {
            let alloc_len = match cdb[4] {
                0 => 4,
                n => n as usize,
            };
            let session = &mut self.sessions[idx];
            self.databuf = session.sense.fixed_format(alloc_len);
            session.sense = Sense::NONE;
            self.status = STATUS_GOOD;
            self.next = BusPhase::DataIn;
            return;
        }
        if self.config.enable_unit_attention && opcode != OPCODE_INQUIRY {
            if let Some(ua) = self.sessions[idx].unit_attention.take() {
                return self.check_condition(idx, Sense::new(SenseKey::UnitAttention, ua));
            }
        }
        if self.sessions[idx].lun.is_some_and(|l| l != 0) && opcode != OPCODE_INQUIRY {
            return self.check_condition(
                idx,
                Sense::new(SenseKey::IllegalRequest, asc::LOGICAL_UNIT_NOT_SUPPORTED),
            );
        }

        let result = self.router.cmd(&self.sessions[idx], &cdb, None);
        self.cmd_result(idx, result);
    }

    fn cmd_result(&mut self, idx: usize, result: Result<ScsiCmdResult>) {
        match result {
            Ok(ScsiCmdResult::Status(s)) => {
                self.sessions[idx].sense = Sense::NONE;
                self.status = s;
                self.next = BusPhase::Status;
            }
            Ok(ScsiCmdResult::CheckCondition(sense)) => self.check_condition(idx, sense),
            Ok(ScsiCmdResult::DataIn(data)) => {
                self.sessions[idx].sense = Sense::NONE;
                self.status = STATUS_GOOD;
                self.next = if data.is_empty() {
                    BusPhase::Status
                } else {
                    BusPhase::DataIn
                };
                self.databuf = data;
            }
            Ok(ScsiCmdResult::DataOut(len)) => {
                if len == 0 {
                    // Zero-length transfers are legal, complete right away
                    let cdb = self.sessions[idx].cdb.clone();
                    let result = self.router.cmd(&self.sessions[idx], &cdb, Some(&[]));
                    return self.cmd_result(idx, result);
                }
                self.databuf = vec![0; len];
                self.next = BusPhase::DataOut;
            }
            Err(e) => {
                log::error!(
                    "SCSI command ({:02X}) error: {}",
                    self.sessions[idx].cdb.first().copied().unwrap_or(0),
                    e
                );
                self.check_condition(
                    idx,
                    Sense::new(SenseKey::HardwareError, asc::INTERNAL_TARGET_FAILURE),
                );
            }
        }
    }

    fn check_condition(&mut self, idx: usize, sense: Sense) {
        log::debug!("ID {} check condition: {:?}", self.sessions[idx].id, sense);
        self.sessions[idx].sense = sense;
        self.status = STATUS_CHECK_CONDITION;
        self.next = BusPhase::Status;
    }

    fn process_data_in(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        self.phy.enter_phase(&self.sessions[idx], BusPhase::DataIn)?;

        let data = std::mem::take(&mut self.databuf);
        self.phy.start_write(data.len())?;
        while !self.phy.is_write_finished(&data)? {
            std::hint::spin_loop();
        }
        self.phy.finish_write(&data)?;
        self.next = BusPhase::Status;
        Ok(())
    }

    fn process_data_out(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        self.phy.enter_phase(&self.sessions[idx], BusPhase::DataOut)?;

        let mut data = std::mem::take(&mut self.databuf);
        let parity_error = self.phy.read(&mut data, self.config.enable_parity)?;
        if parity_error && self.config.enable_parity {
            self.stats.parity_errors += 1;
            self.check_condition(
                idx,
                Sense::new(SenseKey::AbortedCommand, asc::SCSI_PARITY_ERROR),
            );
            return Ok(());
        }

        let cdb = self.sessions[idx].cdb.clone();
        let result = self.router.cmd(&self.sessions[idx], &cdb, Some(&data));
        self.cmd_result(idx, result);
        Ok(())
    }

    fn process_status(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        let session = &self.sessions[idx];
        let control = session.cdb.last().copied().unwrap_or(0);

        self.msg_in = msg::COMMAND_COMPLETE;
        if self.status == STATUS_GOOD && control & 0x01 != 0 {
            // Linked command
            self.status = STATUS_INTERMEDIATE;
            self.msg_in = if control & 0x02 != 0 {
                msg::LINKED_COMMAND_COMPLETE_WITH_FLAG
            } else {
                msg::LINKED_COMMAND_COMPLETE
            };
        }

        self.phy.enter_phase(session, BusPhase::Status)?;
        self.phy.write_byte(self.status)?;
        log::debug!("ID {} status {:02X}", session.id, self.status);
        self.next = BusPhase::MessageIn;
        Ok(())
    }

    fn process_message_in(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        self.phy.enter_phase(&self.sessions[idx], BusPhase::MessageIn)?;
        self.phy.write_byte(self.msg_in)?;

        if self.phy.lines().get(Signal::Atn) {
            // Initiator has something to say first, message is resent after
            self.sessions[idx].atn = true;
        } else if self.msg_in == msg::COMMAND_COMPLETE {
            self.release_bus();
        } else {
            self.status = STATUS_GOOD;
            self.databuf.clear();
            self.next = BusPhase::Command;
        }
        Ok(())
    }

    fn message_reject(&mut self, idx: usize) -> PhyResult<()> {
        log::warn!("Rejecting message");
        self.phy.enter_phase(&self.sessions[idx], BusPhase::MessageIn)?;
        self.phy.write_byte(msg::MESSAGE_REJECT)
    }

    fn process_message_out(&mut self) -> PhyResult<()> {
        let Some(idx) = self.active else {
            self.next = BusPhase::BusFree;
            return Ok(());
        };
        let parity_check = self.config.enable_parity;
        let session = &mut self.sessions[idx];
        let was_need_sync_ack = std::mem::replace(&mut session.need_sync_ack, false);
        session.atn = false;

        self.phy.enter_phase(session, BusPhase::MessageOut)?;
        let (message, parity_error) = self.phy.read_byte(parity_check)?;
        self.stats.messages += 1;
        log::trace!("ID {} message out {:02X}", session.id, message);

        if parity_error && parity_check {
            // Skip the rest, the initiator sends the whole set again
            self.stats.parity_errors += 1;
            while self.phy.lines().get(Signal::Atn) {
                self.phy.read_byte(false)?;
            }
            self.sessions[idx].atn = true;
            return Ok(());
        }

        match message {
            msg::COMMAND_COMPLETE | msg::ABORT | msg::RELEASE_RECOVERY => {
                log::debug!("Message {:02X}, going bus free", message);
                self.release_bus();
                return Ok(());
            }
            msg::BUS_DEVICE_RESET => {
                let session = &mut self.sessions[idx];
                session.sync = SyncAgreement::ASYNC;
                session.sense = Sense::NONE;
                session.unit_attention = Some(asc::SCSI_BUS_RESET);
                log::debug!("ID {} bus device reset", session.id);
                self.release_bus();
                return Ok(());
            }
            msg::MESSAGE_REJECT => {
                if was_need_sync_ack {
                    log::debug!("Sync negotiation rejected");
                    self.sessions[idx].sync.offset = 0;
                    self.sessions[idx].sync.period = 0;
                }
            }
            msg::NOP | msg::INITIATOR_DETECTED_ERROR | msg::INITIATE_RECOVERY => (),
            msg::MESSAGE_PARITY_ERROR => {
                self.next = BusPhase::MessageIn;
                if was_need_sync_ack {
                    self.sessions[idx].sync.offset = 0;
                    self.sessions[idx].sync.period = 0;
                }
            }
            m if m & msg::IDENTIFY != 0 => {
                if m & 0x38 != 0 {
                    // Reserved bits or target routine, the LUN is not taken
                    self.message_reject(idx)?;
                } else {
                    self.sessions[idx].lun = Some(m & 0x07);
                }
            }
            0x20..=0x2F => {
                // Two byte messages, not supported
                self.phy.read_byte(false)?;
                if message != msg::IGNORE_WIDE_RESIDUE {
                    self.message_reject(idx)?;
                }
            }
            msg::EXTENDED => self.extended_message(idx, was_need_sync_ack)?,
            _ => self.message_reject(idx)?,
        }

        let atn = self.phy.lines().get(Signal::Atn);
        let session = &mut self.sessions[idx];
        session.atn |= atn;
        if !session.atn {
            session.need_sync_ack = false;
        }
        Ok(())
    }

    fn extended_message(&mut self, idx: usize, was_need_sync_ack: bool) -> PhyResult<()> {
        let len = match self.phy.read_byte(false)?.0 {
            0 => 256,
            n => n as usize,
        };
        let mut ext = vec![0; len];
        self.phy.read(&mut ext, false)?;

        match (ext[0], len) {
            (msg::EXT_WDTR, 2) => {
                let width = self.phy.negotiator().negotiate_wdtr(ext[1]);
                let session = &mut self.sessions[idx];
                // SDTR is invalidated by WDTR
                session.sync = SyncAgreement {
                    offset: 0,
                    period: 0,
                    wide: width > 0,
                };
                log::debug!("ID {} WDTR {} -> {}", session.id, ext[1], width);
                self.phy.enter_phase(session, BusPhase::MessageIn)?;
                self.phy.write(&[msg::EXTENDED, 2, msg::EXT_WDTR, width])
            }
            (msg::EXT_SDTR, 3) => {
                let (period, offset) = (ext[1], ext[2]);
                let session = &mut self.sessions[idx];
                let old = session.sync;
                session.sync = self.phy.negotiator().negotiate_sdtr(old, period, offset);
                log::debug!(
                    "ID {} SDTR period {} offset {} -> {:?}",
                    session.id,
                    period,
                    offset,
                    session.sync
                );

                let changed = period != old.period
                    || session.sync.period != old.period
                    || offset != old.offset
                    || session.sync.offset != old.offset;
                // Don't get into loops negotiating
                if changed || !was_need_sync_ack {
                    let reply = [
                        msg::EXTENDED,
                        3,
                        msg::EXT_SDTR,
                        session.sync.period,
                        session.sync.offset,
                    ];
                    session.need_sync_ack = true;
                    self.phy.enter_phase(session, BusPhase::MessageIn)?;
                    self.phy.write(&reply)?;
                }
                Ok(())
            }
            _ => self.message_reject(idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::disk::{DISK_BLOCKSIZE, RamDisk};
    use crate::scsi::simbus::{SimBus, SimPort};
    use crate::scsi::target::TargetRouter;

    fn controller(config: BoardConfig) -> TargetController<SimPort, TargetRouter> {
        let mut router = TargetRouter::new();
        router
            .attach(3, Box::new(RamDisk::new(8, DISK_BLOCKSIZE).unwrap()))
            .unwrap();
        let mut c = TargetController::new(SimBus::new().port(), config, router);
        c.active = Some(0);
        c
    }

    fn with_cdb(c: &mut TargetController<SimPort, TargetRouter>, cdb: &[u8]) {
        c.sessions[0].cdb = cdb.iter().copied().collect();
        c.sessions[0].lun = Some(cdb[1] >> 5);
    }

    #[test]
    fn one_session_per_id() {
        let c = controller(BoardConfig::default());
        assert_eq!(c.sessions.len(), 1);
        assert_eq!(c.session(3).unwrap().id, 3);
        assert_eq!(c.phy().flags().target_mask(), 1 << 3);
    }

    #[test]
    fn parity_error_aborts_command() {
        let mut c = controller(BoardConfig::default());
        with_cdb(&mut c, &[0x12, 0, 0, 0, 36, 0]);
        c.dispatch(0, true);
        assert_eq!(c.next, BusPhase::Status);
        assert_eq!(c.status, STATUS_CHECK_CONDITION);
        assert_eq!(
            c.sessions[0].sense,
            Sense::new(SenseKey::AbortedCommand, asc::SCSI_PARITY_ERROR)
        );
        assert_eq!(c.stats().parity_errors, 1);
    }

    #[test]
    fn parity_error_ignored_when_disabled() {
        let mut c = controller(BoardConfig {
            enable_parity: false,
            ..Default::default()
        });
        with_cdb(&mut c, &[0x12, 0, 0, 0, 36, 0]);
        c.dispatch(0, true);
        assert_eq!(c.next, BusPhase::DataIn);
        assert_eq!(c.databuf.len(), 36);
    }

    #[test]
    fn request_sense_zero_length() {
        let mut c = controller(BoardConfig::default());
        c.sessions[0].sense = Sense::new(SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT);
        with_cdb(&mut c, &[0x03, 0, 0, 0, 0, 0]);
        c.dispatch(0, false);
        assert_eq!(c.next, BusPhase::DataIn);
        assert_eq!(c.databuf, vec![0xF0, 0, 0x02, 0]);
        assert_eq!(c.sessions[0].sense, Sense::NONE);
    }

    #[test]
    fn unit_attention_skips_inquiry() {
        let mut c = controller(BoardConfig {
            enable_unit_attention: true,
            ..Default::default()
        });
        with_cdb(&mut c, &[0x12, 0, 0, 0, 36, 0]);
        c.dispatch(0, false);
        assert_eq!(c.next, BusPhase::DataIn);
        assert!(c.sessions[0].unit_attention.is_some());

        with_cdb(&mut c, &[0, 0, 0, 0, 0, 0]);
        c.dispatch(0, false);
        assert_eq!(c.status, STATUS_CHECK_CONDITION);
        assert_eq!(c.sessions[0].sense.key, SenseKey::UnitAttention);
        assert_eq!(c.sessions[0].unit_attention, None);

        c.dispatch(0, false);
        assert_eq!(c.status, STATUS_GOOD);
    }

    #[test]
    fn zero_length_write_completes() {
        let mut c = controller(BoardConfig::default());
        with_cdb(&mut c, &[0x2A, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        c.dispatch(0, false);
        assert_eq!(c.next, BusPhase::Status);
        assert_eq!(c.status, STATUS_GOOD);
    }
}
