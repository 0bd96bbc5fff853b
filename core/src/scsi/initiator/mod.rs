//! Initiator engine
//!
//! The opposite bus role: selects a remote target and runs one CDB through
//! to bus free. The engine does no retries of its own, see [`probe`] for the
//! usual recovery sequences.

pub mod probe;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::scsi::config::InitiatorConfig;
use crate::scsi::lines::{DataBus, Signal, SignalLines};
use crate::scsi::{BusPhase, ScsiStatus, msg};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorError {
    #[error("no device responded at ID {0}")]
    NoDevice(u8),
    #[error("bus is busy")]
    BusBusy,
    #[error("expected {expected:?}, target went to {observed:?}")]
    Sequencing {
        expected: BusPhase,
        observed: BusPhase,
    },
    #[error("SCSI bus reset")]
    BusReset,
    #[error("command ended without status")]
    NoStatus,
}

impl InitiatorError {
    /// Negative result code, distinct from every legal status byte
    pub const fn code(&self) -> i32 {
        match self {
            Self::NoDevice(_) | Self::BusBusy => -1,
            Self::BusReset => -2,
            Self::Sequencing { .. } | Self::NoStatus => -3,
        }
    }
}

pub type InitiatorResult<T> = Result<T, InitiatorError>;

/// Arbitration is lost if another ID shows up within this many samples
const ARBITRATION_SAMPLES: usize = 10;

pub struct InitiatorEngine<L: SignalLines> {
    lines: L,
    config: InitiatorConfig,
    reset: Arc<AtomicBool>,

    /// Phases of the last command, in order of appearance
    phase_history: Vec<BusPhase>,
    /// Message bytes received during the last command
    messages: Vec<u8>,
}

impl<L: SignalLines> InitiatorEngine<L> {
    pub fn new(lines: L, config: InitiatorConfig) -> Self {
        Self {
            lines,
            config,
            reset: Arc::new(AtomicBool::new(false)),
            phase_history: vec![],
            messages: vec![],
        }
    }

    pub fn config(&self) -> &InitiatorConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut InitiatorConfig {
        &mut self.config
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }

    /// Flag to raise from an RST edge interrupt
    pub fn reset_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reset)
    }

    pub fn phase_history(&self) -> &[BusPhase] {
        &self.phase_history
    }

    pub fn messages(&self) -> &[u8] {
        &self.messages
    }

    fn check_reset(&self) -> InitiatorResult<()> {
        if self.lines.get(Signal::Rst) {
            self.reset.store(true, Ordering::Release);
        }
        if self.reset.load(Ordering::Acquire) {
            Err(InitiatorError::BusReset)
        } else {
            Ok(())
        }
    }

    pub fn release(&mut self) {
        log::trace!("Initiator releasing bus");
        self.lines.release_all();
    }

    /// Pulses RST and waits for the devices to recover
    pub fn bus_reset(&mut self) {
        log::debug!("Initiator bus reset");
        self.lines.release_all();
        self.lines.set(Signal::Rst, true);
        self.delay_us(self.config.rst_pulse_us);
        self.lines.set(Signal::Rst, false);
        self.delay_us(self.config.reset_recovery_ms.saturating_mul(1000));
        self.reset.store(false, Ordering::Release);
    }

    fn delay_us(&self, us: u32) {
        self.lines.delay_ns(us.saturating_mul(1000));
    }

    /// Arbitrates and selects `target`. Returns false if another device won
    /// arbitration or the target did not answer in time; the bus is released
    /// in both cases.
    pub fn select_target(&mut self, target: u8, own: u8) -> bool {
        self.lines.release_all();
        if self.lines.get(Signal::Bsy) || self.lines.get(Signal::Sel) {
            log::debug!("Bus busy, not selecting {}", target);
            return false;
        }

        // Yield to anyone else that shows up during arbitration
        let own_bit = 1u8 << own;
        self.lines.set(Signal::Bsy, true);
        self.lines.drive_data_bus(DataBus::narrow(own_bit));
        for _ in 0..ARBITRATION_SAMPLES {
            self.delay_us(1);
            if self.lines.data_bus().low() != own_bit {
                log::debug!("Lost arbitration selecting {}", target);
                self.lines.release_all();
                return false;
            }
        }

        log::debug!("Selecting ID {} from ID {}", target, own);
        self.lines.set(Signal::Sel, true);
        self.lines
            .drive_data_bus(DataBus::narrow((1 << target) | own_bit));
        if self.config.assert_atn {
            self.lines.set(Signal::Atn, true);
        }
        self.lines.set(Signal::Bsy, false);

        let poll_us = self.config.selection_poll_us.max(1);
        let mut waited_us = 0u32;
        while !self.lines.get(Signal::Bsy) {
            if waited_us >= self.config.selection_timeout_us || self.reset.load(Ordering::Acquire) {
                log::debug!("ID {} did not respond", target);
                self.lines.release_all();
                return false;
            }
            self.delay_us(poll_us);
            waited_us = waited_us.saturating_add(poll_us);
        }

        self.lines.release_data_bus();
        self.lines.set(Signal::Sel, false);
        true
    }

    /// Current phase as signalled by the target. Phase lines are only
    /// trusted while REQ is asserted.
    pub fn phase(&self) -> BusPhase {
        let sense = self.lines.sense();
        if !sense.bsy() || self.reset.load(Ordering::Acquire) || sense.rst() {
            BusPhase::BusFree
        } else if !sense.req() {
            BusPhase::BusBusy
        } else {
            BusPhase::from_wire(sense.phase_bits()).unwrap_or(BusPhase::BusBusy)
        }
    }

    /// Waits for REQ in `phase`. Fails if the target goes elsewhere.
    fn await_req(&self, phase: BusPhase) -> InitiatorResult<()> {
        loop {
            self.check_reset()?;
            let sense = self.lines.sense();
            if !sense.bsy() {
                return Err(InitiatorError::Sequencing {
                    expected: phase,
                    observed: BusPhase::BusFree,
                });
            }
            if sense.req() {
                let observed = BusPhase::from_wire(sense.phase_bits()).unwrap_or(BusPhase::BusBusy);
                if observed != phase {
                    return Err(InitiatorError::Sequencing {
                        expected: phase,
                        observed,
                    });
                }
                return Ok(());
            }
        }
    }

    fn await_req_release(&self) -> InitiatorResult<()> {
        while self.lines.get(Signal::Req) {
            self.check_reset()?;
        }
        Ok(())
    }

    /// Sends `data` in `phase`, one interlocked handshake per byte. In
    /// MessageOut, ATN is dropped before the last byte.
    pub fn host_write(&mut self, phase: BusPhase, data: &[u8]) -> InitiatorResult<()> {
        log::trace!("Host write {:?} {:02X?}", phase, data);
        for (i, &b) in data.iter().enumerate() {
            self.await_req(phase)?;
            if phase == BusPhase::MessageOut && i == data.len() - 1 {
                self.lines.set(Signal::Atn, false);
            }
            self.lines.drive_data_bus(DataBus::narrow(b));
            self.lines.delay_ns(self.config.data_setup_ns);
            self.lines.set(Signal::Ack, true);
            let released = self.await_req_release();
            self.lines.release_data_bus();
            self.lines.set(Signal::Ack, false);
            released?;
        }
        Ok(())
    }

    /// Receives `buf.len()` bytes in `phase`. Returns whether any byte had
    /// a parity error (only checked if configured).
    pub fn host_read(&mut self, phase: BusPhase, buf: &mut [u8]) -> InitiatorResult<bool> {
        let mut parity_error = false;
        for b in buf.iter_mut() {
            self.await_req(phase)?;
            let db = self.lines.data_bus();
            *b = db.low();
            if self.config.check_parity && !db.low_parity_ok() {
                log::warn!("Parity error reading {:02X} in {:?}", *b, phase);
                parity_error = true;
            }
            self.lines.set(Signal::Ack, true);
            let released = self.await_req_release();
            self.lines.set(Signal::Ack, false);
            released?;
        }
        log::trace!("Host read {:?} {:02X?}", phase, buf);
        Ok(parity_error)
    }

    /// Message bytes for the MessageOut phase following selection
    fn message_queue(&self) -> Vec<u8> {
        if !self.config.assert_atn {
            return vec![];
        }
        let mut queue = vec![self.config.identify];
        if let Some(req) = self.config.sync_request {
            queue.extend([msg::EXTENDED, 3, msg::EXT_SDTR, req.period, req.offset]);
        }
        queue
    }

    fn read_message(&mut self) -> InitiatorResult<()> {
        let mut b = [0];
        self.host_read(BusPhase::MessageIn, &mut b)?;
        self.messages.push(b[0]);
        if b[0] == msg::EXTENDED {
            self.host_read(BusPhase::MessageIn, &mut b)?;
            self.messages.push(b[0]);
            let len = match b[0] {
                0 => 256,
                n => n as usize,
            };
            let mut ext = vec![0; len];
            self.host_read(BusPhase::MessageIn, &mut ext)?;
            self.messages.extend_from_slice(&ext);
        } else if (0x20..=0x2F).contains(&b[0]) {
            self.host_read(BusPhase::MessageIn, &mut b)?;
            self.messages.push(b[0]);
        }
        Ok(())
    }

    /// Selects `target_id` and runs `cdb` to completion. Returns the status
    /// byte. Each data phase needs its buffer and may only occur once.
    pub fn run_command(
        &mut self,
        target_id: u8,
        cdb: &[u8],
        data_in: Option<&mut [u8]>,
        data_out: Option<&[u8]>,
    ) -> InitiatorResult<u8> {
        self.phase_history.clear();
        self.messages.clear();
        self.check_reset()?;

        if !self.select_target(target_id, self.config.own_id) {
            return Err(if self.lines.get(Signal::Bsy) {
                InitiatorError::BusBusy
            } else {
                InitiatorError::NoDevice(target_id)
            });
        }

        let result = self.command_phases(cdb, data_in, data_out);
        self.release();
        if let Err(e) = result {
            log::debug!("Command {:02X?} to ID {} failed: {}", cdb, target_id, e);
        }
        result
    }

    fn command_phases(
        &mut self,
        cdb: &[u8],
        mut data_in: Option<&mut [u8]>,
        mut data_out: Option<&[u8]>,
    ) -> InitiatorResult<u8> {
        let mut queue = self.message_queue();
        let mut cdb_sent = false;
        let mut status = None;

        loop {
            let phase = self.phase();
            match phase {
                BusPhase::BusFree => {
                    self.check_reset()?;
                    break;
                }
                BusPhase::BusBusy => continue,
                _ => (),
            }
            if self.phase_history.last() != Some(&phase) {
                self.phase_history.push(phase);
            }

            match phase {
                BusPhase::MessageIn => self.read_message()?,
                BusPhase::MessageOut => {
                    if queue.is_empty() {
                        queue.push(msg::NOP);
                    }
                    let out = std::mem::take(&mut queue);
                    self.host_write(phase, &out)?;
                }
                BusPhase::Command if !cdb_sent => {
                    self.host_write(phase, cdb)?;
                    cdb_sent = true;
                }
                BusPhase::DataIn => {
                    let Some(buf) = data_in.take() else {
                        return Err(self.unexpected(phase));
                    };
                    self.host_read(phase, buf)?;
                }
                BusPhase::DataOut => {
                    let Some(buf) = data_out.take() else {
                        return Err(self.unexpected(phase));
                    };
                    self.host_write(phase, buf)?;
                }
                BusPhase::Status => {
                    let mut b = [0];
                    self.host_read(phase, &mut b)?;
                    log::debug!("Status {:02X} ({:?})", b[0], ScsiStatus::from_byte(b[0]));
                    status = Some(b[0]);
                }
                _ => return Err(self.unexpected(phase)),
            }
        }

        status.ok_or(InitiatorError::NoStatus)
    }

    fn unexpected(&self, observed: BusPhase) -> InitiatorError {
        let expected = match observed {
            BusPhase::DataIn | BusPhase::DataOut | BusPhase::Command => BusPhase::Status,
            _ => BusPhase::MessageIn,
        };
        log::warn!("Unexpected {:?} phase", observed);
        InitiatorError::Sequencing { expected, observed }
    }
}
