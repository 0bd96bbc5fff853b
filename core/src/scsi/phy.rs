//! Target physical layer
//!
//! Owns the port and the protocol primitives that act on it.

use std::sync::Arc;

use crate::scsi::config::BoardConfig;
use crate::scsi::handshake::HandshakeTransceiver;
use crate::scsi::lines::{Signal, SignalLines};
use crate::scsi::phase::PhaseController;
use crate::scsi::selection::{SelectionArbiter, TargetIrq};
use crate::scsi::session::{BusFlags, TargetSession};
use crate::scsi::sync::SyncNegotiator;
use crate::scsi::{BusPhase, PhyResult};

pub struct TargetPhy<L: SignalLines> {
    lines: L,
    flags: Arc<BusFlags>,
    phase: PhaseController,
    xcvr: HandshakeTransceiver,
    negotiator: SyncNegotiator,
    arbiter: SelectionArbiter,
}

impl<L: SignalLines> TargetPhy<L> {
    /// `target_mask` has a bit set for every ID we answer selection for
    pub fn new(lines: L, config: &BoardConfig, target_mask: u8) -> Self {
        Self {
            lines,
            flags: BusFlags::new(target_mask),
            phase: PhaseController::new(config.timing.clone()),
            xcvr: HandshakeTransceiver::new(&config.timing),
            negotiator: SyncNegotiator::new(config.sync.clone()),
            arbiter: SelectionArbiter::new(config),
        }
    }

    pub fn flags(&self) -> &Arc<BusFlags> {
        &self.flags
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    pub fn phase(&self) -> BusPhase {
        self.phase.phase()
    }

    pub fn negotiator(&self) -> &SyncNegotiator {
        &self.negotiator
    }

    pub fn arbiter(&self) -> &SelectionArbiter {
        &self.arbiter
    }

    /// Interrupt handler to attach to the port's edge interrupts
    pub fn irq(&self) -> TargetIrq {
        TargetIrq::new(Arc::clone(&self.flags), self.arbiter)
    }

    pub fn delay_ns(&self, ns: u32) {
        if ns > 0 {
            self.lines.delay_ns(ns);
        }
    }

    /// Changes phase without waiting for the bus to settle. Returns the
    /// settle delay still owed before the first REQ.
    pub fn enter_phase_immediate(&mut self, session: &TargetSession, phase: BusPhase) -> PhyResult<u32> {
        self.phase.enter_phase(
            &mut self.lines,
            &mut self.xcvr,
            &self.negotiator,
            session,
            phase,
        )
    }

    /// Changes phase and waits for the bus to settle
    pub fn enter_phase(&mut self, session: &TargetSession, phase: BusPhase) -> PhyResult<()> {
        let delay = self.enter_phase_immediate(session, phase)?;
        self.delay_ns(delay);
        Ok(())
    }

    pub fn enter_bus_free(&mut self, session: &mut TargetSession) {
        self.phase.enter_bus_free(&mut self.lines, session);
    }

    /// Drops everything after a bus reset
    pub fn reset(&mut self) {
        self.xcvr.abort(&mut self.lines);
        self.phase.force_bus_free();
        self.flags.take_selection();
        self.flags.set_bsy_driven(false);
    }

    pub fn set_sync_mode(&mut self, offset: u8, period: u8, wide: bool) -> bool {
        self.negotiator
            .set_sync_mode(&mut self.xcvr, offset, period, wide)
    }

    pub fn on_sel_confirm(&mut self, session: &mut TargetSession) -> bool {
        self.arbiter.on_sel_confirm(&mut self.lines, session)
    }

    /// Runs the selection and reset detectors from the foreground, for ports
    /// without edge interrupts
    pub fn poll_edges(&mut self) {
        if self.lines.take_edge(Signal::Rst) {
            self.arbiter.on_rst_assert_edge(&self.lines, &self.flags);
        }
        self.arbiter.on_bsy_deassert_edge(&self.lines, &self.flags);
    }

    pub fn write_byte(&mut self, value: u8) -> PhyResult<()> {
        self.xcvr.write_byte(&mut self.lines, &self.flags, value)
    }

    pub fn read_byte(&mut self, parity_check: bool) -> PhyResult<(u8, bool)> {
        self.xcvr.read_byte(&mut self.lines, &self.flags, parity_check)
    }

    /// Blocking transfer to the initiator
    pub fn write(&mut self, data: &[u8]) -> PhyResult<()> {
        self.start_write(data.len())?;
        self.finish_write(data)
    }

    /// Blocking transfer from the initiator, returns the parity error flag
    pub fn read(&mut self, data: &mut [u8], parity_check: bool) -> PhyResult<bool> {
        self.start_read(data.len(), parity_check)?;
        self.finish_read(data)
    }

    pub fn start_write(&mut self, len: usize) -> PhyResult<()> {
        self.xcvr.start_write(len)
    }

    pub fn is_write_finished(&mut self, data: &[u8]) -> PhyResult<bool> {
        self.xcvr.is_write_finished(&mut self.lines, &self.flags, data)
    }

    pub fn finish_write(&mut self, data: &[u8]) -> PhyResult<()> {
        self.xcvr.finish_write(&mut self.lines, &self.flags, data)
    }

    pub fn start_read(&mut self, len: usize, parity_check: bool) -> PhyResult<()> {
        self.xcvr.start_read(len, parity_check)
    }

    pub fn is_read_finished(&mut self, data: &mut [u8]) -> PhyResult<bool> {
        self.xcvr.is_read_finished(&mut self.lines, &self.flags, data)
    }

    pub fn finish_read(&mut self, data: &mut [u8]) -> PhyResult<bool> {
        self.xcvr.finish_read(&mut self.lines, &self.flags, data)
    }
}
