//! Bus phase control, target side

use crate::scsi::config::PhyTiming;
use crate::scsi::handshake::HandshakeTransceiver;
use crate::scsi::lines::{Lines, Signal, SignalLines};
use crate::scsi::session::{CompatMode, TargetSession};
use crate::scsi::sync::SyncNegotiator;
use crate::scsi::{BusPhase, PhyError, PhyResult};

pub struct PhaseController {
    phase: BusPhase,
    timing: PhyTiming,
}

impl PhaseController {
    pub fn new(timing: PhyTiming) -> Self {
        Self {
            phase: BusPhase::BusFree,
            timing,
        }
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    pub fn timing(&self) -> &PhyTiming {
        &self.timing
    }

    /// Switches the bus to `phase` and returns how long the caller must wait
    /// before the first REQ. Re-entering the current phase is a no-op.
    ///
    /// Waits (bounded only by reset) until REQ and ACK are both released.
    /// If the sync parameters for the new phase cannot be applied, the bus
    /// reset flag is raised and the phase stays unchanged.
    pub fn enter_phase<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        xcvr: &mut HandshakeTransceiver,
        negotiator: &SyncNegotiator,
        session: &TargetSession,
        phase: BusPhase,
    ) -> PhyResult<u32> {
        if phase == self.phase {
            return Ok(0);
        }

        while lines.get(Signal::Req) || lines.get(Signal::Ack) {
            if session.is_reset() {
                return Err(PhyError::BusReset);
            }
            std::hint::spin_loop();
        }

        let scsi1 = session.compat == CompatMode::Scsi1;
        if scsi1 && phase.is_data() {
            // Some SCSI-1 hosts need a long pause before data
            lines.delay_ns(self.timing.scsi1_data_phase_ns);
        }

        if !negotiator.apply_for_phase(xcvr, session.sync, phase) {
            log::error!("Transfer engine busy entering {:?}, forcing bus reset", phase);
            session.flags().raise_reset();
            return Err(PhyError::SyncNegotiationFailure);
        }

        let old = self.phase;
        self.phase = phase;
        log::trace!("Phase {:?} ({}) -> {:?} ({})", old, old.code(), phase, phase.code());

        let Some(code) = phase.wire_code() else {
            // Not a target-driven phase, nothing of ours stays on the bus
            session.flags().set_bsy_driven(false);
            lines.release_all();
            return Ok(0);
        };
        let wanted = Lines::NONE.with_phase_bits(code);
        let mask = Lines((lines.driven().0 ^ wanted.0) & Lines::PHASE.0);
        if !mask.is_empty() {
            lines.toggle(mask);
        }

        let mut delay = self.timing.bus_settle_ns;
        if old.io() != phase.io() {
            delay += self.timing.data_release_ns;
        }
        if scsi1 {
            delay += self.timing.scsi1_phase_settle_ns;
        }
        Ok(delay)
    }

    /// Releases the bus unconditionally
    pub fn enter_bus_free<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        session: &mut TargetSession,
    ) {
        log::trace!("Phase {:?} -> BusFree", self.phase);
        session.end_command();
        session.flags().take_selection();
        session.flags().set_bsy_driven(false);
        lines.release_all();
        self.phase = BusPhase::BusFree;
    }

    /// Forgets the current phase after a reset released the bus
    pub fn force_bus_free(&mut self) {
        self.phase = BusPhase::BusFree;
    }
}
