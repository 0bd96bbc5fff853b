//! Selection and reset detection
//!
//! The edge handlers here are meant to run in interrupt context. They only
//! read the lines and set flags in [`BusFlags`], they never drive the bus.

use std::sync::Arc;

use crate::scsi::config::{BoardConfig, PhyTiming};
use crate::scsi::lines::{Edges, Signal, SignalLines};
use crate::scsi::session::{BusFlags, CompatMode, Selection, TargetSession};

#[derive(Debug, Clone, Copy)]
pub struct SelectionArbiter {
    rst_glitch_filter_ns: u32,
    sel_io_enable_ns: u32,
    enable_scsi2: bool,
}

impl SelectionArbiter {
    pub fn new(config: &BoardConfig) -> Self {
        let PhyTiming {
            rst_glitch_filter_ns,
            sel_io_enable_ns,
            ..
        } = config.timing;
        Self {
            rst_glitch_filter_ns,
            sel_io_enable_ns,
            enable_scsi2: config.enable_scsi2,
        }
    }

    /// SEL asserted while BSY is not: someone is selecting. Latches the
    /// selection if one of our IDs is on the data bus.
    pub fn on_bsy_deassert_edge<L: SignalLines + ?Sized>(&self, lines: &L, flags: &BusFlags) -> bool {
        if flags.bsy_driven() || flags.selection().is_some() {
            return false;
        }
        let state = lines.sense();
        if !state.sel() || state.bsy() {
            return false;
        }

        let bits = lines.data_bus().low();
        let matched = bits & flags.target_mask();
        if matched == 0 {
            return false;
        }
        let target_id = matched.trailing_zeros() as u8;
        // SCSI-1 hosts may leave their own ID off the bus
        let others = bits & !(1 << target_id);
        let initiator_id = (others.count_ones() == 1).then(|| others.trailing_zeros() as u8);

        log::debug!(
            "Selected as ID {} by {:?} (bus {:02X})",
            target_id,
            initiator_id,
            bits
        );
        flags.latch_selection(Selection {
            target_id,
            initiator_id,
        });
        true
    }

    /// Drives BSY to confirm the selection, then samples ATN. Without ATN the
    /// host gets SCSI-1 treatment for this command. Returns the ATN state.
    pub fn on_sel_confirm<L: SignalLines + ?Sized>(
        &self,
        lines: &mut L,
        session: &mut TargetSession,
    ) -> bool {
        session.flags().set_bsy_driven(true);
        lines.set(Signal::Bsy, true);
        lines.delay_ns(self.sel_io_enable_ns);

        let atn = lines.get(Signal::Atn);
        session.atn = atn;
        if atn {
            session.compat = if self.enable_scsi2 {
                CompatMode::Scsi2
            } else {
                CompatMode::Scsi1
            };
        } else {
            // No IDENTIFY will follow, and nobody will read sense for an
            // attention we would raise
            session.compat = CompatMode::Scsi1;
            session.unit_attention = None;
        }
        atn
    }

    /// Glitch-filtered RST detection. Latches the reset flag only if RST is
    /// still asserted after the filter delay.
    pub fn on_rst_assert_edge<L: SignalLines + ?Sized>(&self, lines: &L, flags: &BusFlags) -> bool {
        let first = lines.get(Signal::Rst);
        lines.delay_ns(self.rst_glitch_filter_ns);
        let second = lines.get(Signal::Rst);
        if first && second {
            log::debug!("BUS RESET");
            flags.raise_reset();
            true
        } else {
            false
        }
    }
}

/// Edge interrupt handler for a target port
#[derive(Clone)]
pub struct TargetIrq {
    flags: Arc<BusFlags>,
    arbiter: SelectionArbiter,
}

impl TargetIrq {
    pub fn new(flags: Arc<BusFlags>, arbiter: SelectionArbiter) -> Self {
        Self { flags, arbiter }
    }

    pub fn on_edges<L: SignalLines + ?Sized>(&self, lines: &L, edges: Edges) {
        if edges.rising.rst() {
            self.arbiter.on_rst_assert_edge(lines, &self.flags);
        }
        if edges.falling.bsy() || edges.rising.sel() {
            self.arbiter.on_bsy_deassert_edge(lines, &self.flags);
        }
    }
}
