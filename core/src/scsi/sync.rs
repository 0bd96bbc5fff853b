//! Synchronous and wide transfer agreements

use crate::scsi::BusPhase;
use crate::scsi::config::SyncLimits;
use crate::scsi::handshake::HandshakeTransceiver;
use crate::scsi::session::SyncAgreement;

pub struct SyncNegotiator {
    limits: SyncLimits,
}

impl SyncNegotiator {
    pub fn new(limits: SyncLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SyncLimits {
        &self.limits
    }

    /// Configures the transceiver for the following transfers. Offset 0 is
    /// asynchronous. Fails if a transfer is still in flight, in which case
    /// the caller must reset the bus.
    pub fn set_sync_mode(
        &self,
        xcvr: &mut HandshakeTransceiver,
        offset: u8,
        period: u8,
        wide: bool,
    ) -> bool {
        let mode = SyncAgreement {
            offset,
            period: if offset > 0 { period } else { 0 },
            wide,
        };
        if xcvr.mode() == mode {
            return xcvr.is_idle();
        }
        match xcvr.configure(mode) {
            Ok(()) => {
                log::trace!("Transfer mode {:?}", mode);
                true
            }
            Err(e) => {
                log::warn!("Cannot apply transfer mode {:?}: {}", mode, e);
                false
            }
        }
    }

    /// Applies the session agreement for data phases, async narrow otherwise
    pub fn apply_for_phase(
        &self,
        xcvr: &mut HandshakeTransceiver,
        agreement: SyncAgreement,
        phase: BusPhase,
    ) -> bool {
        if phase.is_data() {
            self.set_sync_mode(xcvr, agreement.offset, agreement.period, agreement.wide)
        } else {
            self.set_sync_mode(xcvr, 0, 0, false)
        }
    }

    /// Answer to an SDTR request. The width of `current` is kept.
    pub fn negotiate_sdtr(&self, current: SyncAgreement, period: u8, offset: u8) -> SyncAgreement {
        let l = &self.limits;
        if !l.allow_sync || period == 0 || offset == 0 || period > l.max_period {
            return SyncAgreement {
                offset: 0,
                period: 0,
                wide: current.wide,
            };
        }
        SyncAgreement {
            offset: offset.min(l.max_offset),
            period: period.max(l.min_period),
            wide: current.wide,
        }
    }

    /// Answer to a WDTR request: the width exponent we agree to
    pub fn negotiate_wdtr(&self, exponent: u8) -> u8 {
        if self.limits.wide_capable && exponent >= 1 { 1 } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::config::PhyTiming;

    fn negotiator() -> SyncNegotiator {
        SyncNegotiator::new(SyncLimits::default())
    }

    #[test]
    fn sdtr_clamps() {
        let n = negotiator();
        let a = n.negotiate_sdtr(SyncAgreement::ASYNC, 12, 32);
        assert_eq!(a.offset, 15);
        assert_eq!(a.period, 25);

        let a = n.negotiate_sdtr(SyncAgreement::ASYNC, 50, 8);
        assert_eq!((a.period, a.offset), (50, 8));
    }

    #[test]
    fn sdtr_async_fallback() {
        let n = negotiator();
        assert_eq!(n.negotiate_sdtr(SyncAgreement::ASYNC, 0, 8), SyncAgreement::ASYNC);
        assert_eq!(n.negotiate_sdtr(SyncAgreement::ASYNC, 25, 0), SyncAgreement::ASYNC);
        assert_eq!(n.negotiate_sdtr(SyncAgreement::ASYNC, 81, 8), SyncAgreement::ASYNC);

        let n = SyncNegotiator::new(SyncLimits {
            allow_sync: false,
            ..Default::default()
        });
        assert!(!n.negotiate_sdtr(SyncAgreement::ASYNC, 25, 8).is_sync());
    }

    #[test]
    fn wdtr() {
        assert_eq!(negotiator().negotiate_wdtr(1), 0);
        let n = SyncNegotiator::new(SyncLimits {
            wide_capable: true,
            ..Default::default()
        });
        assert_eq!(n.negotiate_wdtr(0), 0);
        assert_eq!(n.negotiate_wdtr(1), 1);
        assert_eq!(n.negotiate_wdtr(2), 1);
    }

    #[test]
    fn set_sync_mode_refused_while_busy() {
        let n = negotiator();
        let mut xcvr = HandshakeTransceiver::new(&PhyTiming::default());
        assert!(n.set_sync_mode(&mut xcvr, 8, 25, false));
        assert_eq!(xcvr.mode().offset, 8);

        xcvr.start_write(4).unwrap();
        assert!(!n.set_sync_mode(&mut xcvr, 0, 0, false));
        assert_eq!(xcvr.mode().offset, 8);
    }

    #[test]
    fn async_mode_is_canonical() {
        let n = negotiator();
        let mut xcvr = HandshakeTransceiver::new(&PhyTiming::default());
        assert!(n.set_sync_mode(&mut xcvr, 0, 50, false));
        assert_eq!(xcvr.mode(), SyncAgreement::ASYNC);
    }
}
