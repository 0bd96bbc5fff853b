//! REQ/ACK handshake, target side
//!
//! Every transfer, including single message and status bytes, runs through
//! the same step machine. The bulk interface hands control back to the
//! caller whenever the initiator has not answered yet, the blocking calls
//! simply spin on it. All waits end on the bus reset flag.

use crate::scsi::config::PhyTiming;
use crate::scsi::lines::{DataBus, Signal, SignalLines};
use crate::scsi::session::{BusFlags, SyncAgreement};
use crate::scsi::{PhyError, PhyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Direction {
    /// Target to initiator (DataIn, Status, MessageIn)
    Write,
    /// Initiator to target (Command, DataOut, MessageOut)
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Put data on the bus (writes) and assert REQ
    Req,
    AwaitAck,
    AwaitAckRelease,
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    dir: Direction,
    len: usize,
    pos: usize,
    step: Step,
    wide: bool,
    parity_check: bool,
    parity_error: bool,
}

impl Transfer {
    const fn unit(&self) -> usize {
        if self.wide { 2 } else { 1 }
    }

    fn unit_out(&self, data: &[u8]) -> DataBus {
        if self.wide {
            let hi = data.get(self.pos + 1).copied().unwrap_or(0);
            DataBus::wide(u16::from_le_bytes([data[self.pos], hi]))
        } else {
            DataBus::narrow(data[self.pos])
        }
    }

    fn unit_in(&mut self, db: DataBus, data: &mut [u8]) {
        let mut ok = db.low_parity_ok();
        data[self.pos] = db.low();
        if self.wide && self.pos + 1 < self.len {
            data[self.pos + 1] = db.high();
            ok &= db.high_parity_ok();
        }
        if self.parity_check && !ok {
            log::warn!("Parity error at byte {} ({:02X})", self.pos, db.low());
            self.parity_error = true;
        }
    }
}

enum Buf<'a> {
    Out(&'a [u8]),
    In(&'a mut [u8]),
}

impl Buf<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Out(d) => d.len(),
            Self::In(d) => d.len(),
        }
    }

    const fn dir(&self) -> Direction {
        match self {
            Self::Out(_) => Direction::Write,
            Self::In(_) => Direction::Read,
        }
    }
}

pub struct HandshakeTransceiver {
    mode: SyncAgreement,
    data_setup_ns: u32,
    xfer: Option<Transfer>,
}

impl HandshakeTransceiver {
    pub fn new(timing: &PhyTiming) -> Self {
        Self {
            mode: SyncAgreement::ASYNC,
            data_setup_ns: timing.data_setup_ns,
            xfer: None,
        }
    }

    pub fn mode(&self) -> SyncAgreement {
        self.mode
    }

    /// No transfer started or awaiting finish
    pub fn is_idle(&self) -> bool {
        self.xfer.is_none()
    }

    /// Applies transfer parameters for the next transfers. Refused while a
    /// transfer is in flight.
    pub fn configure(&mut self, mode: SyncAgreement) -> PhyResult<()> {
        if !self.is_idle() {
            return Err(PhyError::TransferBusy);
        }
        self.mode = mode;
        Ok(())
    }

    fn setup_ns(&self) -> u32 {
        if self.mode.is_sync() {
            self.mode.period_ns() / 2
        } else {
            self.data_setup_ns
        }
    }

    fn begin(&mut self, dir: Direction, len: usize, wide: bool, parity_check: bool) -> PhyResult<()> {
        if !self.is_idle() {
            return Err(PhyError::TransferBusy);
        }
        self.xfer = Some(Transfer {
            dir,
            len,
            pos: 0,
            step: Step::Req,
            wide,
            parity_check,
            parity_error: false,
        });
        Ok(())
    }

    /// Drops any transfer in flight and releases every output
    pub fn abort<L: SignalLines + ?Sized>(&mut self, lines: &mut L) {
        self.xfer = None;
        lines.release_all();
    }

    fn poll<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        mut buf: Buf<'_>,
    ) -> PhyResult<bool> {
        let setup_ns = self.setup_ns();
        let Some(mut xfer) = self.xfer else {
            return Err(PhyError::NoTransfer);
        };
        if xfer.dir != buf.dir() {
            return Err(PhyError::NoTransfer);
        }
        if xfer.len != buf.len() {
            return Err(PhyError::BufferMismatch {
                expected: xfer.len,
                got: buf.len(),
            });
        }

        match Self::run(&mut xfer, lines, flags, &mut buf, setup_ns) {
            Ok(done) => {
                self.xfer = Some(xfer);
                Ok(done)
            }
            Err(e) => {
                self.abort(lines);
                Err(e)
            }
        }
    }

    /// Advances the handshake until it has to wait for the initiator
    fn run<L: SignalLines + ?Sized>(
        xfer: &mut Transfer,
        lines: &mut L,
        flags: &BusFlags,
        buf: &mut Buf<'_>,
        setup_ns: u32,
    ) -> PhyResult<bool> {
        loop {
            if flags.reset() {
                return Err(PhyError::BusReset);
            }
            match xfer.step {
                Step::Req => {
                    if xfer.pos >= xfer.len {
                        return Ok(true);
                    }
                    if let Buf::Out(data) = buf {
                        lines.drive_data_bus(xfer.unit_out(data));
                        lines.delay_ns(setup_ns);
                        // Stale edge from the previous byte
                        lines.take_edge(Signal::Ack);
                    }
                    lines.set(Signal::Req, true);
                    xfer.step = Step::AwaitAck;
                }
                Step::AwaitAck => {
                    match buf {
                        Buf::Out(_) => {
                            // Short synchronous ACK pulses only show up in the latch
                            if !(lines.take_edge(Signal::Ack) || lines.get(Signal::Ack)) {
                                return Ok(false);
                            }
                            lines.release_data_bus();
                        }
                        Buf::In(data) => {
                            if !lines.get(Signal::Ack) {
                                return Ok(false);
                            }
                            lines.delay_ns(setup_ns);
                            xfer.unit_in(lines.data_bus(), data);
                        }
                    }
                    lines.set(Signal::Req, false);
                    xfer.step = Step::AwaitAckRelease;
                }
                Step::AwaitAckRelease => {
                    if lines.get(Signal::Ack) {
                        return Ok(false);
                    }
                    xfer.pos += xfer.unit();
                    xfer.step = Step::Req;
                }
            }
        }
    }

    /// Starts sending `len` bytes, 16 bits per handshake in wide mode
    pub fn start_write(&mut self, len: usize) -> PhyResult<()> {
        log::trace!("Start write {} bytes ({:?})", len, self.mode);
        self.begin(Direction::Write, len, self.mode.wide, false)
    }

    /// Moves as much of `data` as possible without waiting. `data` must be the
    /// same buffer on every call of one transfer.
    pub fn is_write_finished<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        data: &[u8],
    ) -> PhyResult<bool> {
        self.poll(lines, flags, Buf::Out(data))
    }

    pub fn finish_write<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        data: &[u8],
    ) -> PhyResult<()> {
        while !self.poll(lines, flags, Buf::Out(data))? {}
        self.xfer = None;
        Ok(())
    }

    pub fn start_read(&mut self, len: usize, parity_check: bool) -> PhyResult<()> {
        log::trace!("Start read {} bytes ({:?})", len, self.mode);
        self.begin(Direction::Read, len, self.mode.wide, parity_check)
    }

    pub fn is_read_finished<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        data: &mut [u8],
    ) -> PhyResult<bool> {
        self.poll(lines, flags, Buf::In(data))
    }

    /// Completes a read, returns whether any byte had a parity error
    pub fn finish_read<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        data: &mut [u8],
    ) -> PhyResult<bool> {
        while !self.poll(lines, flags, Buf::In(data))? {}
        Ok(self.xfer.take().is_some_and(|x| x.parity_error))
    }

    /// Sends one byte. Always narrow: message and status bytes are never wide.
    pub fn write_byte<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        value: u8,
    ) -> PhyResult<()> {
        self.begin(Direction::Write, 1, false, false)?;
        self.finish_write(lines, flags, &[value])
    }

    /// Receives one byte, returning it with its parity error flag
    pub fn read_byte<L: SignalLines + ?Sized>(
        &mut self,
        lines: &mut L,
        flags: &BusFlags,
        parity_check: bool,
    ) -> PhyResult<(u8, bool)> {
        self.begin(Direction::Read, 1, false, parity_check)?;
        let mut b = [0];
        let parity_error = self.finish_read(lines, flags, &mut b)?;
        Ok((b[0], parity_error))
    }
}
