//! Simulated SCSI bus
//!
//! A backplane shared by any number of [`SimPort`]s, one per device. Every
//! line is wired-OR: a line is asserted on the bus if any port drives it.
//! Ports run on their own threads; interrupt handlers attached to a port run
//! on the thread that caused the edge, outside the backplane lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::scsi::lines::{DataBus, Edges, Lines, Signal, SignalLines};

type IrqHandler = Arc<dyn Fn(Edges) + Send + Sync>;

#[derive(Default)]
struct PortState {
    driven: Lines,
    data: Option<DataBus>,
    /// Assert edges seen since the last `take_edge`
    edges: Lines,
}

#[derive(Default)]
struct Backplane {
    ports: Vec<PortState>,
    irqs: Vec<IrqHandler>,
    /// Data bits flipped on the way to every reader
    data_fault: u16,
    /// ACK assert edges, one per completed handshake
    handshakes: usize,
}

impl Backplane {
    fn lines(&self) -> Lines {
        self.ports
            .iter()
            .fold(Lines::NONE, |acc, p| acc.union(p.driven))
    }

    fn data_bus(&self) -> DataBus {
        let db = self
            .ports
            .iter()
            .filter_map(|p| p.data)
            .fold(DataBus::default(), DataBus::union);
        db.with_word(db.word() ^ self.data_fault)
    }
}

#[derive(Clone, Default)]
pub struct SimBus {
    backplane: Arc<Mutex<Backplane>>,
}

fn lock(bp: &Mutex<Backplane>) -> MutexGuard<'_, Backplane> {
    bp.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new device to the bus
    pub fn port(&self) -> SimPort {
        let mut bp = lock(&self.backplane);
        bp.ports.push(PortState::default());
        SimPort {
            backplane: Arc::clone(&self.backplane),
            idx: bp.ports.len() - 1,
        }
    }

    /// Control lines as seen on the bus
    pub fn lines(&self) -> Lines {
        lock(&self.backplane).lines()
    }

    pub fn data_bus(&self) -> DataBus {
        lock(&self.backplane).data_bus()
    }

    /// Number of REQ/ACK handshakes completed on the bus
    pub fn handshakes(&self) -> usize {
        lock(&self.backplane).handshakes
    }

    pub fn reset_handshakes(&self) {
        lock(&self.backplane).handshakes = 0;
    }

    /// Flips the given data bits (not the parity lines) for every reader
    pub fn set_data_fault(&self, mask: u16) {
        lock(&self.backplane).data_fault = mask;
    }
}

/// One device's connection to a [`SimBus`]. Clones share the same drivers,
/// which is how an interrupt handler gets its own view of the lines.
#[derive(Clone)]
pub struct SimPort {
    backplane: Arc<Mutex<Backplane>>,
    idx: usize,
}

impl SimPort {
    fn lock(&self) -> MutexGuard<'_, Backplane> {
        lock(&self.backplane)
    }

    /// Registers an edge handler. Handlers see every bus edge, including the
    /// ones caused by this port.
    pub fn attach_irq(&self, handler: impl Fn(Edges) + Send + Sync + 'static) {
        self.lock().irqs.push(Arc::new(handler));
    }

    pub fn drives_data(&self) -> bool {
        self.lock().ports[self.idx].data.is_some()
    }
}

impl SignalLines for SimPort {
    fn sense(&self) -> Lines {
        // Every wait loop polls through here, let the other devices run
        thread::yield_now();
        self.lock().lines()
    }

    fn driven(&self) -> Lines {
        self.lock().ports[self.idx].driven
    }

    fn toggle(&mut self, mask: Lines) {
        let (edges, irqs) = {
            let mut bp = self.lock();
            let before = bp.lines();
            let port = &mut bp.ports[self.idx];
            port.driven = Lines(port.driven.0 ^ mask.0);
            let after = bp.lines();

            let edges = Edges {
                rising: Lines(after.0 & !before.0),
                falling: Lines(before.0 & !after.0),
            };
            if edges.rising.is_empty() && edges.falling.is_empty() {
                return;
            }
            for p in &mut bp.ports {
                p.edges = p.edges.union(edges.rising);
            }
            if edges.rising.ack() {
                bp.handshakes += 1;
            }
            (edges, bp.irqs.clone())
        };

        for irq in &irqs {
            irq(edges);
        }
    }

    fn data_bus(&self) -> DataBus {
        self.lock().data_bus()
    }

    fn drive_data_bus(&mut self, value: DataBus) {
        self.lock().ports[self.idx].data = Some(value);
    }

    fn release_data_bus(&mut self) {
        self.lock().ports[self.idx].data = None;
    }

    fn take_edge(&self, signal: Signal) -> bool {
        let mut bp = self.lock();
        let port = &mut bp.ports[self.idx];
        let seen = port.edges.contains(signal);
        port.edges = Lines(port.edges.0 & !signal.mask().0);
        seen
    }

    fn delay_ns(&self, ns: u32) {
        if ns >= 1000 {
            thread::sleep(Duration::from_nanos(ns.into()));
        } else {
            let until = Instant::now() + Duration::from_nanos(ns.into());
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wired_or() {
        let bus = SimBus::new();
        let mut a = bus.port();
        let mut b = bus.port();

        a.set(Signal::Bsy, true);
        b.set(Signal::Bsy, true);
        assert!(b.get(Signal::Bsy));
        a.set(Signal::Bsy, false);
        assert!(a.get(Signal::Bsy));
        assert!(!a.driven().bsy());
        b.set(Signal::Bsy, false);
        assert!(!bus.lines().bsy());

        a.drive_data_bus(DataBus::narrow(0x80));
        b.drive_data_bus(DataBus::narrow(0x08));
        assert_eq!(a.data_bus().low(), 0x88);
        b.release_data_bus();
        assert_eq!(a.data_bus().low(), 0x80);
        assert!(!b.drives_data());
    }

    #[test]
    fn edge_latch() {
        let bus = SimBus::new();
        let mut host = bus.port();
        let dev = bus.port();

        assert!(!dev.take_edge(Signal::Ack));
        host.set(Signal::Ack, true);
        host.set(Signal::Ack, false);
        // Pulse is gone from the level but still latched
        assert!(!dev.get(Signal::Ack));
        assert!(dev.take_edge(Signal::Ack));
        assert!(!dev.take_edge(Signal::Ack));
        assert_eq!(bus.handshakes(), 1);
    }

    #[test]
    fn irq_on_edges() {
        let bus = SimBus::new();
        let mut host = bus.port();
        let dev = bus.port();
        let resets = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&resets);
        dev.attach_irq(move |edges| {
            if edges.rising.rst() {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        host.set(Signal::Rst, true);
        // No edge while already asserted
        host.set(Signal::Bsy, true);
        host.release_all();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn data_fault() {
        let bus = SimBus::new();
        let mut host = bus.port();
        let dev = bus.port();

        host.drive_data_bus(DataBus::narrow(0x10));
        bus.set_data_fault(0x01);
        let db = dev.data_bus();
        assert_eq!(db.low(), 0x11);
        assert!(!db.low_parity_ok());
    }
}
