//! Bus-level tests: target and initiator on one simulated bus

mod scenario;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::scsi::config::{BoardConfig, InitiatorConfig};
use crate::scsi::controller::TargetController;
use crate::scsi::disk::RamDisk;
use crate::scsi::initiator::InitiatorEngine;
use crate::scsi::lines::SignalLines;
use crate::scsi::phy::TargetPhy;
use crate::scsi::session::{CompatMode, TargetSession};
use crate::scsi::simbus::{SimBus, SimPort};
use crate::scsi::target::TargetRouter;

type TestController = TargetController<SimPort, TargetRouter>;

/// A target controller running on its own thread and an initiator on the
/// test thread, sharing one bus
struct Rig {
    bus: SimBus,
    stop: Arc<AtomicBool>,
    target: JoinHandle<TestController>,
    engine: InitiatorEngine<SimPort>,
}

impl Rig {
    fn start(config: BoardConfig, router: TargetRouter, icfg: InitiatorConfig) -> Self {
        let bus = SimBus::new();
        let port = bus.port();
        let mut controller = TargetController::new(port.clone(), config, router);
        attach_irq(&port, controller.phy());

        let stop = Arc::new(AtomicBool::new(false));
        let s = Arc::clone(&stop);
        let target = thread::spawn(move || {
            controller.run(&s);
            controller
        });

        Self {
            engine: InitiatorEngine::new(bus.port(), icfg),
            bus,
            stop,
            target,
        }
    }

    /// Single RAM disk at ID 0
    fn disk(disk: RamDisk, config: BoardConfig, icfg: InitiatorConfig) -> Self {
        let mut router = TargetRouter::new();
        router.attach(0, Box::new(disk)).unwrap();
        Self::start(config, router, icfg)
    }

    /// Stops the target thread. A target still holding the bus is reset
    /// first, it would never get back to polling `stop` otherwise.
    fn finish(mut self) -> (TestController, InitiatorEngine<SimPort>) {
        let start = Instant::now();
        while self.bus.lines().bsy() && start.elapsed() < Duration::from_millis(50) {
            thread::yield_now();
        }
        if self.bus.lines().bsy() {
            self.engine.config_mut().reset_recovery_ms = 10;
            self.engine.bus_reset();
        }
        self.stop.store(true, Ordering::Release);
        (self.target.join().unwrap(), self.engine)
    }
}

/// Hooks the phy's edge handlers to the port's interrupt callbacks
fn attach_irq(port: &SimPort, phy: &TargetPhy<SimPort>) {
    let irq = phy.irq();
    let view = port.clone();
    port.attach_irq(move |edges| irq.on_edges(&view, edges));
}

/// Target phy with a SCSI-2 session that already drives BSY, as after a
/// selection
fn selected_phy(bus: &SimBus) -> (TargetPhy<SimPort>, TargetSession) {
    let mut phy = TargetPhy::new(bus.port(), &BoardConfig::default(), 1);
    let mut session = TargetSession::new(0, Arc::clone(phy.flags()));
    phy.on_sel_confirm(&mut session);
    session.compat = CompatMode::Scsi2;
    (phy, session)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timeout waiting for {}", what);
        thread::yield_now();
    }
}

fn scsi2_initiator() -> InitiatorConfig {
    InitiatorConfig {
        assert_atn: true,
        ..Default::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn assert_released<L: SignalLines>(lines: &L) {
    assert!(lines.driven().is_empty(), "still driving {:?}", lines.driven());
}
