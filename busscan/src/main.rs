use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use itertools::Itertools;
use log::*;

use scsiphy_core::scsi::config::{BoardConfig, InitiatorConfig, SyncRequest};
use scsiphy_core::scsi::controller::TargetController;
use scsiphy_core::scsi::disk::{RamDisk, DISK_BLOCKSIZE};
use scsiphy_core::scsi::initiator::{probe, InitiatorEngine};
use scsiphy_core::scsi::simbus::SimBus;
use scsiphy_core::scsi::target::TargetRouter;
use scsiphy_core::scsi::MAX_TARGETS;

/// Scans a simulated SCSI bus populated with RAM disks
#[derive(Parser)]
struct Args {
    /// IDs to attach a RAM disk to
    #[arg(long, value_delimiter = ',', default_values_t = [0u8])]
    targets: Vec<u8>,

    /// Size of every disk, in blocks
    #[arg(long, default_value_t = 2048)]
    blocks: usize,

    #[arg(long, default_value_t = DISK_BLOCKSIZE)]
    block_size: usize,

    /// Initiator ID
    #[arg(long, default_value_t = 7)]
    own_id: u8,

    /// Select with ATN and send IDENTIFY
    #[arg(long)]
    atn: bool,

    /// Request synchronous transfers with this REQ/ACK offset (implies --atn)
    #[arg(long)]
    sync_offset: Option<u8>,

    /// Selection timeout per ID
    #[arg(long, default_value_t = 20)]
    timeout_ms: u32,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    if usize::from(args.own_id) >= MAX_TARGETS {
        bail!("Initiator ID out of range: {}", args.own_id);
    }

    let mut router = TargetRouter::new();
    for &id in args.targets.iter().unique() {
        if id == args.own_id {
            bail!("Target ID {} is the initiator ID", id);
        }
        router.attach(id.into(), Box::new(RamDisk::new(args.blocks, args.block_size)?))?;
    }

    let bus = SimBus::new();
    let port = bus.port();
    let mut controller = TargetController::new(port.clone(), BoardConfig::default(), router);
    let irq = controller.phy().irq();
    let view = port.clone();
    port.attach_irq(move |edges| irq.on_edges(&view, edges));

    let stop = Arc::new(AtomicBool::new(false));
    let target = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            controller.run(&stop);
            controller
        })
    };

    let mut engine = InitiatorEngine::new(
        bus.port(),
        InitiatorConfig {
            own_id: args.own_id,
            assert_atn: args.atn || args.sync_offset.is_some(),
            sync_request: args.sync_offset.map(|offset| SyncRequest { period: 25, offset }),
            selection_timeout_us: args.timeout_ms.saturating_mul(1000),
            ..Default::default()
        },
    );

    info!(
        "Scanning from ID {}, disks at {}",
        args.own_id,
        args.targets.iter().join(", ")
    );
    let start = Instant::now();
    let found = probe::scan_bus(&mut engine);
    if let Err(e) = &found {
        // The target may be stuck mid-handshake, only a reset gets it out
        warn!("Scan aborted: {}, resetting bus", e);
        engine.bus_reset();
    }
    stop.store(true, Ordering::Release);
    let controller = target
        .join()
        .map_err(|_| anyhow!("Target thread panicked"))?;
    let found = found?;
    info!("Scan completed in {:0.04}s", start.elapsed().as_secs_f64());

    if found.is_empty() {
        println!("No devices found");
    }
    for dev in &found {
        let Some(session) = controller.session(dev.id) else {
            println!("{}", dev);
            continue;
        };
        let compat: &'static str = session.compat.into();
        let transfer = if session.sync.is_sync() {
            format!(
                "sync {} ns offset {}",
                session.sync.period_ns(),
                session.sync.offset
            )
        } else {
            "async".to_string()
        };
        println!("{} [{}, {}]", dev, compat, transfer);
    }

    let stats = controller.stats();
    println!(
        "Target: {} selections, {} commands, {} messages, {} parity errors, {} resets",
        stats.selections, stats.commands, stats.messages, stats.parity_errors, stats.resets
    );
    Ok(())
}
