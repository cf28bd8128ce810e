use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result, bail};
use clap::Parser as _;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use omnibus::Address;
use omnibus::bus::{Broker, BusConfig};

mod cli;
mod config;

/// Set by the signal handler; checked between loop iterations. The poll is
/// interrupted by the signal, so shutdown is prompt.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = on_signal;

    // SAFETY: The handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> Result<()> {
    let args = cli::Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut bus_config = match &args.config {
        Some(path) => config::load(path)?,
        None => BusConfig::default(),
    };

    if !args.address.is_empty() {
        bus_config.addresses.clear();

        for address in &args.address {
            bus_config
                .addresses
                .extend(Address::parse_list(address).context("parsing --address")?);
        }
    }

    if bus_config.addresses.is_empty() {
        bail!("no listen address; pass --address or a configuration with <listen>");
    }

    install_signal_handlers();

    let mut broker = Broker::new(bus_config).context("starting broker")?;

    if args.print_address {
        if let Some(address) = broker.addresses().first() {
            println!("{address}");
        }
    }

    info!("omnibusd running");

    while !STOP.load(Ordering::SeqCst) {
        broker.turn(true).context("broker iteration")?;
    }

    info!("shutting down");
    Ok(())
}
