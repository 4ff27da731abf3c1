//! `armatured` – the Armature hardware server.
//!
//! 1. Loads `~/.armature/config.toml`, writing the default configuration on
//!    first run.
//! 2. Instantiates every configured driver and registers its devices.
//! 3. Subscribes the always-on drivers on behalf of a console client.
//! 4. Runs the update loop: polled drivers get their `update`, and data
//!    reaching the console client is encoded into wire frames.
//! 5. On **Ctrl-C**, unsubscribes everything (stopping driver threads) and
//!    exits.

mod config;
mod telemetry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use armature_hal::{DeviceRegistry, DriverHost, SimRegistry};
use armature_middleware::{encode_message, MessageQueue, WireDispatchTable};
use armature_types::HalError;
use colored::Colorize;
use tracing::{debug, error, info, warn};

/// Totals reported when the server stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ServeStats {
    iterations: u64,
    frames: u64,
    bytes: u64,
    encode_errors: u64,
}

fn main() {
    let _telemetry = telemetry::init_tracing("armatured");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down drivers …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the server with SIGKILL");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Drivers ───────────────────────────────────────────────────────────
    let registry = match build_registry(&cfg) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "failed to load drivers");
            println!("{}: {}", "Driver error".red(), e);
            std::process::exit(1);
        }
    };
    println!("  {} device(s) registered:", registry.len());
    for entry in registry.devices() {
        let always_on = if entry.driver.always_on() { " (always on)".dimmed().to_string() } else { String::new() };
        println!("    • {} → {}{}", entry.id.to_string().bold(), entry.driver.name(), always_on);
    }
    println!();

    let table = WireDispatchTable::init();
    let console = Arc::new(MessageQueue::new(true, cfg.queue_len));
    let subscribed = subscribe_always_on(&registry, &console);

    // ── Update loop ───────────────────────────────────────────────────────
    let stats = serve(
        &registry,
        &table,
        &console,
        Duration::from_millis(cfg.update_interval_ms),
        &shutdown,
    );

    for host in subscribed.iter().rev() {
        if let Err(e) = host.unsubscribe(Some(&console)) {
            warn!(device = %host.id(), error = %e, "unsubscribe failed during shutdown");
        }
    }

    info!(
        iterations = stats.iterations,
        frames = stats.frames,
        bytes = stats.bytes,
        encode_errors = stats.encode_errors,
        "server stopped"
    );
    println!("{}", "  ✓ All drivers stopped. Exiting Armature.".green());
}

/// Load every configured driver into a fresh registry.
fn build_registry(cfg: &config::Config) -> Result<Arc<DeviceRegistry>, HalError> {
    cfg.driver_specs()?
        .into_iter()
        .fold(SimRegistry::builder(), SimRegistry::with_driver)
        .build()
}

/// Subscribe `console` to every always-on driver.  Returns the drivers that
/// accepted, in subscription order.
fn subscribe_always_on(registry: &DeviceRegistry, console: &Arc<MessageQueue>) -> Vec<Arc<DriverHost>> {
    let mut subscribed = Vec::new();
    for host in registry.drivers().into_iter().filter(|h| h.always_on()) {
        match host.subscribe(Some(console)) {
            Ok(()) => subscribed.push(host),
            Err(e) => error!(device = %host.id(), error = %e, "always-on driver failed to start"),
        }
    }
    subscribed
}

/// Run the server loop until `shutdown` is set.
fn serve(
    registry: &DeviceRegistry,
    table: &WireDispatchTable,
    console: &MessageQueue,
    interval: Duration,
    shutdown: &AtomicBool,
) -> ServeStats {
    let drivers = registry.drivers();
    let mut stats = ServeStats::default();
    let mut last_report = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        for host in &drivers {
            host.update();
        }

        while let Some(msg) = console.pop() {
            match encode_message(table, &msg) {
                Ok(frame) => {
                    stats.frames += 1;
                    stats.bytes += frame.len() as u64;
                    debug!(
                        device = %msg.device_id(),
                        msg_type = %msg.msg_type(),
                        subtype = msg.header().subtype,
                        bytes = frame.len(),
                        "frame ready"
                    );
                }
                Err(e) => {
                    stats.encode_errors += 1;
                    warn!(device = %msg.device_id(), error = %e, "failed to encode message");
                }
            }
        }

        stats.iterations += 1;
        if last_report.elapsed() >= Duration::from_secs(10) {
            info!(frames = stats.frames, bytes = stats.bytes, "server running");
            last_report = Instant::now();
        }
        std::thread::sleep(interval);
    }
    stats
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___                   __               "#.bold().cyan());
    println!("{}", r#"  / _ | ______ _  ___ _/ /___ _________ "#.bold().cyan());
    println!("{}", r#" / __ |/ __/  ' \/ _ `/ __/ // / __/ -_)"#.bold().cyan());
    println!("{}", r#"/_/ |_/_/ /_/_/_/\_,_/\__/\_,_/_/  \__/ "#.bold().cyan());
    println!();
    println!("  {} {}", "Armature".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot Hardware Server");
    println!();
}
