//! `icekit-cli` – runs one simulated device on an in-process bus.
//!
//! 1. Loads `~/.icekit/config.toml`, writing the defaults on first run.
//! 2. Starts the bus, the event loop and its service thread.
//! 3. Connects the configured device (`pulse-ox` or `pump`) and keeps it
//!    publishing until **Ctrl-C**.
//! 4. Disconnects, shuts the device down and stops the service thread.

mod config;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use config::{Config, DeviceKind};
use icekit_device::{ConnectedDevice, PumpConfig, SessionConfig, SimInfusionPump, SimPulseOximeter};
use icekit_kernel::{EventLoop, ServiceThread};
use icekit_middleware::DomainBus;
use icekit_types::DriverError;

/// One pleth batch, repeated every publish period.
const PLETH_SHAPE: [f32; 10] = [0.10, 0.35, 0.80, 1.00, 0.85, 0.60, 0.45, 0.40, 0.25, 0.15];

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter (default "info"); ICEKIT_LOG_FORMAT=json
    // emits newline-delimited JSON.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("ICEKIT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – disconnecting …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the device will run until killed");
    }

    let cfg = load_config();
    println!(
        "  Device: {}  name: {}",
        cfg.device.to_string().bold(),
        cfg.device_name.bold()
    );
    println!("  Press {} to stop.\n", "Ctrl-C".bold().cyan());

    if let Err(e) = run(&cfg, &shutdown) {
        println!("{}: {}", "Device error".red(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Device shut down.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Device runner
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: &Config, shutdown: &AtomicBool) -> Result<(), DriverError> {
    let bus = DomainBus::default();
    let event_loop = EventLoop::new();
    let mut service = ServiceThread::spawn(event_loop.clone(), cfg.loop_period())?;
    let session = SessionConfig {
        averaging_period: cfg.averaging_period(),
        ..Default::default()
    };

    let result = match cfg.device {
        DeviceKind::PulseOx => {
            let oximeter = SimPulseOximeter::new(bus, event_loop, session)?;
            let result = oximeter
                .connect(&cfg.device_name)
                .and_then(|_| drive_oximeter(&oximeter, cfg, shutdown));
            finish(oximeter.as_ref());
            result
        }
        DeviceKind::Pump => {
            let pump_config = PumpConfig {
                update_period: cfg.pump_update_period(),
                ..Default::default()
            };
            let pump = SimInfusionPump::new(bus, event_loop, session, pump_config)?;
            let result = pump.connect(&cfg.device_name).map(|_| {
                info!(udi = %pump.session().udi(), "infusion pump running");
                wait_for_shutdown(shutdown);
            });
            finish(&pump);
            result
        }
    };
    service.stop();
    result
}

fn drive_oximeter(oximeter: &Arc<SimPulseOximeter>, cfg: &Config, shutdown: &AtomicBool) -> Result<(), DriverError> {
    info!(udi = %oximeter.session().udi(), "pulse oximeter running");
    let mut next = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        if Instant::now() >= next {
            oximeter.set_bpm_o2(cfg.pulse_rate, cfg.spo2)?;
            oximeter.publish_pleth(PLETH_SHAPE.to_vec())?;
            next += cfg.publish_period();
        }
        thread::sleep(SHUTDOWN_POLL.min(cfg.publish_period()));
    }
    Ok(())
}

fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SHUTDOWN_POLL);
    }
}

fn finish(device: &dyn ConnectedDevice) {
    if let Err(e) = device.disconnect() {
        warn!(error = %e, "disconnect failed");
    }
    device.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&Config::default()) {
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
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _          _    _ _   "#.bold().cyan());
    println!("{}", r#" (_)__ ___  | |__(_) |_ "#.bold().cyan());
    println!("{}", r#" | / _/ -_) | / /| |  _|"#.bold().cyan());
    println!("{}", r#" |_\__\___| |_\_\|_|\__|"#.bold().cyan());
    println!();
    println!("  {} {}",
        "icekit".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Simulated medical device drivers");
    println!();
}
