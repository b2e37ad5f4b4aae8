//! Headless auto-tuner: discover the robot, run a hill-climbing session, print the results.

use anyhow::{anyhow, Result};
use balance_tuner::config_loader::{
    default_config_path, default_presets_path, load_presets, load_tuner_settings,
};
use balance_tuner::search::{SearchConfig, SearchOutcome, StopReason};
use balance_tuner::session::TuningSession;
use balance_tuner::telemetry::TelemetryLink;
use balance_tuner::udp_link::{local_ip_address, UdpTelemetryLink};
use clap::Parser;
use gethostname::gethostname;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Auto-tune the balance controller gains over UDP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to tuner.yaml (defaults to the one next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Static device address, skips discovery (e.g. 192.168.1.89:4210)
    #[arg(long)]
    device: Option<SocketAddr>,
    /// RNG seed for reproducible probe directions
    #[arg(long)]
    seed: Option<u64>,
    /// Override MAX_ROUNDS
    #[arg(long)]
    max_rounds: Option<u32>,
    /// Start from a named preset in presets.yaml instead of START_GAINS
    #[arg(long)]
    preset: Option<String>,
    /// Seconds to wait for the first telemetry datagram
    #[arg(long, default_value_t = 30.0)]
    discover_timeout_s: f64,
}

fn print_results(outcome: &SearchOutcome) {
    println!("\n{:>5}  {:>7}  {:>7}  {:>6}  {:>7}", "trial", "K1", "K2", "K3", "score");
    for r in &outcome.results {
        let marker = if r.gains == outcome.best_gains { " *" } else { "" };
        println!(
            "{:>5}  {:>7.2}  {:>7.2}  {:>6.2}  {:>7.2}{}",
            r.trial_index, r.gains.k1, r.gains.k2, r.gains.k3, r.score, marker
        );
    }
    let why = match outcome.reason {
        StopReason::Converged => "no improvement",
        StopReason::Exhausted => "round budget spent",
        StopReason::Stopped => "stopped",
    };
    println!(
        "\nBest: K1={:.1} K2={:.1} K3={:.2}  score={:.1}  ({} trials, {})",
        outcome.best_gains.k1, outcome.best_gains.k2, outcome.best_gains.k3,
        outcome.best_score, outcome.trials, why
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();

    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut settings = load_tuner_settings(&config_path, &hostname)?;
    if let Some(device) = args.device {
        settings.device_addr = Some(device);
    }
    if let Some(rounds) = args.max_rounds {
        settings.max_rounds = rounds;
    }
    if let Some(name) = &args.preset {
        let presets = load_presets(&default_presets_path())?;
        let preset = presets
            .get(name)
            .ok_or_else(|| anyhow!("Unknown preset '{}' (available: {:?})", name, presets.keys().collect::<Vec<_>>()))?;
        settings.start_gains = preset.gains(&settings.space);
    }

    match local_ip_address() {
        Ok(ip) => println!("Tuner address: {} (port {})", ip, settings.udp_bind.port()),
        Err(e) => log::warn!("Could not determine local IP: {}", e),
    }

    let link = Arc::new(UdpTelemetryLink::from_settings(&settings)?);

    println!("Waiting for robot telemetry...");
    let device = link
        .wait_for_device(Duration::from_secs_f64(args.discover_timeout_s.max(0.0)))
        .ok_or_else(|| anyhow!("No telemetry received within {:.0}s", args.discover_timeout_s))?;
    println!("Robot at {}", device);

    let telemetry: Arc<dyn TelemetryLink> = link.clone();
    telemetry.send_gains(&settings.space.clamp(settings.start_gains));

    let mut session = TuningSession::new(telemetry, SearchConfig::from_settings(&settings))
        .with_poll_interval(settings.recv_timeout);
    if let Some(seed) = args.seed {
        session = session.with_seed(seed);
    }
    let session = Arc::new(session);

    {
        let s = Arc::clone(&session);
        if let Err(e) = ctrlc::set_handler(move || s.stop()) {
            log::warn!("Ctrl-C handler not installed: {}", e);
        }
    }

    if !session.start() {
        return Err(anyhow!("Auto-tune could not be started"));
    }

    let mut last_status = String::new();
    while session.is_active() {
        let snap = session.snapshot();
        if snap.status != last_status {
            print!("\r{:<90}", snap.status);
            let _ = io::stdout().flush();
            last_status = snap.status;
        }
        thread::sleep(Duration::from_millis(200));
    }

    let outcome = session
        .wait()
        .ok_or_else(|| anyhow!("Auto-tune thread ended without a result"))?;
    print_results(&outcome);
    println!(
        "Packets: {} frames, {} acks, {} malformed",
        link.stats().frames(), link.stats().acks(), link.stats().malformed()
    );

    Ok(())
}
