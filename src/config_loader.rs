#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::env;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

use crate::gains::{Coefficient, GainBound, GainSpace, GainVector};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BoundConfig {
    pub MIN: Option<f64>,
    pub MAX: Option<f64>,
    pub STEP: Option<f64>,
    pub FINE_STEP: Option<f64>,
}

/// Raw tuner.yaml block. Every key is optional so host blocks can override single values.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TunerConfig {
    pub UDP_BIND: Option<String>,
    pub DEVICE_ADDR: Option<String>,
    pub DEVICE_PORT: Option<u16>,
    pub RECV_TIMEOUT_MS: Option<u64>,
    pub START_GAINS: Option<[f64; 3]>,
    pub K1: Option<BoundConfig>,
    pub K2: Option<BoundConfig>,
    pub K3: Option<BoundConfig>,
    pub TRIAL_DURATION_S: Option<f64>,
    pub BASELINE_SETTLE_S: Option<f64>,
    pub PROBE_SETTLE_S: Option<f64>,
    pub MAX_ROUNDS: Option<u32>,
    pub PATIENCE: Option<u32>,
    pub FALL_THRESHOLD: Option<f64>,
    pub SEND_INTERVAL_MS: Option<u64>,
    pub HISTORY_LEN: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TunerFile {
    pub common: Option<TunerConfig>,
    pub hosts: Option<BTreeMap<String, TunerConfig>>, // hostname -> overrides
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct TunerSettings {
    pub udp_bind: SocketAddr,
    pub device_addr: Option<SocketAddr>,
    pub device_port: u16,
    pub recv_timeout: Duration,
    pub start_gains: GainVector,
    pub space: GainSpace,
    pub trial_duration: Duration,
    pub baseline_settle: Duration,
    pub probe_settle: Duration,
    pub max_rounds: u32,
    pub patience: u32,
    pub fall_threshold: f64,
    pub send_interval: Duration,
    pub history_len: usize,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 4210)),
            device_addr: None,
            device_port: 4210,
            recv_timeout: Duration::from_millis(50),
            start_gains: GainVector::new(76.0, 24.0, 0.16),
            space: GainSpace::default(),
            trial_duration: Duration::from_secs_f64(4.0),
            baseline_settle: Duration::from_secs_f64(1.0),
            probe_settle: Duration::from_secs_f64(1.5),
            max_rounds: 30,
            patience: 9,
            fall_threshold: 12.0,
            send_interval: Duration::from_millis(100),
            history_len: 300,
        }
    }
}

/// Default location: tuner.yaml next to Cargo.toml.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tuner.yaml")
}

pub fn load_tuner_file(path: &Path) -> Result<TunerFile> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Missing required tuner.yaml at {:?}: {}", path, e))?;
    let cfg: TunerFile = serde_yaml::from_reader(file)
        .with_context(|| format!("Invalid YAML in {:?}", path))?;
    Ok(cfg)
}

/// Load settings for `hostname` from `path`, then apply TUNER_* environment overrides.
pub fn load_tuner_settings(path: &Path, hostname: &str) -> Result<TunerSettings> {
    let file = load_tuner_file(path)?;
    let mut settings = resolve_settings(&file, hostname)?;
    apply_env_overrides(&mut settings)?;
    log::info!(target: "config_loader", "Loaded {:?} for host '{}': bind={}, device={:?}, rounds={}",
               path, hostname, settings.udp_bind, settings.device_addr, settings.max_rounds);
    Ok(settings)
}

/// Merge `common` with the host block (host wins) and resolve against built-in defaults.
pub fn resolve_settings(file: &TunerFile, hostname: &str) -> Result<TunerSettings> {
    let common = file.common.clone().unwrap_or_default();
    let host = file.hosts.as_ref().and_then(|m| m.get(hostname)).cloned();
    if host.is_some() {
        log::debug!(target: "config_loader", "Applying host overrides for '{}'", hostname);
    }
    let merged = match host {
        Some(h) => merge(common, h),
        None => common,
    };
    resolve(&merged)
}

fn merge(base: TunerConfig, over: TunerConfig) -> TunerConfig {
    TunerConfig {
        UDP_BIND: over.UDP_BIND.or(base.UDP_BIND),
        DEVICE_ADDR: over.DEVICE_ADDR.or(base.DEVICE_ADDR),
        DEVICE_PORT: over.DEVICE_PORT.or(base.DEVICE_PORT),
        RECV_TIMEOUT_MS: over.RECV_TIMEOUT_MS.or(base.RECV_TIMEOUT_MS),
        START_GAINS: over.START_GAINS.or(base.START_GAINS),
        K1: merge_bound(base.K1, over.K1),
        K2: merge_bound(base.K2, over.K2),
        K3: merge_bound(base.K3, over.K3),
        TRIAL_DURATION_S: over.TRIAL_DURATION_S.or(base.TRIAL_DURATION_S),
        BASELINE_SETTLE_S: over.BASELINE_SETTLE_S.or(base.BASELINE_SETTLE_S),
        PROBE_SETTLE_S: over.PROBE_SETTLE_S.or(base.PROBE_SETTLE_S),
        MAX_ROUNDS: over.MAX_ROUNDS.or(base.MAX_ROUNDS),
        PATIENCE: over.PATIENCE.or(base.PATIENCE),
        FALL_THRESHOLD: over.FALL_THRESHOLD.or(base.FALL_THRESHOLD),
        SEND_INTERVAL_MS: over.SEND_INTERVAL_MS.or(base.SEND_INTERVAL_MS),
        HISTORY_LEN: over.HISTORY_LEN.or(base.HISTORY_LEN),
    }
}

fn merge_bound(base: Option<BoundConfig>, over: Option<BoundConfig>) -> Option<BoundConfig> {
    match (base, over) {
        (Some(b), Some(o)) => Some(BoundConfig {
            MIN: o.MIN.or(b.MIN),
            MAX: o.MAX.or(b.MAX),
            STEP: o.STEP.or(b.STEP),
            FINE_STEP: o.FINE_STEP.or(b.FINE_STEP),
        }),
        (b, o) => o.or(b),
    }
}

fn resolve_bound(name: &str, cfg: Option<&BoundConfig>, default: GainBound) -> Result<GainBound> {
    let cfg = cfg.cloned().unwrap_or_default();
    let bound = GainBound::new(
        cfg.MIN.unwrap_or(default.min),
        cfg.MAX.unwrap_or(default.max),
        cfg.STEP.unwrap_or(default.step),
        cfg.FINE_STEP.unwrap_or(default.fine_step),
    );
    if !(bound.min <= bound.max) {
        return Err(anyhow!("{}: MIN {} is greater than MAX {}", name, bound.min, bound.max));
    }
    if !(bound.step > 0.0) || !(bound.fine_step > 0.0) {
        return Err(anyhow!("{}: STEP and FINE_STEP must be positive", name));
    }
    Ok(bound)
}

fn seconds(name: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) if s.is_finite() && s >= 0.0 => Ok(Duration::from_secs_f64(s)),
        Some(s) => Err(anyhow!("{} must be a non-negative number of seconds, got {}", name, s)),
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("{} '{}' is not a valid ip:port: {}", name, value, e))
}

fn resolve(cfg: &TunerConfig) -> Result<TunerSettings> {
    let d = TunerSettings::default();
    let default_space = d.space;

    let space = GainSpace::new(
        resolve_bound("K1", cfg.K1.as_ref(), *default_space.bound(Coefficient::Proportional))?,
        resolve_bound("K2", cfg.K2.as_ref(), *default_space.bound(Coefficient::Derivative))?,
        resolve_bound("K3", cfg.K3.as_ref(), *default_space.bound(Coefficient::Brake))?,
    );

    let start_gains = cfg
        .START_GAINS
        .map(|[k1, k2, k3]| GainVector::new(k1, k2, k3))
        .unwrap_or(d.start_gains);
    let clamped = space.clamp(start_gains);
    if clamped != start_gains {
        log::warn!(target: "config_loader", "START_GAINS {} outside bounds, clamped to {}", start_gains, clamped);
    }

    let udp_bind = match cfg.UDP_BIND.as_deref() {
        Some(s) => parse_addr("UDP_BIND", s)?,
        None => d.udp_bind,
    };
    let device_addr = match cfg.DEVICE_ADDR.as_deref() {
        Some(s) if !s.trim().is_empty() => Some(parse_addr("DEVICE_ADDR", s)?),
        _ => None,
    };

    let fall_threshold = cfg.FALL_THRESHOLD.unwrap_or(d.fall_threshold);
    if !(fall_threshold > 0.0) {
        return Err(anyhow!("FALL_THRESHOLD must be positive, got {}", fall_threshold));
    }

    Ok(TunerSettings {
        udp_bind,
        device_addr,
        device_port: cfg.DEVICE_PORT.unwrap_or(d.device_port),
        recv_timeout: cfg.RECV_TIMEOUT_MS.map(Duration::from_millis).unwrap_or(d.recv_timeout),
        start_gains: clamped,
        space,
        trial_duration: seconds("TRIAL_DURATION_S", cfg.TRIAL_DURATION_S, d.trial_duration)?,
        baseline_settle: seconds("BASELINE_SETTLE_S", cfg.BASELINE_SETTLE_S, d.baseline_settle)?,
        probe_settle: seconds("PROBE_SETTLE_S", cfg.PROBE_SETTLE_S, d.probe_settle)?,
        max_rounds: cfg.MAX_ROUNDS.unwrap_or(d.max_rounds),
        patience: cfg.PATIENCE.unwrap_or(d.patience),
        fall_threshold,
        send_interval: cfg.SEND_INTERVAL_MS.map(Duration::from_millis).unwrap_or(d.send_interval),
        history_len: cfg.HISTORY_LEN.unwrap_or(d.history_len).max(1),
    })
}

/// TUNER_DEVICE_ADDR / TUNER_UDP_BIND from the environment (or .env) win over the YAML.
pub fn apply_env_overrides(settings: &mut TunerSettings) -> Result<()> {
    let _ = dotenv();
    if let Ok(v) = env::var("TUNER_DEVICE_ADDR") {
        settings.device_addr = Some(parse_addr("TUNER_DEVICE_ADDR", &v)?);
        log::info!(target: "config_loader", "Device address from environment: {}", v);
    }
    if let Ok(v) = env::var("TUNER_UDP_BIND") {
        settings.udp_bind = parse_addr("TUNER_UDP_BIND", &v)?;
        log::info!(target: "config_loader", "UDP bind from environment: {}", v);
    }
    Ok(())
}

// -------------------- Presets --------------------

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GainPreset {
    pub NAME: String,
    pub DESCRIPTION: Option<String>,
    pub K1: f64,
    pub K2: f64,
    pub K3: f64,
}

impl GainPreset {
    /// Preset gains clamped into the tuner's space.
    pub fn gains(&self, space: &GainSpace) -> GainVector {
        space.clamp(GainVector::new(self.K1, self.K2, self.K3))
    }
}

pub fn default_presets_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("presets.yaml")
}

/// Load presets.yaml (key -> preset).
pub fn load_presets(path: &Path) -> Result<BTreeMap<String, GainPreset>> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Missing required presets.yaml at {:?}: {}", path, e))?;
    let presets: BTreeMap<String, GainPreset> = serde_yaml::from_reader(file)
        .with_context(|| format!("Invalid presets in {:?}", path))?;
    Ok(presets)
}
