/// Manual gain tuning and live telemetry statistics
///
/// The operator's gains live behind getters/setters so the GUI can share one
/// instance with its widgets. Updates are marked pending and pushed at most once
/// per send interval; `force_send` bypasses the limit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::info;

use crate::config_loader::GainPreset;
use crate::gains::{Coefficient, GainSpace, GainVector};
use crate::telemetry::TelemetryLink;

/// Samples averaged by the display smoothing
pub const SMOOTH_WINDOW: usize = 5;
/// Most recent samples considered by `LiveStats`
pub const STATS_WINDOW: usize = 100;
pub const MIN_STATS_SAMPLES: usize = 10;
/// RMS tilt (degrees) under which the robot counts as stable
pub const STABLE_RMS: f64 = 2.0;

pub struct ManualTuner {
    link: Arc<dyn TelemetryLink>,
    space: GainSpace,
    gains: Mutex<GainVector>,
    pending: AtomicBool,
    last_send: Mutex<Option<Instant>>,
    send_interval: Duration,
}

impl ManualTuner {
    pub fn new(link: Arc<dyn TelemetryLink>, space: GainSpace, initial: GainVector, send_interval: Duration) -> Self {
        Self {
            link,
            space,
            gains: Mutex::new(space.clamp(initial)),
            pending: AtomicBool::new(false),
            last_send: Mutex::new(None),
            send_interval,
        }
    }

    pub fn space(&self) -> &GainSpace {
        &self.space
    }

    pub fn get_gains(&self) -> GainVector {
        *self.gains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn set(&self, coefficient: Coefficient, value: f64) -> GainVector {
        let bound = self.space.bound(coefficient);
        self.update(|g| g.with(coefficient, bound.clamp(value)))
    }

    pub fn set_gains(&self, gains: GainVector) -> GainVector {
        let space = self.space;
        self.update(|_| space.clamp(gains))
    }

    /// Move one coefficient by its fine step (`direction` is +1 or -1).
    pub fn nudge(&self, coefficient: Coefficient, direction: f64) -> GainVector {
        let space = self.space;
        self.update(|g| space.nudge(&g, coefficient, direction))
    }

    fn update(&self, f: impl FnOnce(GainVector) -> GainVector) -> GainVector {
        let mut gains = self.gains.lock().unwrap_or_else(PoisonError::into_inner);
        let next = f(*gains);
        if next != *gains {
            *gains = next;
            self.pending.store(true, Ordering::Relaxed);
        }
        next
    }

    /// Push the pending update if the send interval has elapsed. Returns true when sent.
    pub fn flush(&self) -> bool {
        self.flush_at(Instant::now())
    }

    pub fn flush_at(&self, now: Instant) -> bool {
        if !self.is_pending() {
            return false;
        }
        let mut last = self.last_send.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            if now.saturating_duration_since(prev) < self.send_interval {
                return false;
            }
        }
        *last = Some(now);
        self.pending.store(false, Ordering::Relaxed);
        drop(last);
        self.link.send_gains(&self.get_gains());
        true
    }

    pub fn force_send(&self) -> GainVector {
        let gains = self.get_gains();
        *self.last_send.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.pending.store(false, Ordering::Relaxed);
        self.link.send_gains(&gains);
        gains
    }

    pub fn load_preset(&self, preset: &GainPreset) -> GainVector {
        let gains = preset.gains(&self.space);
        info!(target: "manual_tuner", "Loading preset {}: {}", preset.NAME, gains);
        self.set_gains(gains);
        self.force_send()
    }
}

/// Performance figures over the most recent angle samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveStats {
    pub samples: usize,
    pub rms: f64,
    pub max_abs: f64,
    pub stable: bool,
}

impl LiveStats {
    /// `None` with fewer than `MIN_STATS_SAMPLES` angles.
    pub fn from_angles(angles: &[f64]) -> Option<Self> {
        if angles.len() < MIN_STATS_SAMPLES {
            return None;
        }
        let recent = &angles[angles.len().saturating_sub(STATS_WINDOW)..];
        let n = recent.len() as f64;
        let rms = (recent.iter().map(|a| a * a).sum::<f64>() / n).sqrt();
        let max_abs = recent.iter().fold(0.0_f64, |m, a| m.max(a.abs()));
        Some(Self { samples: recent.len(), rms, max_abs, stable: rms < STABLE_RMS })
    }
}

/// Trailing moving average. The first points average over what is available;
/// series shorter than the window are returned unchanged.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || values.len() < window {
        return values.to_vec();
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        let count = (i + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Reading;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<GainVector>>,
    }

    impl TelemetryLink for RecordingLink {
        fn send_gains(&self, gains: &GainVector) {
            self.sent.lock().unwrap().push(*gains);
        }
        fn receive_latest(&self, _timeout: Duration) -> Option<Reading> {
            None
        }
        fn discard_pending(&self) -> usize {
            0
        }
        fn device(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn tuner() -> (ManualTuner, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let tuner = ManualTuner::new(
            link.clone(),
            GainSpace::default(),
            GainVector::new(76.0, 24.0, 0.16),
            Duration::from_millis(100),
        );
        (tuner, link)
    }

    #[test]
    fn test_set_clamps_and_marks_pending() {
        let (tuner, _) = tuner();
        assert!(!tuner.is_pending());
        let g = tuner.set(Coefficient::Proportional, 400.0);
        assert_eq!(g.k1, 120.0);
        assert!(tuner.is_pending());
    }

    #[test]
    fn test_nudge_uses_fine_steps() {
        let (tuner, _) = tuner();
        assert_eq!(tuner.nudge(Coefficient::Proportional, 1.0).k1, 76.5);
        assert_eq!(tuner.nudge(Coefficient::Derivative, -1.0).k2, 23.75);
        let k3 = tuner.nudge(Coefficient::Brake, 1.0).k3;
        assert!((k3 - 0.17).abs() < 1e-9);
    }

    #[test]
    fn test_flush_is_rate_limited() {
        let (tuner, link) = tuner();
        let t0 = Instant::now();
        tuner.set(Coefficient::Derivative, 30.0);
        assert!(tuner.flush_at(t0));

        tuner.set(Coefficient::Derivative, 31.0);
        assert!(!tuner.flush_at(t0 + Duration::from_millis(50)));
        assert!(tuner.is_pending());
        assert!(tuner.flush_at(t0 + Duration::from_millis(150)));

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].k2, 31.0);
    }

    #[test]
    fn test_flush_without_change_sends_nothing() {
        let (tuner, link) = tuner();
        assert!(!tuner.flush());
        tuner.set(Coefficient::Proportional, 76.0);
        assert!(!tuner.flush());
        assert!(link.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_force_send_bypasses_limit() {
        let (tuner, link) = tuner();
        tuner.force_send();
        tuner.force_send();
        assert_eq!(link.sent.lock().unwrap().len(), 2);
        assert!(!tuner.is_pending());
    }

    #[test]
    fn test_preset_is_clamped_and_sent() {
        let (tuner, link) = tuner();
        let preset = GainPreset {
            NAME: "wild".to_string(),
            DESCRIPTION: None,
            K1: 300.0,
            K2: 10.0,
            K3: 0.1,
        };
        let g = tuner.load_preset(&preset);
        assert_eq!(g, GainVector::new(120.0, 10.0, 0.1));
        assert_eq!(link.sent.lock().unwrap().last(), Some(&g));
    }

    #[test]
    fn test_live_stats_window_and_stability() {
        assert_eq!(LiveStats::from_angles(&[1.0; 9]), None);

        let mut angles = vec![50.0; 20];
        angles.extend(vec![1.0; 100]);
        let stats = LiveStats::from_angles(&angles).unwrap();
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.rms, 1.0);
        assert_eq!(stats.max_abs, 1.0);
        assert!(stats.stable);

        let shaky = LiveStats::from_angles(&[3.0, -3.0, 3.0, -3.0, 3.0, -3.0, 3.0, -3.0, 3.0, -3.0]).unwrap();
        assert!(!shaky.stable);
    }

    #[test]
    fn test_moving_average() {
        assert_eq!(moving_average(&[1.0, 2.0], 5), vec![1.0, 2.0]);
        let smoothed = moving_average(&[0.0, 2.0, 4.0, 6.0, 8.0, 10.0], 3);
        assert_eq!(smoothed, vec![0.0, 1.0, 2.0, 4.0, 6.0, 8.0]);
    }
}
