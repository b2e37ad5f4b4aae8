//! Fixed-window trial sampling over a telemetry link.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::gains::GainVector;
use crate::telemetry::{Reading, TelemetryLink};

/// Readings observed for one gain vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub gains: GainVector,
    pub readings: Vec<Reading>,
}

pub struct TrialSampler {
    link: Arc<dyn TelemetryLink>,
    /// Longest single wait on the reading queue
    poll_interval: Duration,
}

impl TrialSampler {
    pub fn new(link: Arc<dyn TelemetryLink>, poll_interval: Duration) -> Self {
        Self { link, poll_interval: poll_interval.max(Duration::from_millis(1)) }
    }

    pub fn link(&self) -> &Arc<dyn TelemetryLink> {
        &self.link
    }

    /// Push `gains`, let the robot settle, drop stale readings, then collect for `window`.
    ///
    /// Always returns once the window has elapsed, even if nothing arrived.
    pub fn run_trial(&self, gains: &GainVector, settle: Duration, window: Duration) -> Trial {
        self.link.send_gains(gains);
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        let stale = self.link.discard_pending();

        let deadline = Instant::now() + window;
        let mut readings = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.poll_interval);
            if let Some(r) = self.link.receive_latest(wait) {
                readings.push(r);
            }
        }

        debug!(target: "sampler", "Trial {} collected {} readings ({} stale discarded)",
            gains, readings.len(), stale);
        Trial { gains: *gains, readings }
    }
}
