/// Tuning session supervisor
///
/// Owns the background search thread and the snapshot board it publishes to.
/// The UI and CLI only call start/stop/apply_best and read snapshots.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::gains::GainVector;
use crate::sampler::TrialSampler;
use crate::search::{lock_board, HillClimber, SearchConfig, SearchOutcome, SearchPhase, SessionSnapshot, SnapshotBoard};
use crate::telemetry::TelemetryLink;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct TuningSession {
    link: Arc<dyn TelemetryLink>,
    config: Mutex<SearchConfig>,
    board: SnapshotBoard,
    seed: Option<u64>,
    poll_interval: Duration,
    worker: Mutex<Option<JoinHandle<SearchOutcome>>>,
    last_outcome: Mutex<Option<SearchOutcome>>,
}

impl TuningSession {
    pub fn new(link: Arc<dyn TelemetryLink>, config: SearchConfig) -> Self {
        let board = Arc::new(Mutex::new(SessionSnapshot::idle(config.start_gains, config.max_rounds)));
        Self {
            link,
            config: Mutex::new(config),
            board,
            seed: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker: Mutex::new(None),
            last_outcome: Mutex::new(None),
        }
    }

    /// Fixed RNG seed for reproducible probe directions.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn link(&self) -> &Arc<dyn TelemetryLink> {
        &self.link
    }

    /// Gains the next run will baseline from.
    pub fn set_start_gains(&self, gains: GainVector) {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).start_gains = gains;
    }

    pub fn config(&self) -> SearchConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Launch a search in the background.
    ///
    /// Returns false (and does nothing) while a search is running or before the
    /// device address is known. A run that was just stopped is joined first; that
    /// waits at most for its in-flight trial window, whose result it discards.
    pub fn start(&self) -> bool {
        if self.link.device().is_none() {
            warn!(target: "session", "Cannot start: device not discovered yet");
            return false;
        }

        // Held for the whole start so concurrent starts serialize
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if lock_board(&self.board).active {
            info!(target: "session", "Search already running");
            return false;
        }
        if let Some(previous) = worker.take() {
            if !previous.is_finished() {
                info!(target: "session", "Waiting for the stopped run to finish its trial");
            }
            self.reap(previous);
        }

        let config = self.config();
        {
            let mut board = lock_board(&self.board);
            let start = config.space.clamp(config.start_gains);
            *board = SessionSnapshot::idle(start, config.max_rounds);
            board.active = true;
            board.phase = SearchPhase::Baselining;
            board.status = "Starting auto-tune".to_string();
        }

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sampler = TrialSampler::new(Arc::clone(&self.link), self.poll_interval);
        let climber = HillClimber::new(sampler, config, rng, Arc::clone(&self.board));

        match thread::Builder::new().name("auto-tune".into()).spawn(move || climber.run()) {
            Ok(handle) => {
                *worker = Some(handle);
                info!(target: "session", "Auto-tune started");
                true
            }
            Err(e) => {
                warn!(target: "session", "Failed to spawn search thread: {}", e);
                let mut board = lock_board(&self.board);
                board.active = false;
                board.phase = SearchPhase::Idle;
                board.status = format!("Failed to start: {}", e);
                false
            }
        }
    }

    /// True while a stopped run is still completing its last trial window.
    pub fn is_finishing(&self) -> bool {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        worker.as_ref().map_or(false, |h| !h.is_finished()) && !self.is_active()
    }

    /// Clear the active flag and push the best gains right away.
    ///
    /// A trial still in flight completes its window but is discarded.
    pub fn stop(&self) {
        let best = {
            let mut board = lock_board(&self.board);
            if board.active {
                board.active = false;
                board.status = "Stopping, best gains sent".to_string();
            }
            board.best_gains
        };
        info!(target: "session", "Stop requested, sending best {}", best);
        self.link.send_gains(&best);
    }

    /// Send the best gains found so far without touching the search.
    pub fn apply_best(&self) -> GainVector {
        let best = lock_board(&self.board).best_gains;
        info!(target: "session", "Applying best {}", best);
        self.link.send_gains(&best);
        best
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock_board(&self.board).clone()
    }

    pub fn is_active(&self) -> bool {
        lock_board(&self.board).active
    }

    /// Block until the current run finishes. `None` when nothing was started.
    pub fn wait(&self) -> Option<SearchOutcome> {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        self.reap(handle)
    }

    /// Result of the most recently joined run.
    pub fn last_outcome(&self) -> Option<SearchOutcome> {
        self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn reap(&self, handle: JoinHandle<SearchOutcome>) -> Option<SearchOutcome> {
        match handle.join() {
            Ok(outcome) => {
                *self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
                Some(outcome)
            }
            Err(_) => {
                warn!(target: "session", "Search thread panicked");
                None
            }
        }
    }
}

impl Drop for TuningSession {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop();
        }
        let _ = self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::{alternating, fast_config, ScriptedLink};
    use crate::search::StopReason;
    use crate::telemetry::Reading;
    use std::net::SocketAddr;
    use std::time::Instant;

    struct SilentLink;

    impl TelemetryLink for SilentLink {
        fn send_gains(&self, _gains: &GainVector) {}
        fn receive_latest(&self, timeout: Duration) -> Option<Reading> {
            thread::sleep(timeout);
            None
        }
        fn discard_pending(&self) -> usize {
            0
        }
        fn device(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn session(link: &Arc<ScriptedLink>, max_rounds: u32) -> TuningSession {
        TuningSession::new(link.clone(), fast_config(max_rounds))
            .with_seed(42)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_start_requires_discovered_device() {
        let session = TuningSession::new(Arc::new(SilentLink), fast_config(3));
        assert!(!session.start());
        assert!(!session.is_active());
        assert!(session.wait().is_none());
    }

    #[test]
    fn test_second_start_is_ignored_while_running() {
        let link = Arc::new(ScriptedLink::new(|_| alternating(1.0, 100)));
        let session = session(&link, 30);
        assert!(session.start());
        assert!(!session.start());
        session.stop();
        let outcome = session.wait().unwrap();
        assert_eq!(outcome.reason, StopReason::Stopped);
    }

    #[test]
    fn test_stop_leaves_best_as_last_sent() {
        let link = Arc::new(ScriptedLink::new(|g| {
            let calm = if g.k2 > 24.0 { 0.6 } else { 1.0 };
            alternating(calm, 150)
        }));
        let session = session(&link, 30);
        assert!(session.start());

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.snapshot().results.len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        session.stop();
        let best_at_stop = session.snapshot().best_gains;
        let outcome = session.wait().unwrap();

        assert_eq!(outcome.best_gains, best_at_stop);
        assert_eq!(link.last_sent(), Some(best_at_stop));
        assert!(!session.is_active());
    }

    #[test]
    fn test_apply_best_does_not_disturb_state() {
        let link = Arc::new(ScriptedLink::new(|_| alternating(1.0, 100)));
        let session = session(&link, 2);
        assert!(session.start());
        let outcome = session.wait().unwrap();
        let before = session.snapshot();

        let sent = session.apply_best();
        assert_eq!(sent, outcome.best_gains);
        assert_eq!(link.last_sent(), Some(sent));
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_restart_resets_results() {
        let link = Arc::new(ScriptedLink::new(|_| alternating(1.0, 100)));
        let session = session(&link, 2);
        assert!(session.start());
        session.wait();
        assert!(!session.snapshot().results.is_empty());

        session.set_start_gains(GainVector::new(80.0, 20.0, 0.2));
        assert!(session.start());
        let outcome = session.wait().unwrap();
        assert_eq!(outcome.results[0].gains, GainVector::new(80.0, 20.0, 0.2));
        assert_eq!(outcome.results[0].trial_index, 0);
    }

    #[test]
    fn test_restart_right_after_stop_discards_old_trial() {
        let link = Arc::new(ScriptedLink::new(|_| alternating(1.0, 100)));
        let mut config = fast_config(12);
        config.trial_duration = Duration::from_millis(150);
        let session = TuningSession::new(link.clone(), config)
            .with_seed(3)
            .with_poll_interval(Duration::from_millis(5));
        assert!(session.start());

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.snapshot().results.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // A probe trial is now in flight
        session.stop();
        let recorded_at_stop = session.snapshot().results.len();

        let started = Instant::now();
        assert!(session.start());
        assert!(started.elapsed() < Duration::from_secs(1), "restart took {:?}", started.elapsed());

        let stopped = session.last_outcome().unwrap();
        assert_eq!(stopped.reason, StopReason::Stopped);
        assert_eq!(stopped.results.len(), recorded_at_stop);

        let snap = session.snapshot();
        assert!(snap.active);
        assert_eq!(snap.trial_index, 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.snapshot().results.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        session.stop();
        let restarted = session.wait().unwrap();
        assert_eq!(restarted.results[0].trial_index, 0);
        assert_eq!(restarted.results[0].gains, GainVector::new(76.0, 24.0, 0.16));
        assert!(!session.is_finishing());
    }
}
