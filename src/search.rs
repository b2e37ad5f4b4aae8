//! Hill-climbing gain search.
//!
//! The controller starts from a baseline trial, then perturbs one coefficient per
//! round (K1, K2, K3 in turn) by one step in a random direction. A candidate that
//! scores strictly better than the best so far is adopted; otherwise the opposite
//! direction is tried once. The run ends when the round budget is spent, when
//! `patience` consecutive rounds fail to improve, or when the session clears the
//! active flag. Whatever the exit, the best gains are pushed to the robot once.
//!
//! Progress is published to a shared [`SessionSnapshot`] board. The board lock is
//! held while a finished trial checks the active flag and adopts a new best, so a
//! concurrent stop always sees a best that can no longer change.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};
use rand::Rng;

use crate::config_loader::TunerSettings;
use crate::gains::{Coefficient, GainSpace, GainVector};
use crate::sampler::TrialSampler;
use crate::scoring::{TrialScorer, DEFAULT_FALL_THRESHOLD};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub start_gains: GainVector,
    pub space: GainSpace,
    pub trial_duration: Duration,
    pub baseline_settle: Duration,
    pub probe_settle: Duration,
    pub max_rounds: u32,
    pub patience: u32,
    pub fall_threshold: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            start_gains: GainVector::new(76.0, 24.0, 0.16),
            space: GainSpace::default(),
            trial_duration: Duration::from_secs(4),
            baseline_settle: Duration::from_secs(1),
            probe_settle: Duration::from_millis(1500),
            max_rounds: 30,
            patience: 9,
            fall_threshold: DEFAULT_FALL_THRESHOLD,
        }
    }
}

impl SearchConfig {
    pub fn from_settings(settings: &TunerSettings) -> Self {
        Self {
            start_gains: settings.start_gains,
            space: settings.space,
            trial_duration: settings.trial_duration,
            baseline_settle: settings.baseline_settle,
            probe_settle: settings.probe_settle,
            max_rounds: settings.max_rounds,
            patience: settings.patience,
            fall_threshold: settings.fall_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Idle,
    Baselining,
    Probing,
    Reverting,
    Converged,
    Exhausted,
    Stopped,
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPhase::Idle => "idle",
            SearchPhase::Baselining => "baselining",
            SearchPhase::Probing => "probing",
            SearchPhase::Reverting => "reverting",
            SearchPhase::Converged => "converged",
            SearchPhase::Exhausted => "exhausted",
            SearchPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One scored trial. Index 0 is the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRecord {
    pub trial_index: u32,
    pub gains: GainVector,
    pub score: f64,
}

/// Working state of one search run. The active flag lives on the snapshot board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchState {
    pub current_gains: GainVector,
    pub best_gains: GainVector,
    pub best_score: f64,
    pub trial_index: u32,
    pub no_improvement_streak: u32,
}

impl SearchState {
    pub fn new(start: GainVector) -> Self {
        Self {
            current_gains: start,
            best_gains: start,
            best_score: 0.0,
            trial_index: 0,
            no_improvement_streak: 0,
        }
    }
}

/// Read-only view of the search shared with the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: SearchPhase,
    pub active: bool,
    pub current_gains: GainVector,
    pub best_gains: GainVector,
    pub best_score: f64,
    pub trial_index: u32,
    pub max_rounds: u32,
    pub no_improvement_streak: u32,
    pub status: String,
    pub results: Vec<ResultRecord>,
}

impl SessionSnapshot {
    pub fn idle(start: GainVector, max_rounds: u32) -> Self {
        Self {
            phase: SearchPhase::Idle,
            active: false,
            current_gains: start,
            best_gains: start,
            best_score: 0.0,
            trial_index: 0,
            max_rounds,
            no_improvement_streak: 0,
            status: "Waiting for start".to_string(),
            results: Vec::new(),
        }
    }
}

pub type SnapshotBoard = Arc<Mutex<SessionSnapshot>>;

pub(crate) fn lock_board(board: &SnapshotBoard) -> MutexGuard<'_, SessionSnapshot> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `patience` rounds in a row without improvement
    Converged,
    /// Round budget spent
    Exhausted,
    /// Active flag cleared from outside
    Stopped,
}

impl StopReason {
    fn phase(self) -> SearchPhase {
        match self {
            StopReason::Converged => SearchPhase::Converged,
            StopReason::Exhausted => SearchPhase::Exhausted,
            StopReason::Stopped => SearchPhase::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub reason: StopReason,
    pub best_gains: GainVector,
    pub best_score: f64,
    pub trials: u32,
    pub no_improvement_streak: u32,
    pub results: Vec<ResultRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeResult {
    /// Candidate clamped back onto the best gains; no trial run
    Skipped,
    Improved,
    NoImprovement,
    /// Stopped while the trial was running; result discarded
    Interrupted,
}

pub struct HillClimber<R: Rng> {
    sampler: TrialSampler,
    scorer: TrialScorer,
    config: SearchConfig,
    rng: R,
    state: SearchState,
    results: Vec<ResultRecord>,
    board: SnapshotBoard,
}

impl<R: Rng> HillClimber<R> {
    /// The caller is expected to have marked the board active.
    pub fn new(sampler: TrialSampler, config: SearchConfig, rng: R, board: SnapshotBoard) -> Self {
        let start = config.space.clamp(config.start_gains);
        Self {
            sampler,
            scorer: TrialScorer::new(config.fall_threshold),
            config,
            rng,
            state: SearchState::new(start),
            results: Vec::new(),
            board,
        }
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn run(mut self) -> SearchOutcome {
        info!(target: "search", "Starting search from {} ({} rounds, patience {})",
            self.state.best_gains, self.config.max_rounds, self.config.patience);

        if !self.baseline() {
            return self.finish(StopReason::Stopped);
        }

        let reason = loop {
            if !self.is_active() {
                break StopReason::Stopped;
            }
            if self.state.trial_index >= self.config.max_rounds {
                break StopReason::Exhausted;
            }
            if self.state.no_improvement_streak >= self.config.patience {
                break StopReason::Converged;
            }
            let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            self.probe_round(sign);
        };
        self.finish(reason)
    }

    fn is_active(&self) -> bool {
        lock_board(&self.board).active
    }

    /// Score the starting gains. Returns false when stopped during the trial.
    fn baseline(&mut self) -> bool {
        let start = self.state.current_gains;
        self.publish(SearchPhase::Baselining, format!("Measuring baseline {}", start));

        let trial = self.sampler.run_trial(&start, self.config.baseline_settle, self.config.trial_duration);
        let score = self.scorer.score(&trial.readings);

        let mut board = lock_board(&self.board);
        if !board.active {
            return false;
        }
        self.state.best_gains = start;
        self.state.best_score = score;
        let record = ResultRecord { trial_index: 0, gains: start, score };
        self.results.push(record);
        info!(target: "search", "Baseline {} -> score {:.2} ({} readings)", start, score, trial.readings.len());
        let status = format!("Baseline score {:.1} at {}", score, start);
        self.write_board(&mut board, SearchPhase::Probing, status);
        true
    }

    /// One round: forward probe, then the opposite direction if that did not help.
    fn probe_round(&mut self, sign: f64) {
        let coefficient = Coefficient::round_robin(self.state.trial_index);
        match self.probe(coefficient, sign, SearchPhase::Probing) {
            ProbeResult::Skipped => {
                self.state.trial_index += 1;
                let status = format!("Round {}/{}: {} already at its limit, skipped",
                    self.state.trial_index, self.config.max_rounds, coefficient);
                self.publish(SearchPhase::Probing, status);
            }
            ProbeResult::Improved => self.state.no_improvement_streak = 0,
            ProbeResult::Interrupted => {}
            ProbeResult::NoImprovement => {
                if self.state.trial_index < self.config.max_rounds && self.is_active() {
                    match self.probe(coefficient, -sign, SearchPhase::Reverting) {
                        ProbeResult::Improved => {
                            self.state.no_improvement_streak = 0;
                            return;
                        }
                        ProbeResult::Interrupted => return,
                        ProbeResult::Skipped | ProbeResult::NoImprovement => {}
                    }
                }
                self.state.no_improvement_streak += 1;
            }
        }
    }

    fn probe(&mut self, coefficient: Coefficient, sign: f64, phase: SearchPhase) -> ProbeResult {
        let best = self.state.best_gains;
        let candidate = self.config.space.perturb(&best, coefficient, sign);
        if candidate == best {
            return ProbeResult::Skipped;
        }

        self.state.trial_index += 1;
        self.state.current_gains = candidate;
        let label = if phase == SearchPhase::Reverting { "reverse" } else { "testing" };
        let status = format!("Round {}/{}: {} {}={:.2} (best={:.1})",
            self.state.trial_index, self.config.max_rounds, label, coefficient,
            candidate.get(coefficient), self.state.best_score);
        self.publish(phase, status);

        let trial = self.sampler.run_trial(&candidate, self.config.probe_settle, self.config.trial_duration);
        let score = self.scorer.score(&trial.readings);

        let mut board = lock_board(&self.board);
        if !board.active {
            info!(target: "search", "Trial #{} discarded, search stopped", self.state.trial_index);
            return ProbeResult::Interrupted;
        }

        self.results.push(ResultRecord { trial_index: self.state.trial_index, gains: candidate, score });
        let improved = score > self.state.best_score;
        info!(target: "search", "#{}: {} -> score {:.2} {}", self.state.trial_index, candidate, score,
            if improved { "(better)" } else { "" });

        let status = if improved {
            self.state.best_score = score;
            self.state.best_gains = candidate;
            format!("Better! score {:.1} at {}", score, candidate)
        } else {
            format!("Round {}/{}: score {:.1}, best stays {:.1}",
                self.state.trial_index, self.config.max_rounds, score, self.state.best_score)
        };
        self.write_board(&mut board, phase, status);

        if improved {
            ProbeResult::Improved
        } else {
            ProbeResult::NoImprovement
        }
    }

    fn finish(mut self, reason: StopReason) -> SearchOutcome {
        self.state.current_gains = self.state.best_gains;
        let best = self.state.best_gains;

        let status = match reason {
            StopReason::Stopped => format!("Stopped. Best {} score {:.1} sent", best, self.state.best_score),
            _ => format!("Done! Best {} score {:.1} ({} trials)", best, self.state.best_score, self.state.trial_index),
        };
        {
            let mut board = lock_board(&self.board);
            board.active = false;
            self.write_board(&mut board, reason.phase(), status);
        }
        self.sampler.link().send_gains(&best);

        info!(target: "search", "Search finished ({:?}): best {} score {:.2} after {} trials",
            reason, best, self.state.best_score, self.state.trial_index);

        SearchOutcome {
            reason,
            best_gains: best,
            best_score: self.state.best_score,
            trials: self.state.trial_index,
            no_improvement_streak: self.state.no_improvement_streak,
            results: self.results,
        }
    }

    fn publish(&self, phase: SearchPhase, status: String) {
        let mut board = lock_board(&self.board);
        self.write_board(&mut board, phase, status);
    }

    fn write_board(&self, board: &mut SessionSnapshot, phase: SearchPhase, status: String) {
        debug!(target: "search", "{}", status);
        board.phase = phase;
        board.current_gains = self.state.current_gains;
        board.best_gains = self.state.best_gains;
        board.best_score = self.state.best_score;
        board.trial_index = self.state.trial_index;
        board.max_rounds = self.config.max_rounds;
        board.no_improvement_streak = self.state.no_improvement_streak;
        board.status = status;
        board.results.clone_from(&self.results);
    }
}
