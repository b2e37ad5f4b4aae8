//! Trial scoring: reduce one observation window to a single fitness value.

/// Fewer readings than this and the trial is treated as degenerate
pub const MIN_TRIAL_READINGS: usize = 10;

/// Tilt (degrees) beyond which the robot is considered fallen
pub const DEFAULT_FALL_THRESHOLD: f64 = 12.0;

/// Summary statistics of a trial window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialStats {
    pub samples: usize,
    pub avg_abs: f64,
    pub max_abs: f64,
    /// Fraction of readings with |angle| below the fall threshold
    pub standing_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialScorer {
    pub fall_threshold: f64,
}

impl Default for TrialScorer {
    fn default() -> Self {
        Self { fall_threshold: DEFAULT_FALL_THRESHOLD }
    }
}

impl TrialScorer {
    pub fn new(fall_threshold: f64) -> Self {
        Self { fall_threshold }
    }

    /// `None` when there are too few readings to judge.
    pub fn stats(&self, readings: &[f64]) -> Option<TrialStats> {
        if readings.len() < MIN_TRIAL_READINGS {
            return None;
        }
        let n = readings.len() as f64;
        let (sum, max_abs, standing) = readings.iter().fold((0.0, 0.0_f64, 0usize), |(s, m, c), r| {
            let a = r.abs();
            (s + a, m.max(a), c + usize::from(a < self.fall_threshold))
        });
        Some(TrialStats {
            samples: readings.len(),
            avg_abs: sum / n,
            max_abs,
            standing_ratio: standing as f64 / n,
        })
    }

    /// Fitness of a trial, higher is better, 0 for a degenerate window.
    ///
    /// A robot that was down for most of the window only earns `ratio * 10`.
    /// Otherwise the score is `ratio * 100 / (avg + 0.5)`, boosted by 1.5 when the
    /// worst tilt stayed under 5° or by 1.2 under 8°. Rounded to 2 decimals.
    pub fn score(&self, readings: &[f64]) -> f64 {
        let Some(stats) = self.stats(readings) else {
            return 0.0;
        };
        let raw = if stats.standing_ratio < 0.5 {
            stats.standing_ratio * 10.0
        } else {
            let base = stats.standing_ratio * 100.0 / (stats.avg_abs + 0.5);
            if stats.max_abs < 5.0 {
                base * 1.5
            } else if stats.max_abs < 8.0 {
                base * 1.2
            } else {
                base
            }
        };
        round2(raw)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating(magnitude: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { magnitude } else { -magnitude }).collect()
    }

    #[test]
    fn test_empty_and_short_trials_score_zero() {
        let scorer = TrialScorer::default();
        assert_eq!(scorer.score(&[]), 0.0);
        assert_eq!(scorer.score(&[0.1; 5]), 0.0);
        assert_eq!(scorer.score(&[0.1; 9]), 0.0);
        assert!(scorer.score(&[0.1; 10]) > 0.0);
    }

    #[test]
    fn test_steady_baseline_scores_one_hundred() {
        let scorer = TrialScorer::default();
        let readings = alternating(1.0, 200);
        assert_eq!(scorer.score(&readings), 100.0);
    }

    #[test]
    fn test_calmer_candidate_scores_higher() {
        let scorer = TrialScorer::default();
        assert_eq!(scorer.score(&alternating(0.8, 200)), 115.38);

        let mut spiky = alternating(0.8, 199);
        spiky.push(4.0);
        let stats = scorer.stats(&spiky).unwrap();
        assert_eq!(stats.max_abs, 4.0);
        assert!(scorer.score(&spiky) > 100.0);
    }

    #[test]
    fn test_perfectly_still_is_finite() {
        let scorer = TrialScorer::default();
        let s = scorer.score(&[0.0; 50]);
        assert!(s.is_finite());
        assert_eq!(s, 300.0);
    }

    #[test]
    fn test_fallen_robot_scores_low() {
        let scorer = TrialScorer::default();
        let mut readings = vec![30.0; 80];
        readings.extend(vec![1.0; 20]);
        // standing ratio 0.2
        assert_eq!(scorer.score(&readings), 2.0);
    }

    #[test]
    fn test_mid_tilt_multiplier() {
        let scorer = TrialScorer::default();
        let mut readings = vec![1.0; 99];
        readings.push(6.0);
        let stats = scorer.stats(&readings).unwrap();
        let expected = round2(100.0 / (stats.avg_abs + 0.5) * 1.2);
        assert_eq!(scorer.score(&readings), expected);
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = TrialScorer::new(12.0);
        let readings: Vec<f64> = (0..64).map(|i| ((i as f64) * 0.37).sin() * 6.0).collect();
        assert_eq!(scorer.score(&readings), scorer.score(&readings));
    }
}
