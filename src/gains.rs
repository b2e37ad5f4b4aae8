//! Gain vectors for the balance controller (K1 proportional, K2 derivative, K3 brake)
//! and the bounded space the tuner is allowed to move them in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three tunable coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coefficient {
    Proportional,
    Derivative,
    Brake,
}

impl Coefficient {
    pub const ALL: [Coefficient; 3] = [
        Coefficient::Proportional,
        Coefficient::Derivative,
        Coefficient::Brake,
    ];

    pub fn index(self) -> usize {
        match self {
            Coefficient::Proportional => 0,
            Coefficient::Derivative => 1,
            Coefficient::Brake => 2,
        }
    }

    /// Wire/display label ("K1", "K2", "K3").
    pub fn label(self) -> &'static str {
        match self {
            Coefficient::Proportional => "K1",
            Coefficient::Derivative => "K2",
            Coefficient::Brake => "K3",
        }
    }

    /// Round-robin selection used by the search: trial index modulo 3.
    pub fn round_robin(trial_index: u32) -> Self {
        Self::ALL[(trial_index % 3) as usize]
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainVector {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
}

impl GainVector {
    pub const fn new(k1: f64, k2: f64, k3: f64) -> Self {
        Self { k1, k2, k3 }
    }

    pub fn get(&self, coefficient: Coefficient) -> f64 {
        match coefficient {
            Coefficient::Proportional => self.k1,
            Coefficient::Derivative => self.k2,
            Coefficient::Brake => self.k3,
        }
    }

    pub fn with(mut self, coefficient: Coefficient, value: f64) -> Self {
        match coefficient {
            Coefficient::Proportional => self.k1 = value,
            Coefficient::Derivative => self.k2 = value,
            Coefficient::Brake => self.k3 = value,
        }
        self
    }

    /// Gain-update message understood by the robot firmware, e.g. `K1=76.00,K2=24.00,K3=0.16`.
    pub fn to_command(&self) -> String {
        format!("K1={:.2},K2={:.2},K3={:.2}", self.k1, self.k2, self.k3)
    }
}

impl fmt::Display for GainVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K1={:.1} K2={:.1} K3={:.2}", self.k1, self.k2, self.k3)
    }
}

/// Closed range and step policy for a single coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainBound {
    pub min: f64,
    pub max: f64,
    /// Perturbation size used by the auto-tuner
    pub step: f64,
    /// Increment used by the manual +/- buttons
    pub fine_step: f64,
}

impl GainBound {
    pub const fn new(min: f64, max: f64, step: f64, fine_step: f64) -> Self {
        Self { min, max, step, fine_step }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Bounds for all three coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSpace {
    bounds: [GainBound; 3],
}

impl Default for GainSpace {
    fn default() -> Self {
        Self::new(
            GainBound::new(20.0, 120.0, 5.0, 0.5),
            GainBound::new(2.0, 50.0, 2.0, 0.25),
            GainBound::new(0.0, 0.50, 0.02, 0.01),
        )
    }
}

impl GainSpace {
    pub const fn new(k1: GainBound, k2: GainBound, k3: GainBound) -> Self {
        Self { bounds: [k1, k2, k3] }
    }

    pub fn bound(&self, coefficient: Coefficient) -> &GainBound {
        &self.bounds[coefficient.index()]
    }

    pub fn clamp(&self, gains: GainVector) -> GainVector {
        Coefficient::ALL.iter().fold(gains, |acc, &c| {
            let clamped = self.bound(c).clamp(acc.get(c));
            acc.with(c, clamped)
        })
    }

    pub fn contains(&self, gains: &GainVector) -> bool {
        Coefficient::ALL
            .iter()
            .all(|&c| self.bound(c).contains(gains.get(c)))
    }

    /// Shift one coefficient by `direction * step` and clamp it back into range.
    pub fn perturb(&self, gains: &GainVector, coefficient: Coefficient, direction: f64) -> GainVector {
        let bound = self.bound(coefficient);
        let moved = gains.get(coefficient) + direction * bound.step;
        gains.with(coefficient, bound.clamp(moved))
    }

    /// Same as `perturb` but with the manual fine step.
    pub fn nudge(&self, gains: &GainVector, coefficient: Coefficient, direction: f64) -> GainVector {
        let bound = self.bound(coefficient);
        let moved = gains.get(coefficient) + direction * bound.fine_step;
        gains.with(coefficient, bound.clamp(moved))
    }
}
