//! Per-topic mastery update.
//!
//! The canonical rule is a bounded exponential moving average toward the
//! observed score. The slip/guess Bayesian rule is kept as an alternative and
//! shares the same display bounds.

use crate::tutor::config::{
    BktParams, MasteryConfig, MasteryRule, LEARNING_RATE, MASTERY_CEILING, MASTERY_FLOOR,
    MASTERY_THRESHOLD,
};

/// `prior + 0.25 * (score - prior)`, clamped into `[0.05, 0.95]`.
pub fn update(prior_mastery: f64, observed_score: f64) -> f64 {
    ema_update(prior_mastery, observed_score, LEARNING_RATE)
}

pub fn ema_update(prior_mastery: f64, observed_score: f64, learning_rate: f64) -> f64 {
    let prior = sanitize(prior_mastery);
    let score = sanitize(observed_score);
    clamp_display(prior + learning_rate * (score - prior))
}

pub fn bkt_update(prior_mastery: f64, correct: bool, params: &BktParams) -> f64 {
    let m = sanitize(prior_mastery);
    let posterior = if correct {
        let num = m * (1.0 - params.slip);
        num / (num + (1.0 - m) * params.guess)
    } else {
        let num = m * params.slip;
        num / (num + (1.0 - m) * (1.0 - params.guess))
    };
    let posterior = if posterior.is_finite() { posterior } else { m };
    clamp_display(posterior + (1.0 - posterior) * params.transit)
}

pub fn clamp_display(value: f64) -> f64 {
    if value.is_nan() {
        return MASTERY_FLOOR;
    }
    value.clamp(MASTERY_FLOOR, MASTERY_CEILING)
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct MasteryUpdater {
    config: MasteryConfig,
}

impl MasteryUpdater {
    pub fn new(config: MasteryConfig) -> Self {
        Self { config }
    }

    pub fn rule(&self) -> MasteryRule {
        self.config.rule
    }

    pub fn update(&self, prior_mastery: f64, observed_score: f64) -> f64 {
        match self.config.rule {
            MasteryRule::Ema => {
                ema_update(prior_mastery, observed_score, self.config.learning_rate)
            }
            MasteryRule::Bkt => bkt_update(
                prior_mastery,
                observed_score >= MASTERY_THRESHOLD,
                &self.config.bkt,
            ),
        }
    }
}

impl Default for MasteryUpdater {
    fn default() -> Self {
        Self::new(MasteryConfig::default())
    }
}
