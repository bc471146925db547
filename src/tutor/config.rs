use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of topic slots in an observation window.
pub const WINDOW_SIZE: usize = 9;
/// Number of difficulty levels the policy chooses between.
pub const DIFFICULTY_COUNT: usize = 3;
/// Size of the combined (topic slot, difficulty) action space.
pub const ACTION_COUNT: usize = WINDOW_SIZE * DIFFICULTY_COUNT;

/// Mastery reported for padding slots.
pub const PADDING_MASTERY: f64 = 0.1;
/// Mastery assumed for a real topic the student has never attempted.
pub const DEFAULT_PRIOR: f64 = 0.5;
/// Score (and mastery) at or above which an attempt counts as correct.
pub const MASTERY_THRESHOLD: f64 = 0.6;
/// Mastery assumed for a prerequisite with no record (assume unlearned).
pub const UNRECORDED_PREREQUISITE_MASTERY: f64 = 0.1;

pub const MAX_HOPS: usize = 5;
pub const NEIGHBOURS_PER_DIRECTION: usize = 4;

/// EMA step toward the observed score.
pub const LEARNING_RATE: f64 = 0.25;

pub const MASTERY_FLOOR: f64 = 0.05;
pub const MASTERY_CEILING: f64 = 0.95;

const DEFAULT_POLICY_PATH: &str = "./resources/adaptive_tutor_policy/policy.json";
const DEFAULT_GRADING_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_QUESTION_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MasteryRule {
    #[default]
    Ema,
    Bkt,
}

impl MasteryRule {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "bkt" | "bayesian" => Self::Bkt,
            _ => Self::Ema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BktParams {
    pub transit: f64,
    pub slip: f64,
    pub guess: f64,
}

impl Default for BktParams {
    fn default() -> Self {
        Self {
            transit: 0.1,
            slip: 0.05,
            guess: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryConfig {
    pub rule: MasteryRule,
    pub learning_rate: f64,
    pub bkt: BktParams,
}

impl Default for MasteryConfig {
    fn default() -> Self {
        Self {
            rule: MasteryRule::Ema,
            learning_rate: LEARNING_RATE,
            bkt: BktParams::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TutorConfig {
    pub policy_path: PathBuf,
    pub grading_timeout: Duration,
    pub question_timeout: Duration,
    /// In-memory session cursors untouched this long are dropped; the next
    /// request for that session rebuilds it from the store.
    pub session_idle_ttl: Duration,
    pub mastery: MasteryConfig,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            policy_path: PathBuf::from(DEFAULT_POLICY_PATH),
            grading_timeout: Duration::from_millis(DEFAULT_GRADING_TIMEOUT_MS),
            question_timeout: Duration::from_millis(DEFAULT_QUESTION_TIMEOUT_MS),
            session_idle_ttl: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
            mastery: MasteryConfig::default(),
        }
    }
}

impl TutorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TUTOR_POLICY_PATH") {
            if !val.trim().is_empty() {
                config.policy_path = PathBuf::from(val);
            }
        }
        if let Some(ms) = env_u64("TUTOR_GRADING_TIMEOUT_MS") {
            config.grading_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TUTOR_QUESTION_TIMEOUT_MS") {
            config.question_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("TUTOR_SESSION_IDLE_SECS") {
            config.session_idle_ttl = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("TUTOR_MASTERY_RULE") {
            config.mastery.rule = MasteryRule::parse(&val);
        }
        if let Some(rate) = std::env::var("TUTOR_LEARNING_RATE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0 && *v <= 1.0)
        {
            config.mastery.learning_rate = rate;
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
