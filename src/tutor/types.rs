use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tutor::config::{ACTION_COUNT, DIFFICULTY_COUNT, WINDOW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; DIFFICULTY_COUNT] =
        [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "Easy",
            Self::Medium => "Medium",
            Self::Hard => "Hard",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Easy => 0,
            Self::Medium => 1,
            Self::Hard => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Lenient parse used on client input; unknown values map to Medium.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "easy" => Self::Easy,
            "hard" => Self::Hard,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A combined (topic slot, difficulty) action: `raw = topic_slot * 3 + difficulty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub topic_slot: usize,
    pub difficulty: Difficulty,
}

impl Action {
    pub fn new(topic_slot: usize, difficulty: Difficulty) -> Self {
        Self {
            topic_slot,
            difficulty,
        }
    }

    pub fn decode(raw: usize) -> Option<Self> {
        if raw >= ACTION_COUNT {
            return None;
        }
        let difficulty = Difficulty::from_index(raw % DIFFICULTY_COUNT)?;
        Some(Self::new(raw / DIFFICULTY_COUNT, difficulty))
    }

    pub fn raw(&self) -> usize {
        self.topic_slot * DIFFICULTY_COUNT + self.difficulty.index()
    }

    pub fn is_valid(&self) -> bool {
        self.topic_slot < WINDOW_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Policy,
    Fallback,
    Remediation,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Fallback => "fallback",
            Self::Remediation => "remediation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub topic_slot: usize,
    pub difficulty: Difficulty,
    pub raw_action: usize,
    pub source: DecisionSource,
}

impl Decision {
    pub fn from_action(action: Action, source: DecisionSource) -> Self {
        Self {
            topic_slot: action.topic_slot,
            difficulty: action.difficulty,
            raw_action: action.raw(),
            source,
        }
    }

    pub fn action(&self) -> Action {
        Action::new(self.topic_slot, self.difficulty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub text: String,
    pub reference_answer: String,
}

impl Question {
    pub fn fallback(topic: &str) -> Self {
        Self {
            text: format!("Explain the key concepts of {topic}."),
            reference_answer: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub score: f64,
    pub feedback: String,
}

impl Grade {
    pub fn failed(feedback: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            feedback: feedback.into(),
        }
    }

    pub fn is_correct(&self) -> bool {
        self.score >= crate::tutor::config::MASTERY_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub student_id: String,
    pub subject: String,
    pub source_assessment: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningStep {
    pub session_id: String,
    pub sequence: u64,
    pub student_id: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub score: f64,
    pub feedback: String,
    pub mastery_before: f64,
    pub mastery_after: f64,
    pub action_taken: usize,
    pub reward: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: String,
    pub question: Question,
    pub topic: String,
    pub difficulty: Difficulty,
    pub observation: Vec<f64>,
    pub decision_source: DecisionSource,
    pub available_topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AnswerSubmission {
    pub session_id: String,
    pub student_id: String,
    pub question: String,
    pub answer: String,
    pub topic: String,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOutcome {
    pub score: f64,
    pub feedback: String,
    pub mastery_before: f64,
    pub mastery_after: f64,
    pub next_question: Question,
    pub next_topic: String,
    pub next_difficulty: Difficulty,
    pub observation: Vec<f64>,
    pub decision_source: DecisionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicProgress {
    pub topic: String,
    pub mastery: Option<f64>,
}
