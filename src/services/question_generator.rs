use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::services::llm_provider::LLMProvider;
use crate::tutor::grading::clean_json_block;
use crate::tutor::types::{Difficulty, Question};

#[derive(Debug, Error)]
pub enum QuestionError {
    #[error("question generator unavailable: {0}")]
    Unavailable(String),
    #[error("question generation timed out after {0} ms")]
    TimedOut(u64),
    #[error("unusable question response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(
        &self,
        subject: &str,
        topic: &str,
        difficulty: Difficulty,
    ) -> Result<Question, QuestionError>;
}

const QUESTION_SYSTEM_PROMPT: &str = "You write one short-answer exam question. \
Reply with strict JSON only: {\"text\": \"<question>\", \"answer\": \"<reference answer>\"}.";

#[derive(Debug, Deserialize)]
struct GeneratedQuestion {
    #[serde(alias = "question")]
    text: String,
    #[serde(default, alias = "reference_answer", alias = "referenceAnswer")]
    answer: String,
}

pub struct LlmQuestionGenerator {
    provider: Arc<LLMProvider>,
}

impl LlmQuestionGenerator {
    pub fn new(provider: Arc<LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl QuestionGenerator for LlmQuestionGenerator {
    async fn generate(
        &self,
        subject: &str,
        topic: &str,
        difficulty: Difficulty,
    ) -> Result<Question, QuestionError> {
        let prompt = format!(
            "Subject: {subject}\nTopic: {topic}\nDifficulty: {difficulty}\n\
             Key concepts include definitions, applications and problem solving."
        );
        let raw = self
            .provider
            .complete_with_system(QUESTION_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|err| QuestionError::Unavailable(err.to_string()))?;
        parse_question(&raw)
    }
}

pub fn parse_question(raw: &str) -> Result<Question, QuestionError> {
    let cleaned = clean_json_block(raw);
    let generated = match serde_json::from_str::<Vec<GeneratedQuestion>>(cleaned) {
        Ok(list) => list.into_iter().next(),
        Err(_) => serde_json::from_str::<GeneratedQuestion>(cleaned).ok(),
    };
    match generated {
        Some(q) if !q.text.trim().is_empty() => Ok(Question {
            text: q.text.trim().to_string(),
            reference_answer: q.answer,
        }),
        _ => Err(QuestionError::Malformed(raw.chars().take(200).collect())),
    }
}
