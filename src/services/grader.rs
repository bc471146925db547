use std::sync::Arc;

use async_trait::async_trait;

use crate::services::llm_provider::LLMProvider;
use crate::tutor::grading::{parse_grading_response, GradingError};
use crate::tutor::types::Grade;

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(
        &self,
        question: &str,
        rubric: Option<&str>,
        student_answer: &str,
    ) -> Result<Grade, GradingError>;
}

const GRADER_SYSTEM_PROMPT: &str = "You grade short student answers. \
Reply with strict JSON only: {\"score\": <float 0.0-1.0>, \"feedback\": \"<1-2 sentences>\"}.";

pub struct LlmGrader {
    provider: Arc<LLMProvider>,
}

impl LlmGrader {
    pub fn new(provider: Arc<LLMProvider>) -> Self {
        Self { provider }
    }

    fn prompt(&self, question: &str, rubric: Option<&str>, student_answer: &str) -> String {
        let mut prompt = format!("Question: {question}\n");
        if let Some(rubric) = rubric.filter(|r| !r.trim().is_empty()) {
            prompt.push_str(&format!("Reference answer: {rubric}\n"));
        }
        prompt.push_str(&format!("Student answer: {student_answer}\n"));
        prompt.push_str("Grade the answer for correctness and relevance.");
        prompt
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn grade(
        &self,
        question: &str,
        rubric: Option<&str>,
        student_answer: &str,
    ) -> Result<Grade, GradingError> {
        let prompt = self.prompt(question, rubric, student_answer);
        let raw = self
            .provider
            .complete_with_system(GRADER_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|err| GradingError::Unavailable(err.to_string()))?;
        parse_grading_response(&raw)
    }
}
