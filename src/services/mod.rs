pub mod grader;
pub mod llm_provider;
pub mod question_generator;

pub use grader::{Grader, LlmGrader};
pub use llm_provider::LLMProvider;
pub use question_generator::{LlmQuestionGenerator, QuestionError, QuestionGenerator};
