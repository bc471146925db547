use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::config::Config;
use crate::services::{LLMProvider, LlmGrader, LlmQuestionGenerator};
use crate::store::{SqliteStore, StoreError, Stores};
use crate::tutor::{PolicyHandle, TutorConfig, TutorOrchestrator};

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    started_at_system: SystemTime,
    backend: &'static str,
    tutor: Arc<TutorOrchestrator>,
}

impl AppState {
    pub fn new(tutor: Arc<TutorOrchestrator>, backend: &'static str) -> Self {
        Self {
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
            backend,
            tutor,
        }
    }

    /// Wires stores, the policy artifact and the LLM collaborators from the environment.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let (stores, backend) = match config.database_url.as_deref() {
            Some(url) => (Stores::from_backend(SqliteStore::connect(url).await?), "sqlite"),
            None => {
                tracing::warn!("DATABASE_URL not set, records are kept in memory only");
                (Stores::in_memory(), "memory")
            }
        };

        let tutor_config = TutorConfig::from_env();
        let provider = Arc::new(LLMProvider::from_env());
        if !provider.is_available() {
            tracing::warn!("LLM provider not configured, grading and question generation will fall back");
        }

        let tutor = TutorOrchestrator::new(
            tutor_config.clone(),
            stores,
            Arc::new(PolicyHandle::from_path(tutor_config.policy_path.clone())),
            Arc::new(LlmQuestionGenerator::new(Arc::clone(&provider))),
            Arc::new(LlmGrader::new(provider)),
        );

        Ok(Self::new(Arc::new(tutor), backend))
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn tutor(&self) -> Arc<TutorOrchestrator> {
        Arc::clone(&self.tutor)
    }
}
