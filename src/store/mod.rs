//! Record stores consumed by the tutoring core.
//!
//! The core only depends on the traits below; `memory` and `sqlite` are the
//! two backends shipped with the service.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::tutor::types::{LearningStep, Session};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

/// Subject → Topic membership and `prerequisite → dependent` edges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// One hop only, in edge insertion order.
    async fn get_direct_prerequisites(
        &self,
        subject: &str,
        topic: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Topics the given topic depends on, with their shortest hop distance.
    async fn get_ancestors_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError>;

    /// Topics depending on the given topic, with their shortest hop distance.
    async fn get_descendants_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError>;

    async fn ensure_topic(&self, subject: &str, topic: &str) -> Result<(), StoreError>;

    async fn ensure_prerequisite_edge(
        &self,
        subject: &str,
        topic: &str,
        prerequisite: &str,
    ) -> Result<(), StoreError>;

    async fn subject_topics(&self, subject: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait MasteryStore: Send + Sync {
    async fn get_mastery_map(
        &self,
        student_id: &str,
        subject: &str,
    ) -> Result<HashMap<String, f64>, StoreError>;

    async fn set_mastery(
        &self,
        student_id: &str,
        subject: &str,
        topic: &str,
        value: f64,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Append-only; entries are never updated or removed.
    async fn append_learning_step(&self, step: &LearningStep) -> Result<(), StoreError>;

    /// Most recent first.
    async fn recent_learning_steps(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>, StoreError>;

    /// In sequence order.
    async fn session_steps(&self, session_id: &str) -> Result<Vec<LearningStep>, StoreError>;
}

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    async fn register_assessment(
        &self,
        assessment_id: &str,
        topics: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn assessment_topics(&self, assessment_id: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Clone)]
pub struct Stores {
    pub graph: Arc<dyn GraphStore>,
    pub mastery: Arc<dyn MasteryStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub assessments: Arc<dyn AssessmentStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }

    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: GraphStore + MasteryStore + SessionStore + AssessmentStore + 'static,
    {
        Self {
            graph: backend.clone(),
            mastery: backend.clone(),
            sessions: backend.clone(),
            assessments: backend,
        }
    }
}

/// Extracts the topic list stored for an assessment.
///
/// Lists keep their non-empty entries in order. Objects map question ids to
/// topics; their distinct values (minus `"Unknown"`) are used, or `General`
/// when nothing usable remains. A JSON string holding either shape is decoded
/// first.
pub fn topics_from_json(value: &serde_json::Value) -> Vec<String> {
    use serde_json::Value;

    match value {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(inner @ (Value::Array(_) | Value::Object(_))) => topics_from_json(&inner),
            _ => Vec::new(),
        },
        Value::Array(items) => items.iter().filter_map(value_as_topic).collect(),
        Value::Object(map) => {
            let mut topics: Vec<String> = Vec::new();
            for topic in map.values().filter_map(value_as_topic) {
                if topic != "Unknown" && !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
            if topics.is_empty() {
                vec!["General".to_string()]
            } else {
                topics
            }
        }
        _ => Vec::new(),
    }
}

fn value_as_topic(value: &serde_json::Value) -> Option<String> {
    let topic = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!topic.is_empty()).then_some(topic)
}
