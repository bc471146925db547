#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tutor_backend::services::{Grader, QuestionError, QuestionGenerator};
use tutor_backend::store::{
    GraphStore, InMemoryStore, MasteryStore, SessionStore, StoreError, Stores,
};
use tutor_backend::tutor::grading::{parse_grading_response, GradingError};
use tutor_backend::tutor::policy::{PolicyError, PolicyLoader, PolicyModel};
use tutor_backend::tutor::{
    Difficulty, Grade, LearningStep, PolicyHandle, Question, Session, TutorConfig,
    TutorOrchestrator,
};

// ============================================================================
// Collaborator stubs
// ============================================================================

#[derive(Debug, Clone)]
pub enum GraderScript {
    Score(f64),
    /// Raw collaborator text, interpreted like a real reply.
    Raw(String),
    Unavailable,
    /// Never answers within any test timeout.
    Hang,
}

pub struct ScriptedGrader {
    script: parking_lot::Mutex<GraderScript>,
    calls: AtomicUsize,
}

impl ScriptedGrader {
    pub fn new(script: GraderScript) -> Arc<Self> {
        Arc::new(Self {
            script: parking_lot::Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn scoring(score: f64) -> Arc<Self> {
        Self::new(GraderScript::Score(score))
    }

    pub fn set(&self, script: GraderScript) {
        *self.script.lock() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Grader for ScriptedGrader {
    async fn grade(
        &self,
        _question: &str,
        _rubric: Option<&str>,
        _student_answer: &str,
    ) -> Result<Grade, GradingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();
        match script {
            GraderScript::Score(score) => Ok(Grade {
                score,
                feedback: format!("scored {score}"),
            }),
            GraderScript::Raw(raw) => parse_grading_response(&raw),
            GraderScript::Unavailable => Err(GradingError::Unavailable("offline".into())),
            GraderScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GradingError::Unavailable("woke up".into()))
            }
        }
    }
}

pub struct StaticQuestions;

#[async_trait]
impl QuestionGenerator for StaticQuestions {
    async fn generate(
        &self,
        _subject: &str,
        topic: &str,
        difficulty: Difficulty,
    ) -> Result<Question, QuestionError> {
        Ok(Question {
            text: format!("[{difficulty}] Describe {topic}."),
            reference_answer: format!("Reference for {topic}"),
        })
    }
}

pub struct OfflineQuestions;

#[async_trait]
impl QuestionGenerator for OfflineQuestions {
    async fn generate(
        &self,
        _subject: &str,
        _topic: &str,
        _difficulty: Difficulty,
    ) -> Result<Question, QuestionError> {
        Err(QuestionError::Unavailable("offline".into()))
    }
}

/// Always returns the same raw action.
pub struct FixedPolicy(pub usize);

impl PolicyModel for FixedPolicy {
    fn predict(&self, _observation: &[f64]) -> Result<usize, PolicyError> {
        Ok(self.0)
    }
}

/// Slow loader that counts how often the artifact is read.
pub struct CountingPolicyLoader {
    pub loads: AtomicUsize,
    pub action: usize,
    pub delay: Duration,
}

impl CountingPolicyLoader {
    pub fn new(action: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            action,
            delay,
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyLoader for CountingPolicyLoader {
    async fn load(&self) -> Result<Arc<dyn PolicyModel>, PolicyError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Arc::new(FixedPolicy(self.action)))
    }
}

// ============================================================================
// Store wrappers
// ============================================================================

/// In-memory records with switchable write and read failures.
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    pub fail_mastery_writes: AtomicBool,
    pub fail_step_writes: AtomicBool,
    pub fail_mastery_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_mastery_writes: AtomicBool::new(false),
            fail_step_writes: AtomicBool::new(false),
            fail_mastery_reads: AtomicBool::new(false),
        })
    }

    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            graph: self.inner.clone(),
            mastery: self.clone(),
            sessions: self.clone(),
            assessments: self.inner.clone(),
        }
    }
}

fn outage() -> StoreError {
    StoreError::Unavailable("simulated outage".into())
}

#[async_trait]
impl MasteryStore for FlakyStore {
    async fn get_mastery_map(
        &self,
        student_id: &str,
        subject: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        if self.fail_mastery_reads.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.get_mastery_map(student_id, subject).await
    }

    async fn set_mastery(
        &self,
        student_id: &str,
        subject: &str,
        topic: &str,
        value: f64,
    ) -> Result<(), StoreError> {
        if self.fail_mastery_writes.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.set_mastery(student_id, subject, topic, value).await
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.create_session(session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.inner.get_session(session_id).await
    }

    async fn append_learning_step(&self, step: &LearningStep) -> Result<(), StoreError> {
        if self.fail_step_writes.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.append_learning_step(step).await
    }

    async fn recent_learning_steps(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>, StoreError> {
        self.inner.recent_learning_steps(student_id, limit).await
    }

    async fn session_steps(&self, session_id: &str) -> Result<Vec<LearningStep>, StoreError> {
        self.inner.session_steps(session_id).await
    }
}

/// A graph store that is always down.
pub struct DownGraph;

#[async_trait]
impl GraphStore for DownGraph {
    async fn get_direct_prerequisites(
        &self,
        _subject: &str,
        _topic: &str,
    ) -> Result<Vec<String>, StoreError> {
        Err(outage())
    }

    async fn get_ancestors_by_distance(
        &self,
        _subject: &str,
        _topic: &str,
        _max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        Err(outage())
    }

    async fn get_descendants_by_distance(
        &self,
        _subject: &str,
        _topic: &str,
        _max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        Err(outage())
    }

    async fn ensure_topic(&self, _subject: &str, _topic: &str) -> Result<(), StoreError> {
        Err(outage())
    }

    async fn ensure_prerequisite_edge(
        &self,
        _subject: &str,
        _topic: &str,
        _prerequisite: &str,
    ) -> Result<(), StoreError> {
        Err(outage())
    }

    async fn subject_topics(&self, _subject: &str) -> Result<Vec<String>, StoreError> {
        Err(outage())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn test_config() -> TutorConfig {
    TutorConfig {
        grading_timeout: Duration::from_millis(200),
        question_timeout: Duration::from_millis(200),
        ..TutorConfig::default()
    }
}

pub fn tutor_with(
    stores: Stores,
    policy: PolicyHandle,
    grader: Arc<dyn Grader>,
) -> TutorOrchestrator {
    tutor_with_config(test_config(), stores, policy, grader)
}

pub fn tutor_with_config(
    config: TutorConfig,
    stores: Stores,
    policy: PolicyHandle,
    grader: Arc<dyn Grader>,
) -> TutorOrchestrator {
    TutorOrchestrator::new(
        config,
        stores,
        Arc::new(policy),
        Arc::new(StaticQuestions),
        grader,
    )
}

/// Policy that always asks for the anchor topic at Medium difficulty.
pub fn anchor_medium_policy() -> PolicyHandle {
    PolicyHandle::with_model(Arc::new(FixedPolicy(1)))
}

pub fn padding_vector(first: f64) -> Vec<f64> {
    let mut expected = vec![first];
    expected.extend(std::iter::repeat(0.1).take(8));
    expected
}
