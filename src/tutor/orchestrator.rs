//! Tutoring session state machine.
//!
//! `start_session` covers SessionStart; `submit_answer` runs Grading,
//! MasteryUpdate and NextActionDecision for one attempt and leaves the
//! session waiting for the next answer. Steps of one session are serialized
//! through that session's cursor lock; distinct sessions never share it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::services::{Grader, QuestionGenerator};
use crate::store::{StoreError, Stores};
use crate::tutor::config::{TutorConfig, DEFAULT_PRIOR, WINDOW_SIZE};
use crate::tutor::grading::{normalize_score, GradingError};
use crate::tutor::mastery::MasteryUpdater;
use crate::tutor::policy::{PolicyAgent, PolicyHandle};
use crate::tutor::projection::{lookup_mastery, GraphProjector, ObservationWindow};
use crate::tutor::remediation::RemediationSelector;
use crate::tutor::types::{
    Action, AnswerOutcome, AnswerSubmission, Decision, DecisionSource, Difficulty, Grade,
    LearningStep, Question, Session, SessionStart, TopicProgress,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStage {
    Session,
    Mastery,
    LearningStep,
}

impl std::fmt::Display for PersistStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Session => "session",
            Self::Mastery => "mastery",
            Self::LearningStep => "learning step",
        })
    }
}

#[derive(Debug, Error)]
pub enum TutorError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("failed to persist {stage}: {source}")]
    Persistence {
        stage: PersistStage,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TutorError {
    /// Persistence failures keep the computed step; resubmitting retries the write.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Store(_))
    }
}

#[derive(Debug, Clone)]
struct IssuedQuestion {
    topic: String,
    question: Question,
    decision: Decision,
}

#[derive(Debug, Clone)]
struct PendingStep {
    question: String,
    answer: String,
    grade: Grade,
    step: LearningStep,
    mastery: HashMap<String, f64>,
}

impl PendingStep {
    fn matches(&self, submission: &AnswerSubmission, topic: &str) -> bool {
        self.question == submission.question
            && self.answer == submission.answer
            && self.step.topic == topic
    }
}

#[derive(Debug)]
struct SessionCursor {
    session: Session,
    candidates: Vec<String>,
    anchor: String,
    window: ObservationWindow,
    issued: Option<IssuedQuestion>,
    sequence: u64,
    pending: Option<PendingStep>,
}

impl SessionCursor {
    fn last_topic(&self) -> &str {
        self.issued
            .as_ref()
            .map(|issued| issued.topic.as_str())
            .unwrap_or(&self.anchor)
    }

    /// Blank or unknown topics fall back to the topic most recently issued.
    fn resolve_topic(&self, submitted: &str) -> String {
        let submitted = submitted.trim();
        if submitted.is_empty() {
            return self.last_topic().to_string();
        }
        let same = |name: &String| name.trim().eq_ignore_ascii_case(submitted);

        if self.last_topic().trim().eq_ignore_ascii_case(submitted) {
            return self.last_topic().to_string();
        }
        if let Some(found) = self.candidates.iter().find(|c| same(*c)) {
            return found.clone();
        }
        if let Some(slot) = self.window.slot_of(submitted) {
            if let Some(found) = self.window.topic_at(slot) {
                return found.to_string();
            }
        }
        tracing::warn!(
            session_id = %self.session.id,
            submitted,
            substitute = self.last_topic(),
            "submitted topic outside candidate universe"
        );
        self.last_topic().to_string()
    }

    fn action_for(&self, topic: &str, difficulty: Difficulty) -> usize {
        if let Some(issued) = self.issued.as_ref() {
            if issued.topic == topic && issued.decision.difficulty == difficulty {
                return issued.decision.raw_action;
            }
        }
        let slot = self.window.slot_of(topic).unwrap_or(0);
        Action::new(slot, difficulty).raw()
    }
}

struct CursorEntry {
    cursor: Arc<AsyncMutex<SessionCursor>>,
    touched: Instant,
}

impl CursorEntry {
    fn new(cursor: SessionCursor) -> Self {
        Self {
            cursor: Arc::new(AsyncMutex::new(cursor)),
            touched: Instant::now(),
        }
    }

    /// Busy cursors and cursors holding an unpersisted step are never idle.
    fn is_evictable(&self, ttl: std::time::Duration) -> bool {
        if self.touched.elapsed() < ttl || Arc::strong_count(&self.cursor) > 1 {
            return false;
        }
        match self.cursor.try_lock() {
            Ok(cursor) => cursor.pending.is_none(),
            Err(_) => false,
        }
    }
}

/// Next (topic, difficulty) chosen at a decision point.
struct NextStep {
    topic: String,
    decision: Decision,
    window: ObservationWindow,
    observation: Vec<f64>,
}

pub struct TutorOrchestrator {
    config: TutorConfig,
    stores: Stores,
    projector: GraphProjector,
    agent: PolicyAgent,
    remediation: RemediationSelector,
    updater: MasteryUpdater,
    questions: Arc<dyn QuestionGenerator>,
    grader: Arc<dyn Grader>,
    cursors: parking_lot::Mutex<HashMap<String, CursorEntry>>,
}

impl TutorOrchestrator {
    pub fn new(
        config: TutorConfig,
        stores: Stores,
        policy: Arc<PolicyHandle>,
        questions: Arc<dyn QuestionGenerator>,
        grader: Arc<dyn Grader>,
    ) -> Self {
        let projector = GraphProjector::new(Arc::clone(&stores.graph));
        let remediation =
            RemediationSelector::new(Arc::clone(&stores.graph), Arc::clone(&stores.mastery));
        let updater = MasteryUpdater::new(config.mastery.clone());

        Self {
            config,
            projector,
            agent: PolicyAgent::new(policy),
            remediation,
            updater,
            questions,
            grader,
            stores,
            cursors: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn start_session(
        &self,
        student_id: &str,
        subject: &str,
        source_assessment: Option<&str>,
    ) -> Result<SessionStart, TutorError> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            subject: subject.to_string(),
            source_assessment: source_assessment
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            started_at: Utc::now(),
        };
        self.stores
            .sessions
            .create_session(&session)
            .await
            .map_err(|source| TutorError::Persistence {
                stage: PersistStage::Session,
                source,
            })?;

        let candidates = self
            .candidate_topics(subject, session.source_assessment.as_deref())
            .await;
        let anchor = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| placeholder_topics().remove(0));

        let mastery = self.mastery_or_empty(student_id, subject).await;
        let next = self.policy_step(subject, &anchor, &mastery).await;
        let question = self
            .question_for(subject, &next.topic, next.decision.difficulty)
            .await;

        tracing::info!(
            session_id = %session.id,
            student_id,
            subject,
            topic = %next.topic,
            difficulty = %next.decision.difficulty,
            source = next.decision.source.as_str(),
            "session started"
        );

        let start = SessionStart {
            session_id: session.id.clone(),
            question: question.clone(),
            topic: next.topic.clone(),
            difficulty: next.decision.difficulty,
            observation: next.observation.clone(),
            decision_source: next.decision.source,
            available_topics: candidates.clone(),
        };

        let cursor = SessionCursor {
            session,
            candidates,
            anchor,
            window: next.window,
            issued: Some(IssuedQuestion {
                topic: next.topic,
                question,
                decision: next.decision,
            }),
            sequence: 0,
            pending: None,
        };
        let mut cursors = self.cursors.lock();
        self.evict_idle(&mut cursors, &start.session_id);
        cursors.insert(start.session_id.clone(), CursorEntry::new(cursor));
        drop(cursors);

        Ok(start)
    }

    pub async fn submit_answer(
        &self,
        submission: AnswerSubmission,
    ) -> Result<AnswerOutcome, TutorError> {
        let cursor = self.cursor(&submission.session_id).await?;
        let mut cursor = cursor.lock().await;

        if cursor.session.student_id != submission.student_id {
            tracing::warn!(
                session_id = %submission.session_id,
                submitted = %submission.student_id,
                owner = %cursor.session.student_id,
                "student does not own session, attributing attempt to session owner"
            );
        }
        let student_id = cursor.session.student_id.clone();
        let subject = cursor.session.subject.clone();
        let topic = cursor.resolve_topic(&submission.topic);

        let pending = match cursor.pending.take() {
            Some(pending) if pending.matches(&submission, &topic) => Some(pending),
            Some(stale) => {
                self.flush_stale(&mut cursor, stale).await?;
                None
            }
            None => None,
        };

        let pending = match pending {
            Some(pending) => {
                tracing::info!(session_id = %submission.session_id, sequence = pending.step.sequence, "retrying persistence of graded step");
                pending
            }
            None => {
                self.grade_step(&cursor, &submission, &student_id, &subject, &topic)
                    .await?
            }
        };

        if let Err(err) = self.persist(&subject, &pending.step).await {
            tracing::error!(
                session_id = %submission.session_id,
                sequence = pending.step.sequence,
                error = %err,
                "graded step not persisted"
            );
            cursor.pending = Some(pending);
            return Err(err);
        }
        cursor.sequence = pending.step.sequence;

        let PendingStep {
            grade,
            step,
            mastery,
            ..
        } = pending;

        tracing::info!(
            session_id = %step.session_id,
            student_id = %student_id,
            topic = %step.topic,
            score = grade.score,
            mastery_before = step.mastery_before,
            mastery_after = step.mastery_after,
            "attempt graded"
        );

        let next = self
            .next_step(&student_id, &subject, &step.topic, &grade, &mastery)
            .await;
        let question = self
            .question_for(&subject, &next.topic, next.decision.difficulty)
            .await;

        let outcome = AnswerOutcome {
            score: grade.score,
            feedback: grade.feedback,
            mastery_before: step.mastery_before,
            mastery_after: step.mastery_after,
            next_question: question.clone(),
            next_topic: next.topic.clone(),
            next_difficulty: next.decision.difficulty,
            observation: next.observation,
            decision_source: next.decision.source,
        };

        if next.decision.source == DecisionSource::Remediation {
            cursor.anchor = next.topic.clone();
        }
        cursor.window = next.window;
        cursor.issued = Some(IssuedQuestion {
            topic: next.topic,
            question,
            decision: next.decision,
        });

        Ok(outcome)
    }

    /// Drops the in-memory cursor of a finished session.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.cursors.lock().remove(session_id).is_some()
    }

    pub async fn recent_learning_steps(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>, TutorError> {
        Ok(self
            .stores
            .sessions
            .recent_learning_steps(student_id, limit)
            .await?)
    }

    pub async fn progress(
        &self,
        student_id: &str,
        subject: &str,
    ) -> Result<Vec<TopicProgress>, TutorError> {
        let mastery = self
            .stores
            .mastery
            .get_mastery_map(student_id, subject)
            .await?;
        let topics = match self.stores.graph.subject_topics(subject).await {
            Ok(topics) => topics,
            Err(err) => {
                tracing::warn!(subject, error = %err, "graph store unavailable, listing recorded topics only");
                Vec::new()
            }
        };

        let mut progress: Vec<TopicProgress> = topics
            .iter()
            .map(|topic| TopicProgress {
                topic: topic.clone(),
                mastery: lookup_mastery(&mastery, topic),
            })
            .collect();

        let mut recorded: Vec<(&String, &f64)> = mastery
            .iter()
            .filter(|(name, _)| !topics.iter().any(|t| t.eq_ignore_ascii_case(name)))
            .collect();
        recorded.sort_by(|a, b| a.0.cmp(b.0));
        progress.extend(recorded.into_iter().map(|(topic, value)| TopicProgress {
            topic: topic.clone(),
            mastery: Some(*value),
        }));

        Ok(progress)
    }

    pub async fn register_prerequisite(
        &self,
        subject: &str,
        topic: &str,
        prerequisite: &str,
    ) -> Result<(), TutorError> {
        self.stores
            .graph
            .ensure_prerequisite_edge(subject, topic, prerequisite)
            .await?;
        Ok(())
    }

    pub async fn register_assessment(
        &self,
        assessment_id: &str,
        topics: &serde_json::Value,
    ) -> Result<Vec<String>, TutorError> {
        self.stores
            .assessments
            .register_assessment(assessment_id, topics)
            .await?;
        Ok(self.stores.assessments.assessment_topics(assessment_id).await?)
    }

    pub fn active_sessions(&self) -> usize {
        self.cursors.lock().len()
    }

    async fn cursor(&self, session_id: &str) -> Result<Arc<AsyncMutex<SessionCursor>>, TutorError> {
        if let Some(cursor) = self.touch(session_id) {
            return Ok(cursor);
        }

        let rebuilt = self.rebuild_cursor(session_id).await?;
        let mut cursors = self.cursors.lock();
        self.evict_idle(&mut cursors, session_id);
        let entry = cursors
            .entry(session_id.to_string())
            .or_insert_with(|| CursorEntry::new(rebuilt));
        entry.touched = Instant::now();
        Ok(Arc::clone(&entry.cursor))
    }

    fn touch(&self, session_id: &str) -> Option<Arc<AsyncMutex<SessionCursor>>> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(session_id).map(|entry| {
            entry.touched = Instant::now();
            Arc::clone(&entry.cursor)
        });
        self.evict_idle(&mut cursors, session_id);
        cursor
    }

    fn evict_idle(&self, cursors: &mut HashMap<String, CursorEntry>, keep: &str) {
        let ttl = self.config.session_idle_ttl;
        let before = cursors.len();
        cursors.retain(|id, entry| id == keep || !entry.is_evictable(ttl));
        let evicted = before - cursors.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = cursors.len(), "idle session cursors evicted");
        }
    }

    async fn rebuild_cursor(&self, session_id: &str) -> Result<SessionCursor, TutorError> {
        let session = self
            .stores
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| TutorError::SessionNotFound(session_id.to_string()))?;
        let sequence = self
            .stores
            .sessions
            .session_steps(session_id)
            .await?
            .iter()
            .map(|s| s.sequence)
            .max()
            .unwrap_or(0);
        let candidates = self
            .candidate_topics(&session.subject, session.source_assessment.as_deref())
            .await;
        let anchor = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| placeholder_topics().remove(0));

        tracing::debug!(session_id, sequence, "session cursor rebuilt from store");

        Ok(SessionCursor {
            window: ObservationWindow::new(vec![anchor.clone()]),
            session,
            candidates,
            anchor,
            issued: None,
            sequence,
            pending: None,
        })
    }

    async fn candidate_topics(&self, subject: &str, source_assessment: Option<&str>) -> Vec<String> {
        let mut topics = match source_assessment {
            Some(id) => match self.stores.assessments.assessment_topics(id).await {
                Ok(topics) => topics,
                Err(err) => {
                    tracing::warn!(assessment = id, error = %err, "assessment topics unavailable");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if topics.is_empty() {
            topics = placeholder_topics();
        }

        for topic in &topics {
            if let Err(err) = self.stores.graph.ensure_topic(subject, topic).await {
                tracing::warn!(subject, topic = %topic, error = %err, "could not record topic in graph");
                break;
            }
        }
        topics
    }

    async fn mastery_or_empty(&self, student_id: &str, subject: &str) -> HashMap<String, f64> {
        match self.stores.mastery.get_mastery_map(student_id, subject).await {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(student_id, subject, error = %err, "mastery unavailable, using priors");
                HashMap::new()
            }
        }
    }

    async fn grade_step(
        &self,
        cursor: &SessionCursor,
        submission: &AnswerSubmission,
        student_id: &str,
        subject: &str,
        topic: &str,
    ) -> Result<PendingStep, TutorError> {
        let rubric = cursor
            .issued
            .as_ref()
            .filter(|issued| issued.question.text == submission.question)
            .map(|issued| issued.question.reference_answer.as_str())
            .filter(|r| !r.trim().is_empty());

        let grade = self
            .grade(&submission.question, rubric, &submission.answer)
            .await;

        let mut mastery = self
            .stores
            .mastery
            .get_mastery_map(student_id, subject)
            .await?;
        let mastery_before = lookup_mastery(&mastery, topic).unwrap_or(DEFAULT_PRIOR);
        let mastery_after = self.updater.update(mastery_before, grade.score);
        mastery.retain(|name, _| !name.eq_ignore_ascii_case(topic));
        mastery.insert(topic.to_string(), mastery_after);

        let step = LearningStep {
            session_id: cursor.session.id.clone(),
            sequence: cursor.sequence + 1,
            student_id: student_id.to_string(),
            topic: topic.to_string(),
            difficulty: submission.difficulty,
            score: grade.score,
            feedback: grade.feedback.clone(),
            mastery_before,
            mastery_after,
            action_taken: cursor.action_for(topic, submission.difficulty),
            reward: grade.score,
            recorded_at: Utc::now(),
        };

        Ok(PendingStep {
            question: submission.question.clone(),
            answer: submission.answer.clone(),
            grade,
            step,
            mastery,
        })
    }

    async fn flush_stale(
        &self,
        cursor: &mut SessionCursor,
        stale: PendingStep,
    ) -> Result<(), TutorError> {
        let subject = cursor.session.subject.clone();
        match self.persist(&subject, &stale.step).await {
            Ok(()) => {
                cursor.sequence = stale.step.sequence;
                Ok(())
            }
            Err(err) => {
                cursor.pending = Some(stale);
                Err(err)
            }
        }
    }

    async fn persist(&self, subject: &str, step: &LearningStep) -> Result<(), TutorError> {
        self.stores
            .mastery
            .set_mastery(&step.student_id, subject, &step.topic, step.mastery_after)
            .await
            .map_err(|source| TutorError::Persistence {
                stage: PersistStage::Mastery,
                source,
            })?;
        self.stores
            .sessions
            .append_learning_step(step)
            .await
            .map_err(|source| TutorError::Persistence {
                stage: PersistStage::LearningStep,
                source,
            })
    }

    async fn grade(&self, question: &str, rubric: Option<&str>, answer: &str) -> Grade {
        let timeout = self.config.grading_timeout;
        match tokio::time::timeout(timeout, self.grader.grade(question, rubric, answer)).await {
            Ok(Ok(grade)) => Grade {
                score: normalize_score(grade.score),
                feedback: grade.feedback,
            },
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "grading failed, scoring attempt as 0");
                err.into_grade()
            }
            Err(_) => {
                let err = GradingError::TimedOut(timeout.as_millis() as u64);
                tracing::warn!(error = %err, "grading timed out, scoring attempt as 0");
                err.into_grade()
            }
        }
    }

    async fn next_step(
        &self,
        student_id: &str,
        subject: &str,
        attempted: &str,
        grade: &Grade,
        mastery: &HashMap<String, f64>,
    ) -> NextStep {
        if !grade.is_correct() {
            if let Some(bottleneck) = self
                .remediation
                .find_bottleneck(student_id, subject, attempted)
                .await
            {
                tracing::info!(student_id, subject, failed = attempted, bottleneck = %bottleneck, "remediating prerequisite");
                return self.remediation_step(subject, &bottleneck, mastery).await;
            }
        }
        self.policy_step(subject, attempted, mastery).await
    }

    async fn remediation_step(
        &self,
        subject: &str,
        bottleneck: &str,
        mastery: &HashMap<String, f64>,
    ) -> NextStep {
        let window = ObservationWindow::new(self.projector.project(subject, bottleneck).await);
        let observation = window.observe(mastery);
        let slot = window.slot_of(bottleneck).unwrap_or(0);
        let decision = Decision::from_action(
            Action::new(slot, Difficulty::Easy),
            DecisionSource::Remediation,
        );
        NextStep {
            topic: bottleneck.to_string(),
            decision,
            window,
            observation,
        }
    }

    async fn policy_step(
        &self,
        subject: &str,
        anchor: &str,
        mastery: &HashMap<String, f64>,
    ) -> NextStep {
        let window = ObservationWindow::new(self.projector.project(subject, anchor).await);
        let observation = window.observe(mastery);
        let decision = self.agent.decide(&observation).await;

        let (topic, decision) = match window.topic_at(decision.topic_slot) {
            Some(topic) => (topic.to_string(), decision),
            None => {
                tracing::debug!(
                    slot = decision.topic_slot,
                    anchor,
                    "decision points at padding, substituting anchor"
                );
                let fixed =
                    Decision::from_action(Action::new(0, decision.difficulty), decision.source);
                (window.anchor().unwrap_or(anchor).to_string(), fixed)
            }
        };

        NextStep {
            topic,
            decision,
            window,
            observation,
        }
    }

    async fn question_for(&self, subject: &str, topic: &str, difficulty: Difficulty) -> Question {
        let timeout = self.config.question_timeout;
        match tokio::time::timeout(timeout, self.questions.generate(subject, topic, difficulty))
            .await
        {
            Ok(Ok(question)) => question,
            Ok(Err(err)) => {
                tracing::warn!(subject, topic, error = %err, "question generation failed, using fallback question");
                Question::fallback(topic)
            }
            Err(_) => {
                tracing::warn!(subject, topic, "question generation timed out, using fallback question");
                Question::fallback(topic)
            }
        }
    }
}

/// Generic topic universe used when no assessment topics are known.
pub fn placeholder_topics() -> Vec<String> {
    (1..=WINDOW_SIZE).map(|i| format!("Topic {i}")).collect()
}
