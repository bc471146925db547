use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tutor_backend::store::{InMemoryStore, MasteryStore, SessionStore, Stores};
use tutor_backend::tutor::{
    AnswerSubmission, DecisionSource, Difficulty, PersistStage, PolicyHandle, TutorConfig,
    TutorError, TutorOrchestrator,
};

mod common;

use common::{
    anchor_medium_policy, padding_vector, test_config, tutor_with, tutor_with_config, DownGraph,
    FixedPolicy, FlakyStore, GraderScript, OfflineQuestions, ScriptedGrader,
};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn answer(session_id: &str, student_id: &str, topic: &str, difficulty: Difficulty) -> AnswerSubmission {
    AnswerSubmission {
        session_id: session_id.to_string(),
        student_id: student_id.to_string(),
        question: format!("[{difficulty}] Describe {topic}."),
        answer: "something".to_string(),
        topic: topic.to_string(),
        difficulty,
    }
}

async fn cs_exam(tutor: &TutorOrchestrator) {
    tutor
        .register_assessment("exam-1", &json!(["Recursion", "Loops", "Arrays"]))
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_attempt_remediates_unmastered_prerequisite() {
    let store = Arc::new(InMemoryStore::new());
    let grader = ScriptedGrader::scoring(0.2);
    let tutor = tutor_with(
        Stores::from_backend(store.clone()),
        anchor_medium_policy(),
        grader.clone(),
    );
    cs_exam(&tutor).await;

    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();
    assert_eq!(start.topic, "Recursion");
    assert_eq!(start.difficulty, Difficulty::Medium);
    assert_eq!(start.decision_source, DecisionSource::Policy);
    assert_eq!(start.observation, padding_vector(0.5));
    assert_eq!(start.available_topics, vec!["Recursion", "Loops", "Arrays"]);

    tutor
        .register_prerequisite("CS", "Recursion", "Loops")
        .await
        .unwrap();

    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Recursion", Difficulty::Medium))
        .await
        .unwrap();

    assert!(approx(outcome.score, 0.2));
    assert!(approx(outcome.mastery_before, 0.5));
    assert!(approx(outcome.mastery_after, 0.425));
    assert_eq!(outcome.next_topic, "Loops");
    assert_eq!(outcome.next_difficulty, Difficulty::Easy);
    assert_eq!(outcome.decision_source, DecisionSource::Remediation);
    assert_eq!(outcome.next_question.text, "[Easy] Describe Loops.");

    let mut expected = vec![0.5, 0.425];
    expected.extend(std::iter::repeat(0.1).take(7));
    assert_eq!(outcome.observation.len(), 9);
    for (got, want) in outcome.observation.iter().zip(&expected) {
        assert!(approx(*got, *want), "observation {:?}", outcome.observation);
    }

    let logs = tutor.recent_learning_steps("s1", 20).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].sequence, 1);
    assert_eq!(logs[0].topic, "Recursion");
    assert_eq!(logs[0].action_taken, 1);
    assert!(approx(logs[0].reward, 0.2));

    let mastery = store.get_mastery_map("s1", "CS").await.unwrap();
    assert!(approx(mastery["Recursion"], 0.425));
    assert_eq!(grader.calls(), 1);
}

#[tokio::test]
async fn mixed_topic_spellings_update_one_mastery_record() {
    let store = Arc::new(InMemoryStore::new());
    let grader = ScriptedGrader::scoring(0.0);
    let tutor = tutor_with(
        Stores::from_backend(store.clone()),
        anchor_medium_policy(),
        grader.clone(),
    );
    tutor
        .register_prerequisite("CS", "Recursion", "loops")
        .await
        .unwrap();
    tutor
        .register_assessment("exam-1", &json!(["Recursion", "Loops"]))
        .await
        .unwrap();
    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();

    let first = tutor
        .submit_answer(answer(&start.session_id, "s1", "Loops", Difficulty::Medium))
        .await
        .unwrap();
    assert!(approx(first.mastery_after, 0.375));

    let failed = tutor
        .submit_answer(answer(&start.session_id, "s1", "Recursion", Difficulty::Medium))
        .await
        .unwrap();
    assert_eq!(failed.decision_source, DecisionSource::Remediation);
    assert_eq!(failed.next_topic, "loops");

    grader.set(GraderScript::Score(1.0));
    let remediated = tutor
        .submit_answer(answer(&start.session_id, "s1", "loops", Difficulty::Easy))
        .await
        .unwrap();
    assert!(approx(remediated.mastery_before, 0.375));
    assert!(approx(remediated.mastery_after, 0.53125));

    let again = tutor
        .submit_answer(answer(&start.session_id, "s1", "Loops", Difficulty::Medium))
        .await
        .unwrap();
    assert!(approx(again.mastery_before, 0.53125));
    assert!(approx(again.mastery_after, 0.6484375));

    let mastery = store.get_mastery_map("s1", "CS").await.unwrap();
    let loops: Vec<_> = mastery
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("loops"))
        .collect();
    assert_eq!(loops.len(), 1, "mastery records: {mastery:?}");
    assert!(approx(*loops[0].1, 0.6484375));
}

#[tokio::test]
async fn correct_attempt_consults_policy() {
    let store = Arc::new(InMemoryStore::new());
    let tutor = tutor_with(
        Stores::from_backend(store.clone()),
        anchor_medium_policy(),
        ScriptedGrader::scoring(0.9),
    );
    cs_exam(&tutor).await;
    tutor
        .register_prerequisite("CS", "Recursion", "Loops")
        .await
        .unwrap();

    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();
    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Recursion", Difficulty::Medium))
        .await
        .unwrap();

    assert_eq!(outcome.decision_source, DecisionSource::Policy);
    assert_eq!(outcome.next_topic, "Recursion");
    assert!(approx(outcome.mastery_after, 0.6));
}

#[tokio::test]
async fn grading_timeout_scores_zero() {
    let grader = ScriptedGrader::new(GraderScript::Hang);
    let tutor = tutor_with(Stores::in_memory(), anchor_medium_policy(), grader);

    let start = tutor.start_session("s1", "Physics", None).await.unwrap();
    assert_eq!(start.topic, "Topic 1");

    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();

    assert_eq!(outcome.score, 0.0);
    assert!(outcome.feedback.contains("timed out"), "{}", outcome.feedback);
    assert!(approx(outcome.mastery_after, 0.375));
}

#[tokio::test]
async fn unparseable_grading_scores_zero_with_raw_feedback() {
    let grader = ScriptedGrader::new(GraderScript::Raw("I cannot grade this".into()));
    let tutor = tutor_with(Stores::in_memory(), anchor_medium_policy(), grader.clone());

    let start = tutor.start_session("s1", "Physics", None).await.unwrap();
    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();
    assert_eq!(outcome.score, 0.0);
    assert_eq!(outcome.feedback, "I cannot grade this");

    grader.set(GraderScript::Raw(r#"```json
{"score": 8, "feedback": "good"}
```"#
        .into()));
    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Hard))
        .await
        .unwrap();
    assert!(approx(outcome.score, 0.8));
    assert_eq!(outcome.feedback, "good");
}

#[tokio::test]
async fn unavailable_grader_scores_zero() {
    let tutor = tutor_with(
        Stores::in_memory(),
        anchor_medium_policy(),
        ScriptedGrader::new(GraderScript::Unavailable),
    );
    let start = tutor.start_session("s1", "Physics", None).await.unwrap();
    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Easy))
        .await
        .unwrap();
    assert_eq!(outcome.score, 0.0);
    assert!(outcome.feedback.contains("offline"));
}

#[tokio::test]
async fn failed_log_write_is_retried_without_regrading() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = FlakyStore::new(inner.clone());
    let grader = ScriptedGrader::scoring(0.2);
    let tutor = tutor_with(flaky.stores(), anchor_medium_policy(), grader.clone());
    cs_exam(&tutor).await;

    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();
    flaky.fail_step_writes.store(true, Ordering::SeqCst);

    let submission = answer(&start.session_id, "s1", "Recursion", Difficulty::Medium);
    let err = tutor.submit_answer(submission.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        TutorError::Persistence {
            stage: PersistStage::LearningStep,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(inner.step_count(), 0);

    flaky.fail_step_writes.store(false, Ordering::SeqCst);
    let outcome = tutor.submit_answer(submission).await.unwrap();

    assert_eq!(grader.calls(), 1);
    assert_eq!(inner.step_count(), 1);
    assert!(approx(outcome.mastery_after, 0.425));
    let mastery = inner.get_mastery_map("s1", "CS").await.unwrap();
    assert!(approx(mastery["Recursion"], 0.425));
}

#[tokio::test]
async fn failed_mastery_write_keeps_log_untouched() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = FlakyStore::new(inner.clone());
    let tutor = tutor_with(
        flaky.stores(),
        anchor_medium_policy(),
        ScriptedGrader::scoring(1.0),
    );

    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    flaky.fail_mastery_writes.store(true, Ordering::SeqCst);

    let err = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Easy))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TutorError::Persistence {
            stage: PersistStage::Mastery,
            ..
        }
    ));
    assert_eq!(inner.step_count(), 0);
    assert!(inner.get_mastery_map("s1", "CS").await.unwrap().is_empty());
}

#[tokio::test]
async fn mastery_read_failure_during_update_is_fatal() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = FlakyStore::new(inner.clone());
    let tutor = tutor_with(
        flaky.stores(),
        anchor_medium_policy(),
        ScriptedGrader::scoring(0.7),
    );

    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    flaky.fail_mastery_reads.store(true, Ordering::SeqCst);

    let err = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Easy))
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::Store(_)));
    assert_eq!(inner.step_count(), 0);
}

#[tokio::test]
async fn graph_outage_degrades_to_anchor_only() {
    let inner = Arc::new(InMemoryStore::new());
    let stores = Stores {
        graph: Arc::new(DownGraph),
        mastery: inner.clone(),
        sessions: inner.clone(),
        assessments: inner.clone(),
    };
    let tutor = tutor_with(stores, anchor_medium_policy(), ScriptedGrader::scoring(0.0));

    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    assert_eq!(start.topic, "Topic 1");
    assert_eq!(start.observation, padding_vector(0.5));

    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();
    assert_eq!(outcome.decision_source, DecisionSource::Policy);
    assert_eq!(outcome.next_topic, "Topic 1");
    assert_eq!(outcome.observation, padding_vector(0.375));
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let tutor = tutor_with(
        Stores::in_memory(),
        anchor_medium_policy(),
        ScriptedGrader::scoring(1.0),
    );
    let err = tutor
        .submit_answer(answer("missing", "s1", "Topic 1", Difficulty::Easy))
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::SessionNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn blank_and_unknown_topics_fall_back_to_issued_topic() {
    let store = Arc::new(InMemoryStore::new());
    let tutor = tutor_with(
        Stores::from_backend(store.clone()),
        anchor_medium_policy(),
        ScriptedGrader::scoring(0.9),
    );
    cs_exam(&tutor).await;

    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();
    tutor
        .submit_answer(answer(&start.session_id, "s1", "  ", Difficulty::Medium))
        .await
        .unwrap();
    tutor
        .submit_answer(answer(&start.session_id, "s1", "Quantum Gravity", Difficulty::Medium))
        .await
        .unwrap();
    tutor
        .submit_answer(answer(&start.session_id, "s1", "arrays", Difficulty::Medium))
        .await
        .unwrap();

    let steps = store.session_steps(&start.session_id).await.unwrap();
    let topics: Vec<&str> = steps.iter().map(|s| s.topic.as_str()).collect();
    assert_eq!(topics, vec!["Recursion", "Recursion", "Arrays"]);
    let sequences: Vec<u64> = steps.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn question_generator_failure_uses_fallback_text() {
    let tutor = TutorOrchestrator::new(
        test_config(),
        Stores::in_memory(),
        Arc::new(anchor_medium_policy()),
        Arc::new(OfflineQuestions),
        ScriptedGrader::scoring(1.0),
    );
    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    assert_eq!(start.question.text, "Explain the key concepts of Topic 1.");
    assert!(start.question.reference_answer.is_empty());
}

#[tokio::test]
async fn out_of_range_policy_action_uses_anchor_easy() {
    let tutor = tutor_with(
        Stores::in_memory(),
        PolicyHandle::with_model(Arc::new(FixedPolicy(99))),
        ScriptedGrader::scoring(1.0),
    );
    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    assert_eq!(start.topic, "Topic 1");
    assert_eq!(start.difficulty, Difficulty::Easy);
    assert_eq!(start.decision_source, DecisionSource::Fallback);
}

#[tokio::test]
async fn padding_slot_action_substitutes_anchor() {
    // slot 5, Hard
    let tutor = tutor_with(
        Stores::in_memory(),
        PolicyHandle::with_model(Arc::new(FixedPolicy(17))),
        ScriptedGrader::scoring(1.0),
    );
    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    assert_eq!(start.topic, "Topic 1");
    assert_eq!(start.difficulty, Difficulty::Hard);
    assert_eq!(start.decision_source, DecisionSource::Policy);
}

#[tokio::test]
async fn missing_policy_falls_back_to_random_choice() {
    let tutor = tutor_with(
        Stores::in_memory(),
        PolicyHandle::disabled(),
        ScriptedGrader::scoring(1.0),
    );
    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    assert_eq!(start.decision_source, DecisionSource::Fallback);
    assert_eq!(start.topic, "Topic 1");
}

#[tokio::test]
async fn ended_session_resumes_from_store() {
    let store = Arc::new(InMemoryStore::new());
    let tutor = tutor_with(
        Stores::from_backend(store.clone()),
        anchor_medium_policy(),
        ScriptedGrader::scoring(0.8),
    );
    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();

    assert!(tutor.end_session(&start.session_id));
    assert!(!tutor.end_session(&start.session_id));

    tutor
        .submit_answer(answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();
    let steps = store.session_steps(&start.session_id).await.unwrap();
    assert_eq!(steps.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![1, 2]);
}

fn evicting_tutor(stores: Stores, grader: Arc<ScriptedGrader>) -> TutorOrchestrator {
    let config = TutorConfig {
        session_idle_ttl: Duration::ZERO,
        ..test_config()
    };
    tutor_with_config(config, stores, anchor_medium_policy(), grader)
}

#[tokio::test]
async fn idle_cursor_is_evicted_and_session_resumes() {
    let store = Arc::new(InMemoryStore::new());
    let tutor = evicting_tutor(Stores::from_backend(store.clone()), ScriptedGrader::scoring(0.8));

    let first = tutor.start_session("s1", "CS", None).await.unwrap();
    tutor
        .submit_answer(answer(&first.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();

    let second = tutor.start_session("s2", "CS", None).await.unwrap();
    assert_eq!(tutor.active_sessions(), 1);
    assert!(!tutor.end_session(&first.session_id));

    let resumed = tutor
        .submit_answer(answer(&first.session_id, "s1", "Topic 1", Difficulty::Medium))
        .await
        .unwrap();
    assert!(approx(resumed.mastery_before, 0.575));
    let steps = store.session_steps(&first.session_id).await.unwrap();
    assert_eq!(steps.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert!(!tutor.end_session(&second.session_id));
}

#[tokio::test]
async fn cursor_with_unpersisted_step_survives_eviction() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = FlakyStore::new(inner.clone());
    let grader = ScriptedGrader::scoring(0.8);
    let tutor = evicting_tutor(flaky.stores(), grader.clone());

    let start = tutor.start_session("s1", "CS", None).await.unwrap();
    flaky.fail_step_writes.store(true, Ordering::SeqCst);
    let submission = answer(&start.session_id, "s1", "Topic 1", Difficulty::Medium);
    assert!(tutor.submit_answer(submission.clone()).await.is_err());

    tutor.start_session("s2", "CS", None).await.unwrap();
    assert_eq!(tutor.active_sessions(), 2);

    flaky.fail_step_writes.store(false, Ordering::SeqCst);
    tutor.submit_answer(submission).await.unwrap();
    assert_eq!(grader.calls(), 1);
    assert_eq!(inner.step_count(), 1);
}

#[tokio::test]
async fn progress_lists_graph_topics_with_recorded_mastery() {
    let tutor = tutor_with(
        Stores::in_memory(),
        anchor_medium_policy(),
        ScriptedGrader::scoring(0.2),
    );
    cs_exam(&tutor).await;
    let start = tutor.start_session("s1", "CS", Some("exam-1")).await.unwrap();
    tutor
        .submit_answer(answer(&start.session_id, "s1", "Recursion", Difficulty::Medium))
        .await
        .unwrap();

    let progress = tutor.progress("s1", "CS").await.unwrap();
    let recursion = progress.iter().find(|p| p.topic == "Recursion").unwrap();
    assert!(approx(recursion.mastery.unwrap(), 0.425));
    let loops = progress.iter().find(|p| p.topic == "Loops").unwrap();
    assert_eq!(loops.mastery, None);
}

#[tokio::test]
async fn dict_assessment_topics_skip_unknown() {
    let tutor = tutor_with(
        Stores::in_memory(),
        anchor_medium_policy(),
        ScriptedGrader::scoring(1.0),
    );
    let topics = tutor
        .register_assessment("exam-2", &json!({"q1": "Optics", "q2": "Unknown", "q3": "Optics"}))
        .await
        .unwrap();
    assert_eq!(topics, vec!["Optics"]);

    let topics = tutor
        .register_assessment("exam-3", &json!({"q1": "Unknown"}))
        .await
        .unwrap();
    assert_eq!(topics, vec!["General"]);
}

#[tokio::test]
async fn remediation_overrides_without_a_policy() {
    let tutor = tutor_with(
        Stores::in_memory(),
        PolicyHandle::disabled(),
        ScriptedGrader::scoring(0.2),
    );
    tutor
        .register_assessment("E1", &json!(["Recursion", "Loops", "Arrays"]))
        .await
        .unwrap();

    let start = tutor.start_session("s1", "CS101", Some("E1")).await.unwrap();
    assert_eq!(start.topic, "Recursion");
    assert_eq!(start.observation, padding_vector(0.5));
    assert_eq!(start.decision_source, DecisionSource::Fallback);

    tutor
        .register_prerequisite("CS101", "Recursion", "Loops")
        .await
        .unwrap();
    let outcome = tutor
        .submit_answer(answer(&start.session_id, "s1", "Recursion", start.difficulty))
        .await
        .unwrap();

    assert!(approx(outcome.mastery_after, 0.425));
    assert_eq!(outcome.next_topic, "Loops");
    assert_eq!(outcome.next_difficulty, Difficulty::Easy);
    assert_eq!(outcome.decision_source, DecisionSource::Remediation);
}
