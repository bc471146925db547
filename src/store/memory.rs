//! In-process store backend.
//!
//! Topic and subject lookups are case-insensitive; names are returned the way
//! they were first recorded.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    topics_from_json, AssessmentStore, GraphStore, MasteryStore, SessionStore, StoreError,
};
use crate::tutor::types::{LearningStep, Session};

#[derive(Debug, Default)]
struct SubjectGraph {
    names: HashMap<String, String>,
    order: Vec<String>,
    prerequisites: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl SubjectGraph {
    fn ensure(&mut self, topic: &str) -> String {
        let key = normalize(topic);
        if !self.names.contains_key(&key) {
            self.names.insert(key.clone(), topic.trim().to_string());
            self.order.push(key.clone());
        }
        key
    }

    fn name(&self, key: &str) -> String {
        self.names.get(key).cloned().unwrap_or_else(|| key.to_string())
    }

    fn walk(
        &self,
        adjacency: &HashMap<String, Vec<String>>,
        start: &str,
        max_hops: usize,
    ) -> Vec<(String, usize)> {
        let start = normalize(start);
        let mut visited: HashSet<String> = HashSet::from([start.clone()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(start, 0)]);
        let mut found = Vec::new();

        while let Some((node, hop)) = queue.pop_front() {
            if hop >= max_hops {
                continue;
            }
            let Some(next) = adjacency.get(&node) else {
                continue;
            };
            for neighbour in next {
                if visited.insert(neighbour.clone()) {
                    found.push((self.name(neighbour), hop + 1));
                    queue.push_back((neighbour.clone(), hop + 1));
                }
            }
        }

        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        found
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    graphs: RwLock<HashMap<String, SubjectGraph>>,
    mastery: RwLock<HashMap<(String, String), HashMap<String, f64>>>,
    sessions: RwLock<HashMap<String, Session>>,
    steps: RwLock<Vec<LearningStep>>,
    assessments: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn get_direct_prerequisites(
        &self,
        subject: &str,
        topic: &str,
    ) -> Result<Vec<String>, StoreError> {
        let graphs = self.graphs.read();
        let Some(graph) = graphs.get(&normalize(subject)) else {
            return Ok(Vec::new());
        };
        Ok(graph
            .prerequisites
            .get(&normalize(topic))
            .map(|keys| keys.iter().map(|k| graph.name(k)).collect())
            .unwrap_or_default())
    }

    async fn get_ancestors_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        let graphs = self.graphs.read();
        Ok(graphs
            .get(&normalize(subject))
            .map(|g| g.walk(&g.prerequisites, topic, max_hops))
            .unwrap_or_default())
    }

    async fn get_descendants_by_distance(
        &self,
        subject: &str,
        topic: &str,
        max_hops: usize,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        let graphs = self.graphs.read();
        Ok(graphs
            .get(&normalize(subject))
            .map(|g| g.walk(&g.dependents, topic, max_hops))
            .unwrap_or_default())
    }

    async fn ensure_topic(&self, subject: &str, topic: &str) -> Result<(), StoreError> {
        let mut graphs = self.graphs.write();
        graphs.entry(normalize(subject)).or_default().ensure(topic);
        Ok(())
    }

    async fn ensure_prerequisite_edge(
        &self,
        subject: &str,
        topic: &str,
        prerequisite: &str,
    ) -> Result<(), StoreError> {
        let mut graphs = self.graphs.write();
        let graph = graphs.entry(normalize(subject)).or_default();
        let dependent = graph.ensure(topic);
        let prerequisite = graph.ensure(prerequisite);
        if dependent == prerequisite {
            return Ok(());
        }

        let prereqs = graph.prerequisites.entry(dependent.clone()).or_default();
        if !prereqs.contains(&prerequisite) {
            prereqs.push(prerequisite.clone());
        }
        let dependents = graph.dependents.entry(prerequisite).or_default();
        if !dependents.contains(&dependent) {
            dependents.push(dependent);
        }
        Ok(())
    }

    async fn subject_topics(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        let graphs = self.graphs.read();
        Ok(graphs
            .get(&normalize(subject))
            .map(|g| g.order.iter().map(|k| g.name(k)).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MasteryStore for InMemoryStore {
    async fn get_mastery_map(
        &self,
        student_id: &str,
        subject: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let key = (student_id.to_string(), subject.to_string());
        Ok(self.mastery.read().get(&key).cloned().unwrap_or_default())
    }

    async fn set_mastery(
        &self,
        student_id: &str,
        subject: &str,
        topic: &str,
        value: f64,
    ) -> Result<(), StoreError> {
        let key = (student_id.to_string(), subject.to_string());
        let mut mastery = self.mastery.write();
        let topics = mastery.entry(key).or_default();
        // First recorded spelling keeps the record.
        let wanted = normalize(topic);
        let recorded = topics.keys().find(|name| normalize(name) == wanted).cloned();
        topics.insert(recorded.unwrap_or_else(|| topic.to_string()), value);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Custom(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn append_learning_step(&self, step: &LearningStep) -> Result<(), StoreError> {
        self.steps.write().push(step.clone());
        Ok(())
    }

    async fn recent_learning_steps(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>, StoreError> {
        Ok(self
            .steps
            .read()
            .iter()
            .rev()
            .filter(|s| s.student_id == student_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn session_steps(&self, session_id: &str) -> Result<Vec<LearningStep>, StoreError> {
        let mut steps: Vec<LearningStep> = self
            .steps
            .read()
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }
}

#[async_trait]
impl AssessmentStore for InMemoryStore {
    async fn register_assessment(
        &self,
        assessment_id: &str,
        topics: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.assessments
            .write()
            .insert(assessment_id.to_string(), topics.clone());
        Ok(())
    }

    async fn assessment_topics(&self, assessment_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .assessments
            .read()
            .get(assessment_id)
            .map(topics_from_json)
            .unwrap_or_default())
    }
}
