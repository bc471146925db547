use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{GraphStore, MasteryStore};
use crate::tutor::config::{MASTERY_THRESHOLD, UNRECORDED_PREREQUISITE_MASTERY};
use crate::tutor::projection::lookup_mastery;

/// Finds the shallowest unmastered prerequisite of a failed topic.
#[derive(Clone)]
pub struct RemediationSelector {
    graph: Arc<dyn GraphStore>,
    mastery: Arc<dyn MasteryStore>,
}

impl RemediationSelector {
    pub fn new(graph: Arc<dyn GraphStore>, mastery: Arc<dyn MasteryStore>) -> Self {
        Self { graph, mastery }
    }

    pub async fn find_bottleneck(
        &self,
        student_id: &str,
        subject: &str,
        failed_topic: &str,
    ) -> Option<String> {
        let prerequisites = match self
            .graph
            .get_direct_prerequisites(subject, failed_topic)
            .await
        {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(subject, topic = failed_topic, error = %err, "prerequisite lookup failed, skipping remediation");
                return None;
            }
        };
        if prerequisites.is_empty() {
            return None;
        }

        let mastery = match self.mastery.get_mastery_map(student_id, subject).await {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(student_id, subject, error = %err, "mastery lookup failed, treating prerequisites as unlearned");
                HashMap::new()
            }
        };

        first_unmastered(&prerequisites, &mastery)
    }
}

/// First prerequisite in graph order below the mastery threshold.
pub fn first_unmastered(prerequisites: &[String], mastery: &HashMap<String, f64>) -> Option<String> {
    prerequisites
        .iter()
        .find(|topic| {
            lookup_mastery(mastery, topic).unwrap_or(UNRECORDED_PREREQUISITE_MASTERY)
                < MASTERY_THRESHOLD
        })
        .cloned()
}
