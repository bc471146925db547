//! Graph-local observation window around an anchor topic.
//!
//! Slot 0 is the anchor, followed by up to four prerequisites and up to four
//! dependents, nearest first. The projector's output has variable length;
//! [`ObservationWindow`] pads it to exactly [`WINDOW_SIZE`] slots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::store::GraphStore;
use crate::tutor::config::{
    DEFAULT_PRIOR, MAX_HOPS, NEIGHBOURS_PER_DIRECTION, PADDING_MASTERY, WINDOW_SIZE,
};

#[derive(Clone)]
pub struct GraphProjector {
    graph: Arc<dyn GraphStore>,
}

impl GraphProjector {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// Ordered topic names, anchor first, at most `WINDOW_SIZE` long.
    pub async fn project(&self, subject: &str, anchor: &str) -> Vec<String> {
        let (ancestors, descendants) = tokio::join!(
            self.graph.get_ancestors_by_distance(subject, anchor, MAX_HOPS),
            self.graph.get_descendants_by_distance(subject, anchor, MAX_HOPS),
        );

        match (ancestors, descendants) {
            (Ok(ancestors), Ok(descendants)) => assemble(anchor, ancestors, descendants),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(
                    subject,
                    anchor,
                    error = %err,
                    "graph store unavailable, projecting anchor only"
                );
                vec![anchor.to_string()]
            }
        }
    }
}

pub fn assemble(
    anchor: &str,
    ancestors: Vec<(String, usize)>,
    descendants: Vec<(String, usize)>,
) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut topics = Vec::with_capacity(WINDOW_SIZE);

    let candidates = std::iter::once(anchor.to_string())
        .chain(nearest(ancestors))
        .chain(nearest(descendants));

    for topic in candidates {
        if seen.insert(topic.trim().to_lowercase()) {
            topics.push(topic);
        }
    }

    topics.truncate(WINDOW_SIZE);
    topics
}

fn nearest(mut neighbours: Vec<(String, usize)>) -> Vec<String> {
    neighbours.retain(|(_, hop)| (1..=MAX_HOPS).contains(hop));
    neighbours.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    neighbours
        .into_iter()
        .take(NEIGHBOURS_PER_DIRECTION)
        .map(|(name, _)| name)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowSlot {
    Topic(String),
    Padding,
}

/// Pads (or truncates) to exactly `WINDOW_SIZE` slots. Idempotent.
pub fn pad_slots(mut slots: Vec<WindowSlot>) -> Vec<WindowSlot> {
    slots.truncate(WINDOW_SIZE);
    slots.resize(WINDOW_SIZE, WindowSlot::Padding);
    slots
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationWindow {
    slots: Vec<WindowSlot>,
}

impl ObservationWindow {
    pub fn new(projected: Vec<String>) -> Self {
        Self {
            slots: pad_slots(projected.into_iter().map(WindowSlot::Topic).collect()),
        }
    }

    pub fn slots(&self) -> &[WindowSlot] {
        &self.slots
    }

    pub fn anchor(&self) -> Option<&str> {
        self.topic_at(0)
    }

    /// `None` for padding slots and out-of-range indices.
    pub fn topic_at(&self, slot: usize) -> Option<&str> {
        match self.slots.get(slot) {
            Some(WindowSlot::Topic(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn slot_of(&self, topic: &str) -> Option<usize> {
        let wanted = topic.trim().to_lowercase();
        self.slots.iter().position(|slot| match slot {
            WindowSlot::Topic(name) => name.trim().to_lowercase() == wanted,
            WindowSlot::Padding => false,
        })
    }

    pub fn topic_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, WindowSlot::Topic(_)))
            .count()
    }

    /// Mastery per slot; unattempted topics read as the default prior.
    pub fn observe(&self, mastery: &HashMap<String, f64>) -> Vec<f64> {
        self.slots
            .iter()
            .map(|slot| match slot {
                WindowSlot::Topic(name) => lookup_mastery(mastery, name).unwrap_or(DEFAULT_PRIOR),
                WindowSlot::Padding => PADDING_MASTERY,
            })
            .collect()
    }
}

/// Exact match first, then case-insensitive.
pub fn lookup_mastery(mastery: &HashMap<String, f64>, topic: &str) -> Option<f64> {
    if let Some(value) = mastery.get(topic) {
        return Some(*value);
    }
    let wanted = topic.trim().to_lowercase();
    mastery
        .iter()
        .find(|(name, _)| name.trim().to_lowercase() == wanted)
        .map(|(_, value)| *value)
}
