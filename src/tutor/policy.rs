//! Frozen decision policy and the agent wrapped around it.
//!
//! The policy artifact is a JSON export of a trained actor network: a stack
//! of dense layers mapping the 9-slot mastery observation to logits over the
//! 27 combined (topic slot, difficulty) actions. Hidden layers use `tanh`.
//! Actions are sampled from the softmax of the logits.
//!
//! The artifact is loaded at most once per [`PolicyHandle`]; a failed load is
//! remembered and every later decision uses the random fallback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::tutor::config::{ACTION_COUNT, DIFFICULTY_COUNT, WINDOW_SIZE};
use crate::tutor::types::{Action, Decision, DecisionSource, Difficulty};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy artifact not found at {0}")]
    Missing(PathBuf),
    #[error("failed to read policy artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed policy artifact: {0}")]
    Malformed(String),
    #[error("invalid policy artifact json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("observation has {actual} entries, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
}

pub trait PolicyModel: Send + Sync {
    /// Returns a raw combined action, expected in `[0, ACTION_COUNT)`.
    fn predict(&self, observation: &[f64]) -> Result<usize, PolicyError>;
}

#[async_trait]
pub trait PolicyLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn PolicyModel>, PolicyError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Row-major `[out][in]`.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl DenseLayer {
    fn input_dim(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn output_dim(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpPolicy {
    pub observation_dim: usize,
    pub action_count: usize,
    pub layers: Vec<DenseLayer>,
}

impl MlpPolicy {
    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.observation_dim != WINDOW_SIZE {
            return Err(PolicyError::Malformed(format!(
                "observation_dim {} != {WINDOW_SIZE}",
                self.observation_dim
            )));
        }
        if self.action_count != ACTION_COUNT {
            return Err(PolicyError::Malformed(format!(
                "action_count {} != {ACTION_COUNT}",
                self.action_count
            )));
        }
        if self.layers.is_empty() {
            return Err(PolicyError::Malformed("no layers".to_string()));
        }

        let mut expected_in = self.observation_dim;
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.output_dim() == 0 || layer.bias.len() != layer.output_dim() {
                return Err(PolicyError::Malformed(format!(
                    "layer {idx}: bias length {} does not match {} outputs",
                    layer.bias.len(),
                    layer.output_dim()
                )));
            }
            if layer.input_dim() != expected_in
                || layer.weights.iter().any(|row| row.len() != expected_in)
            {
                return Err(PolicyError::Malformed(format!(
                    "layer {idx}: expected {expected_in} inputs"
                )));
            }
            let finite = layer.bias.iter().all(|v| v.is_finite())
                && layer.weights.iter().flatten().all(|v| v.is_finite());
            if !finite {
                return Err(PolicyError::Malformed(format!(
                    "layer {idx}: non-finite parameter"
                )));
            }
            expected_in = layer.output_dim();
        }

        if expected_in != self.action_count {
            return Err(PolicyError::Malformed(format!(
                "final layer emits {expected_in} logits, expected {}",
                self.action_count
            )));
        }
        Ok(())
    }

    pub fn logits(&self, observation: &[f64]) -> Result<Vec<f64>, PolicyError> {
        if observation.len() != self.observation_dim {
            return Err(PolicyError::ShapeMismatch {
                expected: self.observation_dim,
                actual: observation.len(),
            });
        }
        let last = self.layers.len() - 1;
        let mut activations = observation.to_vec();
        for (idx, layer) in self.layers.iter().enumerate() {
            activations = layer.forward(&activations);
            if idx < last {
                activations.iter_mut().for_each(|v| *v = v.tanh());
            }
        }
        Ok(activations)
    }

    pub fn probabilities(&self, observation: &[f64]) -> Result<Vec<f64>, PolicyError> {
        Ok(softmax(&self.logits(observation)?))
    }

    pub fn sample_with<R: Rng>(
        &self,
        observation: &[f64],
        rng: &mut R,
    ) -> Result<usize, PolicyError> {
        let probs = self.probabilities(observation)?;
        let draw: f64 = rng.random();
        let mut cumulative = 0.0;
        for (action, p) in probs.iter().enumerate() {
            cumulative += p;
            if draw < cumulative {
                return Ok(action);
            }
        }
        Ok(probs.len().saturating_sub(1))
    }
}

impl PolicyModel for MlpPolicy {
    fn predict(&self, observation: &[f64]) -> Result<usize, PolicyError> {
        self.sample_with(observation, &mut rand::rng())
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        let uniform = 1.0 / logits.len().max(1) as f64;
        return vec![uniform; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

pub struct FilePolicyLoader {
    path: PathBuf,
}

impl FilePolicyLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicyLoader for FilePolicyLoader {
    async fn load(&self) -> Result<Arc<dyn PolicyModel>, PolicyError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PolicyError::Missing(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        let policy = MlpPolicy::from_json(&raw)?;
        Ok(Arc::new(policy))
    }
}

/// Process-wide, lazily loaded, read-only policy.
pub struct PolicyHandle {
    loader: Option<Arc<dyn PolicyLoader>>,
    model: OnceCell<Option<Arc<dyn PolicyModel>>>,
}

impl PolicyHandle {
    pub fn new(loader: Arc<dyn PolicyLoader>) -> Self {
        Self {
            loader: Some(loader),
            model: OnceCell::new(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FilePolicyLoader::new(path)))
    }

    pub fn with_model(model: Arc<dyn PolicyModel>) -> Self {
        Self {
            loader: None,
            model: OnceCell::new_with(Some(Some(model))),
        }
    }

    pub fn disabled() -> Self {
        Self {
            loader: None,
            model: OnceCell::new_with(Some(None)),
        }
    }

    /// Concurrent first callers wait on the single in-flight load.
    pub async fn get(&self) -> Option<Arc<dyn PolicyModel>> {
        self.model
            .get_or_init(|| async {
                let Some(loader) = self.loader.as_ref() else {
                    return None;
                };
                match loader.load().await {
                    Ok(model) => {
                        tracing::info!("decision policy loaded");
                        Some(model)
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "decision policy unavailable, using random fallback");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.model.initialized()
    }
}

#[derive(Clone)]
pub struct PolicyAgent {
    handle: Arc<PolicyHandle>,
}

impl PolicyAgent {
    pub fn new(handle: Arc<PolicyHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> Arc<PolicyHandle> {
        Arc::clone(&self.handle)
    }

    pub async fn decide(&self, observation: &[f64]) -> Decision {
        if observation.len() != WINDOW_SIZE {
            tracing::warn!(
                len = observation.len(),
                "observation shape mismatch, using random fallback"
            );
            return fallback_decision();
        }

        let Some(model) = self.handle.get().await else {
            return fallback_decision();
        };

        match model.predict(observation) {
            Ok(raw) => match Action::decode(raw) {
                Some(action) => {
                    let decision = Decision::from_action(action, DecisionSource::Policy);
                    tracing::debug!(raw_action = raw, slot = decision.topic_slot, difficulty = %decision.difficulty, "policy decision");
                    decision
                }
                None => {
                    tracing::warn!(raw_action = raw, "policy action out of range, substituting anchor");
                    Decision::from_action(
                        Action::new(0, Difficulty::Easy),
                        DecisionSource::Fallback,
                    )
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "policy prediction failed, using random fallback");
                fallback_decision()
            }
        }
    }
}

pub fn fallback_decision() -> Decision {
    let mut rng = rand::rng();
    let slot = rng.random_range(0..WINDOW_SIZE);
    let difficulty =
        Difficulty::from_index(rng.random_range(0..DIFFICULTY_COUNT)).unwrap_or_default();
    Decision::from_action(Action::new(slot, difficulty), DecisionSource::Fallback)
}
