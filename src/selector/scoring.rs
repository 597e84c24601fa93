use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// A model the outer router could run. Attributes are free-form metrics such as
// "quality", "cost_per_token" or "latency_ms"; their meaning belongs to the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub attributes: HashMap<String, f64>,
}

impl ModelCandidate {
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        Self { name: name.into(), size_bytes, attributes: HashMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).copied()
    }
}

pub trait ModelScorer: Send + Sync {
    // Higher is better. Non-finite scores drop the candidate.
    fn score(&self, candidate: &ModelCandidate) -> f64;
}

pub struct FnScorer<F>(pub F);

impl<F> ModelScorer for FnScorer<F>
where
    F: Fn(&ModelCandidate) -> f64 + Send + Sync,
{
    fn score(&self, candidate: &ModelCandidate) -> f64 {
        (self.0)(candidate)
    }
}

// Linear combination of attributes with caller-supplied weights; missing attributes count as 0.
#[derive(Debug, Clone, Default)]
pub struct WeightedScorer {
    weights: HashMap<String, f64>,
}

impl WeightedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(mut self, attribute: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(attribute.into(), weight);
        self
    }
}

impl ModelScorer for WeightedScorer {
    fn score(&self, candidate: &ModelCandidate) -> f64 {
        self.weights
            .iter()
            .map(|(key, weight)| candidate.attribute(key).unwrap_or(0.0) * weight)
            .sum()
    }
}

// Best first. Ties keep the input order.
pub fn rank_models(candidates: &[ModelCandidate], scorer: &dyn ModelScorer) -> Vec<(ModelCandidate, f64)> {
    let mut ranked: Vec<(ModelCandidate, f64)> = candidates
        .iter()
        .map(|c| (c.clone(), scorer.score(c)))
        .filter(|(_, score)| score.is_finite())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

pub fn best_model(candidates: &[ModelCandidate], scorer: &dyn ModelScorer) -> Option<ModelCandidate> {
    rank_models(candidates, scorer).into_iter().next().map(|(c, _)| c)
}
