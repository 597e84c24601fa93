// Reference CPU kernel shared by the worker pool and the edge engine. The sandbox
// runtime module and the default GPU shader compute the same projection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn effective_temperature(temperature: f32) -> f32 {
    if temperature > 0.0 {
        temperature
    } else {
        1.0
    }
}

pub fn forward(weights: &[f32], input: &[f32], output_size: usize, temperature: f32) -> Vec<f32> {
    let temp = effective_temperature(temperature);
    (0..output_size)
        .map(|j| {
            let mut acc = 0.0f32;
            for (i, x) in input.iter().enumerate() {
                let w = if weights.is_empty() {
                    1.0
                } else {
                    weights[(i * output_size + j) % weights.len()]
                };
                acc += x * w;
            }
            acc / temp
        })
        .collect()
}

// Deterministic weights for models that arrive without any.
pub fn synthesize_weights(seed: u64, count: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub struct Sampler {
    temperature: f32,
    top_k: usize,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, top_k: usize, seed: u64) -> Self {
        Self { temperature, top_k, rng: StdRng::seed_from_u64(seed) }
    }

    // Returns (index, logit). Temperature <= 0 means greedy.
    pub fn sample(&mut self, logits: &[f32]) -> Option<(usize, f32)> {
        if logits.is_empty() {
            return None;
        }

        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.temperature <= 0.0 {
            return candidates.first().copied();
        }
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        let max = candidates[0].1;
        let weights: Vec<f32> = candidates
            .iter()
            .map(|(_, l)| ((l - max) / self.temperature).exp())
            .collect();
        let sum: f32 = weights.iter().sum();
        let r = self.rng.gen::<f32>() * sum;

        let mut cumulative = 0.0;
        for (candidate, w) in candidates.iter().zip(&weights) {
            cumulative += w;
            if cumulative >= r {
                return Some(*candidate);
            }
        }
        candidates.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_projection() {
        let out = forward(&[1.0, 2.0], &[1.0, 1.0], 2, 1.0);
        // j=0: w[0] + w[2 % 2]; j=1: w[1] + w[3 % 2]
        assert_eq!(out, vec![2.0, 4.0]);
    }

    #[test]
    fn test_forward_without_weights_sums_input() {
        let out = forward(&[], &[1.0, 2.0, 3.0], 3, 2.0);
        assert_eq!(out, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_synthesized_weights_are_stable() {
        assert_eq!(synthesize_weights(7, 16), synthesize_weights(7, 16));
        assert_ne!(synthesize_weights(7, 16), synthesize_weights(8, 16));
        assert!(synthesize_weights(7, 64).iter().all(|w| (-1.0..=1.0).contains(w)));
    }

    #[test]
    fn test_greedy_sampling() {
        let mut sampler = Sampler::new(0.0, 0, 1);
        assert_eq!(sampler.sample(&[0.1, 0.9, 0.3]), Some((1, 0.9)));
        assert_eq!(sampler.sample(&[]), None);
    }

    #[test]
    fn test_top_k_restricts_choice() {
        let mut sampler = Sampler::new(1.0, 1, 42);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.5, 2.0, 1.0]).map(|(i, _)| i), Some(1));
        }
    }
}
