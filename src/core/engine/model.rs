use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub weights: Bytes,
    pub output_size: usize,
    pub shader: Option<String>,
}

impl ModelHandle {
    pub fn new(id: impl Into<String>, weights: impl Into<Bytes>, output_size: usize) -> Self {
        let id = id.into();
        let weights = weights.into();
        Self {
            name: id.clone(),
            size_bytes: weights.len() as u64,
            id,
            weights,
            output_size,
            shader: None,
        }
    }

    pub fn from_f32(id: impl Into<String>, weights: &[f32], output_size: usize) -> Self {
        Self::new(id, Bytes::copy_from_slice(bytemuck::cast_slice(weights)), output_size)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_shader(mut self, shader: impl Into<String>) -> Self {
        self.shader = Some(shader.into());
        self
    }

    // Trailing bytes that do not form a whole f32 are ignored.
    pub fn weights_f32(&self) -> Vec<f32> {
        self.weights
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub id: String,
    pub name: String,
    pub output_size: usize,
    pub engine: String,
    pub load_time: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub operation: String,
    pub temperature: f32,
    pub top_k: usize,
    pub max_tokens: usize,
    pub stop_token: Option<u32>,
    pub timeout: Option<Duration>,
    pub seed: u64,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            operation: "inference".to_string(),
            temperature: 1.0,
            top_k: 0,
            max_tokens: 16,
            stop_token: None,
            timeout: None,
            seed: 0,
        }
    }
}

impl ExecuteOptions {
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub data: Vec<f32>,
    pub cached: bool,
    pub latency: Duration,
    pub engine: String,
}

impl InferenceOutput {
    pub fn new(engine: impl Into<String>, data: Vec<f32>) -> Self {
        Self { data, cached: false, latency: Duration::ZERO, engine: engine.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_from_f32() {
        let handle = ModelHandle::from_f32("tiny", &[1.0, -2.5, 3.0], 8);
        assert_eq!(handle.size_bytes, 12);
        assert_eq!(handle.weights_f32(), vec![1.0, -2.5, 3.0]);
        assert_eq!(handle.name, "tiny");
    }

    #[test]
    fn test_partial_weight_bytes_ignored() {
        let handle = ModelHandle::new("odd", vec![0u8; 6], 1);
        assert_eq!(handle.weights_f32().len(), 1);
    }
}
