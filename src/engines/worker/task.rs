use crate::core::{EngineError, Result};
use crate::kernel;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Inference,
    Echo,
}

#[derive(Debug)]
pub struct PoolModel {
    pub id: String,
    pub weights: Arc<[f32]>,
    pub output_size: usize,
    pub shared: bool,
}

#[derive(Debug, Clone)]
pub enum TaskPayload {
    Inference { model: Arc<PoolModel>, input: Vec<f32>, temperature: f32 },
    Echo { data: Vec<f32>, delay: Duration },
}

impl TaskPayload {
    pub fn echo(data: Vec<f32>, delay: Duration) -> Self {
        TaskPayload::Echo { data, delay }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Inference { .. } => TaskKind::Inference,
            TaskPayload::Echo { .. } => TaskKind::Echo,
        }
    }
}

// State private to one worker thread. Lost when the slot is recreated.
#[derive(Default)]
pub struct WorkerContext {
    pub slot: usize,
    weights: HashMap<String, Arc<[f32]>>,
}

impl WorkerContext {
    pub fn new(slot: usize) -> Self {
        Self { slot, weights: HashMap::new() }
    }

    // Shared models are used in place; others get a private copy on first use.
    pub fn weights(&mut self, model: &PoolModel) -> Arc<[f32]> {
        if model.shared {
            return Arc::clone(&model.weights);
        }
        self.weights
            .entry(model.id.clone())
            .or_insert_with(|| Arc::from(model.weights.to_vec()))
            .clone()
    }

    pub fn cached_models(&self) -> usize {
        self.weights.len()
    }
}

pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &mut WorkerContext, payload: &TaskPayload) -> Result<Vec<f32>>;
}

pub struct KernelHandler;

impl TaskHandler for KernelHandler {
    fn handle(&self, ctx: &mut WorkerContext, payload: &TaskPayload) -> Result<Vec<f32>> {
        match payload {
            TaskPayload::Inference { model, input, temperature } => {
                let weights = ctx.weights(model);
                Ok(kernel::forward(&weights, input, model.output_size, *temperature))
            }
            TaskPayload::Echo { data, delay } => {
                if !delay.is_zero() {
                    std::thread::sleep(*delay);
                }
                Ok(data.clone())
            }
        }
    }
}

pub(crate) struct Job {
    pub payload: TaskPayload,
    pub reply: oneshot::Sender<Result<Vec<f32>>>,
}

pub(crate) struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub attempts_remaining: u32,
    pub created_at: tokio::time::Instant,
    pub deadline: tokio::time::Instant,
    pub reply: oneshot::Sender<Result<Vec<f32>>>,
    pub reaper: Option<AbortHandle>,
}

impl Task {
    pub fn resolve(self, result: Result<Vec<f32>>) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
        tracing::trace!("{} resolved after {:?}", self.id, self.created_at.elapsed());
        let _ = self.reply.send(result);
    }
}

pub struct TaskHandle {
    id: TaskId,
    engine: String,
    rx: oneshot::Receiver<Result<Vec<f32>>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, engine: String, rx: oneshot::Receiver<Result<Vec<f32>>>) -> Self {
        Self { id, engine, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub async fn wait(self) -> Result<Vec<f32>> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Cancelled { engine: self.engine, task: self.id.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(shared: bool) -> Arc<PoolModel> {
        Arc::new(PoolModel {
            id: "m".into(),
            weights: Arc::from(vec![1.0f32, 2.0]),
            output_size: 2,
            shared,
        })
    }

    #[test]
    fn test_shared_weights_are_not_copied() {
        let mut ctx = WorkerContext::new(0);
        let model = model(true);
        let weights = ctx.weights(&model);
        assert!(Arc::ptr_eq(&weights, &model.weights));
        assert_eq!(ctx.cached_models(), 0);
    }

    #[test]
    fn test_private_weights_are_copied_once() {
        let mut ctx = WorkerContext::new(0);
        let model = model(false);
        let first = ctx.weights(&model);
        let second = ctx.weights(&model);
        assert!(!Arc::ptr_eq(&first, &model.weights));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.cached_models(), 1);
    }

    #[test]
    fn test_kernel_handler() {
        let mut ctx = WorkerContext::new(0);
        let payload = TaskPayload::Inference { model: model(false), input: vec![1.0, 1.0], temperature: 1.0 };
        assert_eq!(KernelHandler.handle(&mut ctx, &payload).unwrap(), vec![2.0, 4.0]);

        let echo = TaskPayload::echo(vec![3.0], Duration::ZERO);
        assert_eq!(echo.kind(), TaskKind::Echo);
        assert_eq!(KernelHandler.handle(&mut ctx, &echo).unwrap(), vec![3.0]);
    }
}
