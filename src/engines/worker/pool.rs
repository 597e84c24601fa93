use super::policy::{select_slot, SlotStats};
use super::task::{Job, Task, TaskHandle, TaskHandler, TaskId, TaskPayload, WorkerContext};
use crate::app::events::{Event, EventBus};
use crate::core::{EngineError, Result};
use crate::envconfig::WorkerConfig;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Slot {
    stats: SlotStats,
    generation: u64,
    sender: Option<mpsc::Sender<Job>>,
    current: Option<Task>,
}

struct PoolState {
    queue: VecDeque<Task>,
    slots: Vec<Slot>,
    cursor: usize,
    rng: StdRng,
    peak_busy: usize,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.stats.busy).count()
    }
}

enum Attempt {
    Finished(Result<Vec<f32>>),
    Crashed,
    TimedOut,
}

struct PoolInner {
    engine: String,
    config: WorkerConfig,
    handler: Arc<dyn TaskHandler>,
    events: Arc<EventBus>,
    runtime: Handle,
    state: Mutex<PoolState>,
    next_task: AtomicU64,
    closed: AtomicBool,
    live_threads: Arc<AtomicUsize>,
    size: usize,
}

// Fixed set of OS-thread worker slots fed from one queue. Each slot runs at most
// one task; a slot whose thread dies or hangs is replaced without touching the others.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn start(
        engine: &str,
        config: WorkerConfig,
        size: usize,
        handler: Arc<dyn TaskHandler>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| EngineError::initialization(engine, e))?;
        let size = size.max(1);
        let live_threads = Arc::new(AtomicUsize::new(0));

        let mut slots = Vec::with_capacity(size);
        for id in 0..size {
            let sender = spawn_worker(engine, id, Arc::clone(&handler), &live_threads)
                .map_err(|e| EngineError::initialization(engine, e))?;
            slots.push(Slot {
                stats: SlotStats { id, busy: false, completed: 0, restarts: 0, last_used_at: None },
                generation: 0,
                sender: Some(sender),
                current: None,
            });
        }
        tracing::info!("{}: started {} worker slots ({:?})", engine, size, config.policy);

        Ok(Self {
            inner: Arc::new(PoolInner {
                engine: engine.to_string(),
                config,
                handler,
                events,
                runtime,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    slots,
                    cursor: 0,
                    rng: StdRng::from_entropy(),
                    peak_busy: 0,
                }),
                next_task: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                live_threads,
                size,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn busy_slots(&self) -> usize {
        self.inner.state.lock().busy()
    }

    pub fn peak_busy(&self) -> usize {
        self.inner.state.lock().peak_busy
    }

    // Includes threads abandoned after an in-flight timeout that have not exited yet.
    pub fn live_threads(&self) -> usize {
        self.inner.live_threads.load(Ordering::SeqCst)
    }

    pub fn slot_stats(&self) -> Vec<SlotStats> {
        self.inner.state.lock().slots.iter().map(|s| s.stats.clone()).collect()
    }

    pub fn submit(&self, payload: TaskPayload, timeout: Option<Duration>) -> Result<TaskHandle> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::not_initialized(&inner.engine));
        }

        let id = TaskId(inner.next_task.fetch_add(1, Ordering::SeqCst));
        let created_at = Instant::now();
        let deadline = created_at + timeout.unwrap_or_else(|| inner.config.task_timeout());
        let (reply, rx) = oneshot::channel();

        let weak = Arc::downgrade(inner);
        let reaper = inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_queued(id);
            }
        });

        tracing::debug!("{}: queued {} ({:?})", inner.engine, id, payload.kind());
        inner.state.lock().queue.push_back(Task {
            id,
            payload,
            attempts_remaining: inner.config.retry_budget,
            created_at,
            deadline,
            reply,
            reaper: Some(reaper.abort_handle()),
        });
        inner.dispatch();

        Ok(TaskHandle::new(id, inner.engine.clone(), rx))
    }

    // Only tasks still waiting in the queue can be cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.queue.iter().position(|t| t.id == id) else {
                return false;
            };
            state.queue.remove(pos)
        };
        match task {
            Some(task) => {
                tracing::debug!("{}: cancelled {}", self.inner.engine, id);
                task.resolve(Err(EngineError::Cancelled {
                    engine: self.inner.engine.clone(),
                    task: id.to_string(),
                }));
                true
            }
            None => false,
        }
    }

    // Rejects everything pending and lets the worker threads exit once idle.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);

        let (queued, running) = {
            let mut state = inner.state.lock();
            let queued: Vec<Task> = state.queue.drain(..).collect();
            let running: Vec<Task> = state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.sender = None;
                    slot.stats.busy = false;
                    slot.current.take()
                })
                .collect();
            (queued, running)
        };

        for task in queued.into_iter().chain(running) {
            let id = task.id.to_string();
            task.resolve(Err(EngineError::Cancelled { engine: inner.engine.clone(), task: id }));
        }
        tracing::info!("{}: worker pool shut down", inner.engine);
    }
}

impl PoolInner {
    fn dispatch(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        while !state.queue.is_empty() {
            let stats: Vec<SlotStats> = state.slots.iter().map(|s| s.stats.clone()).collect();
            let PoolState { cursor, rng, .. } = &mut *state;
            let Some(index) = select_slot(self.config.policy, &stats, cursor, rng) else {
                break;
            };
            let Some(task) = state.queue.pop_front() else {
                break;
            };

            let (reply, attempt) = oneshot::channel();
            let job = Job { payload: task.payload.clone(), reply };
            let task_id = task.id;
            let deadline = task.deadline;

            let slot = &mut state.slots[index];
            slot.stats.busy = true;
            slot.current = Some(task);
            let generation = slot.generation;
            // A failed send drops the job's reply, which the monitor reports as a crash.
            if let Some(sender) = &slot.sender {
                let _ = sender.send(job);
            }

            let busy = state.busy();
            state.peak_busy = state.peak_busy.max(busy);
            tracing::debug!("{}: {} -> slot {} ({} busy)", self.engine, task_id, index, busy);

            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                let outcome = match tokio::time::timeout_at(deadline, attempt).await {
                    Ok(Ok(result)) => Attempt::Finished(result),
                    Ok(Err(_)) => Attempt::Crashed,
                    Err(_) => Attempt::TimedOut,
                };
                inner.finish(index, generation, task_id, outcome);
            });
        }
    }

    fn finish(self: &Arc<Self>, index: usize, generation: u64, task_id: TaskId, outcome: Attempt) {
        let mut resolved = None;
        {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(index) else {
                return;
            };
            let current = slot.current.as_ref().map(|t| t.id);
            if slot.generation != generation || current != Some(task_id) {
                return;
            }
            let Some(mut task) = slot.current.take() else {
                return;
            };
            slot.stats.busy = false;
            slot.stats.completed += 1;
            slot.stats.last_used_at = Some(Utc::now());

            let attempt = match outcome {
                Attempt::Finished(result) => Ok(result),
                Attempt::Crashed => Err(EngineError::WorkerCrash {
                    engine: self.engine.clone(),
                    slot: index,
                    message: "worker thread terminated".to_string(),
                }),
                Attempt::TimedOut => Err(EngineError::WorkerTimeout {
                    engine: self.engine.clone(),
                    task: task_id.to_string(),
                    timeout: task.deadline.duration_since(task.created_at),
                }),
            };

            match attempt {
                Ok(result) => resolved = Some((task, result)),
                Err(error) => {
                    tracing::warn!("{}: slot {} failed: {}", self.engine, index, error);
                    self.restart_slot(slot);

                    if task.attempts_remaining > 0 && Instant::now() < task.deadline {
                        task.attempts_remaining -= 1;
                        tracing::warn!(
                            "{}: retrying {} ({} attempts left)",
                            self.engine,
                            task_id,
                            task.attempts_remaining
                        );
                        self.events.publish(Event::TaskRetried {
                            engine: self.engine.clone(),
                            task: task_id.to_string(),
                            attempts_remaining: task.attempts_remaining,
                        });
                        state.queue.push_front(task);
                    } else {
                        resolved = Some((task, Err(error)));
                    }
                }
            }
        }

        if let Some((task, result)) = resolved {
            task.resolve(result);
        }
        self.dispatch();
    }

    // The old thread is abandoned, not killed. A slow thread exits once its job
    // returns, since its channel is closed. A thread that never returns keeps
    // running outside the pool, so compute concurrency can exceed the slot count
    // until it does. `live_threads` exposes that overhang.
    fn restart_slot(&self, slot: &mut Slot) {
        slot.generation += 1;
        slot.stats.restarts += 1;
        match spawn_worker(&self.engine, slot.stats.id, Arc::clone(&self.handler), &self.live_threads) {
            Ok(sender) => slot.sender = Some(sender),
            Err(e) => {
                tracing::error!("{}: could not respawn slot {}: {}", self.engine, slot.stats.id, e);
                slot.sender = None;
            }
        }
        let live = self.live_threads.load(Ordering::SeqCst);
        if live > self.size * 2 {
            tracing::warn!("{}: {} worker threads alive for a pool of {}", self.engine, live, self.size);
        }
        self.events.publish(Event::WorkerRestarted { engine: self.engine.clone(), slot: slot.stats.id });
    }

    fn expire_queued(&self, id: TaskId) {
        let task = {
            let mut state = self.state.lock();
            match state.queue.iter().position(|t| t.id == id) {
                Some(pos) => state.queue.remove(pos),
                None => None,
            }
        };
        if let Some(task) = task {
            tracing::warn!("{}: {} timed out in queue", self.engine, id);
            let timeout = task.deadline.duration_since(task.created_at);
            task.resolve(Err(EngineError::WorkerTimeout {
                engine: self.engine.clone(),
                task: id.to_string(),
                timeout,
            }));
        }
    }
}

struct LiveThread(Arc<AtomicUsize>);

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_worker(
    engine: &str,
    slot: usize,
    handler: Arc<dyn TaskHandler>,
    live: &Arc<AtomicUsize>,
) -> std::io::Result<mpsc::Sender<Job>> {
    let (tx, rx) = mpsc::channel::<Job>();
    live.fetch_add(1, Ordering::SeqCst);
    let guard = LiveThread(Arc::clone(live));
    std::thread::Builder::new()
        .name(format!("{}-worker-{}", engine, slot))
        .spawn(move || {
            let _guard = guard;
            let mut ctx = WorkerContext::new(slot);
            while let Ok(job) = rx.recv() {
                let result = handler.handle(&mut ctx, &job.payload);
                let _ = job.reply.send(result);
            }
        })?;
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::worker::task::KernelHandler;
    use std::sync::atomic::AtomicUsize;

    fn config(max_workers: usize) -> WorkerConfig {
        WorkerConfig { max_workers, task_timeout_ms: 5_000, ..WorkerConfig::default() }
    }

    fn pool(size: usize, handler: Arc<dyn TaskHandler>) -> WorkerPool {
        WorkerPool::start("test", config(size), size, handler, EventBus::shared()).unwrap()
    }

    // Panics while the first `crashes` calls are made.
    struct FlakyHandler {
        crashes: usize,
        calls: AtomicUsize,
    }

    impl TaskHandler for FlakyHandler {
        fn handle(&self, ctx: &mut WorkerContext, payload: &TaskPayload) -> Result<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.crashes {
                panic!("worker {} crashed", ctx.slot);
            }
            KernelHandler.handle(ctx, payload)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_concurrency() {
        let pool = pool(2, Arc::new(KernelHandler));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                pool.submit(TaskPayload::echo(vec![i as f32], Duration::from_millis(30)), None)
                    .unwrap()
            })
            .collect();
        assert!(pool.busy_slots() <= 2);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await.unwrap(), vec![i as f32]);
        }
        assert_eq!(pool.peak_busy(), 2);
        assert_eq!(pool.queue_len(), 0);
        let completed: u64 = pool.slot_stats().iter().map(|s| s.completed).sum();
        assert_eq!(completed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_is_retried_on_fresh_slot() {
        let bus = EventBus::shared();
        let mut rx = bus.channel();
        let handler = Arc::new(FlakyHandler { crashes: 1, calls: AtomicUsize::new(0) });
        let pool = WorkerPool::start("test", config(2), 2, handler, bus).unwrap();

        let result = pool.submit(TaskPayload::echo(vec![1.0], Duration::ZERO), None).unwrap().wait().await;
        assert_eq!(result.unwrap(), vec![1.0]);

        let restarts: u64 = pool.slot_stats().iter().map(|s| s.restarts).sum();
        assert_eq!(restarts, 1);
        let mut saw_retry = false;
        while let Ok(event) = rx.try_recv() {
            saw_retry |= matches!(event, Event::TaskRetried { attempts_remaining: 1, .. });
        }
        assert!(saw_retry);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_surfaces_after_budget() {
        let handler = Arc::new(FlakyHandler { crashes: usize::MAX, calls: AtomicUsize::new(0) });
        let pool = pool(1, handler);
        let err = pool
            .submit(TaskPayload::echo(vec![1.0], Duration::ZERO), None)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerCrash { .. }));
        // initial attempt plus the default budget of two retries
        assert_eq!(pool.slot_stats()[0].restarts, 3);
        assert!(!pool.slot_stats()[0].busy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeouts_in_flight_and_queued() {
        let pool = pool(1, Arc::new(KernelHandler));
        let slow = pool
            .submit(TaskPayload::echo(vec![1.0], Duration::from_millis(500)), Some(Duration::from_millis(50)))
            .unwrap();
        let queued = pool
            .submit(TaskPayload::echo(vec![2.0], Duration::ZERO), Some(Duration::from_millis(20)))
            .unwrap();

        assert!(matches!(queued.wait().await, Err(EngineError::WorkerTimeout { .. })));
        assert!(matches!(slow.wait().await, Err(EngineError::WorkerTimeout { .. })));

        let after = pool.submit(TaskPayload::echo(vec![3.0], Duration::ZERO), None).unwrap();
        assert_eq!(after.wait().await.unwrap(), vec![3.0]);
    }

    struct RejectingHandler;

    impl TaskHandler for RejectingHandler {
        fn handle(&self, _: &mut WorkerContext, payload: &TaskPayload) -> Result<Vec<f32>> {
            match payload {
                TaskPayload::Echo { data, .. } if data.is_empty() => Err(EngineError::inference("test", "empty")),
                _ => KernelHandler.handle(&mut WorkerContext::new(0), payload),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_results_resolve_without_restart() {
        let pool = pool(1, Arc::new(RejectingHandler));
        let ok = pool.submit(TaskPayload::echo(vec![2.0], Duration::ZERO), None).unwrap();
        assert_eq!(ok.wait().await.unwrap(), vec![2.0]);

        let rejected = pool.submit(TaskPayload::echo(vec![], Duration::ZERO), None).unwrap();
        assert!(matches!(rejected.wait().await, Err(EngineError::Inference { .. })));

        let stats = &pool.slot_stats()[0];
        assert_eq!(stats.restarts, 0);
        assert_eq!(stats.completed, 2);
        assert!(!stats.busy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_thread_exits_after_slow_job() {
        let mut config = config(1);
        config.retry_budget = 0;
        let pool = WorkerPool::start("test", config, 1, Arc::new(KernelHandler), EventBus::shared()).unwrap();
        assert_eq!(pool.live_threads(), 1);

        let slow = pool
            .submit(TaskPayload::echo(vec![1.0], Duration::from_millis(200)), Some(Duration::from_millis(30)))
            .unwrap();
        assert!(matches!(slow.wait().await, Err(EngineError::WorkerTimeout { .. })));
        assert_eq!(pool.live_threads(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.live_threads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_queued_only() {
        let pool = pool(1, Arc::new(KernelHandler));
        let running = pool.submit(TaskPayload::echo(vec![1.0], Duration::from_millis(100)), None).unwrap();
        let queued = pool.submit(TaskPayload::echo(vec![2.0], Duration::ZERO), None).unwrap();

        assert!(pool.cancel(queued.id()));
        assert!(!pool.cancel(running.id()));
        assert!(matches!(queued.wait().await, Err(EngineError::Cancelled { .. })));
        assert_eq!(running.wait().await.unwrap(), vec![1.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_rejects_pending() {
        let pool = pool(1, Arc::new(KernelHandler));
        let running = pool.submit(TaskPayload::echo(vec![1.0], Duration::from_millis(100)), None).unwrap();
        let queued = pool.submit(TaskPayload::echo(vec![2.0], Duration::ZERO), None).unwrap();
        pool.shutdown();

        assert!(matches!(running.wait().await, Err(EngineError::Cancelled { .. })));
        assert!(matches!(queued.wait().await, Err(EngineError::Cancelled { .. })));
        assert!(pool.submit(TaskPayload::echo(vec![], Duration::ZERO), None).is_err());
    }
}
