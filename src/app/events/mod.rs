use crate::core::ErrorKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Initialized { engine: String },
    ModelLoaded { engine: String, model: String, load_time: Duration },
    Inference {
        engine: String,
        model: String,
        latency: Duration,
        input_size: usize,
        output_size: usize,
        cached: bool,
    },
    StreamComplete { engine: String, model: String, tokens: usize },
    Error { engine: String, kind: ErrorKind, error: String, model: Option<String> },
    WorkerRestarted { engine: String, slot: usize },
    TaskRetried { engine: String, task: String, attempts_remaining: u32 },
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Initialized { .. } => "initialized",
            Event::ModelLoaded { .. } => "model_loaded",
            Event::Inference { .. } => "inference",
            Event::StreamComplete { .. } => "stream_complete",
            Event::Error { .. } => "error",
            Event::WorkerRestarted { .. } => "worker_restarted",
            Event::TaskRetried { .. } => "task_retried",
        }
    }

    pub fn engine(&self) -> &str {
        match self {
            Event::Initialized { engine }
            | Event::ModelLoaded { engine, .. }
            | Event::Inference { engine, .. }
            | Event::StreamComplete { engine, .. }
            | Event::Error { engine, .. }
            | Event::WorkerRestarted { engine, .. }
            | Event::TaskRetried { engine, .. } => engine,
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
    fn name(&self) -> &str;
}

pub type HandlerId = usize;

#[allow(clippy::type_complexity)]
pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, (String, Arc<dyn EventHandler>)>>,
    callbacks: RwLock<HashMap<&'static str, Vec<EventCallback>>>,
    channels: RwLock<Vec<mpsc::UnboundedSender<Event>>>,
    next_id: RwLock<HandlerId>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            channels: RwLock::new(Vec::new()),
            next_id: RwLock::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let mut id = self.next_id.write();
        *id += 1;
        let handler_id = *id;
        drop(id);

        let name = handler.name().to_string();
        self.handlers.write().insert(handler_id, (name, Arc::new(handler)));

        handler_id
    }

    pub fn subscribe_to(&self, event_type: &'static str, callback: EventCallback) {
        self.callbacks.write().entry(event_type).or_default().push(callback);
    }

    // The receiver is owned by the caller; dropping it detaches the channel on the next publish.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().push(tx);
        rx
    }

    pub fn unsubscribe(&self, handler_id: HandlerId) -> bool {
        self.handlers.write().remove(&handler_id).is_some()
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().values().map(|(name, _)| name.clone()).collect()
    }

    pub fn publish(&self, event: Event) {
        for (_, handler) in self.handlers.read().values() {
            handler.handle(&event);
        }

        if let Some(callbacks) = self.callbacks.read().get(event.type_name()) {
            for callback in callbacks {
                callback(&event);
            }
        }

        let mut closed = false;
        for tx in self.channels.read().iter() {
            closed |= tx.send(event.clone()).is_err();
        }
        if closed {
            self.channels.write().retain(|tx| !tx.is_closed());
        }
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
        self.callbacks.write().clear();
        self.channels.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        match event {
            Event::Error { .. } | Event::WorkerRestarted { .. } => {
                tracing::warn!("Event: {:?}", event)
            }
            _ => tracing::info!("Event: {:?}", event),
        }
    }

    fn name(&self) -> &str {
        "logging"
    }
}
