use runloop_state::AgentEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// An [`AgentEvent`] as published by the runner, numbered per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub session_id: String,
    pub event: AgentEvent,
}

pub type RunEventReceiver = mpsc::UnboundedReceiver<RunEvent>;

enum Subscriber {
    Callback(Arc<dyn Fn(&RunEvent) + Send + Sync>),
    Channel(mpsc::UnboundedSender<RunEvent>),
}

/// Fans run events out to callbacks and channels, numbering them as they
/// go. Clones share subscribers and the sequence counter.
#[derive(Clone, Default)]
pub struct RunEventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    sequence: Arc<AtomicU64>,
}

impl RunEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel that receives every event published from now on. The
    /// channel closes once every clone of the bus is dropped.
    pub fn subscribe(&self) -> RunEventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(Subscriber::Channel(sender));
        receiver
    }

    /// Callbacks run synchronously on the publishing task and must not call
    /// back into the bus.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.lock().push(Subscriber::Callback(Arc::new(callback)));
    }

    pub fn last_sequence_no(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Numbers `events` and delivers them in order. Channels whose receiver
    /// has gone away are dropped.
    pub fn publish(
        &self,
        session_id: &str,
        timestamp: &str,
        events: impl IntoIterator<Item = AgentEvent>,
    ) {
        let mut subscribers = self.lock();
        for event in events {
            let event = RunEvent {
                sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                timestamp: timestamp.to_string(),
                session_id: session_id.to_string(),
                event,
            };
            subscribers.retain(|subscriber| match subscriber {
                Subscriber::Callback(callback) => {
                    callback(&event);
                    true
                }
                Subscriber::Channel(sender) => sender.send(event.clone()).is_ok(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .expect("run event subscribers mutex poisoned")
    }
}
