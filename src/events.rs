//! In-process event bus: bounded per-topic fan-out with replay.
//!
//! Topics are created lazily on first publish or subscribe:
//! - `log:<worker_id>` — parsed agent output for one worker
//! - `plan:<pid>:<tid>` — plan conversation stream for one task
//! - `system` — dispatcher events
//!
//! Publishing never blocks. Each topic keeps a ring buffer for replay; live
//! delivery rides a tokio broadcast channel, so a slow subscriber lags
//! independently and only its own oldest pending messages are dropped (the
//! WebSocket layer surfaces the lag as a `dropped` marker frame).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::DispatcherEvent;

pub const SYSTEM_TOPIC: &str = "system";

/// Ring capacity for worker-log and plan topics.
const LOG_RING_CAPACITY: usize = 300;
/// Ring capacity for the system topic.
const SYSTEM_RING_CAPACITY: usize = 1000;
/// Per-subscriber broadcast queue depth.
const CHANNEL_CAPACITY: usize = 256;

pub fn log_topic(worker_id: &str) -> String {
    format!("log:{}", worker_id)
}

pub fn plan_topic(project_id: &str, task_id: &str) -> String {
    format!("plan:{}:{}", project_id, task_id)
}

struct Topic {
    ring: VecDeque<Value>,
    capacity: usize,
    tx: broadcast::Sender<Value>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            ring: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            tx,
        }
    }
}

pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn capacity_for(topic: &str) -> usize {
        if topic == SYSTEM_TOPIC {
            SYSTEM_RING_CAPACITY
        } else {
            LOG_RING_CAPACITY
        }
    }

    /// Append to the topic ring and fan out to live subscribers. Send errors
    /// (no subscribers) are ignored.
    pub fn publish(&self, topic: &str, event: Value) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(Self::capacity_for(topic)));
        if entry.ring.len() >= entry.capacity {
            entry.ring.pop_front();
        }
        entry.ring.push_back(event.clone());
        let _ = entry.tx.send(event);
    }

    /// Subscribe to a topic: returns the last `replay` buffered events plus a
    /// live receiver positioned after them.
    pub fn subscribe(&self, topic: &str, replay: usize) -> (Vec<Value>, broadcast::Receiver<Value>) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(Self::capacity_for(topic)));
        let rx = entry.tx.subscribe();
        let start = entry.ring.len().saturating_sub(replay);
        let replayed = entry.ring.iter().skip(start).cloned().collect();
        (replayed, rx)
    }

    /// The last `last_n` events of a topic, oldest first.
    pub fn replay(&self, topic: &str, last_n: usize) -> Vec<Value> {
        let topics = self.topics.lock().expect("event bus lock poisoned");
        match topics.get(topic) {
            Some(entry) => {
                let start = entry.ring.len().saturating_sub(last_n);
                entry.ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Emit a dispatcher event on the `system` topic.
    /// source: `worker-1`, `system`, `scheduler`, etc.
    pub fn emit(&self, source: &str, message: impl Into<String>) {
        let event = DispatcherEvent::new(source, message);
        if let Ok(value) = serde_json::to_value(&event) {
            self.publish(SYSTEM_TOPIC, value);
        }
    }

    /// Most recent dispatcher events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DispatcherEvent> {
        self.replay(SYSTEM_TOPIC, limit)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }
}
