/// Recent-event backlog for late subscribers
///
/// Keeps the last few events per execution, bounded both by count and by age,
/// so a client that attaches slightly late can replay what it missed. This is
/// a convenience for observers only; resumption relies on the state store.

use crate::events::subscriber::ExecutionEventHandler;
use crate::events::types::ExecutionEventMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Count- and time-bounded per-execution event buffer
pub struct RecentEventBuffer {
    max_events: usize,
    ttl: Duration,
    executions: Mutex<HashMap<String, VecDeque<(Instant, ExecutionEventMessage)>>>,
}

impl RecentEventBuffer {
    pub fn new(max_events: usize, ttl: Duration) -> Self {
        Self {
            max_events: max_events.max(1),
            ttl,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event, evicting the oldest once the buffer is full
    pub fn push(&self, event: ExecutionEventMessage) {
        let now = Instant::now();
        let mut executions = self.executions.lock();
        let events = executions.entry(event.execution_id.clone()).or_default();

        Self::evict_expired(events, now, self.ttl);
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back((now, event));
    }

    /// Buffered events for an execution, oldest first
    pub fn recent(&self, execution_id: &str) -> Vec<ExecutionEventMessage> {
        let now = Instant::now();
        let mut executions = self.executions.lock();

        let Some(events) = executions.get_mut(execution_id) else {
            return Vec::new();
        };
        Self::evict_expired(events, now, self.ttl);
        if events.is_empty() {
            executions.remove(execution_id);
            return Vec::new();
        }
        events.iter().map(|(_, event)| event.clone()).collect()
    }

    /// Drop expired events across all executions, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut executions = self.executions.lock();
        let mut removed = 0;

        executions.retain(|_, events| {
            let before = events.len();
            Self::evict_expired(events, now, self.ttl);
            removed += before - events.len();
            !events.is_empty()
        });
        removed
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    fn evict_expired(events: &mut VecDeque<(Instant, ExecutionEventMessage)>, now: Instant, ttl: Duration) {
        while events
            .front()
            .is_some_and(|(stored_at, _)| now.duration_since(*stored_at) >= ttl)
        {
            events.pop_front();
        }
    }
}

impl ExecutionEventHandler for RecentEventBuffer {
    fn handle(&self, event: &ExecutionEventMessage) -> anyhow::Result<()> {
        self.push(event.clone());
        Ok(())
    }
}
