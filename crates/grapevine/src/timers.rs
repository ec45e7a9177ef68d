//! One-shot timer registry
//!
//! Backs the failure detector (one pending timer per peer) and election
//! deadlines. Arming a key replaces any pending timer for it; firing
//! removes the entry and then runs the action. `clear` is an idempotent
//! teardown step.

use grapevine_core::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Registry key: at most one pending timer per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Failure-detection window for a peer.
    Peer(PeerId),
    /// Deadline for an election topic.
    Election(String),
}

/// Named one-shot timers over spawned tasks.
#[derive(Clone)]
pub struct TimerRegistry {
    handles: Arc<Mutex<HashMap<TimerKey, JoinHandle<()>>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm a timer, replacing any pending one for the same key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, key: TimerKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handles = self.handles.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handles.lock().remove(&fire_key);
            action.await;
        });

        if let Some(previous) = self.handles.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel a pending timer. Returns whether one was pending.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.handles.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel everything.
    pub fn clear(&self) {
        let mut handles = self.handles.lock();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
