use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::jobs::{JobEnvelope, JobId, JobState};
use crate::queue::{Claim, JobQueue, QueueError};

struct StoredState {
    state: JobState,
    expires_at: Instant,
}

struct KeyHold {
    holder: JobId,
    expires_at: Instant,
}

/// Single-process queue for embedded workers and tests
pub struct MemoryJobQueue {
    pending: Mutex<VecDeque<JobEnvelope>>,
    available: Notify,
    states: DashMap<JobId, StoredState>,
    keys: DashMap<String, KeyHold>,
    state_ttl: Duration,
}

impl MemoryJobQueue {
    pub fn new(state_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            states: DashMap::new(),
            keys: DashMap::new(),
            state_ttl,
        }
    }

    /// Forget states and submission keys whose lifetime is over
    fn sweep_expired(&self, now: Instant) {
        self.states.retain(|_, stored| stored.expires_at > now);
        self.keys.retain(|_, hold| hold.expires_at > now);
    }

    #[cfg(test)]
    pub(crate) fn tracked_states(&self) -> usize {
        self.states.len()
    }

    fn pop(&self) -> Option<JobEnvelope> {
        self.pending.lock().ok().and_then(|mut queue| queue.pop_front())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: JobEnvelope) -> Result<(), QueueError> {
        self.set_state(&job.id, JobState::Pending).await?;
        if let Ok(mut queue) = self.pending.lock() {
            queue.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEnvelope>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.pop() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(self.pop());
            }
        }
    }

    async fn set_state(&self, id: &JobId, state: JobState) -> Result<(), QueueError> {
        let now = Instant::now();
        self.sweep_expired(now);
        self.states.insert(
            id.clone(),
            StoredState {
                state,
                expires_at: now + self.state_ttl,
            },
        );
        Ok(())
    }

    async fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError> {
        let now = Instant::now();
        self.states.remove_if(id, |_, stored| stored.expires_at <= now);
        Ok(self.states.get(id).map(|stored| stored.state.clone()))
    }

    async fn discard_state(&self, id: &JobId) -> Result<(), QueueError> {
        self.states.remove(id);
        Ok(())
    }

    async fn claim_key(&self, key: &str, id: &JobId, ttl: Duration) -> Result<Claim, QueueError> {
        let now = Instant::now();
        let hold = KeyHold {
            holder: id.clone(),
            expires_at: now + ttl,
        };
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    entry.insert(hold);
                    Ok(Claim::Acquired)
                } else {
                    Ok(Claim::Held(entry.get().holder.clone()))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(hold);
                Ok(Claim::Acquired)
            }
        }
    }

    async fn release_key(&self, key: &str, id: &JobId) -> Result<(), QueueError> {
        self.keys.remove_if(key, |_, hold| &hold.holder == id);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
