use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::core::jobs::{JobEnvelope, JobId, JobState};
use crate::queue::{Claim, JobQueue, QueueError};

const RELEASE_IF_HOLDER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Queue shared by the HTTP processes and the separate worker pool.
///
/// Layout under `prefix`: a list `{prefix}:jobs`, JSON states at
/// `{prefix}:state:{id}` with a TTL, and submission keys at
/// `{prefix}:submission:{key}`.
pub struct RedisJobQueue {
    client: Client,
    manager: ConnectionManager,
    prefix: String,
    state_ttl: Duration,
}

impl RedisJobQueue {
    pub async fn connect(url: &str, prefix: &str, state_ttl: Duration) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            prefix: prefix.to_string(),
            state_ttl,
        })
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn state_key(&self, id: &JobId) -> String {
        format!("{}:state:{}", self.prefix, id)
    }

    fn submission_key(&self, key: &str) -> String {
        format!("{}:submission:{}", self.prefix, key)
    }

    fn ttl_secs(&self) -> u64 {
        self.state_ttl.as_secs().max(1)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: JobEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let state = serde_json::to_string(&JobState::Pending)?;
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .set_ex(self.state_key(&job.id), state, self.ttl_secs())
            .ignore()
            .lpush(self.jobs_key(), payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Enqueued job {} on redis", job.id);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEnvelope>, QueueError> {
        // BRPOP blocks its connection, so it gets its own
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.jobs_key())
            .arg(timeout.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set_state(&self, id: &JobId, state: JobState) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&state)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(self.state_key(id), payload, self.ttl_secs())
            .await?;
        Ok(())
    }

    async fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(self.state_key(id)).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn discard_state(&self, id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.state_key(id)).await?;
        Ok(())
    }

    async fn claim_key(&self, key: &str, id: &JobId, ttl: Duration) -> Result<Claim, QueueError> {
        let redis_key = self.submission_key(key);
        let mut conn = self.manager.clone();
        for _ in 0..3 {
            let set: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(id.as_str())
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            if set.is_some() {
                return Ok(Claim::Acquired);
            }
            let holder: Option<String> = conn.get(&redis_key).await?;
            if let Some(holder) = holder {
                return Ok(Claim::Held(JobId::from(holder)));
            }
            // expired between SET and GET
        }
        Err(QueueError::Contended(key.to_string()))
    }

    async fn release_key(&self, key: &str, id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        Script::new(RELEASE_IF_HOLDER)
            .key(self.submission_key(key))
            .arg(id.as_str())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
