use crate::error::PipelineError;
use crate::job::{job_identity, new_job, Job, JobState, Submission};
use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

const STREAM_KEY: &str = "compress:jobs";
const GROUP_NAME: &str = "compress:workers";
const INDEX_KEY: &str = "compress:jobs:index";
const JOB_KEY_PREFIX: &str = "compress:job:";
const DEDUP_KEY_PREFIX: &str = "compress:dedup:";
const STREAM_ID_KEY_PREFIX: &str = "compress:streamid:";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub job_id: String,
    pub queue_position: u64,
}

/// Redis Streams-backed durable queue. One consumer group
/// (`compress:workers`) backs `claimNext`; stalled entries are reclaimed via
/// `XPENDING`/`XCLAIM`, the same shape the corpus's Redis-streams job queue
/// uses for at-least-once delivery with visibility timeouts.
#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
    stall_window: Duration,
    max_attempts: u32,
}

impl Broker {
    pub async fn connect(
        redis_url: &str,
        stall_window: Duration,
        max_attempts: u32,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let broker = Self {
            conn,
            stall_window,
            max_attempts,
        };
        broker.ensure_group().await?;
        Ok(broker)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(GROUP_NAME)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(PipelineError::BrokerUnavailable(e.to_string()).into()),
        }
    }

    fn job_key(id: &str) -> String {
        format!("{}{}", JOB_KEY_PREFIX, id)
    }

    fn dedup_key(identity: &str) -> String {
        format!("{}{}", DEDUP_KEY_PREFIX, identity)
    }

    fn stream_id_key(id: &str) -> String {
        format!("{}{}", STREAM_ID_KEY_PREFIX, id)
    }

    /// Enqueues a submission, rejecting duplicate identity while a prior job
    /// with the same `(postId, timestamp)` is non-terminal. The whole
    /// round-trip is bounded by a 15s end-to-end timeout; a broker that's
    /// wedged reports unavailable rather than hanging the request.
    pub async fn enqueue(&self, submission: Submission, unix_millis: i64) -> Result<EnqueueResult> {
        match tokio::time::timeout(
            Duration::from_secs(15),
            self.enqueue_inner(submission, unix_millis),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::BrokerUnavailable("enqueue timed out after 15s".to_string()).into()),
        }
    }

    async fn enqueue_inner(&self, submission: Submission, unix_millis: i64) -> Result<EnqueueResult> {
        let mut conn = self.conn.clone();
        let identity = job_identity(submission.post_id, unix_millis);
        let dedup_key = Self::dedup_key(&identity);

        let set: bool = redis::cmd("SET")
            .arg(&dedup_key)
            .arg(1)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        if !set {
            return Err(PipelineError::ValidationError(format!(
                "job {} already exists",
                identity
            ))
            .into());
        }

        let job = new_job(submission, unix_millis);
        self.persist(&job).await?;

        let entry_id: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("*")
            .arg("job_id")
            .arg(&job.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let _: () = conn
            .set(Self::stream_id_key(&job.id), &entry_id)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let _: () = conn
            .zadd(INDEX_KEY, &job.id, job.created_at.timestamp_millis())
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let queue_position: u64 = redis::cmd("XLEN")
            .arg(STREAM_KEY)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);

        Ok(EnqueueResult {
            job_id: job.id,
            queue_position,
        })
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: () = conn
            .set(Self::job_key(&job.id), json)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::job_key(job_id))
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Blocks (up to `block_ms`) for the next pending job. Before reading new
    /// entries, reclaims any message idle longer than the stall window so a
    /// worker that crashed mid-job doesn't strand it forever.
    pub async fn claim_next(&self, worker_id: &str, block_ms: u64) -> Result<Option<Job>> {
        if let Some(job) = self.reclaim_stalled(worker_id).await? {
            return Ok(Some(job));
        }

        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP_NAME)
            .arg(worker_id)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(STREAM_KEY)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                if let Some(redis::Value::BulkString(bytes)) = entry.map.get("job_id") {
                    let job_id = String::from_utf8_lossy(bytes).to_string();
                    if let Some(mut job) = self.load(&job_id).await? {
                        job.mark_processing();
                        self.persist(&job).await?;
                        return Ok(Some(job));
                    }
                }
            }
        }

        Ok(None)
    }

    async fn reclaim_stalled(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = self.stall_window.as_millis() as u64;

        let pending: redis::streams::StreamPendingReply = redis::cmd("XPENDING")
            .arg(STREAM_KEY)
            .arg(GROUP_NAME)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await
            .unwrap_or(redis::streams::StreamPendingReply::Empty);

        let ids = match pending {
            redis::streams::StreamPendingReply::Data(data) => {
                data.ids.into_iter().map(|p| p.id).collect::<Vec<_>>()
            }
            redis::streams::StreamPendingReply::Empty => vec![],
        };

        for id in ids {
            let claimed: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
                .arg(STREAM_KEY)
                .arg(GROUP_NAME)
                .arg(worker_id)
                .arg(min_idle_ms)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

            for entry in claimed.ids {
                if let Some(redis::Value::BulkString(bytes)) = entry.map.get("job_id") {
                    let job_id = String::from_utf8_lossy(bytes).to_string();
                    if let Some(mut job) = self.load(&job_id).await? {
                        job.state = JobState::Pending;
                        self.persist(&job).await?;
                        job.mark_processing();
                        self.persist(&job).await?;
                        return Ok(Some(job));
                    }
                }
            }
        }

        Ok(None)
    }

    pub async fn update_progress(&self, job: &Job) -> Result<()> {
        self.persist(job).await
    }

    pub async fn finalize(&self, job: &Job) -> Result<()> {
        self.persist(job).await?;
        if matches!(job.state, JobState::Completed | JobState::Failed) {
            let mut conn = self.conn.clone();
            let _: () = conn.del(Self::dedup_key(&job.id)).await.unwrap_or(());
            self.ack_and_trim(&job.id).await;
        }
        Ok(())
    }

    /// Acks and removes the job's stream entry so a completed/failed job's
    /// message doesn't linger in the consumer group's PEL, where stall
    /// reclaim would otherwise re-deliver it forever.
    async fn ack_and_trim(&self, job_id: &str) {
        let mut conn = self.conn.clone();
        let entry_id: Option<String> = conn.get(Self::stream_id_key(job_id)).await.unwrap_or(None);
        if let Some(entry_id) = entry_id {
            let _: redis::RedisResult<()> = redis::cmd("XACK")
                .arg(STREAM_KEY)
                .arg(GROUP_NAME)
                .arg(&entry_id)
                .query_async(&mut conn)
                .await;
            let _: redis::RedisResult<()> = redis::cmd("XDEL")
                .arg(STREAM_KEY)
                .arg(&entry_id)
                .query_async(&mut conn)
                .await;
            let _: () = conn.del(Self::stream_id_key(job_id)).await.unwrap_or(());
        }
    }

    /// Re-enqueues a `failed` job for another attempt, bounded by
    /// `max_attempts`.
    pub async fn retry(&self, job_id: &str) -> Result<bool> {
        let mut job = match self.load(job_id).await? {
            Some(j) => j,
            None => return Ok(false),
        };

        if job.state != JobState::Failed || job.attempt >= self.max_attempts {
            return Ok(false);
        }

        job.state = JobState::Pending;
        job.error = None;
        job.error_code = None;
        self.persist(&job).await?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .del(Self::dedup_key(&job.id))
            .await
            .unwrap_or(());
        let _: bool = redis::cmd("SET")
            .arg(Self::dedup_key(&job.id))
            .arg(1)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .unwrap_or(false);

        let entry_id: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("*")
            .arg("job_id")
            .arg(&job.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let _: () = conn
            .set(Self::stream_id_key(&job.id), &entry_id)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        Ok(true)
    }

    pub async fn remove(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let existed: Option<String> = conn
            .get(Self::job_key(job_id))
            .await
            .unwrap_or(None);
        if existed.is_none() {
            return Ok(false);
        }
        let _: () = conn.del(Self::job_key(job_id)).await.unwrap_or(());
        let _: () = conn.del(Self::dedup_key(job_id)).await.unwrap_or(());
        let _: () = conn.zrem(INDEX_KEY, job_id).await.unwrap_or(());
        self.ack_and_trim(job_id).await;
        Ok(true)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(INDEX_KEY, 0, -1)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let mut stats = QueueStats::default();
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                match job.state {
                    JobState::Pending | JobState::Delayed => stats.pending += 1,
                    JobState::Processing => stats.processing += 1,
                    JobState::Completed => stats.completed += 1,
                    JobState::Failed => stats.failed += 1,
                }
            }
        }
        Ok(stats)
    }

    /// Scans the recency index for the most recent job submitted for
    /// `post_id`. Used by `/api/status` when callers only know the WordPress
    /// post rather than a `job_id`.
    pub async fn find_by_post_id(&self, post_id: u64) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(INDEX_KEY, 0, -1)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        for id in ids {
            if let Some(job) = self.load(&id).await? {
                if job.submission.post_id == post_id {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    /// Liveness check for `/api/health`: a bare `PING` against the broker's
    /// connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn list_recent(&self, limit: isize) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(INDEX_KEY, 0, limit - 1)
            .await
            .map_err(|e| PipelineError::BrokerUnavailable(e.to_string()))?;

        let mut jobs = Vec::new();
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_and_dedup_keys_are_namespaced() {
        assert_eq!(Broker::job_key("job_1_2"), "compress:job:job_1_2");
        assert_eq!(Broker::dedup_key("job_1_2"), "compress:dedup:job_1_2");
    }
}
