//! Redis-backed authoritative store.
//!
//! Layout:
//! - `{prefix}:job:{id}`: hash with the mutable job fields plus the immutable
//!   `description` as JSON
//! - `{prefix}:jobs:queued`: sorted set of queued job ids scored by creation
//!   time (ms), used by the rescue scan
//!
//! Every conditional operation is a Lua script so the check and the write are
//! a single atomic step on the server.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use encnode_models::{AcquisitionPath, JobDescription, JobId, JobResult, JobStatus};

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{Claim, JobRecord, JobStore, ReleaseOutcome};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1],
    'description', ARGV[1],
    'status', 'queued',
    'updated_at', ARGV[2],
    'attempt_count', '0',
    'defensive_takeover', '0')
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'queued' and status ~= 'pending' then
    return 0
end
redis.call('HSET', KEYS[1],
    'status', 'running',
    'assigned_worker', ARGV[1],
    'acquisition_path', ARGV[2],
    'updated_at', ARGV[3])
if ARGV[4] == '1' then
    redis.call('HSET', KEYS[1], 'defensive_takeover', '1')
end
redis.call('ZREM', KEYS[2], ARGV[5])
return 1
"#;

const ADVANCE_SCRIPT: &str = r#"
local ranks = {pending = 0, queued = 1, assigned = 2, downloading = 3, running = 4, uploading = 5, complete = 6}
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    return 0
end
if redis.call('HGET', KEYS[1], 'assigned_worker') ~= ARGV[1] then
    return 0
end
local from = ranks[current]
if from == nil or from == 6 then
    return 0
end
local to = ranks[ARGV[2]]
if ARGV[2] ~= 'failed' and ARGV[2] ~= 'cancelled' and (to == nil or to <= from) then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[3])
return 1
"#;

const WRITE_RESULT_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status or status == 'complete' or status == 'cancelled' then
    return 0
end
redis.call('HSET', KEYS[1], 'status', 'complete', 'result', ARGV[1], 'updated_at', ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[3])
return 1
"#;

const TAKEOVER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'defensive_takeover', '1')
return 1
"#;

// Returns {code, attempt_count}: 0 = not owner, 1 = requeued, 2 = failed.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'assigned_worker') ~= ARGV[1] then
    return {0, 0}
end
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'complete' or status == 'failed' or status == 'cancelled' then
    return {0, 0}
end
local attempts = redis.call('HINCRBY', KEYS[1], 'attempt_count', 1)
redis.call('HSET', KEYS[1], 'last_error', ARGV[2], 'updated_at', ARGV[4])
if attempts >= tonumber(ARGV[3]) then
    redis.call('HSET', KEYS[1], 'status', 'failed')
    return {2, attempts}
end
redis.call('HSET', KEYS[1], 'status', 'queued')
redis.call('HDEL', KEYS[1], 'assigned_worker', 'acquisition_path')
redis.call('ZADD', KEYS[2], ARGV[5], ARGV[6])
return {1, attempts}
"#;

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key namespace
    pub key_prefix: String,
    /// Upper bound for any single store call
    pub op_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "encnode".to_string(),
            op_timeout: Duration::from_secs(10),
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables. `None` when `REDIS_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty())?;
        Some(Self {
            redis_url,
            key_prefix: std::env::var("JOBSTORE_KEY_PREFIX")
                .unwrap_or_else(|_| "encnode".to_string()),
            op_timeout: Duration::from_secs(
                std::env::var("JOBSTORE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}

/// Job store on Redis.
pub struct RedisJobStore {
    client: redis::Client,
    config: RedisStoreConfig,
    enqueue: Script,
    claim: Script,
    advance: Script,
    write_result: Script,
    takeover: Script,
    release: Script,
}

impl RedisJobStore {
    pub fn new(config: RedisStoreConfig) -> JobStoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            advance: Script::new(ADVANCE_SCRIPT),
            write_result: Script::new(WRITE_RESULT_SCRIPT),
            takeover: Script::new(TAKEOVER_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn queued_key(&self) -> String {
        format!("{}:jobs:queued", self.config.key_prefix)
    }

    async fn connection(&self) -> JobStoreResult<redis::aio::MultiplexedConnection> {
        self.bounded("connect", self.client.get_multiplexed_async_connection())
            .await
    }

    /// Apply the per-operation timeout so a hung server cannot stall a loop.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> JobStoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result.map_err(JobStoreError::from),
            Err(_) => Err(JobStoreError::Timeout(format!(
                "{} exceeded {:?}",
                operation, self.config.op_timeout
            ))),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Decode a job hash into a record.
pub(crate) fn parse_record(
    id: &JobId,
    mut fields: HashMap<String, String>,
) -> JobStoreResult<JobRecord> {
    let description_json = fields
        .remove("description")
        .ok_or_else(|| JobStoreError::corrupt(id.as_str(), "missing description"))?;
    let description: JobDescription = serde_json::from_str(&description_json)?;

    let status_raw = fields.remove("status").unwrap_or_default();
    let status = JobStatus::parse(&status_raw).ok_or_else(|| {
        JobStoreError::corrupt(id.as_str(), format!("unknown status '{}'", status_raw))
    })?;

    let updated_at = match fields.remove("updated_at") {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| JobStoreError::corrupt(id.as_str(), format!("bad updated_at: {}", e)))?,
        None => description.created_at,
    };

    let acquisition_path = match fields.remove("acquisition_path") {
        Some(raw) => Some(AcquisitionPath::parse(&raw).ok_or_else(|| {
            JobStoreError::corrupt(id.as_str(), format!("unknown acquisition path '{}'", raw))
        })?),
        None => None,
    };

    let result = match fields.remove("result") {
        Some(raw) => Some(serde_json::from_str::<JobResult>(&raw)?),
        None => None,
    };

    Ok(JobRecord {
        description,
        status,
        updated_at,
        assigned_worker: fields.remove("assigned_worker").filter(|s| !s.is_empty()),
        acquisition_path,
        defensive_takeover: fields.get("defensive_takeover").map(String::as_str) == Some("1"),
        result,
        attempt_count: fields
            .get("attempt_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        last_error: fields.remove("last_error"),
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, description: JobDescription) -> JobStoreResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&description)?;
        let inserted: i32 = self
            .bounded(
                "enqueue",
                self.enqueue
                    .key(self.job_key(&description.id))
                    .key(self.queued_key())
                    .arg(&payload)
                    .arg(now_rfc3339())
                    .arg(description.created_at.timestamp_millis())
                    .arg(description.id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        if inserted == 0 {
            return Err(JobStoreError::AlreadyExists(description.id.to_string()));
        }
        debug!(job_id = %description.id, "Enqueued job");
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> JobStoreResult<Option<JobRecord>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = self
            .bounded("get_job", conn.hgetall(self.job_key(id)))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(id, fields).map(Some)
    }

    async fn find_queued_older_than(
        &self,
        age: Duration,
        limit: usize,
    ) -> JobStoreResult<Vec<JobRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        let mut conn = self.connection().await?;

        let ids: Vec<String> = self
            .bounded(
                "find_queued_older_than",
                redis::cmd("ZRANGEBYSCORE")
                    .arg(self.queued_key())
                    .arg("-inf")
                    .arg(cutoff.timestamp_millis())
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit)
                    .query_async(&mut conn),
            )
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let id = JobId::from_string(raw_id);
            match self.get_job(&id).await {
                // The index can lag the hash; the hash is authoritative.
                Ok(Some(record)) if record.status == JobStatus::Queued => records.push(record),
                Ok(_) => debug!(job_id = %id, "Skipping stale queued index entry"),
                Err(JobStoreError::CorruptRecord { id, reason }) => {
                    warn!(job_id = %id, "Skipping corrupt job record: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn conditional_claim(&self, id: &JobId, claim: &Claim) -> JobStoreResult<bool> {
        let mut conn = self.connection().await?;
        let claimed: i32 = self
            .bounded(
                "conditional_claim",
                self.claim
                    .key(self.job_key(id))
                    .key(self.queued_key())
                    .arg(&claim.worker_id)
                    .arg(claim.path.as_str())
                    .arg(now_rfc3339())
                    .arg(if claim.path.bypasses_gateway() { "1" } else { "0" })
                    .arg(id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(claimed == 1)
    }

    async fn advance_status(
        &self,
        id: &JobId,
        worker_id: &str,
        status: JobStatus,
    ) -> JobStoreResult<bool> {
        let mut conn = self.connection().await?;
        let advanced: i32 = self
            .bounded(
                "advance_status",
                self.advance
                    .key(self.job_key(id))
                    .arg(worker_id)
                    .arg(status.as_str())
                    .arg(now_rfc3339())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(advanced == 1)
    }

    async fn write_result(&self, id: &JobId, result: &JobResult) -> JobStoreResult<bool> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(result)?;
        let written: i32 = self
            .bounded(
                "write_result",
                self.write_result
                    .key(self.job_key(id))
                    .key(self.queued_key())
                    .arg(&payload)
                    .arg(now_rfc3339())
                    .arg(id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(written == 1)
    }

    async fn mark_defensive_takeover(&self, id: &JobId) -> JobStoreResult<bool> {
        let mut conn = self.connection().await?;
        let marked: i32 = self
            .bounded(
                "mark_defensive_takeover",
                self.takeover.key(self.job_key(id)).invoke_async(&mut conn),
            )
            .await?;
        Ok(marked == 1)
    }

    async fn release(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> JobStoreResult<ReleaseOutcome> {
        let created_at_ms = match self.get_job(id).await? {
            Some(record) => record.created_at().timestamp_millis(),
            None => return Ok(ReleaseOutcome::NotOwner),
        };

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .bounded(
                "release",
                self.release
                    .key(self.job_key(id))
                    .key(self.queued_key())
                    .arg(worker_id)
                    .arg(error)
                    .arg(max_attempts)
                    .arg(now_rfc3339())
                    .arg(created_at_ms)
                    .arg(id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        let attempt_count = reply.get(1).copied().unwrap_or(0).max(0) as u32;
        Ok(match reply.first().copied().unwrap_or(0) {
            1 => ReleaseOutcome::Requeued { attempt_count },
            2 => ReleaseOutcome::Failed { attempt_count },
            _ => ReleaseOutcome::NotOwner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encnode_models::{ContentAddress, JobSource};

    fn fields(description: &JobDescription) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "description".to_string(),
            serde_json::to_string(description).unwrap(),
        );
        map.insert("status".to_string(), "running".to_string());
        map.insert("updated_at".to_string(), now_rfc3339());
        map.insert("assigned_worker".to_string(), "w1".to_string());
        map.insert("acquisition_path".to_string(), "rescued".to_string());
        map.insert("defensive_takeover".to_string(), "1".to_string());
        map.insert("attempt_count".to_string(), "2".to_string());
        map
    }

    fn description() -> JobDescription {
        JobDescription::new(
            JobId::from_string("J1"),
            "ipfs://QmSource",
            JobSource::Direct {
                owner: "bob".into(),
                api_client: "cli".into(),
                max_duration_secs: None,
            },
        )
    }

    #[test]
    fn test_parse_record_full() {
        let desc = description();
        let mut map = fields(&desc);
        let result = JobResult::new(ContentAddress::parse("QmOut").unwrap(), 7);
        map.insert("result".to_string(), serde_json::to_string(&result).unwrap());

        let record = parse_record(&desc.id, map).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.acquisition_path, Some(AcquisitionPath::Rescued));
        assert!(record.defensive_takeover);
        assert!(record.is_assigned_to("w1"));
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.result, Some(result));
    }

    #[test]
    fn test_parse_record_rejects_unknown_status() {
        let desc = description();
        let mut map = fields(&desc);
        map.insert("status".to_string(), "exploded".to_string());
        assert!(matches!(
            parse_record(&desc.id, map),
            Err(JobStoreError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_parse_record_requires_description() {
        let desc = description();
        let mut map = fields(&desc);
        map.remove("description");
        assert!(parse_record(&desc.id, map).is_err());
    }

    /// Two claims on the same queued job: exactly one wins.
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_conditional_claim_single_winner() {
        dotenvy::dotenv().ok();
        let mut config = RedisStoreConfig::from_env().expect("REDIS_URL must be set");
        config.key_prefix = format!("encnode-test-{}", Utc::now().timestamp_millis());
        let store = RedisJobStore::new(config).expect("Failed to create store");

        let desc = description();
        store.enqueue(desc.clone()).await.expect("Failed to enqueue");

        let first = Claim::new("w1", AcquisitionPath::Rescued);
        let second = Claim::new("w2", AcquisitionPath::DefensiveTakeover);
        let (a, b) = tokio::join!(
            store.conditional_claim(&desc.id, &first),
            store.conditional_claim(&desc.id, &second)
        );
        assert!(a.unwrap() ^ b.unwrap());
    }
}
