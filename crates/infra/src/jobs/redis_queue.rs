//! Redis-backed durable queue.
//!
//! Every state transition is a Lua script, so add-if-absent, lease, token
//! checked extend/complete/fail, stall recovery and pruning are atomic on the
//! server. The current time comes from the injected [`Clock`] and is passed
//! to every script.
//!
//! ## Layout
//!
//! All keys live under one prefix (default `sellerflow:queue`):
//!
//! - `{prefix}:job:{id}`: hash with the job's fields
//! - `{prefix}:waiting`: zset, score `priority * 2^41 + seq`
//! - `{prefix}:delayed`: zset, score = visible-at (ms)
//! - `{prefix}:active`: zset, score = lease expiry (ms)
//! - `{prefix}:completed` / `{prefix}:failed`: zset, score = finished-at (ms)
//! - `{prefix}:seq`: FIFO counter
//!
//! Scripts derive key names from the prefix. On Redis Cluster the prefix
//! must carry a hash tag (`{sellerflow}:queue`) so every key maps to one slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use sellerflow_core::{Clock, JobId, RunId, UnitKey};

use super::store::{JobQueue, QueueError, STALLED_ERROR};
use super::types::{
    EnqueueOptions, EnqueueOutcome, FailOutcome, Job, JobKind, JobState, LeaseInfo,
    LeaseAttempt, LeaseRequest, LeaseToken, LeasedJob, NewJob, QueueCounts, QueueSettings, StallReport,
};

pub const DEFAULT_PREFIX: &str = "sellerflow:queue";

/// Waiting jobs scanned per lease when filtering by phase.
const LEASE_SCAN_LIMIT: i64 = 1000;

/// Priorities are clamped into this range for the waiting score.
const MAX_SCORE_PRIORITY: i32 = 1000;

/// Shared by every script. ARGV[1..8] are the same for all of them:
/// prefix, now, freshness window, completed age/count, failed age/count,
/// max stalled count.
const LUA_HELPERS: &str = r#"
local p = ARGV[1]
local now = tonumber(ARGV[2])
local retention = {
  window = tonumber(ARGV[3]),
  completed_age = tonumber(ARGV[4]),
  completed_count = tonumber(ARGV[5]),
  failed_age = tonumber(ARGV[6]),
  failed_count = tonumber(ARGV[7]),
}
local max_stalled = tonumber(ARGV[8])

local function jkey(id) return p .. ':job:' .. id end

local function wscore(id, seq)
  return tonumber(redis.call('HGET', jkey(id), 'prio_score') or '0') * 2199023255552 + seq
end

local function push_waiting(id)
  local seq = redis.call('INCR', p .. ':seq')
  redis.call('HSET', jkey(id), 'state', 'waiting')
  redis.call('ZADD', p .. ':waiting', wscore(id, seq), id)
end

local function drop(set, id)
  redis.call('ZREM', p .. ':' .. set, id)
  redis.call('DEL', jkey(id))
end

local function prune_set(set, max_age, max_count, window)
  local key = p .. ':' .. set
  local cutoff = now - max_age
  if window > 0 and now - window < cutoff then cutoff = now - window end
  for _, id in ipairs(redis.call('ZRANGEBYSCORE', key, '-inf', cutoff)) do
    drop(set, id)
  end
  local excess = redis.call('ZCARD', key) - max_count
  if excess > 0 then
    local oldest = redis.call('ZRANGE', key, 0, excess - 1, 'WITHSCORES')
    for i = 1, #oldest, 2 do
      if window == 0 or tonumber(oldest[i + 1]) <= now - window then
        drop(set, oldest[i])
      end
    end
  end
end

local function prune()
  prune_set('completed', retention.completed_age, retention.completed_count, retention.window)
  prune_set('failed', retention.failed_age, retention.failed_count, 0)
end

local function promote()
  local due = redis.call('ZRANGEBYSCORE', p .. ':delayed', '-inf', now)
  for _, id in ipairs(due) do
    redis.call('ZREM', p .. ':delayed', id)
    push_waiting(id)
  end
end

local function recover()
  local requeued, failed = {}, {}
  for _, id in ipairs(redis.call('ZRANGEBYSCORE', p .. ':active', '-inf', now)) do
    local jk = jkey(id)
    redis.call('ZREM', p .. ':active', id)
    redis.call('HDEL', jk, 'token', 'worker', 'lease_ms')
    local stalled = redis.call('HINCRBY', jk, 'stalled', 1)
    if stalled > max_stalled then
      redis.call('HSET', jk, 'state', 'failed', 'finished_ms', now, 'error', '__STALLED_ERROR__')
      redis.call('ZADD', p .. ':failed', now, id)
      table.insert(failed, id)
    else
      push_waiting(id)
      table.insert(requeued, id)
    end
  end
  if #failed > 0 then prune() end
  return requeued, failed
end

-- 1 = ok, -1 = lease lost, -2 = not found
local function check_lease(id, token)
  local jk = jkey(id)
  local fields = redis.call('HMGET', jk, 'state', 'token', 'lease_ms')
  if not fields[1] then return -2 end
  if fields[1] ~= 'active' or fields[2] ~= token or tonumber(fields[3] or '0') <= now then
    return -1
  end
  return 1
end
"#;

/// ARGV[9..]: id, dedup, replace, data, phase, priority, prio_score,
/// max_attempts, available_ms. Returns `{existing, state}`.
const ENQUEUE_LUA: &str = r#"
local id = ARGV[9]
local jk = jkey(id)
local state = redis.call('HGET', jk, 'state')
if state then
  if state == 'waiting' or state == 'delayed' or state == 'active' then
    return {1, state}
  end
  if state == 'completed' then
    local finished = tonumber(redis.call('HGET', jk, 'finished_ms') or '0')
    local stored = redis.call('HGET', jk, 'dedup') or ''
    local fresh = now - finished < retention.window
    if fresh and ARGV[11] ~= '1' and (ARGV[10] == '' or ARGV[10] == stored) then
      return {1, state}
    end
  end
  redis.call('ZREM', p .. ':completed', id)
  redis.call('ZREM', p .. ':failed', id)
  redis.call('DEL', jk)
end

local available = tonumber(ARGV[17])
redis.call('HSET', jk,
  'id', id, 'data', ARGV[12], 'phase', ARGV[13], 'priority', ARGV[14],
  'prio_score', ARGV[15], 'max_attempts', ARGV[16], 'attempt', 0, 'stalled', 0,
  'enqueued_ms', now, 'available_ms', available, 'dedup', ARGV[10])
if available > now then
  redis.call('HSET', jk, 'state', 'delayed')
  redis.call('ZADD', p .. ':delayed', available, id)
  return {0, 'delayed'}
end
push_waiting(id)
return {0, 'waiting'}
"#;

/// ARGV[9..]: worker, token, lease duration (ms), include legacy, phases...
/// Returns `{requeued, failed, hash}`; the hash is empty when nothing was leased.
const LEASE_LUA: &str = r#"
promote()
local requeued, failed = recover()

local allowed = {}
for i = 13, #ARGV do allowed[ARGV[i]] = true end
local include_legacy = ARGV[12] == '1'

local candidates = redis.call('ZRANGE', p .. ':waiting', 0, __SCAN_LIMIT__ - 1)
for _, id in ipairs(candidates) do
  local jk = jkey(id)
  local phase = redis.call('HGET', jk, 'phase') or ''
  if (phase == '' and include_legacy) or (phase ~= '' and allowed[phase]) then
    local expires = now + tonumber(ARGV[11])
    redis.call('ZREM', p .. ':waiting', id)
    redis.call('HINCRBY', jk, 'attempt', 1)
    redis.call('HSET', jk, 'state', 'active', 'token', ARGV[10], 'worker', ARGV[9],
      'lease_ms', expires, 'started_ms', now)
    redis.call('ZADD', p .. ':active', expires, id)
    return {requeued, failed, redis.call('HGETALL', jk)}
  end
end
return {requeued, failed, {}}
"#;

/// ARGV[9..]: id, token, extension (ms). Returns new expiry or a negative code.
const EXTEND_LUA: &str = r#"
local id = ARGV[9]
local code = check_lease(id, ARGV[10])
if code < 0 then return code end
local expires = now + tonumber(ARGV[11])
redis.call('HSET', jkey(id), 'lease_ms', expires)
redis.call('ZADD', p .. ':active', expires, id)
return expires
"#;

/// ARGV[9..]: id, token.
const COMPLETE_LUA: &str = r#"
local id = ARGV[9]
local code = check_lease(id, ARGV[10])
if code < 0 then return code end
local jk = jkey(id)
redis.call('ZREM', p .. ':active', id)
redis.call('HDEL', jk, 'token', 'worker', 'lease_ms')
redis.call('HSET', jk, 'state', 'completed', 'finished_ms', now)
redis.call('ZADD', p .. ':completed', now, id)
prune()
return 1
"#;

/// ARGV[9..]: id, token, error, retryable, retry delay (ms).
/// Returns `{code, attempt}`: 1 retrying, 2 exhausted, negative on error.
const FAIL_LUA: &str = r#"
local id = ARGV[9]
local code = check_lease(id, ARGV[10])
if code < 0 then return {code, 0} end
local jk = jkey(id)
redis.call('ZREM', p .. ':active', id)
redis.call('HDEL', jk, 'token', 'worker', 'lease_ms')
redis.call('HSET', jk, 'error', ARGV[11])
local attempt = tonumber(redis.call('HGET', jk, 'attempt') or '0')
local max_attempts = tonumber(redis.call('HGET', jk, 'max_attempts') or '1')
if ARGV[12] == '1' and attempt < max_attempts then
  local retry_at = now + tonumber(ARGV[13])
  redis.call('HSET', jk, 'state', 'delayed', 'available_ms', retry_at)
  redis.call('ZADD', p .. ':delayed', retry_at, id)
  return {1, attempt}
end
redis.call('HSET', jk, 'state', 'failed', 'finished_ms', now)
redis.call('ZADD', p .. ':failed', now, id)
prune()
return {2, attempt}
"#;

/// ARGV[9]: id. Returns 1 when removed.
const REMOVE_LUA: &str = r#"
local id = ARGV[9]
local state = redis.call('HGET', jkey(id), 'state')
if state == 'waiting' or state == 'delayed' then
  drop(state, id)
  return 1
end
return 0
"#;

const RECOVER_LUA: &str = r#"
local requeued, failed = recover()
return {requeued, failed}
"#;

struct Scripts {
    enqueue: Script,
    lease: Script,
    extend: Script,
    complete: Script,
    fail: Script,
    remove: Script,
    recover: Script,
}

impl Scripts {
    fn load() -> Self {
        let helpers = LUA_HELPERS.replace("__STALLED_ERROR__", STALLED_ERROR);
        let build = |body: &str| Script::new(&format!("{helpers}\n{body}"));
        Self {
            enqueue: build(ENQUEUE_LUA),
            lease: build(&LEASE_LUA.replace("__SCAN_LIMIT__", &LEASE_SCAN_LIMIT.to_string())),
            extend: build(EXTEND_LUA),
            complete: build(COMPLETE_LUA),
            fail: build(FAIL_LUA),
            remove: build(REMOVE_LUA),
            recover: build(RECOVER_LUA),
        }
    }
}

/// Immutable part of a job, stored as JSON in the `data` field.
#[derive(Debug, Serialize, Deserialize)]
struct JobData {
    #[serde(default)]
    kind: JobKind,
    unit: UnitKey,
    #[serde(default)]
    run_id: Option<RunId>,
    #[serde(default)]
    payload: Map<String, JsonValue>,
    #[serde(default)]
    meta: Map<String, JsonValue>,
}

/// Durable queue on Redis.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    prefix: String,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    scripts: Arc<Scripts>,
}

impl core::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("prefix", &self.prefix)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    /// Connect to Redis.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key namespace (default: "sellerflow:queue")
    pub async fn connect(
        redis_url: &str,
        prefix: Option<String>,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;
        let prefix = prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        info!(prefix = %prefix, "connected redis job queue");
        Ok(Self {
            conn,
            prefix,
            settings,
            clock,
            scripts: Arc::new(Scripts::load()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    /// ARGV[1..8] shared by every script.
    fn head<'a>(&self, script: &'a Script, now: DateTime<Utc>) -> redis::ScriptInvocation<'a> {
        let retention = &self.settings.retention;
        let mut invocation = script.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(now.timestamp_millis())
            .arg(millis(self.settings.freshness_window))
            .arg(millis(retention.completed_age))
            .arg(retention.completed_count)
            .arg(millis(retention.failed_age))
            .arg(retention.failed_count)
            .arg(self.settings.max_stalled_count);
        invocation
    }

    async fn fetch(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_hash(fields).map(Some)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job, options), fields(job_id = %job.id), err)]
    async fn enqueue(
        &self,
        job: NewJob,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let available = now + options.delay.map(super::types::chrono_duration).unwrap_or_default();
        let phase = job.kind.phase().unwrap_or_default().to_string();
        let data = serde_json::to_string(&JobData {
            kind: job.kind,
            unit: job.unit,
            run_id: job.run_id,
            payload: job.payload,
            meta: job.meta,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.settings.retry.max_attempts)
            .max(1);

        let mut conn = self.conn.clone();
        let (existing, state): (i64, String) = self
            .head(&self.scripts.enqueue, now)
            .arg(job.id.as_str())
            .arg(options.dedup_key.as_deref().unwrap_or_default())
            .arg(if options.replace_completed { "1" } else { "0" })
            .arg(data)
            .arg(phase)
            .arg(options.priority)
            .arg(score_priority(options.priority))
            .arg(max_attempts)
            .arg(available.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let state = state.parse::<JobState>().map_err(QueueError::Backend)?;
        if existing == 1 {
            debug!(job_id = %job.id, %state, "enqueue deduplicated");
        }
        Ok(EnqueueOutcome {
            job_id: job.id,
            existing: existing == 1,
            state,
        })
    }

    async fn try_lease(&self, request: &LeaseRequest) -> Result<LeaseAttempt, QueueError> {
        let now = self.clock.now();
        let token = LeaseToken::new();
        let mut conn = self.conn.clone();
        let (requeued, failed, fields): (Vec<String>, Vec<String>, HashMap<String, String>) = self
            .head(&self.scripts.lease, now)
            .arg(&request.worker_id)
            .arg(token.as_str())
            .arg(millis(self.settings.lease_duration))
            .arg(if request.include_legacy { "1" } else { "0" })
            .arg(&request.phases)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let stalls = stall_report(requeued, failed);
        if fields.is_empty() {
            return Ok(LeaseAttempt {
                leased: None,
                stalls,
            });
        }
        let job = job_from_hash(fields)?;
        let expires_at = job
            .lease
            .as_ref()
            .map(|l| l.expires_at)
            .ok_or_else(|| QueueError::Backend(format!("leased job {} has no lease", job.id)))?;
        debug!(job_id = %job.id, worker = %request.worker_id, attempt = job.attempt, "leased job");
        Ok(LeaseAttempt {
            leased: Some(LeasedJob {
                job,
                token,
                expires_at,
            }),
            stalls,
        })
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        extension: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let result: i64 = self
            .head(&self.scripts.extend, now)
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(millis(extension))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        lease_code(job_id, result)?;
        from_millis(result)
    }

    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let result: i64 = self
            .head(&self.scripts.complete, now)
            .arg(job_id.as_str())
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        lease_code(job_id, result)
    }

    async fn fail(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();

        // The attempt counter only moves on lease, so it is stable while we
        // hold the lease; the script re-checks the token.
        let attempt: Option<u32> = redis::cmd("HGET")
            .arg(self.job_key(job_id))
            .arg("attempt")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let attempt = attempt.ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        let delay = self.settings.retry.delay_for_attempt(attempt);

        let (code, attempt): (i64, u32) = self
            .head(&self.scripts.fail, now)
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(error)
            .arg(if retryable { "1" } else { "0" })
            .arg(millis(delay))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        lease_code(job_id, code)?;

        if code == 1 {
            let retry_at = now + super::types::chrono_duration(delay);
            Ok(FailOutcome::Retrying { attempt, retry_at })
        } else {
            Ok(FailOutcome::Exhausted { attempts: attempt })
        }
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .head(&self.scripts.remove, now)
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed == 1)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, QueueError> {
        self.fetch(job_id).await
    }

    async fn recover_stalled(&self) -> Result<StallReport, QueueError> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .head(&self.scripts.recover, now)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(stall_report(requeued, failed))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = self.clock.now().timestamp_millis();
        let mut conn = self.conn.clone();
        let (waiting, delayed, due, active, completed, failed): (usize, usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(self.key("waiting"))
                .zcard(self.key("delayed"))
                .zcount(self.key("delayed"), "-inf", now)
                .zcard(self.key("active"))
                .zcard(self.key("completed"))
                .zcard(self.key("failed"))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

        Ok(QueueCounts {
            waiting: waiting + due,
            delayed: delayed.saturating_sub(due),
            active,
            completed,
            failed,
        })
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.key(state.as_str()))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.job_key(&JobId::from_raw(id.clone())));
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        hashes
            .into_iter()
            .filter(|h| !h.is_empty())
            .map(job_from_hash)
            .collect()
    }
}

fn lease_code(job_id: &JobId, code: i64) -> Result<(), QueueError> {
    match code {
        -2 => Err(QueueError::NotFound(job_id.clone())),
        -1 => Err(QueueError::LeaseLost(job_id.clone())),
        _ => Ok(()),
    }
}

fn stall_report(requeued: Vec<String>, failed: Vec<String>) -> StallReport {
    let report = StallReport {
        requeued: requeued.into_iter().map(JobId::from_raw).collect(),
        failed: failed.into_iter().map(JobId::from_raw).collect(),
    };
    if !report.failed.is_empty() {
        warn!(failed = report.failed.len(), "stalled jobs failed permanently");
    }
    report
}

fn score_priority(priority: i32) -> i32 {
    priority.clamp(0, MAX_SCORE_PRIORITY)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Backend(format!("timestamp out of range: {ms}")))
}

fn map_redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

/// Rebuild a [`Job`] from its hash fields.
fn job_from_hash(mut fields: HashMap<String, String>) -> Result<Job, QueueError> {
    fn take(fields: &mut HashMap<String, String>, name: &str) -> Result<String, QueueError> {
        fields
            .remove(name)
            .ok_or_else(|| QueueError::Serialization(format!("job hash missing field {name}")))
    }
    fn num<T: core::str::FromStr>(value: &str, name: &str) -> Result<T, QueueError> {
        value
            .parse()
            .map_err(|_| QueueError::Serialization(format!("job field {name} is not a number: {value}")))
    }
    fn time(fields: &mut HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        match fields.remove(name) {
            Some(v) if !v.is_empty() => from_millis(num(&v, name)?).map(Some),
            _ => Ok(None),
        }
    }

    let id = JobId::from_raw(take(&mut fields, "id")?);
    let data: JobData = serde_json::from_str(&take(&mut fields, "data")?)
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
    let state: JobState = take(&mut fields, "state")?
        .parse()
        .map_err(QueueError::Serialization)?;

    let lease = match (fields.remove("token"), fields.remove("worker"), time(&mut fields, "lease_ms")?) {
        (Some(token), Some(worker_id), Some(expires_at)) if state == JobState::Active => Some(LeaseInfo {
            token: LeaseToken::from_raw(token),
            worker_id,
            expires_at,
        }),
        _ => None,
    };
    let enqueued_at = time(&mut fields, "enqueued_ms")?
        .ok_or_else(|| QueueError::Serialization("job hash missing enqueued_ms".to_string()))?;

    Ok(Job {
        id,
        kind: data.kind,
        unit: data.unit,
        run_id: data.run_id,
        payload: data.payload,
        meta: data.meta,
        dedup_key: fields.remove("dedup").filter(|d| !d.is_empty()),
        priority: num(&take(&mut fields, "priority")?, "priority")?,
        max_attempts: num(&take(&mut fields, "max_attempts")?, "max_attempts")?,
        attempt: num(&take(&mut fields, "attempt")?, "attempt")?,
        stalled_count: num(&take(&mut fields, "stalled")?, "stalled")?,
        state,
        lease,
        enqueued_at,
        available_at: time(&mut fields, "available_ms")?.unwrap_or(enqueued_at),
        started_at: time(&mut fields, "started_ms")?,
        finished_at: time(&mut fields, "finished_ms")?,
        last_error: fields.remove("error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sellerflow_core::SubjectId;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn data() -> String {
        serde_json::to_string(&JobData {
            kind: JobKind::phased("ORDERS"),
            unit: UnitKey::with_region(SubjectId::new("user-1").unwrap(), "DE"),
            run_id: Some(RunId::new()),
            payload: Map::new(),
            meta: Map::new(),
        })
        .unwrap()
    }

    #[test]
    fn active_job_hash_round_trips_lease() {
        let data = data();
        let job = job_from_hash(hash(&[
            ("id", "user-1:DE-ORDERS"),
            ("data", &data),
            ("state", "active"),
            ("priority", "0"),
            ("max_attempts", "3"),
            ("attempt", "2"),
            ("stalled", "1"),
            ("token", "tok"),
            ("worker", "w-1"),
            ("lease_ms", "1700000060000"),
            ("enqueued_ms", "1700000000000"),
            ("available_ms", "1700000000000"),
            ("started_ms", "1700000001000"),
            ("dedup", ""),
        ]))
        .unwrap();

        assert_eq!(job.phase(), Some("ORDERS"));
        assert_eq!(job.unit.region.as_deref(), Some("DE"));
        assert_eq!(job.attempt, 2);
        assert_eq!(job.stalled_count, 1);
        assert_eq!(job.dedup_key, None);
        let lease = job.lease.unwrap();
        assert_eq!(lease.worker_id, "w-1");
        assert_eq!(lease.expires_at.timestamp_millis(), 1_700_000_060_000);
    }

    #[test]
    fn waiting_job_ignores_stale_lease_fields() {
        let data = data();
        let job = job_from_hash(hash(&[
            ("id", "user-1:DE-ORDERS"),
            ("data", &data),
            ("state", "waiting"),
            ("priority", "5"),
            ("max_attempts", "3"),
            ("attempt", "0"),
            ("stalled", "0"),
            ("token", "old"),
            ("worker", "w-0"),
            ("lease_ms", "1"),
            ("enqueued_ms", "1700000000000"),
        ]))
        .unwrap();
        assert!(job.lease.is_none());
        assert_eq!(job.available_at, job.enqueued_at);
    }

    #[test]
    fn missing_fields_are_serialization_errors() {
        let err = job_from_hash(hash(&[("id", "x")])).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn lease_codes_map_to_errors() {
        let id = JobId::from("user-1-INIT");
        assert!(matches!(lease_code(&id, -1), Err(QueueError::LeaseLost(_))));
        assert!(matches!(lease_code(&id, -2), Err(QueueError::NotFound(_))));
        assert!(lease_code(&id, 1).is_ok());
        assert_eq!(score_priority(-5), 0);
        assert_eq!(score_priority(50_000), MAX_SCORE_PRIORITY);
    }

    #[test]
    fn scripts_embed_helpers_and_constants() {
        let helpers = LUA_HELPERS.replace("__STALLED_ERROR__", STALLED_ERROR);
        assert!(helpers.contains(STALLED_ERROR));
        assert!(!LEASE_LUA.replace("__SCAN_LIMIT__", "1000").contains("__SCAN_LIMIT__"));
    }
}
