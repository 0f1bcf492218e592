use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::api::BuildFinishedEvent;
use crate::error::{JudgeError, Result};
use crate::queue::{Delivery, JobQueue};
use crate::store::{ClaimOutcome, JobStore, Registration};
use crate::types::{BuildJob, BuildReport, BuildStatus, RunningPhase, TestCase};

/// Redis key semantics - defines only naming, not runtime logic
/// Ensures api and worker never drift and keys stay deterministic
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn build(&self, uuid: &str) -> String {
        format!("{}:build:{}", self.prefix, uuid)
    }

    pub fn test_case(&self, uuid: &str) -> String {
        format!("{}:testcase:{}", self.prefix, uuid)
    }

    pub fn assignment_test_cases(&self, assignment_uuid: &str) -> String {
        format!("{}:assignment:{}:testcases", self.prefix, assignment_uuid)
    }

    /// Sorted set of running jobs scored by claim time
    pub fn running(&self) -> String {
        format!("{}:running", self.prefix)
    }

    /// Jobs reset to pending that still have to be put back on the queue
    pub fn requeue(&self) -> String {
        format!("{}:requeue", self.prefix)
    }

    pub fn queue_pending(&self) -> String {
        format!("{}:queue:pending", self.prefix)
    }

    pub fn queue_processing(&self) -> String {
        format!("{}:queue:processing", self.prefix)
    }

    /// Sorted set of leased deliveries scored by lease deadline
    pub fn queue_leases(&self) -> String {
        format!("{}:queue:leases", self.prefix)
    }

    pub fn build_finished_channel(&self) -> String {
        format!("{}:events:build-finished", self.prefix)
    }
}

const REGISTER_BUILD: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  local cur = redis.call('HMGET', KEYS[1], 'assignment_uuid', 'language', 'source')
  if cur[1] == ARGV[1] and cur[2] == ARGV[2] and cur[3] == ARGV[3] then
    return 0
  end
  return -1
end
redis.call('HSET', KEYS[1],
  'assignment_uuid', ARGV[1], 'language', ARGV[2], 'source', ARGV[3],
  'status', 'pending', 'score', '0', 'details', '', 'build_log', '', 'tests_log', '',
  'tests_passed', '0', 'tests_total', '0', 'exception', '', 'created_at', ARGV[4])
return 1
";

const REGISTER_TEST_CASE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  local cur = redis.call('HMGET', KEYS[1], 'assignment_uuid', 'input', 'expected')
  if cur[1] == ARGV[2] and cur[2] == ARGV[3] and cur[3] == ARGV[4] then
    return 0
  end
  return -1
end
redis.call('HSET', KEYS[1], 'assignment_uuid', ARGV[2], 'input', ARGV[3], 'expected', ARGV[4])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
";

const CLAIM: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return 'missing'
end
if status ~= 'pending' then
  return status
end
redis.call('HSET', KEYS[1], 'status', 'running', 'details', 'compiling', 'claimed_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 'claimed'
";

const SET_PHASE: &str = r"
if redis.call('HGET', KEYS[1], 'status') ~= 'running' then
  return 0
end
redis.call('HSET', KEYS[1], 'details', ARGV[1])
return 1
";

const FINALIZE: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return -1
end
if status ~= 'pending' and status ~= 'running' then
  return 0
end
redis.call('HSET', KEYS[1],
  'status', ARGV[2], 'score', ARGV[3], 'details', ARGV[4], 'build_log', ARGV[5],
  'tests_log', ARGV[6], 'tests_passed', ARGV[7], 'tests_total', ARGV[8], 'exception', ARGV[9])
redis.call('HDEL', KEYS[1], 'claimed_at')
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
";

const RESET_STALE: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'running' then
  redis.call('ZREM', KEYS[2], ARGV[1])
  return 0
end
local claimed = tonumber(redis.call('HGET', KEYS[1], 'claimed_at') or '0')
if claimed > tonumber(ARGV[2]) then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'pending', 'details', '')
redis.call('HDEL', KEYS[1], 'claimed_at')
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
";

const HEARTBEAT: &str = r"
if redis.call('HGET', KEYS[1], 'status') ~= 'running' then
  return 0
end
redis.call('HSET', KEYS[1], 'claimed_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
";

const RECEIVE: &str = r"
local uuid = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not uuid then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[1], uuid)
return uuid
";

const ACK: &str = r"
redis.call('LREM', KEYS[1], 1, ARGV[1])
if not redis.call('LPOS', KEYS[1], ARGV[1]) then
  redis.call('ZREM', KEYS[2], ARGV[1])
end
return 1
";

const REQUEUE_EXPIRED: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
local moved = 0
for _, uuid in ipairs(expired) do
  redis.call('ZREM', KEYS[3], uuid)
  if redis.call('LREM', KEYS[2], 1, uuid) > 0 then
    redis.call('RPUSH', KEYS[1], uuid)
    moved = moved + 1
  end
end
return moved
";

fn take(fields: &mut HashMap<String, String>, name: &str) -> String {
    fields.remove(name).unwrap_or_default()
}

fn take_number<T: FromStr>(fields: &mut HashMap<String, String>, name: &str) -> Result<T> {
    let raw = take(fields, name);
    raw.parse()
        .map_err(|_| JudgeError::Internal(format!("stored field '{}' is not a number: '{}'", name, raw)))
}

fn job_from_fields(uuid: &str, mut fields: HashMap<String, String>) -> Result<BuildJob> {
    let status: BuildStatus = take(&mut fields, "status").parse()?;
    let claimed_at = match fields.remove("claimed_at") {
        Some(raw) if !raw.is_empty() => Some(raw.parse().map_err(|_| {
            JudgeError::Internal(format!("stored claimed_at is not a number: '{}'", raw))
        })?),
        _ => None,
    };
    Ok(BuildJob {
        uuid: uuid.to_string(),
        assignment_uuid: take(&mut fields, "assignment_uuid"),
        language: take(&mut fields, "language"),
        source: take(&mut fields, "source"),
        status,
        score: take_number(&mut fields, "score")?,
        details: take(&mut fields, "details"),
        build_log: take(&mut fields, "build_log"),
        tests_log: take(&mut fields, "tests_log"),
        tests_passed: take_number(&mut fields, "tests_passed")?,
        tests_total: take_number(&mut fields, "tests_total")?,
        exception: take(&mut fields, "exception"),
        created_at: take_number(&mut fields, "created_at")?,
        claimed_at,
    })
}

fn registration_from_code(code: i64, what: &str, uuid: &str) -> Result<Registration> {
    match code {
        1 => Ok(Registration::Created),
        0 => Ok(Registration::AlreadyExists),
        _ => Err(JudgeError::Conflict(format!(
            "{} '{}' is already registered with different content",
            what, uuid
        ))),
    }
}

fn claim_from_reply(reply: &str) -> Result<ClaimOutcome> {
    match reply {
        "claimed" => Ok(ClaimOutcome::Claimed),
        "missing" => Ok(ClaimOutcome::Missing),
        status => Ok(ClaimOutcome::AlreadyClaimed(status.parse()?)),
    }
}

struct StoreScripts {
    register_build: Script,
    register_test_case: Script,
    claim: Script,
    set_phase: Script,
    finalize: Script,
    reset_stale: Script,
    heartbeat: Script,
}

/// Job Store backed by Redis hashes. Every conditional transition runs as
/// a Lua script, so it is atomic with respect to other clients.
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
    scripts: StoreScripts,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: Keys::new(prefix),
            scripts: StoreScripts {
                register_build: Script::new(REGISTER_BUILD),
                register_test_case: Script::new(REGISTER_TEST_CASE),
                claim: Script::new(CLAIM),
                set_phase: Script::new(SET_PHASE),
                finalize: Script::new(FINALIZE),
                reset_stale: Script::new(RESET_STALE),
                heartbeat: Script::new(HEARTBEAT),
            },
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn register_build(&self, job: &BuildJob) -> Result<Registration> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .register_build
            .key(self.keys.build(&job.uuid))
            .arg(&job.assignment_uuid)
            .arg(&job.language)
            .arg(&job.source)
            .arg(job.created_at)
            .invoke_async(&mut conn)
            .await?;
        registration_from_code(code, "build", &job.uuid)
    }

    async fn build(&self, uuid: &str) -> Result<Option<BuildJob>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.build(uuid)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(uuid, fields).map(Some)
    }

    async fn register_test_case(&self, case: &TestCase) -> Result<Registration> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .register_test_case
            .key(self.keys.test_case(&case.uuid))
            .key(self.keys.assignment_test_cases(&case.assignment_uuid))
            .arg(&case.uuid)
            .arg(&case.assignment_uuid)
            .arg(&case.input)
            .arg(&case.expected)
            .invoke_async(&mut conn)
            .await?;
        registration_from_code(code, "test case", &case.uuid)
    }

    async fn test_cases(&self, assignment_uuid: &str) -> Result<Vec<TestCase>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(self.keys.assignment_test_cases(assignment_uuid), 0, -1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.test_case(id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut cases = Vec::with_capacity(ids.len());
        for (uuid, mut fields) in ids.into_iter().zip(rows) {
            if fields.is_empty() {
                warn!(assignment = %assignment_uuid, test_case = %uuid, "Skipping dangling test case id");
                continue;
            }
            cases.push(TestCase {
                uuid,
                assignment_uuid: take(&mut fields, "assignment_uuid"),
                input: take(&mut fields, "input"),
                expected: take(&mut fields, "expected"),
            });
        }
        Ok(cases)
    }

    async fn claim(&self, uuid: &str, now_ms: i64) -> Result<ClaimOutcome> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .scripts
            .claim
            .key(self.keys.build(uuid))
            .key(self.keys.running())
            .arg(uuid)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        claim_from_reply(&reply)
    }

    async fn set_phase(&self, uuid: &str, phase: RunningPhase) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .set_phase
            .key(self.keys.build(uuid))
            .arg(phase.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn finalize(&self, uuid: &str, report: &BuildReport) -> Result<bool> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .finalize
            .key(self.keys.build(uuid))
            .key(self.keys.running())
            .arg(uuid)
            .arg(report.status.as_str())
            .arg(report.score)
            .arg(&report.details)
            .arg(&report.build_log)
            .arg(&report.tests_log)
            .arg(report.tests_passed)
            .arg(report.tests_total)
            .arg(&report.exception)
            .invoke_async(&mut conn)
            .await?;
        match code {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(JudgeError::NotFound(format!("build '{}' not found", uuid))),
        }
    }

    async fn heartbeat(&self, uuid: &str, now_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .heartbeat
            .key(self.keys.build(uuid))
            .key(self.keys.running())
            .arg(uuid)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn reset_stale(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let candidates: Vec<String> = conn
            .zrangebyscore(self.keys.running(), "-inf", cutoff_ms)
            .await?;

        for uuid in candidates {
            let _: i64 = self
                .scripts
                .reset_stale
                .key(self.keys.build(&uuid))
                .key(self.keys.running())
                .key(self.keys.requeue())
                .arg(&uuid)
                .arg(cutoff_ms)
                .invoke_async(&mut conn)
                .await?;
        }
        let mut awaiting: Vec<String> = conn.smembers(self.keys.requeue()).await?;
        awaiting.sort();
        Ok(awaiting)
    }

    async fn confirm_requeued(&self, uuid: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(self.keys.requeue(), uuid).await?;
        Ok(())
    }
}

struct QueueScripts {
    receive: Script,
    ack: Script,
    requeue_expired: Script,
}

/// Reliable list queue: pending → processing with a lease per delivery.
/// Uses LPUSH/RPOPLPUSH for FIFO semantics.
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: Keys,
    lease: Duration,
    scripts: QueueScripts,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, prefix: &str, lease: Duration) -> Self {
        Self {
            conn,
            keys: Keys::new(prefix),
            lease,
            scripts: QueueScripts {
                receive: Script::new(RECEIVE),
                ack: Script::new(ACK),
                requeue_expired: Script::new(REQUEUE_EXPIRED),
            },
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn publish(&self, uuid: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(self.keys.queue_pending(), uuid).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let deadline = chrono::Utc::now().timestamp_millis() + self.lease.as_millis() as i64;
        let uuid: Option<String> = self
            .scripts
            .receive
            .key(self.keys.queue_pending())
            .key(self.keys.queue_processing())
            .key(self.keys.queue_leases())
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        Ok(uuid.map(|uuid| Delivery { uuid }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .ack
            .key(self.keys.queue_processing())
            .key(self.keys.queue_leases())
            .arg(&delivery.uuid)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let now = chrono::Utc::now().timestamp_millis();
        let moved: i64 = self
            .scripts
            .requeue_expired
            .key(self.keys.queue_pending())
            .key(self.keys.queue_processing())
            .key(self.keys.queue_leases())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as usize)
    }

    async fn notify_finished(&self, event: &BuildFinishedEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn
            .publish(self.keys.build_finished_channel(), payload)
            .await?;
        Ok(())
    }
}
