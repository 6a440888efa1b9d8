//! Redis-backed store for multi-node deployments.
//!
//! Layout:
//! - `pisces:traffic:group:{visitor}` hash, field = experiment id, value = group id
//! - `pisces:mab:arm:{experiment}:{group}` hash with `trials`, `successes`, `failures`
//! - `pisces:mab:trials:{experiment}` integer total of trials across arms
//! - `pisces:event:counter:{experiment}:{group}` hash, field = event type, value = count
//! - `pisces:experiment:{experiment}` JSON experiment definition
//!
//! Every counter write is a native atomic command (`HSETNX`, `HINCRBY`, `INCR`),
//! so concurrent writers on different nodes never lose an update.

use parking_lot::Mutex;
use pisces_core::config::RedisConfig;
use pisces_core::store::{
    BanditStore, EventCounterProvider, EventCounterSink, ExperimentProvider,
    ExperimentRepository, StickyStore,
};
use pisces_core::types::{ArmCounters, EventType, ExperimentDefinition};
use pisces_core::{PiscesError, PiscesResult};
use redis::Commands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const STICKY_PREFIX: &str = "pisces:traffic:group:";
const ARM_PREFIX: &str = "pisces:mab:arm:";
const TOTAL_TRIALS_PREFIX: &str = "pisces:mab:trials:";
const EVENT_COUNTER_PREFIX: &str = "pisces:event:counter:";
const EXPERIMENT_PREFIX: &str = "pisces:experiment:";

fn storage_error(err: redis::RedisError) -> PiscesError {
    metrics::counter!("cache.redis.errors").increment(1);
    PiscesError::Storage(err.to_string())
}

fn sticky_key(visitor_id: &str) -> String {
    format!("{STICKY_PREFIX}{visitor_id}")
}

fn arm_key(experiment_id: &str, group_id: &str) -> String {
    format!("{ARM_PREFIX}{experiment_id}:{group_id}")
}

fn total_trials_key(experiment_id: &str) -> String {
    format!("{TOTAL_TRIALS_PREFIX}{experiment_id}")
}

fn event_counter_key(experiment_id: &str, group_id: &str) -> String {
    format!("{EVENT_COUNTER_PREFIX}{experiment_id}:{group_id}")
}

fn experiment_key(experiment_id: &str) -> String {
    format!("{EXPERIMENT_PREFIX}{experiment_id}")
}

pub struct RedisStore {
    client: redis::Client,
    /// Connections returned after a successful command, reused LIFO.
    idle: Mutex<Vec<redis::Connection>>,
    max_idle: usize,
    connect_timeout: Duration,
    sticky_ttl_secs: u64,
    bandit_ttl_secs: u64,
}

impl RedisStore {
    /// Open the client and verify connectivity with a PING.
    pub fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str())?;
        let store = Self {
            client,
            idle: Mutex::new(Vec::with_capacity(config.max_idle_connections)),
            max_idle: config.max_idle_connections,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            sticky_ttl_secs: config.sticky_ttl_secs,
            bandit_ttl_secs: config.bandit_ttl_secs,
        };

        let pong: String = store.with_connection(|conn| redis::cmd("PING").query(conn))?;
        info!(response = %pong, "Redis connection established");

        Ok(store)
    }

    /// Run `op` on an idle connection, opening a new one when none is free.
    /// The connection goes back to the idle list only if `op` succeeded.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> PiscesResult<T> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => {
                debug!("Opening Redis connection");
                self.client
                    .get_connection_with_timeout(self.connect_timeout)
                    .map_err(storage_error)?
            }
        };

        let result = op(&mut conn);
        if result.is_ok() {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
        result.map_err(storage_error)
    }
}

impl StickyStore for RedisStore {
    fn get(&self, visitor_id: &str, experiment_id: &str) -> PiscesResult<Option<String>> {
        self.with_connection(|conn| conn.hget(sticky_key(visitor_id), experiment_id))
    }

    fn put_if_absent(
        &self,
        visitor_id: &str,
        experiment_id: &str,
        group_id: &str,
    ) -> PiscesResult<String> {
        let key = sticky_key(visitor_id);
        let (winner,): (String,) = self.with_connection(|conn| {
            redis::pipe()
            .atomic()
            .cmd("HSETNX")
            .arg(&key)
            .arg(experiment_id)
            .arg(group_id)
            .ignore()
            .cmd("HGET")
            .arg(&key)
            .arg(experiment_id)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.sticky_ttl_secs)
            .ignore()
            .query(conn)
        })?;
        Ok(winner)
    }

    fn experiments_for_visitor(&self, visitor_id: &str) -> PiscesResult<HashMap<String, String>> {
        self.with_connection(|conn| conn.hgetall(sticky_key(visitor_id)))
    }
}

impl BanditStore for RedisStore {
    fn arm(&self, experiment_id: &str, group_id: &str) -> PiscesResult<ArmCounters> {
        let (trials, successes, failures): (Option<u64>, Option<u64>, Option<u64>) =
            self.with_connection(|conn| {
                redis::cmd("HMGET")
                    .arg(arm_key(experiment_id, group_id))
                    .arg("trials")
                    .arg("successes")
                    .arg("failures")
                    .query(conn)
            })?;
        Ok(ArmCounters {
            trials: trials.unwrap_or(0),
            successes: successes.unwrap_or(0),
            failures: failures.unwrap_or(0),
        })
    }

    fn total_trials(&self, experiment_id: &str) -> PiscesResult<u64> {
        let total: Option<u64> =
            self.with_connection(|conn| conn.get(total_trials_key(experiment_id)))?;
        Ok(total.unwrap_or(0))
    }

    fn record_trial(&self, experiment_id: &str, group_id: &str) -> PiscesResult<()> {
        let arm = arm_key(experiment_id, group_id);
        let total = total_trials_key(experiment_id);
        self.with_connection(|conn| {
            redis::pipe()
                .cmd("HINCRBY")
                .arg(&arm)
                .arg("trials")
                .arg(1)
                .ignore()
                .cmd("EXPIRE")
                .arg(&arm)
                .arg(self.bandit_ttl_secs)
                .ignore()
                .cmd("INCR")
                .arg(&total)
                .ignore()
                .cmd("EXPIRE")
                .arg(&total)
                .arg(self.bandit_ttl_secs)
                .ignore()
                .query::<()>(conn)
        })
    }

    fn record_reward(
        &self,
        experiment_id: &str,
        group_id: &str,
        success: bool,
    ) -> PiscesResult<()> {
        let arm = arm_key(experiment_id, group_id);
        let field = if success { "successes" } else { "failures" };
        self.with_connection(|conn| {
            redis::pipe()
                .cmd("HINCRBY")
                .arg(&arm)
                .arg(field)
                .arg(1)
                .ignore()
                .cmd("EXPIRE")
                .arg(&arm)
                .arg(self.bandit_ttl_secs)
                .ignore()
                .query::<()>(conn)
        })
    }
}

impl EventCounterProvider for RedisStore {
    fn event_count(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64> {
        let count: Option<u64> = self.with_connection(|conn| {
            conn.hget(event_counter_key(experiment_id, group_id), event_type.as_str())
        })?;
        Ok(count.unwrap_or(0))
    }
}

impl EventCounterSink for RedisStore {
    fn increment(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64> {
        let key = event_counter_key(experiment_id, group_id);
        let (count,): (u64,) = self.with_connection(|conn| {
            redis::pipe()
                .cmd("HINCRBY")
                .arg(&key)
                .arg(event_type.as_str())
                .arg(1)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.bandit_ttl_secs)
                .ignore()
                .query(conn)
        })?;
        Ok(count)
    }
}

impl ExperimentProvider for RedisStore {
    fn get(&self, experiment_id: &str) -> PiscesResult<Option<Arc<ExperimentDefinition>>> {
        let raw: Option<String> =
            self.with_connection(|conn| conn.get(experiment_key(experiment_id)))?;
        match raw {
            Some(raw) => Ok(Some(Arc::new(serde_json::from_str(&raw)?))),
            None => Ok(None),
        }
    }
}

impl ExperimentRepository for RedisStore {
    fn save(&self, definition: ExperimentDefinition) -> PiscesResult<()> {
        let json = serde_json::to_string(&definition)?;
        self.with_connection(|conn| conn.set::<_, _, ()>(experiment_key(&definition.id), json))
    }

    fn delete(&self, experiment_id: &str) -> PiscesResult<bool> {
        let removed: u64 = self.with_connection(|conn| conn.del(experiment_key(experiment_id)))?;
        Ok(removed > 0)
    }
}
