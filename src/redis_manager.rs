//! Redis Manager - job intake and result publishing
//!
//! This module handles:
//! - Worker ID allocation and lease management
//! - Job queue operations (BLPOP)
//! - Grading result storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::grading::{GradingJob, GradingResult};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "grader:worker:lease:";

    /// Job queue key
    pub const GRADER_QUEUE: &str = "grader:queue";

    /// Grading result key prefix (for polling)
    pub const GRADING_RESULT_PREFIX: &str = "grader:result:";

    /// Grading result channel (for pub/sub)
    pub const GRADING_RESULT_CHANNEL: &str = "grader:results";
}

const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;
const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Worker job enum - the kinds of jobs a worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Grade a submission
    #[serde(rename = "grade")]
    Grade(GradingJob),
    /// Build a custom sandbox image
    #[serde(rename = "build_image")]
    BuildImage { build_task_id: i64 },
    /// Cancel a queued or running image build
    #[serde(rename = "cancel_build")]
    CancelBuild { build_task_id: i64 },
}

pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
    lease_handle: JoinHandle<()>,
}

impl RedisManager {
    /// Connect, claim a worker ID, and keep its lease alive in the background.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = allocate_worker_id(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );

        let lease_handle = spawn_lease_heartbeat(client.clone(), worker_id);

        Ok(Self {
            worker_id,
            client,
            conn,
            lease_handle,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Block until the next parseable job arrives.
    ///
    /// Reconnects on connection failure; malformed jobs are logged and dropped.
    pub async fn pop_job(&mut self) -> Result<WorkerJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::GRADER_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match parse_job(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Store a grading result with a 1-hour expiration and publish it.
    pub async fn store_grading_result(&mut self, result: &GradingResult) -> Result<()> {
        let key = format!("{}{}", keys::GRADING_RESULT_PREFIX, result.submission_id);
        let json = serde_json::to_string(result)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // There may be no subscribers
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::GRADING_RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

fn parse_job(data: &str) -> serde_json::Result<WorkerJob> {
    serde_json::from_str(data)
}

async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

fn worker_lease_key(worker_id: u32) -> String {
    format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id)
}

/// Claim the first free worker ID with SET NX EX.
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await?;

        for worker_id in 0..MAX_WORKERS {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(worker_lease_key(worker_id))
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);

        loop {
            tokio::time::sleep(interval).await;

            match get_connection_with_retry(&client).await {
                Ok(mut conn) => {
                    if let Err(e) = redis::cmd("EXPIRE")
                        .arg(worker_lease_key(worker_id))
                        .arg(WORKER_LEASE_TTL_SECS as usize)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("Failed to refresh worker lease {}: {}", worker_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh worker lease {} (connection): {}",
                        worker_id, e
                    );
                }
            }
        }
    })
}
