mod build;
mod config;
mod core;
mod feedback;
mod grading;
mod recorder;
mod redis_manager;
mod retry;
mod runner;
mod sandbox;
mod storage;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::build::{BuildOrchestrator, BuildSettings, BuildTaskStore, DockerCli, RedisTaskStore};
use crate::config::{init_config, GraderConfig};
use crate::redis_manager::{RedisManager, WorkerJob};
use crate::retry::{with_backoff, RetryPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ag_grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = init_config(GraderConfig::load()?)?;
    info!(
        "Starting grader worker (sandbox backend {:?}, project storage {:?})",
        config.sandbox_backend, config.project_storage
    );

    let files = storage::from_config(config).await?;

    let store: Arc<dyn BuildTaskStore> = Arc::new(RedisTaskStore::connect(&config.redis_url).await?);
    let orchestrator = Arc::new(BuildOrchestrator::new(
        store.clone(),
        Arc::new(DockerCli::new(config)),
        BuildSettings::from_config(config),
    ));

    let mut redis = RedisManager::with_url(&config.redis_url).await?;
    info!("Worker {} waiting for jobs...", redis.worker_id());

    loop {
        match redis.pop_job().await? {
            WorkerJob::Grade(job) => {
                info!(
                    "Received grade job: submission_id={}, test_cases={}",
                    job.submission_id,
                    job.test_cases.len()
                );
                let result = grading::grade(&job, config, files.as_ref()).await;
                info!(
                    "Grade job completed: submission_id={}, status={:?}",
                    result.submission_id, result.status
                );
                if let Err(e) = redis.store_grading_result(&result).await {
                    error!(
                        "Failed to store grading result for submission {}: {:#}",
                        result.submission_id, e
                    );
                }
            }
            WorkerJob::BuildImage { build_task_id } => {
                info!("Received build job: build_task_id={}", build_task_id);
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.run(build_task_id).await });
            }
            WorkerJob::CancelBuild { build_task_id } => {
                let cancelled = with_backoff(&RetryPolicy::default(), "cancel build", || {
                    store.request_cancel(build_task_id)
                })
                .await;
                match cancelled {
                    Ok(true) => info!("Build task {} cancelled", build_task_id),
                    Ok(false) => info!(
                        "Build task {} already finished, nothing to cancel",
                        build_task_id
                    ),
                    Err(e) => warn!("Failed to cancel build task {}: {}", build_task_id, e),
                }
            }
        }
    }
}
