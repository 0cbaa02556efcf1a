//! Build module - custom sandbox image builds
//!
//! [`BuildOrchestrator::run`] takes a queued [`BuildTask`] through
//! `in_progress` to exactly one terminal status:
//!
//! 1. Skip the task if it was cancelled before pickup
//! 2. Mark it `in_progress`, restarting it if a redelivered job finds it there
//! 3. Build under a timeout while polling the store for cancellation
//! 4. Record the return code; stop if cancelled, fail on timeout or non-zero exit
//! 5. Reject images that set ENTRYPOINT or a non-shell CMD (`image_invalid`)
//! 6. Push, then create or retag the image and mark the task `done`
//!
//! Any error along the way ends in `internal_error` with the full error chain.

pub mod builder;
#[cfg(test)]
pub mod memory_store;
pub mod redis_store;
pub mod runtime;
pub mod store;
pub mod task;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Semaphore};
use tracing::{error, info, warn};

use crate::config::GraderConfig;
use crate::retry::{with_backoff, RetryPolicy};

pub use builder::{BuildOutcome, ImageBuilder};
pub use redis_store::RedisTaskStore;
pub use runtime::{ContainerRuntime, DockerCli, ImageConfig};
pub use store::BuildTaskStore;
pub use task::{BuildStatus, BuildTask, SandboxImage};
pub use validate::validate_image_config;

/// Timing and registry settings for builds.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub registry_host: String,
    pub registry_port: u16,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub cancel_grace: Duration,
    /// Builds running at once; further jobs wait for a slot
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl BuildSettings {
    pub fn from_config(config: &GraderConfig) -> Self {
        Self {
            registry_host: config.registry_host.clone(),
            registry_port: config.registry_port,
            timeout: config.image_build_timeout(),
            poll_interval: config.build_poll_interval(),
            cancel_grace: config.build_cancel_grace(),
            max_concurrent: config.max_concurrent_builds.max(1),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct BuildOrchestrator {
    store: Arc<dyn BuildTaskStore>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: BuildSettings,
    slots: Semaphore,
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<dyn BuildTaskStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            slots: Semaphore::new(settings.max_concurrent.max(1)),
            settings,
        }
    }

    /// Build the image for `task_id`. Never fails: errors become `internal_error`.
    ///
    /// Waits for a free build slot first; the task stays `queued` meanwhile.
    pub async fn run(&self, task_id: i64) {
        let result = match self.slots.acquire().await {
            Ok(_permit) => self.try_run(task_id).await,
            Err(e) => Err(e).context("Build slots closed"),
        };
        let Err(e) = result else {
            return;
        };

        let message = format!("{:?}", e);
        error!("Build task {} hit an internal error: {}", task_id, message);
        match with_backoff(&self.settings.retry, "save internal error", || {
            self.store.record_internal_error(task_id, &message)
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                "Build task {} is no longer in progress, internal error not saved",
                task_id
            ),
            Err(e) => error!(
                "Failed to save internal error for build task {}: {}",
                task_id, e
            ),
        }
    }

    async fn try_run(&self, task_id: i64) -> Result<()> {
        let retry = &self.settings.retry;

        let task = with_backoff(retry, "load build task", || self.store.load(task_id)).await?;
        if task.status == BuildStatus::Cancelled {
            info!("Build task {} was cancelled before it started", task_id);
            return Ok(());
        }

        // A task already in progress had its job redelivered after a worker
        // died mid-build; build it again rather than leave it stuck.
        let started = with_backoff(retry, "mark build in progress", || {
            self.store.transition(
                task_id,
                &[BuildStatus::Queued, BuildStatus::InProgress],
                BuildStatus::InProgress,
            )
        })
        .await?;
        if !started {
            info!(
                "Build task {} is {}, not queued; skipping",
                task_id, task.status
            );
            return Ok(());
        }
        if task.status == BuildStatus::InProgress {
            warn!("Build task {} was already in progress; restarting it", task_id);
        }
        info!("Build task {} in progress", task_id);

        let tag = runtime::image_tag(
            &self.settings.registry_host,
            self.settings.registry_port,
            task_id,
        )
        .await?;
        let builder = ImageBuilder::new(
            self.runtime.build_command(&tag, &task.build_dir),
            task.output_filename.clone(),
            self.settings.timeout,
            self.settings.cancel_grace,
        );
        let outcome = self.supervise(task_id, builder).await?;

        with_backoff(retry, "save build return code", || {
            self.store
                .record_outcome(task_id, outcome.return_code, outcome.timed_out)
        })
        .await?;

        let current = with_backoff(retry, "reload build task", || self.store.load(task_id)).await?;
        if outcome.cancelled || current.status == BuildStatus::Cancelled {
            info!("Build task {} cancelled", task_id);
            return Ok(());
        }

        if outcome.timed_out || outcome.return_code != Some(0) {
            info!(
                "Build task {} failed (return code {:?}, timed out: {})",
                task_id, outcome.return_code, outcome.timed_out
            );
            with_backoff(retry, "mark build failed", || {
                self.store
                    .transition(task_id, &[BuildStatus::InProgress], BuildStatus::Failed)
            })
            .await?;
            return Ok(());
        }

        let config = self
            .runtime
            .inspect_config(&tag)
            .await
            .with_context(|| format!("Failed to inspect image {}", tag))?;
        if let Err(message) = validate_image_config(&config) {
            info!("Build task {} produced an invalid image: {}", task_id, message.trim_end());
            with_backoff(retry, "save validation error", || {
                self.store.record_validation_error(task_id, &message)
            })
            .await?;
            return Ok(());
        }

        self.runtime
            .push(&tag)
            .await
            .with_context(|| format!("Failed to push image {}", tag))?;

        let image = with_backoff(retry, "save built image", || {
            self.store.complete_with_image(task_id, &tag)
        })
        .await?;
        match image {
            Some(image) => info!(
                "Build task {} done: image {} ({}) tagged {}",
                task_id, image.id, image.display_name, image.tag
            ),
            None => info!(
                "Build task {} finished after leaving in_progress; image not recorded",
                task_id
            ),
        }
        Ok(())
    }

    /// Run the build on its own task and poll for cancellation until it ends.
    async fn supervise(&self, task_id: i64, builder: ImageBuilder) -> Result<BuildOutcome> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut cancel_tx = Some(cancel_tx);
        let mut build = tokio::spawn(builder.run(cancel_rx));

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut build => {
                    return joined.context("Build task panicked")?;
                }
                _ = poll.tick(), if cancel_tx.is_some() => {
                    match self.store.load(task_id).await {
                        Ok(task) if task.status == BuildStatus::Cancelled => {
                            info!("Cancellation requested for build task {}", task_id);
                            if let Some(tx) = cancel_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to poll build task {}: {}", task_id, e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::memory_store::MemoryTaskStore;
    use crate::build::task::NewBuildTask;
    use crate::core::CommandFailed;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::runner::CommandSpec;

    /// "Builds" by running a shell script; inspect and push are canned.
    struct FakeRuntime {
        script: String,
        config: ImageConfig,
        push_error: Option<String>,
        built: Mutex<Vec<String>>,
        pushed: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
                config: ImageConfig {
                    entrypoint: None,
                    cmd: Some(vec!["/bin/bash".to_string()]),
                },
                push_error: None,
                built: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        fn build_command(&self, tag: &str, _context: &Path) -> CommandSpec {
            self.built.lock().unwrap().push(tag.to_string());
            CommandSpec::new("sh").with_args(["-c", self.script.as_str()])
        }

        async fn inspect_config(&self, _tag: &str) -> Result<ImageConfig> {
            Ok(self.config.clone())
        }

        async fn push(&self, tag: &str) -> Result<()> {
            if let Some(output) = &self.push_error {
                return Err(CommandFailed {
                    argv: vec!["docker".into(), "push".into(), tag.into()],
                    status: 1,
                    output: output.clone(),
                }
                .into());
            }
            self.pushed.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryTaskStore>,
        runtime: Arc<FakeRuntime>,
        orchestrator: Arc<BuildOrchestrator>,
    }

    fn fixture(runtime: FakeRuntime, timeout: Duration) -> Fixture {
        fixture_with_slots(runtime, timeout, 4)
    }

    fn fixture_with_slots(runtime: FakeRuntime, timeout: Duration, max_concurrent: usize) -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let runtime = Arc::new(runtime);
        let settings = BuildSettings {
            registry_host: "127.0.0.1".into(),
            registry_port: 5001,
            timeout,
            poll_interval: Duration::from_millis(50),
            cancel_grace: Duration::from_millis(300),
            max_concurrent,
            retry: RetryPolicy::default(),
        };
        let orchestrator = Arc::new(BuildOrchestrator::new(
            store.clone(),
            runtime.clone(),
            settings,
        ));
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            store,
            runtime,
            orchestrator,
        }
    }

    impl Fixture {
        async fn queue(&self, image_id: Option<i64>) -> BuildTask {
            self.store
                .insert(NewBuildTask {
                    project_id: 1,
                    build_dir: self.dir.path().to_path_buf(),
                    output_filename: self.output_path(),
                    image_id,
                })
                .await
                .unwrap()
        }

        fn output_path(&self) -> PathBuf {
            self.dir.path().join("output.txt")
        }
    }

    #[tokio::test]
    async fn test_successful_build_creates_image() {
        let fx = fixture(FakeRuntime::new("echo building; exit 0"), Duration::from_secs(30));
        let task = fx.queue(None).await;

        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Done);
        assert_eq!(task.return_code, Some(0));
        assert!(!task.timed_out);

        let image = fx.store.load_image(task.image_id.unwrap()).await.unwrap();
        assert!(image.tag.starts_with("127.0.0.1:5001/build1_result"));
        assert!(image.display_name.starts_with("New Image "));
        assert_eq!(*fx.runtime.pushed.lock().unwrap(), vec![image.tag.clone()]);
        assert!(std::fs::read_to_string(fx.output_path())
            .unwrap()
            .contains("building"));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_display_name() {
        let fx = fixture(FakeRuntime::new("exit 0"), Duration::from_secs(30));
        let existing = fx
            .store
            .insert_image(1, "Course Image", "old:tag")
            .await;
        let task = fx.queue(Some(existing.id)).await;

        fx.orchestrator.run(task.id).await;

        let image = fx.store.load_image(existing.id).await.unwrap();
        assert_eq!(image.display_name, "Course Image");
        assert_ne!(image.tag, "old:tag");
        assert_eq!(fx.store.image_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_pickup_never_builds() {
        let fx = fixture(FakeRuntime::new("exit 0"), Duration::from_secs(30));
        let task = fx.queue(None).await;
        assert!(fx.store.request_cancel(task.id).await.unwrap());

        fx.orchestrator.run(task.id).await;

        assert_eq!(
            fx.store.load(task.id).await.unwrap().status,
            BuildStatus::Cancelled
        );
        assert!(fx.runtime.built.lock().unwrap().is_empty());
        assert!(!fx.output_path().exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let fx = fixture(FakeRuntime::new("echo nope; exit 3"), Duration::from_secs(30));
        let task = fx.queue(None).await;

        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Failed);
        assert_eq!(task.return_code, Some(3));
        assert_eq!(task.image_id, None);
        assert!(fx.runtime.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let fx = fixture(FakeRuntime::new("sleep 30"), Duration::from_millis(500));
        let task = fx.queue(None).await;

        let started = Instant::now();
        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Failed);
        assert!(task.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_invalid_image_is_rejected() {
        let mut runtime = FakeRuntime::new("exit 0");
        runtime.config.entrypoint = Some(vec!["/custom".to_string()]);
        let fx = fixture(runtime, Duration::from_secs(30));
        let task = fx.queue(None).await;

        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::ImageInvalid);
        assert!(task.validation_error_msg.contains("ENTRYPOINT"));
        assert_eq!(task.image_id, None);
        assert_eq!(fx.store.image_count().await, 0);
        assert!(fx.runtime.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_failure_is_internal_error() {
        let mut runtime = FakeRuntime::new("exit 0");
        runtime.push_error = Some("denied: requested access to the resource is denied".into());
        let fx = fixture(runtime, Duration::from_secs(30));
        let task = fx.queue(None).await;

        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::InternalError);
        assert!(task.internal_error_msg.contains("Failed to push image"));
        assert!(task.internal_error_msg.contains("denied"));
        assert_eq!(task.image_id, None);
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let fx = fixture(
            FakeRuntime::new("trap '' TERM; sleep 30"),
            Duration::from_secs(60),
        );
        let task = fx.queue(None).await;

        let orchestrator = fx.orchestrator.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { orchestrator.run(task.id).await });

        // wait until the worker has picked the task up
        while fx.store.load(task.id).await.unwrap().status == BuildStatus::Queued {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.store.request_cancel(task.id).await.unwrap());
        handle.await.unwrap();

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Cancelled);
        assert_eq!(task.return_code, Some(-9));
        assert_eq!(task.image_id, None);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(fx.runtime.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_builds_are_independent() {
        let fx = fixture(FakeRuntime::new("sleep 0.2; exit 0"), Duration::from_secs(30));
        let first = fx.queue(None).await;
        let second = fx.queue(None).await;

        tokio::join!(fx.orchestrator.run(first.id), fx.orchestrator.run(second.id));

        let first = fx.store.load(first.id).await.unwrap();
        let second = fx.store.load(second.id).await.unwrap();
        assert_eq!(first.status, BuildStatus::Done);
        assert_eq!(second.status, BuildStatus::Done);
        assert_ne!(first.image_id, second.image_id);

        let first_image = fx.store.load_image(first.image_id.unwrap()).await.unwrap();
        let second_image = fx.store.load_image(second.image_id.unwrap()).await.unwrap();
        assert!(first_image.tag.contains(&format!("/build{}_result", first.id)));
        assert!(second_image.tag.contains(&format!("/build{}_result", second.id)));
    }

    #[tokio::test]
    async fn test_redelivered_in_progress_task_is_rebuilt() {
        let fx = fixture(FakeRuntime::new("exit 0"), Duration::from_secs(30));
        let task = fx.queue(None).await;
        // a previous worker picked it up, then died
        assert!(fx
            .store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap());

        fx.orchestrator.run(task.id).await;

        let task = fx.store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Done);
        assert!(task.image_id.is_some());
        assert_eq!(fx.runtime.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_task_is_not_rebuilt() {
        let fx = fixture(FakeRuntime::new("exit 0"), Duration::from_secs(30));
        let task = fx.queue(None).await;
        fx.orchestrator.run(task.id).await;
        let image_id = fx.store.load(task.id).await.unwrap().image_id;

        // a duplicate job for a terminal task does nothing
        fx.orchestrator.run(task.id).await;

        assert_eq!(fx.runtime.built.lock().unwrap().len(), 1);
        assert_eq!(fx.store.load(task.id).await.unwrap().image_id, image_id);
    }

    #[tokio::test]
    async fn test_builds_wait_for_a_free_slot() {
        let fx = fixture_with_slots(
            FakeRuntime::new("sleep 0.5; exit 0"),
            Duration::from_secs(30),
            1,
        );
        let first = fx.queue(None).await;
        let second = fx.queue(None).await;

        let started = Instant::now();
        let check_waiting = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(
                fx.store.load(first.id).await.unwrap().status,
                BuildStatus::InProgress
            );
            assert_eq!(
                fx.store.load(second.id).await.unwrap().status,
                BuildStatus::Queued
            );
        };
        tokio::join!(
            fx.orchestrator.run(first.id),
            fx.orchestrator.run(second.id),
            check_waiting
        );

        assert!(started.elapsed() >= Duration::from_millis(1000));
        for id in [first.id, second.id] {
            assert_eq!(fx.store.load(id).await.unwrap().status, BuildStatus::Done);
        }
    }

    #[tokio::test]
    async fn test_missing_task_does_not_panic() {
        let fx = fixture(FakeRuntime::new("exit 0"), Duration::from_secs(30));
        fx.orchestrator.run(404).await;
        assert!(fx.runtime.built.lock().unwrap().is_empty());
    }
}
