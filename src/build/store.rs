//! Build task persistence
//!
//! Every status change is a conditional update: it applies only if the
//! task's current status is one of the expected ones, checked and written
//! in one atomic step. A worker holding a stale view can never overwrite a
//! cancellation.

use async_trait::async_trait;

use super::task::{BuildStatus, BuildTask, SandboxImage};
use crate::core::StoreError;

#[async_trait]
pub trait BuildTaskStore: Send + Sync {
    async fn load(&self, id: i64) -> Result<BuildTask, StoreError>;

    /// Set status to `to` if it is currently one of `from`. Returns whether it applied.
    ///
    /// Statuses in `from` that may not move to `to` never match.
    async fn transition(
        &self,
        id: i64,
        from: &[BuildStatus],
        to: BuildStatus,
    ) -> Result<bool, StoreError>;

    /// Save the build process's return code and timeout flag.
    async fn record_outcome(
        &self,
        id: i64,
        return_code: Option<i32>,
        timed_out: bool,
    ) -> Result<(), StoreError>;

    /// `in_progress -> image_invalid` with the validation message
    async fn record_validation_error(&self, id: i64, message: &str) -> Result<bool, StoreError>;

    /// `in_progress -> internal_error` with diagnostic text
    async fn record_internal_error(&self, id: i64, message: &str) -> Result<bool, StoreError>;

    /// `in_progress -> done`, creating or retagging the task's image in the same step.
    ///
    /// An existing image keeps its display name. Returns `None` (and changes
    /// nothing) if the task is no longer in progress.
    async fn complete_with_image(
        &self,
        id: i64,
        tag: &str,
    ) -> Result<Option<SandboxImage>, StoreError>;

    async fn load_image(&self, id: i64) -> Result<SandboxImage, StoreError>;

    /// User-requested cancellation. No effect once the task is terminal.
    async fn request_cancel(&self, id: i64) -> Result<bool, StoreError> {
        self.transition(
            id,
            &[BuildStatus::Queued, BuildStatus::InProgress],
            BuildStatus::Cancelled,
        )
        .await
    }
}

/// The statuses of `from` that the state machine lets move to `to`.
pub fn legal_sources(from: &[BuildStatus], to: BuildStatus) -> Vec<BuildStatus> {
    from.iter()
        .copied()
        .filter(|status| status.can_transition_to(to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::memory_store::MemoryTaskStore;
    use crate::build::task::NewBuildTask;
    use std::path::PathBuf;

    fn new_task(image_id: Option<i64>) -> NewBuildTask {
        NewBuildTask {
            project_id: 3,
            build_dir: PathBuf::from("/tmp/build"),
            output_filename: PathBuf::from("/tmp/build.log"),
            image_id,
        }
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let store = MemoryTaskStore::new();
        let task = store.insert(new_task(None)).await.unwrap();
        assert_eq!(task.status, BuildStatus::Queued);

        assert!(store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap());
        // stale expectation does nothing
        assert!(!store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap());
        assert_eq!(store.load(task.id).await.unwrap().status, BuildStatus::InProgress);
    }

    #[tokio::test]
    async fn test_cancel_has_no_effect_on_terminal_task() {
        let store = MemoryTaskStore::new();
        let task = store.insert(new_task(None)).await.unwrap();
        store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap();
        store
            .transition(task.id, &[BuildStatus::InProgress], BuildStatus::Failed)
            .await
            .unwrap();

        assert!(!store.request_cancel(task.id).await.unwrap());
        assert_eq!(store.load(task.id).await.unwrap().status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_complete_creates_then_retags_image() {
        let store = MemoryTaskStore::new();
        let first = store.insert(new_task(None)).await.unwrap();
        store
            .transition(first.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap();
        let image = store
            .complete_with_image(first.id, "reg/build1_resulta")
            .await
            .unwrap()
            .unwrap();
        assert!(image.display_name.starts_with("New Image "));
        assert_eq!(store.load(first.id).await.unwrap().image_id, Some(image.id));

        let second = store.insert(new_task(Some(image.id))).await.unwrap();
        store
            .transition(second.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap();
        let retagged = store
            .complete_with_image(second.id, "reg/build2_resultb")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retagged.id, image.id);
        assert_eq!(retagged.display_name, image.display_name);
        assert_eq!(retagged.tag, "reg/build2_resultb");
        assert_eq!(store.image_count().await, 1);
    }

    #[tokio::test]
    async fn test_complete_after_cancel_changes_nothing() {
        let store = MemoryTaskStore::new();
        let task = store.insert(new_task(None)).await.unwrap();
        store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::InProgress)
            .await
            .unwrap();
        store.request_cancel(task.id).await.unwrap();

        assert_eq!(store.complete_with_image(task.id, "tag").await.unwrap(), None);
        assert!(!store.record_internal_error(task.id, "boom").await.unwrap());
        let task = store.load(task.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Cancelled);
        assert_eq!(task.image_id, None);
        assert_eq!(store.image_count().await, 0);
    }

    #[test]
    fn test_legal_sources() {
        use BuildStatus::*;
        assert_eq!(legal_sources(&[Queued, InProgress], InProgress), vec![Queued, InProgress]);
        assert_eq!(legal_sources(&[Queued, InProgress], Done), vec![InProgress]);
        assert!(legal_sources(&[Done, Cancelled], Failed).is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_never_applies() {
        let store = MemoryTaskStore::new();
        let task = store.insert(new_task(None)).await.unwrap();
        // queued tasks go through in_progress before any outcome
        assert!(!store
            .transition(task.id, &[BuildStatus::Queued], BuildStatus::Done)
            .await
            .unwrap());
        assert_eq!(store.load(task.id).await.unwrap().status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn test_missing_task() {
        let store = MemoryTaskStore::new();
        assert!(matches!(
            store.load(99).await,
            Err(StoreError::NotFound { id: 99, .. })
        ));
        assert!(store.request_cancel(99).await.is_err());
    }
}
