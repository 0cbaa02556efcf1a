//! In-process build task store for tests
//!
//! The mutex plays the part of the row lock.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store::{legal_sources, BuildTaskStore};
use super::task::{new_image_display_name, BuildStatus, BuildTask, NewBuildTask, SandboxImage};
use crate::core::StoreError;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<i64, BuildTask>,
    images: HashMap<i64, SandboxImage>,
    last_task_id: i64,
    last_image_id: i64,
}

impl MemoryState {
    fn task_mut(&mut self, id: i64) -> Result<&mut BuildTask, StoreError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("build task", id))
    }
}

#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new task, the way the web app does
    pub async fn insert(&self, task: NewBuildTask) -> Result<BuildTask, StoreError> {
        let mut state = self.state.lock().await;
        state.last_task_id += 1;
        let task = task.into_task(state.last_task_id);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Register an existing image, e.g. one a rebuild should retag
    pub async fn insert_image(&self, project_id: i64, display_name: &str, tag: &str) -> SandboxImage {
        let mut state = self.state.lock().await;
        state.last_image_id += 1;
        let image = SandboxImage {
            id: state.last_image_id,
            project_id,
            display_name: display_name.to_string(),
            tag: tag.to_string(),
        };
        state.images.insert(image.id, image.clone());
        image
    }

    pub async fn image_count(&self) -> usize {
        self.state.lock().await.images.len()
    }
}

#[async_trait]
impl BuildTaskStore for MemoryTaskStore {
    async fn load(&self, id: i64) -> Result<BuildTask, StoreError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("build task", id))
    }

    async fn transition(
        &self,
        id: i64,
        from: &[BuildStatus],
        to: BuildStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        if !legal_sources(from, to).contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        Ok(true)
    }

    async fn record_outcome(
        &self,
        id: i64,
        return_code: Option<i32>,
        timed_out: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        task.return_code = return_code;
        task.timed_out = timed_out;
        Ok(())
    }

    async fn record_validation_error(&self, id: i64, message: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        if task.status != BuildStatus::InProgress {
            return Ok(false);
        }
        task.status = BuildStatus::ImageInvalid;
        task.validation_error_msg = message.to_string();
        Ok(true)
    }

    async fn record_internal_error(&self, id: i64, message: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        if task.status != BuildStatus::InProgress {
            return Ok(false);
        }
        task.status = BuildStatus::InternalError;
        task.internal_error_msg = message.to_string();
        Ok(true)
    }

    async fn complete_with_image(
        &self,
        id: i64,
        tag: &str,
    ) -> Result<Option<SandboxImage>, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("build task", id))?;
        if task.status != BuildStatus::InProgress {
            return Ok(None);
        }

        let retagged = task.image_id.and_then(|image_id| {
            let image = state.images.get_mut(&image_id)?;
            image.tag = tag.to_string();
            Some(image.clone())
        });
        let image = match retagged {
            Some(image) => image,
            None => {
                state.last_image_id += 1;
                let image = SandboxImage {
                    id: state.last_image_id,
                    project_id: task.project_id,
                    display_name: new_image_display_name(),
                    tag: tag.to_string(),
                };
                state.images.insert(image.id, image.clone());
                task.image_id = Some(image.id);
                image
            }
        };
        task.status = BuildStatus::Done;
        Ok(Some(image))
    }

    async fn load_image(&self, id: i64) -> Result<SandboxImage, StoreError> {
        let state = self.state.lock().await;
        state
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("sandbox image", id))
    }
}
