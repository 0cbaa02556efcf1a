//! Redis-backed build task store
//!
//! Each task is a hash at `{grader}:build_task:<id>`, each image a hash at
//! `{grader}:sandbox_image:<id>`. Conditional updates run as Lua scripts so
//! the status check and the write happen atomically on the server.
//!
//! All keys share the `{grader}` hash tag, so on a cluster they live in one
//! slot and a script may touch image keys it only learns while running.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::store::{legal_sources, BuildTaskStore};
use super::task::{new_image_display_name, BuildStatus, BuildTask, SandboxImage};
use crate::core::StoreError;

/// Redis key constants
pub mod keys {
    pub const TASK_PREFIX: &str = "{grader}:build_task:";
    pub const IMAGE_PREFIX: &str = "{grader}:sandbox_image:";
    pub const IMAGE_ID_COUNTER: &str = "{grader}:counter:sandbox_image";
}

/// KEYS[1] task. ARGV: to, message field ("" for none), message, from...
/// Returns -1 if the task is missing, 1 if applied, 0 otherwise.
const TRANSITION_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return -1 end
for i = 4, #ARGV do
  if status == ARGV[i] then
    redis.call('HSET', KEYS[1], 'status', ARGV[1])
    if ARGV[2] ~= '' then
      redis.call('HSET', KEYS[1], ARGV[2], ARGV[3])
    end
    return 1
  end
end
return 0
"#;

/// KEYS[1] task. ARGV: return code ("" for none), timed out flag.
const OUTCOME_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('HSET', KEYS[1], 'return_code', ARGV[1], 'timed_out', ARGV[2])
return 1
"#;

/// KEYS[1] task, KEYS[2] image id counter. ARGV: tag, display name for a
/// new image, image key prefix. Returns the image id, 0 if the task is not
/// in progress, -1 if it is missing.
const COMPLETE_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return -1 end
if status ~= 'in_progress' then return 0 end
local image_id = redis.call('HGET', KEYS[1], 'image_id')
if image_id and image_id ~= '' and redis.call('EXISTS', ARGV[3] .. image_id) == 1 then
  redis.call('HSET', ARGV[3] .. image_id, 'tag', ARGV[1])
else
  image_id = tostring(redis.call('INCR', KEYS[2]))
  local project_id = redis.call('HGET', KEYS[1], 'project_id')
  redis.call('HSET', ARGV[3] .. image_id,
    'id', image_id, 'project_id', project_id, 'display_name', ARGV[2], 'tag', ARGV[1])
  redis.call('HSET', KEYS[1], 'image_id', image_id)
end
redis.call('HSET', KEYS[1], 'status', 'done')
return tonumber(image_id)
"#;

pub struct RedisTaskStore {
    conn: ConnectionManager,
    transition: Script,
    outcome: Script,
    complete: Script,
}

impl RedisTaskStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Build task store connected to {}", redis_url);
        Ok(Self {
            conn,
            transition: Script::new(TRANSITION_SCRIPT),
            outcome: Script::new(OUTCOME_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
        })
    }

    fn task_key(id: i64) -> String {
        format!("{}{}", keys::TASK_PREFIX, id)
    }

    fn image_key(id: i64) -> String {
        format!("{}{}", keys::IMAGE_PREFIX, id)
    }

    async fn conditional_update(
        &self,
        id: i64,
        from: &[BuildStatus],
        to: BuildStatus,
        message: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let (field, text) = message.unwrap_or(("", ""));
        let mut invocation = self.transition.key(Self::task_key(id));
        invocation.arg(to.as_str()).arg(field).arg(text);
        for status in legal_sources(from, to) {
            invocation.arg(status.as_str());
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        match applied {
            -1 => Err(StoreError::not_found("build task", id)),
            applied => Ok(applied == 1),
        }
    }
}

#[async_trait]
impl BuildTaskStore for RedisTaskStore {
    async fn load(&self, id: i64) -> Result<BuildTask, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::task_key(id)).await?;
        if fields.is_empty() {
            return Err(StoreError::not_found("build task", id));
        }
        decode_task(id, &fields)
    }

    async fn transition(
        &self,
        id: i64,
        from: &[BuildStatus],
        to: BuildStatus,
    ) -> Result<bool, StoreError> {
        self.conditional_update(id, from, to, None).await
    }

    async fn record_outcome(
        &self,
        id: i64,
        return_code: Option<i32>,
        timed_out: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .outcome
            .key(Self::task_key(id))
            .arg(return_code.map(|rc| rc.to_string()).unwrap_or_default())
            .arg(if timed_out { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        if applied == -1 {
            return Err(StoreError::not_found("build task", id));
        }
        Ok(())
    }

    async fn record_validation_error(&self, id: i64, message: &str) -> Result<bool, StoreError> {
        self.conditional_update(
            id,
            &[BuildStatus::InProgress],
            BuildStatus::ImageInvalid,
            Some(("validation_error_msg", message)),
        )
        .await
    }

    async fn record_internal_error(&self, id: i64, message: &str) -> Result<bool, StoreError> {
        self.conditional_update(
            id,
            &[BuildStatus::InProgress],
            BuildStatus::InternalError,
            Some(("internal_error_msg", message)),
        )
        .await
    }

    async fn complete_with_image(
        &self,
        id: i64,
        tag: &str,
    ) -> Result<Option<SandboxImage>, StoreError> {
        let mut conn = self.conn.clone();
        let image_id: i64 = self
            .complete
            .key(Self::task_key(id))
            .key(keys::IMAGE_ID_COUNTER)
            .arg(tag)
            .arg(new_image_display_name())
            .arg(keys::IMAGE_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        match image_id {
            -1 => Err(StoreError::not_found("build task", id)),
            0 => Ok(None),
            image_id => self.load_image(image_id).await.map(Some),
        }
    }

    async fn load_image(&self, id: i64) -> Result<SandboxImage, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::image_key(id)).await?;
        if fields.is_empty() {
            return Err(StoreError::not_found("sandbox image", id));
        }
        decode_image(id, &fields)
    }
}

/// Hash fields of a task, as the web app writes them
#[cfg(test)]
fn encode_task(task: &BuildTask) -> Vec<(&'static str, String)> {
    vec![
        ("id", task.id.to_string()),
        ("project_id", task.project_id.to_string()),
        ("build_dir", task.build_dir.display().to_string()),
        ("output_filename", task.output_filename.display().to_string()),
        ("status", task.status.as_str().to_string()),
        (
            "return_code",
            task.return_code.map(|rc| rc.to_string()).unwrap_or_default(),
        ),
        ("timed_out", if task.timed_out { "1" } else { "0" }.to_string()),
        ("validation_error_msg", task.validation_error_msg.clone()),
        ("internal_error_msg", task.internal_error_msg.clone()),
        (
            "image_id",
            task.image_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
    ]
}

fn decode_task(id: i64, fields: &HashMap<String, String>) -> Result<BuildTask, StoreError> {
    let get = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();
    let malformed = |name: &str, value: &str| {
        StoreError::malformed("build task", id, format!("bad {} {:?}", name, value))
    };
    let optional = |name: &str| -> Result<Option<i64>, StoreError> {
        match get(name) {
            "" => Ok(None),
            value => value.parse().map(Some).map_err(|_| malformed(name, value)),
        }
    };

    Ok(BuildTask {
        id,
        project_id: get("project_id")
            .parse()
            .map_err(|_| malformed("project_id", get("project_id")))?,
        build_dir: PathBuf::from(get("build_dir")),
        output_filename: PathBuf::from(get("output_filename")),
        status: get("status")
            .parse()
            .map_err(|_| malformed("status", get("status")))?,
        return_code: optional("return_code")?
            .map(|rc| i32::try_from(rc).map_err(|_| malformed("return_code", get("return_code"))))
            .transpose()?,
        timed_out: get("timed_out") == "1",
        validation_error_msg: get("validation_error_msg").to_string(),
        internal_error_msg: get("internal_error_msg").to_string(),
        image_id: optional("image_id")?,
    })
}

fn decode_image(id: i64, fields: &HashMap<String, String>) -> Result<SandboxImage, StoreError> {
    let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let project_id = get("project_id");
    Ok(SandboxImage {
        id,
        project_id: project_id.parse().map_err(|_| {
            StoreError::malformed("sandbox image", id, format!("bad project_id {:?}", project_id))
        })?,
        display_name: get("display_name"),
        tag: get("tag"),
    })
}
