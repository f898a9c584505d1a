//! Demo handlers registered by `skein run`.
//!
//! - `echo` logs its payload and succeeds.
//! - `fail` fails `times` times (every time when absent), then succeeds. With
//!   `"permanent": true` the failure skips the retry budget.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_core::{Handler, HandlerContext, HandlerError, TaskPayload};
use tracing::info;

pub async fn echo(ctx: HandlerContext, payload: Value) -> Result<(), HandlerError> {
    info!(task_id = %ctx.task_id, attempt = ctx.attempt(), payload = %payload, "echo");
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FailTask {
    #[serde(default)]
    pub times: Option<u32>,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskPayload for FailTask {
    const TASK_TYPE: &'static str = "fail";
}

pub struct FailHandler;

#[async_trait]
impl Handler<FailTask> for FailHandler {
    async fn handle(&self, ctx: HandlerContext, task: FailTask) -> Result<(), HandlerError> {
        if task.times.is_some_and(|times| ctx.retry_count >= times) {
            info!(task_id = %ctx.task_id, attempt = ctx.attempt(), "fail: giving up failing");
            return Ok(());
        }
        let message = task
            .message
            .unwrap_or_else(|| format!("intentional failure on attempt {}", ctx.attempt()));
        if task.permanent {
            Err(HandlerError::permanent(message))
        } else {
            Err(HandlerError::new(message))
        }
    }
}
