use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::{HandlerContext, TaskPayload};
use crate::domain::HandlerError;

/// Runs tasks whose payload decodes to `T`.
///
/// ```ignore
/// struct SendReminderHandler;
///
/// #[async_trait]
/// impl Handler<SendReminder, Services> for SendReminderHandler {
///     async fn handle(&self, ctx: HandlerContext<Services>, task: SendReminder) -> Result<(), HandlerError> {
///         ctx.app.chat.send(task.chat_id, &task.text).await.map_err(|e| HandlerError::new(e.to_string()))
///     }
/// }
/// ```
///
/// Return [`HandlerError::permanent`] when retrying cannot help; anything else is
/// retried within the task's budget.
#[async_trait]
pub trait Handler<T: TaskPayload, C = ()>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<C>, task: T) -> Result<(), HandlerError>;
}

/// Object-safe handler over the raw JSON payload. This is what the registry stores.
#[async_trait]
pub trait TaskHandler<C = ()>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<C>, payload: Value) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H, C> TaskHandler<C> for TypedHandler<T, H>
where
    T: TaskPayload,
    H: Handler<T, C>,
    C: Send + Sync + 'static,
{
    async fn handle(&self, ctx: HandlerContext<C>, payload: Value) -> Result<(), HandlerError> {
        // A payload that does not decode never will: permanent.
        let task: T = serde_json::from_value(payload)?;
        self.handler.handle(ctx, task).await
    }
}

/// Async closure over the raw payload, for small task types and tests.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, C> TaskHandler<C> for FnHandler<F>
where
    F: Fn(HandlerContext<C>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
    C: Send + Sync + 'static,
{
    async fn handle(&self, ctx: HandlerContext<C>, payload: Value) -> Result<(), HandlerError> {
        (self.f)(ctx, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TaskId, TaskType};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl TaskPayload for Greet {
        const TASK_TYPE: &'static str = "greet";
    }

    struct Greeting {
        prefix: &'static str,
    }

    struct GreetHandler;

    #[async_trait]
    impl Handler<Greet, Greeting> for GreetHandler {
        async fn handle(
            &self,
            ctx: HandlerContext<Greeting>,
            task: Greet,
        ) -> Result<(), HandlerError> {
            if task.name.is_empty() {
                return Err(HandlerError::permanent("empty name"));
            }
            assert_eq!(ctx.app.prefix, "hello");
            Ok(())
        }
    }

    fn ctx() -> HandlerContext<Greeting> {
        HandlerContext {
            task_id: TaskId::new("t1"),
            task_type: TaskType::new(Greet::TASK_TYPE),
            retry_count: 0,
            max_retries: 3,
            scheduled_at: Utc::now(),
            worker_id: "w1".to_string(),
            original_task_id: None,
            app: Arc::new(Greeting { prefix: "hello" }),
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<Greet, _>::new(GreetHandler);
        handler.handle(ctx(), json!({"name": "kamo"})).await.unwrap();

        let err = handler.handle(ctx(), json!({"name": ""})).await.unwrap_err();
        assert_eq!(err.message(), "empty name");
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<Greet, _>::new(GreetHandler);
        let err = handler.handle(ctx(), json!({"nom": 1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn fn_handler_sees_context() {
        let handler = FnHandler::new(|ctx: HandlerContext<Greeting>, payload: Value| async move {
            assert_eq!(ctx.task_id.as_str(), "t1");
            assert_eq!(ctx.attempt(), 1);
            assert_eq!(payload, json!(1));
            Ok(())
        });
        handler.handle(ctx(), json!(1)).await.unwrap();
    }
}
