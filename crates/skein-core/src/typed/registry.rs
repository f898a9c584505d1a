//! Handler registry: task type to handler.
//!
//! Filled during start-up, then shared read-only by every worker behind an `Arc`, so
//! lookups need no lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::{FnHandler, Handler, HandlerContext, TaskHandler, TaskPayload, TypedHandler};
use crate::domain::{HandlerError, TaskType};
use crate::ports::TaskTypeFilter;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

/// Task type → handler map, built once before the workers start.
///
/// # Example
/// ```ignore
/// let mut registry = HandlerRegistry::<Services>::new();
/// registry.register_typed::<SendReminder, _>(SendReminderHandler)?;
/// registry.register_fn("cache.flush", |ctx, _payload| async move {
///     ctx.app.cache.flush().await.map_err(|e| HandlerError::new(e.to_string()))
/// })?;
/// ```
pub struct HandlerRegistry<C = ()> {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler<C>>>,
}

impl<C: Send + Sync + 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler<C>>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Registers a typed handler under `T::TASK_TYPE`.
    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: TaskPayload,
        H: Handler<T, C> + 'static,
    {
        self.register(T::TASK_TYPE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(HandlerContext<C>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler::new(f)))
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler<C>>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Sorted, for stable log lines and error messages.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// A filter accepting exactly the registered types.
    pub fn filter(&self) -> TaskTypeFilter {
        TaskTypeFilter::Only(self.registered_types())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Send + Sync + 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
