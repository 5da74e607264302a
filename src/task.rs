//! Task descriptors, results, and the work function contract.

use crate::error::ErrorClass;
use crate::proxy::ProxyRecord;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Identifier assigned by the executor: the task's index in the batch
/// handed to `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Still queued when the batch was cancelled.
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Abandoned
        )
    }
}

/// One unit of work and its scheduling state.
#[derive(Debug, Clone)]
pub struct TaskDescriptor<P> {
    pub id: TaskId,
    /// Number of times the work function has been started for this task.
    pub attempts: u32,
    /// Proxy for the next attempt. Cleared before every retry.
    pub assigned_proxy: Option<ProxyRecord>,
    pub status: TaskStatus,
    /// Tasks sharing a group key are spaced apart when they start.
    pub group_key: Option<String>,
    pub payload: Arc<P>,
    pub(crate) auth_failures: u32,
    pub(crate) last_error: Option<ErrorClass>,
}

impl<P> TaskDescriptor<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: TaskId(0),
            attempts: 0,
            assigned_proxy: None,
            status: TaskStatus::Queued,
            group_key: None,
            payload: Arc::new(payload),
            auth_failures: 0,
            last_error: None,
        }
    }

    /// Put the task in a spacing group, e.g. the account it acts as.
    pub fn with_group(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    /// Use this proxy for the first attempt instead of drawing from the pool.
    pub fn with_proxy(mut self, proxy: ProxyRecord) -> Self {
        self.assigned_proxy = Some(proxy);
        self
    }
}

/// What the work function sees for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext<P> {
    pub id: TaskId,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub group_key: Option<String>,
    pub payload: Arc<P>,
    pub proxy: Option<ProxyRecord>,
}

/// Final outcome of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub success: bool,
    /// Error of the last attempt, if it failed.
    pub error_class: Option<ErrorClass>,
    /// `host:port` of the proxy used by the last attempt.
    pub proxy_used: Option<String>,
    pub attempts: u32,
    /// Wall time of the last attempt.
    pub duration: Duration,
}

impl ExecutionResult {
    pub(crate) fn succeeded(task_id: TaskId, attempts: u32, proxy: Option<String>, duration: Duration) -> Self {
        Self {
            task_id,
            status: TaskStatus::Succeeded,
            success: true,
            error_class: None,
            proxy_used: proxy,
            attempts,
            duration,
        }
    }

    pub(crate) fn failed(
        task_id: TaskId,
        attempts: u32,
        error: ErrorClass,
        proxy: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            success: false,
            error_class: Some(error),
            proxy_used: proxy,
            attempts,
            duration,
        }
    }

    pub(crate) fn abandoned(task_id: TaskId, attempts: u32, last_error: Option<ErrorClass>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Abandoned,
            success: false,
            error_class: last_error,
            proxy_used: None,
            attempts,
            duration: Duration::ZERO,
        }
    }
}

/// The action performed for each task.
///
/// Expected failures are returned as an [`ErrorClass`]; panics are treated
/// as programmer errors and recorded as [`ErrorClass::Panicked`].
#[async_trait]
pub trait TaskWork<P>: Send + Sync + 'static {
    async fn execute(&self, ctx: TaskContext<P>) -> Result<(), ErrorClass>;
}

#[async_trait]
impl<P, F, Fut> TaskWork<P> for F
where
    P: Send + Sync + 'static,
    F: Fn(TaskContext<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorClass>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext<P>) -> Result<(), ErrorClass> {
        (self)(ctx).await
    }
}
