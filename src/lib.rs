//! # proxy-task-pool
//!
//! A bounded concurrent task executor backed by a pool of static and rotating proxies.
//!
//! This library runs large batches of independent network-bound tasks under a single
//! global concurrency ceiling, assigns each attempt a proxy from a health-ranked pool,
//! retries transient failures with backoff, and keeps the pool topped up from an
//! external rotation API.

pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod proxy;
pub mod rotation;
pub mod task;
pub mod tracker;
mod utils;

pub use config::{
    ConcurrencyBudget, ExecutorConfig, ExecutorConfigBuilder, ProxyPolicy, ProxyPoolConfig,
    ProxyPoolConfigBuilder, RetryPolicy, RotationConfig, RotationConfigBuilder,
};
pub use error::{ErrorClass, ExecutorError, NoProxyAvailable, RotationError};
pub use executor::TaskExecutor;
pub use pool::{PoolStats, ProxyPool};
pub use proxy::{ProxyRecord, ProxySource, ProxyStatus, MAX_LEASE};
pub use rotation::{HttpRotationEndpoint, ProxyRotationService, RotationEndpoint, RotationOutcome};
pub use task::{ExecutionResult, TaskContext, TaskDescriptor, TaskId, TaskStatus, TaskWork};
pub use tracker::{ProgressSnapshot, ProgressTracker};
pub use utils::{parse_proxy_list, IssuedProxy, RotationResponse};
