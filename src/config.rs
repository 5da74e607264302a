//! Configuration for the proxy pool, the rotation service and the executor.

use crate::error::ErrorClass;
use crate::proxy::ProxySource;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Error count at which a record is blacklisted (rotating) or soft-disabled (static).
    pub error_ceiling: usize,
    /// Number of rate-limit errors at which a record is taken out of rotation.
    pub rate_limit_ceiling: usize,
    /// Fraction of the ranked candidates the random pick is drawn from.
    pub top_fraction: f64,
    /// How long a soft-disabled static record stays inactive.
    pub static_cooldown: Duration,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    error_ceiling: Option<usize>,
    rate_limit_ceiling: Option<usize>,
    top_fraction: Option<f64>,
    static_cooldown: Option<Duration>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            error_ceiling: None,
            rate_limit_ceiling: None,
            top_fraction: None,
            static_cooldown: None,
        }
    }

    /// Set the error count at which a record is taken out of rotation.
    pub fn error_ceiling(mut self, count: usize) -> Self {
        self.error_ceiling = Some(count);
        self
    }

    /// Set the number of rate-limit errors tolerated per record.
    pub fn rate_limit_ceiling(mut self, count: usize) -> Self {
        self.rate_limit_ceiling = Some(count);
        self
    }

    /// Set the share of best-ranked candidates to pick from (0, 1].
    pub fn top_fraction(mut self, fraction: f64) -> Self {
        self.top_fraction = Some(fraction);
        self
    }

    /// Set how long a soft-disabled static record stays inactive.
    pub fn static_cooldown(mut self, cooldown: Duration) -> Self {
        self.static_cooldown = Some(cooldown);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            error_ceiling: self.error_ceiling.unwrap_or(5).max(1),
            rate_limit_ceiling: self.rate_limit_ceiling.unwrap_or(3).max(1),
            top_fraction: self.top_fraction.unwrap_or(0.3).clamp(f64::EPSILON, 1.0),
            static_cooldown: self.static_cooldown.unwrap_or(Duration::from_secs(5 * 60)),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the rotation service.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Rotation credentials.
    pub keys: Vec<String>,
    /// Minimum time between two rotation requests for one key.
    pub rotate_interval: Duration,
    /// How often the background tick scans the keys.
    pub tick_interval: Duration,
    /// How often expired rotating records are swept.
    pub sweep_interval: Duration,
    /// Lease assumed when the endpoint does not state one.
    pub default_lease: Duration,
    /// Cool-down assumed when the endpoint asks to wait without saying how long.
    pub default_cooldown: Duration,
}

impl RotationConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RotationConfigBuilder {
        RotationConfigBuilder::new()
    }
}

/// Builder for `RotationConfig`.
pub struct RotationConfigBuilder {
    keys: Vec<String>,
    rotate_interval: Option<Duration>,
    tick_interval: Option<Duration>,
    sweep_interval: Option<Duration>,
    default_lease: Option<Duration>,
    default_cooldown: Option<Duration>,
}

impl RotationConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            rotate_interval: None,
            tick_interval: None,
            sweep_interval: None,
            default_lease: None,
            default_cooldown: None,
        }
    }

    /// Set the rotation keys.
    pub fn keys(mut self, keys: Vec<impl Into<String>>) -> Self {
        self.keys = keys
            .into_iter()
            .map(Into::into)
            .map(|k: String| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        self
    }

    /// Set the minimum interval between rotations of one key.
    pub fn rotate_interval(mut self, interval: Duration) -> Self {
        self.rotate_interval = Some(interval);
        self
    }

    /// Set the background tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Set the expiry sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the lease used when a response carries none.
    pub fn default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = Some(lease);
        self
    }

    /// Set the cool-down used when a response carries none.
    pub fn default_cooldown(mut self, cooldown: Duration) -> Self {
        self.default_cooldown = Some(cooldown);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RotationConfig {
        RotationConfig {
            keys: self.keys,
            rotate_interval: self.rotate_interval.unwrap_or(Duration::from_secs(60)),
            tick_interval: self.tick_interval.unwrap_or(Duration::from_secs(60)),
            sweep_interval: self.sweep_interval.unwrap_or(Duration::from_secs(30)),
            default_lease: self.default_lease.unwrap_or(Duration::from_secs(13 * 60)),
            default_cooldown: self.default_cooldown.unwrap_or(Duration::from_secs(60)),
        }
    }
}

impl Default for RotationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Global ceiling on simultaneously running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyBudget {
    pub workers: usize,
    pub tasks_per_worker: usize,
}

impl ConcurrencyBudget {
    pub fn new(workers: usize, tasks_per_worker: usize) -> Self {
        Self {
            workers,
            tasks_per_worker,
        }
    }

    /// A budget of exactly `n` concurrent tasks.
    pub fn fixed(n: usize) -> Self {
        Self::new(1, n)
    }

    /// The single shared ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.workers.saturating_mul(self.tasks_per_worker)
    }
}

impl Default for ConcurrencyBudget {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

/// What to do when the pool has nothing to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPolicy {
    /// Fail the task with `NoProxyAvailable`.
    Required,
    /// Run the task without a proxy.
    Optional,
}

type RetryPredicate = Arc<dyn Fn(&ErrorClass) -> bool + Send + Sync>;

/// Retry rules shared by every task type.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    retryable: RetryPredicate,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            retryable: Arc::new(ErrorClass::is_retryable),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the retryable-error predicate.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&ErrorClass) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, class: &ErrorClass) -> bool {
        (self.retryable)(class)
    }

    /// Decide whether a task that has run `attempts` times and just failed
    /// with `class` gets another attempt.
    ///
    /// Authentication failures get exactly one retry with a fresh proxy,
    /// still bounded by `max_retries`.
    pub fn should_retry(&self, class: &ErrorClass, attempts: u32, auth_failures: u32) -> bool {
        if attempts > self.max_retries {
            return false;
        }
        if class.is_auth() {
            auth_failures <= 1
        } else {
            self.is_retryable(class)
        }
    }

    /// Delay before retry number `attempt` (1-based): base × attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// Configuration for the task executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub budget: ConcurrencyBudget,
    pub retry: RetryPolicy,
    /// Hard wall-clock limit for one attempt.
    pub task_timeout: Duration,
    /// Minimum spacing between starts of tasks sharing a group key.
    pub group_spacing: Option<Duration>,
    /// Re-check interval while some queued tasks are held back by spacing.
    pub poll_interval: Duration,
    pub proxy_policy: ProxyPolicy,
    /// Prefer proxies of this source when any are active.
    pub proxy_preference: Option<ProxySource>,
    /// Log a progress line at this interval while a batch runs.
    pub progress_interval: Option<Duration>,
}

impl ExecutorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfigBuilder::new().build()
    }
}

/// Builder for `ExecutorConfig`.
pub struct ExecutorConfigBuilder {
    budget: Option<ConcurrencyBudget>,
    retry: Option<RetryPolicy>,
    task_timeout: Option<Duration>,
    group_spacing: Option<Option<Duration>>,
    poll_interval: Option<Duration>,
    proxy_policy: Option<ProxyPolicy>,
    proxy_preference: Option<ProxySource>,
    progress_interval: Option<Duration>,
}

impl ExecutorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            budget: None,
            retry: None,
            task_timeout: None,
            group_spacing: None,
            poll_interval: None,
            proxy_policy: None,
            proxy_preference: None,
            progress_interval: None,
        }
    }

    /// Set the concurrency budget.
    pub fn budget(mut self, budget: ConcurrencyBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the per-attempt timeout.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set (or disable with `None`) the per-group start spacing.
    pub fn group_spacing(mut self, spacing: Option<Duration>) -> Self {
        self.group_spacing = Some(spacing);
        self
    }

    /// Set the re-check interval for spacing-deferred tasks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the behavior when no proxy is available.
    pub fn proxy_policy(mut self, policy: ProxyPolicy) -> Self {
        self.proxy_policy = Some(policy);
        self
    }

    /// Draw proxies of this source first, falling back to any active proxy.
    pub fn proxy_preference(mut self, source: ProxySource) -> Self {
        self.proxy_preference = Some(source);
        self
    }

    /// Enable periodic progress logging.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ExecutorConfig {
        ExecutorConfig {
            budget: self.budget.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            task_timeout: self.task_timeout.unwrap_or(Duration::from_secs(45)),
            group_spacing: self
                .group_spacing
                .unwrap_or(Some(Duration::from_secs(2))),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(250)),
            proxy_policy: self.proxy_policy.unwrap_or(ProxyPolicy::Required),
            proxy_preference: self.proxy_preference,
            progress_interval: self.progress_interval,
        }
    }
}

impl Default for ExecutorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
