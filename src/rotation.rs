//! Replenishing the pool from an external rotation API.

use crate::config::RotationConfig;
use crate::error::RotationError;
use crate::pool::ProxyPool;
use crate::proxy::{later, ProxyRecord, MAX_LEASE};
use crate::utils::{self, RotationResponse};

use async_trait::async_trait;
use futures::future;
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use url::Url;

/// An API that issues a fresh proxy for a rotation key.
#[async_trait]
pub trait RotationEndpoint: Send + Sync {
    /// Ask for a new proxy on behalf of `key`.
    async fn rotate(&self, key: &str) -> Result<RotationResponse, RotationError>;
}

/// Rotation endpoint reached over HTTP with `GET <url>?key=<key>`.
pub struct HttpRotationEndpoint {
    client: Client,
    url: Url,
}

impl HttpRotationEndpoint {
    /// Create an endpoint for the given base URL with a per-request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RotationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: Url::parse(url)?,
        })
    }
}

#[async_trait]
impl RotationEndpoint for HttpRotationEndpoint {
    async fn rotate(&self, key: &str) -> Result<RotationResponse, RotationError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("key", key);

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        utils::parse_rotation_response(&body)
    }
}

/// Result of one successful exchange with the rotation endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A proxy was issued; `added` is false when the pool already held it or
    /// refused it.
    Issued { proxy: String, added: bool },
    /// The key must wait this long before its next rotation.
    CoolDown(Duration),
    /// The endpoint rejected the key.
    InvalidKey,
}

/// Periodically rotates every key whose cool-down has elapsed and sweeps
/// expired rotating proxies out of the pool.
pub struct ProxyRotationService {
    pool: Arc<ProxyPool>,
    endpoint: Arc<dyn RotationEndpoint>,
    config: RotationConfig,
    /// Next instant each key may rotate.
    schedule: Mutex<HashMap<String, Instant>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyRotationService {
    pub fn new(
        pool: Arc<ProxyPool>,
        endpoint: Arc<dyn RotationEndpoint>,
        config: RotationConfig,
    ) -> Arc<Self> {
        let now = Instant::now();
        let schedule = config.keys.iter().map(|k| (k.clone(), now)).collect();
        Arc::new(Self {
            pool,
            endpoint,
            config,
            schedule: Mutex::new(schedule),
            background: Mutex::new(None),
        })
    }

    /// Number of configured keys.
    pub fn key_count(&self) -> usize {
        self.schedule.lock().len()
    }

    /// The instant `key` next becomes eligible for rotation.
    pub fn next_eligible(&self, key: &str) -> Option<Instant> {
        self.schedule.lock().get(key).copied()
    }

    /// Request a new proxy for one key and feed it to the pool.
    ///
    /// Transport errors and malformed responses leave the key's schedule
    /// untouched so the next tick tries again.
    pub async fn rotate_one(&self, key: &str) -> Result<RotationOutcome, RotationError> {
        if !self.schedule.lock().contains_key(key) {
            return Err(RotationError::UnknownKey(short(key)));
        }

        let response = match self.endpoint.rotate(key).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Rotation failed for key {}: {}", short(key), e);
                return Err(e);
            }
        };

        let now = Instant::now();
        let (outcome, next) = match response {
            RotationResponse::Issued(issued) => {
                let lease = issued
                    .lease
                    .unwrap_or(self.config.default_lease)
                    .min(MAX_LEASE);
                let record = ProxyRecord::new_rotating(
                    issued.host,
                    issued.port,
                    issued.username,
                    issued.password,
                    lease,
                )
                .with_rotation_key(key);
                let proxy = record.key();
                let added = self.pool.add([record]) > 0;
                info!(
                    "Key {} issued proxy {} for {:?} (added: {})",
                    short(key),
                    proxy,
                    lease,
                    added
                );
                (
                    RotationOutcome::Issued { proxy, added },
                    later(now, self.config.rotate_interval),
                )
            }
            RotationResponse::CoolDown(wait) => {
                let wait = wait.unwrap_or(self.config.default_cooldown).min(MAX_LEASE);
                info!("Key {} must wait {:?} before rotating", short(key), wait);
                (RotationOutcome::CoolDown(wait), later(now, wait))
            }
            RotationResponse::InvalidKey(message) => {
                warn!("Key {} rejected by rotation API: {}", short(key), message);
                (
                    RotationOutcome::InvalidKey,
                    later(now, self.config.rotate_interval),
                )
            }
        };

        self.schedule.lock().insert(key.to_string(), next);
        Ok(outcome)
    }

    /// Rotate every key whose cool-down has elapsed. Returns how many keys
    /// were attempted.
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        let due: Vec<String> = self
            .schedule
            .lock()
            .iter()
            .filter(|(_, next)| **next <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let attempts = due.len();
        // Failures are already logged per key; the pool keeps serving what it has.
        future::join_all(due.iter().map(|key| self.rotate_one(key))).await;
        attempts
    }

    /// Start the background rotation and expiry sweep. Every key is rotated
    /// once right away. Calling `start` on a running service does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if background.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        info!(
            "Starting proxy rotation for {} keys every {:?}",
            self.key_count(),
            self.config.tick_interval
        );
        let service = Arc::clone(self);
        *background = Some(tokio::spawn(async move {
            let mut rotate = time::interval(service.config.tick_interval);
            rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweep = time::interval(service.config.sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = rotate.tick() => {
                        service.tick().await;
                        let stats = service.pool.stats();
                        info!(
                            "Proxy pool status update: {}/{} active, {} rotating",
                            stats.active, stats.total, stats.rotating_count
                        );
                    }
                    _ = sweep.tick() => {
                        service.pool.sweep_expired();
                    }
                }
            }
        }));
    }

    /// Cancel the background work. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
            info!("Stopped proxy rotation");
        }
    }

    /// Whether the background loop is alive.
    pub fn is_running(&self) -> bool {
        self.background
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Keys are credentials; only a prefix goes to the logs.
fn short(key: &str) -> String {
    let prefix: String = key.chars().take(6).collect();
    if prefix.len() < key.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}
