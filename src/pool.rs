//! Core proxy pool implementation.

use crate::config::ProxyPoolConfig;
use crate::error::{ErrorClass, NoProxyAvailable};
use crate::proxy::{ProxyRecord, ProxySource, ProxyStatus};

use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::time::Instant;

/// Counts reported by [`ProxyPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub static_count: usize,
    pub rotating_count: usize,
    /// Keys remembered as blacklisted, including ones already purged.
    pub blacklisted: usize,
}

#[derive(Default)]
struct PoolState {
    records: Vec<ProxyRecord>,
    blacklist: HashSet<String>,
}

impl PoolState {
    fn position(&self, key: &str) -> Option<usize> {
        self.records.iter().position(|p| p.key() == key)
    }

    /// Terminal removal from rotation. Rotating records are marked blacklisted
    /// and left for the sweep, or dropped right away when `purge` is set.
    /// Static records stay in the pool as inactive but are never selected again.
    fn retire(&mut self, idx: usize, purge: bool) {
        let key = self.records[idx].key();
        self.blacklist.insert(key.clone());

        if self.records[idx].source == ProxySource::Rotating {
            if purge {
                self.records.remove(idx);
                warn!("Rotating proxy {} blacklisted and removed from pool", key);
            } else {
                self.records[idx].status = ProxyStatus::Blacklisted;
                warn!("Rotating proxy {} blacklisted", key);
            }
        } else {
            let record = &mut self.records[idx];
            record.status = ProxyStatus::Inactive;
            record.inactive_until = None;
            warn!("Static proxy {} blacklisted, kept as inactive", key);
        }
    }

    /// Static records whose cool-down has elapsed go back into rotation.
    fn reactivate_cooled(&mut self, now: Instant) {
        for record in self.records.iter_mut() {
            if record.status != ProxyStatus::Inactive {
                continue;
            }
            if matches!(record.inactive_until, Some(until) if until <= now)
                && !self.blacklist.contains(&record.key())
            {
                record.status = ProxyStatus::Active;
                record.inactive_until = None;
                record.error_count = 0;
                record.rate_limit_count = 0;
                info!("Proxy {} reactivated after cool-down", record.key());
            }
        }
    }
}

/// A pool of static and rotating proxies shared by concurrently running tasks.
///
/// Every operation takes the single state lock, so `add`, `select`,
/// `report_error` and `sweep_expired` are atomic with respect to each other.
pub struct ProxyPool {
    state: RwLock<PoolState>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
}

impl ProxyPool {
    /// Create an empty pool.
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            config,
        }
    }

    /// Add records to the pool, returning how many were new.
    ///
    /// Malformed and blacklisted records are skipped with a warning. Records
    /// already present (same `host:port`) are not duplicated; a re-issued
    /// rotating record only extends the existing lease.
    pub fn add(&self, records: impl IntoIterator<Item = ProxyRecord>) -> usize {
        let mut state = self.state.write();
        let mut added = 0;
        let mut skipped = 0;

        for record in records {
            let key = record.key();
            if !record.is_well_formed() {
                warn!("Skipping malformed proxy {}", key);
                skipped += 1;
                continue;
            }
            if state.blacklist.contains(&key) {
                warn!("Skipping blacklisted proxy {}", key);
                skipped += 1;
                continue;
            }

            match state.position(&key) {
                Some(idx) => {
                    let existing = &mut state.records[idx];
                    if let (Some(current), Some(offered)) = (existing.expires_at, record.expires_at) {
                        existing.expires_at = Some(current.max(offered));
                    }
                    debug!("Proxy {} already in pool", key);
                }
                None => {
                    state.records.push(record);
                    added += 1;
                }
            }
        }

        if added > 0 || skipped > 0 {
            info!(
                "Added {} proxies ({} skipped), pool size {}",
                added,
                skipped,
                state.records.len()
            );
        }
        added
    }

    /// Pick a proxy for one attempt.
    ///
    /// Active records are ranked by `(error_count, use_count)` and one is drawn
    /// uniformly from the best `top_fraction` of them. With a `hint`, records
    /// of that source are preferred when any are available.
    pub fn select(&self, hint: Option<ProxySource>) -> Result<ProxyRecord, NoProxyAvailable> {
        let now = Instant::now();
        let mut state = self.state.write();
        state.reactivate_cooled(now);

        let PoolState { records, blacklist } = &mut *state;
        let mut candidates: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.status == ProxyStatus::Active && !p.is_expired(now) && !blacklist.contains(&p.key())
            })
            .map(|(i, _)| i)
            .collect();

        if let Some(source) = hint {
            let preferred: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&i| records[i].source == source)
                .collect();
            if !preferred.is_empty() {
                candidates = preferred;
            }
        }

        if candidates.is_empty() {
            return Err(NoProxyAvailable);
        }

        candidates.sort_by_key(|&i| (records[i].error_count, records[i].use_count));
        let top = ((candidates.len() as f64 * self.config.top_fraction).floor() as usize).max(1);
        let pick = candidates[rand::rng().random_range(0..top)];

        let record = &mut records[pick];
        record.use_count += 1;
        record.last_used = Some(now);
        Ok(record.clone())
    }

    /// Report a failed attempt through the proxy with the given key.
    pub fn report_error(&self, key: &str, class: &ErrorClass) {
        let mut state = self.state.write();

        let Some(idx) = state.position(key) else {
            if class.is_auth() {
                // Already purged; remember it so it cannot be re-added.
                state.blacklist.insert(key.to_string());
            }
            return;
        };

        let record = &mut state.records[idx];
        record.error_count += 1;
        if class.is_rate_limit() {
            record.rate_limit_count += 1;
        }

        if class.is_auth() {
            warn!("Proxy {} failed authentication", key);
            state.retire(idx, true);
            return;
        }

        let over_errors = record.error_count >= self.config.error_ceiling;
        let over_rate_limit = record.rate_limit_count >= self.config.rate_limit_ceiling;
        if !(over_errors || over_rate_limit) {
            return;
        }

        if record.source == ProxySource::Rotating {
            state.retire(idx, false);
        } else if record.status == ProxyStatus::Active {
            record.status = ProxyStatus::Inactive;
            record.inactive_until = Some(Instant::now() + self.config.static_cooldown);
            warn!(
                "Proxy {} marked inactive for {:?}: {} errors, {} rate limits",
                key, self.config.static_cooldown, record.error_count, record.rate_limit_count
            );
        }
    }

    /// Remove rotating records whose lease has ended, along with blacklisted
    /// ones. Static records are never removed here.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write();
        let before = state.records.len();
        state.records.retain(|p| {
            p.status != ProxyStatus::Blacklisted
                && !(p.source == ProxySource::Rotating && p.is_expired(now))
        });
        let removed = before - state.records.len();
        if removed > 0 {
            info!(
                "Removed {} expired proxies, {} remaining",
                removed,
                state.records.len()
            );
        }
        removed
    }

    /// Whether a key has been blacklisted.
    pub fn is_blacklisted(&self, key: &str) -> bool {
        self.state.read().blacklist.contains(key)
    }

    /// A copy of the record with the given key.
    pub fn get(&self, key: &str) -> Option<ProxyRecord> {
        let state = self.state.read();
        state.position(key).map(|idx| state.records[idx].clone())
    }

    /// Get statistics about the proxy pool.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.read();
        let total = state.records.len();
        let active = state
            .records
            .iter()
            .filter(|p| p.status == ProxyStatus::Active)
            .count();
        let rotating_count = state
            .records
            .iter()
            .filter(|p| p.source == ProxySource::Rotating)
            .count();

        PoolStats {
            total,
            active,
            inactive: total - active,
            static_count: total - rotating_count,
            rotating_count,
            blacklisted: state.blacklist.len(),
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn static_proxy(n: u16) -> ProxyRecord {
        ProxyRecord::new_static(format!("10.0.0.{n}"), 8000 + n, "user", "pass")
    }

    #[test]
    fn add_is_idempotent() {
        let pool = ProxyPool::default();
        let records: Vec<_> = (1..=3).map(static_proxy).collect();
        assert_eq!(pool.add(records.clone()), 3);
        assert_eq!(pool.add(records), 0);
        assert_eq!(pool.stats().total, 3);
    }

    #[test]
    fn add_skips_malformed() {
        let pool = ProxyPool::default();
        let added = pool.add(vec![
            static_proxy(1),
            ProxyRecord::new_static("10.0.0.2", 0, "user", "pass"),
            ProxyRecord::new_static("10.0.0.3", 8003, "", "pass"),
        ]);
        assert_eq!(added, 1);
    }

    #[test]
    fn empty_pool_has_nothing_to_select() {
        let pool = ProxyPool::default();
        assert_eq!(pool.select(None).unwrap_err(), NoProxyAvailable);
    }

    #[test]
    fn select_counts_use() {
        let pool = ProxyPool::default();
        pool.add(vec![static_proxy(1)]);
        pool.select(None).unwrap();
        let picked = pool.select(None).unwrap();
        assert_eq!(picked.use_count, 2);
        assert_eq!(pool.get(&picked.key()).unwrap().use_count, 2);
    }

    #[test]
    fn select_prefers_healthy_slice() {
        let pool = ProxyPool::default();
        pool.add((1..=10).map(static_proxy));
        // Records 4..=10 get one error each; the top 30% are the three clean ones.
        for n in 4..=10 {
            pool.report_error(&static_proxy(n).key(), &ErrorClass::Timeout);
        }
        let healthy: HashSet<String> = (1..=3).map(|n| static_proxy(n).key()).collect();
        for _ in 0..50 {
            let picked = pool.select(None).unwrap();
            assert!(healthy.contains(&picked.key()), "picked {}", picked.key());
        }
    }

    #[test]
    fn auth_failure_blacklists_static_for_good() {
        let pool = ProxyPool::default();
        pool.add(vec![static_proxy(1), static_proxy(2)]);
        let bad = static_proxy(1).key();

        pool.report_error(&bad, &ErrorClass::ProxyAuth);
        assert!(pool.is_blacklisted(&bad));
        assert_eq!(pool.get(&bad).unwrap().status, ProxyStatus::Inactive);
        for _ in 0..30 {
            assert_ne!(pool.select(None).unwrap().key(), bad);
        }

        // Re-adding the same endpoint does not bring it back.
        assert_eq!(pool.add(vec![static_proxy(1)]), 0);
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.inactive, 1);
    }

    #[test]
    fn auth_failure_purges_rotating() {
        let pool = ProxyPool::default();
        let rotating = ProxyRecord::new_rotating("10.1.0.1", 9000, "u", "p", Duration::from_secs(600));
        let key = rotating.key();
        pool.add(vec![rotating]);

        pool.report_error(&key, &ErrorClass::ProxyAuth);
        assert!(pool.get(&key).is_none());
        assert!(pool.is_blacklisted(&key));
        assert!(pool.select(None).is_err());
    }

    #[test]
    fn error_ceiling_disables_static_until_cooldown() {
        let pool = ProxyPool::new(
            ProxyPoolConfig::builder()
                .error_ceiling(2)
                .static_cooldown(Duration::ZERO)
                .build(),
        );
        let key = static_proxy(1).key();
        pool.add(vec![static_proxy(1)]);

        pool.report_error(&key, &ErrorClass::ConnectionRefused);
        assert_eq!(pool.get(&key).unwrap().status, ProxyStatus::Active);
        pool.report_error(&key, &ErrorClass::ConnectionRefused);
        assert_eq!(pool.get(&key).unwrap().status, ProxyStatus::Inactive);
        assert!(!pool.is_blacklisted(&key));

        // Zero cool-down: the next selection reactivates it with a clean slate.
        let picked = pool.select(None).unwrap();
        assert_eq!(picked.key(), key);
        assert_eq!(picked.error_count, 0);
    }

    #[test]
    fn repeated_rate_limits_remove_rotating() {
        let pool = ProxyPool::default();
        let rotating = ProxyRecord::new_rotating("10.1.0.1", 9000, "u", "p", Duration::from_secs(600));
        let key = rotating.key();
        pool.add(vec![rotating]);

        pool.report_error(&key, &ErrorClass::Http(429));
        pool.report_error(&key, &ErrorClass::Http(429));
        assert!(pool.get(&key).is_some());
        pool.report_error(&key, &ErrorClass::Http(429));
        assert_eq!(pool.get(&key).unwrap().status, ProxyStatus::Blacklisted);
        assert!(pool.select(None).is_err());
        assert_eq!(pool.add(vec![ProxyRecord::new_rotating("10.1.0.1", 9000, "u", "p", Duration::from_secs(600))]), 0);

        assert_eq!(pool.sweep_expired(), 1);
        assert!(pool.get(&key).is_none());
    }

    #[test]
    fn sweep_only_touches_expired_rotating() {
        let pool = ProxyPool::default();
        pool.add(vec![
            static_proxy(1),
            ProxyRecord::new_rotating("10.1.0.1", 9000, "u", "p", Duration::ZERO),
            ProxyRecord::new_rotating("10.1.0.2", 9000, "u", "p", Duration::from_secs(600)),
        ]);
        assert_eq!(pool.sweep_expired(), 1);
        let stats = pool.stats();
        assert_eq!(stats.static_count, 1);
        assert_eq!(stats.rotating_count, 1);
    }

    #[test]
    fn hint_prefers_source_when_available() {
        let pool = ProxyPool::default();
        pool.add(vec![
            static_proxy(1),
            ProxyRecord::new_rotating("10.1.0.1", 9000, "u", "p", Duration::from_secs(600)),
        ]);
        for _ in 0..10 {
            assert_eq!(
                pool.select(Some(ProxySource::Rotating)).unwrap().source,
                ProxySource::Rotating
            );
        }

        let only_static = ProxyPool::default();
        only_static.add(vec![static_proxy(1)]);
        assert_eq!(
            only_static.select(Some(ProxySource::Rotating)).unwrap().source,
            ProxySource::Static
        );
    }
}
