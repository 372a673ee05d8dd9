//! Lazily populated set of limiters, one per key.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::key::LimiterKey;
use super::limiter::Limiter;
use crate::config::LimiterConfig;

/// Transforms each freshly built limiter before it is handed out.
pub type LimiterFactory = Box<dyn Fn(Limiter) -> Limiter + Send + Sync>;

/// Registry of limiters sharing one configuration, indexed by key.
///
/// Entries are created on first use and evicted once they have been idle for
/// the configured timeout and nobody outside the registry holds them.
pub struct KeyedRegistry {
    /// Name used in log output and as a prefix for limiter names
    name: String,
    /// Configuration given to every limiter
    config: LimiterConfig,
    /// Live limiters indexed by key
    limiters: DashMap<LimiterKey, Arc<Limiter>>,
    /// Applied once to every new limiter
    factory: Option<LimiterFactory>,
    /// Idle time after which a limiter may be evicted
    idle_timeout: Duration,
    /// When idle entries were last swept
    last_sweep: Mutex<Instant>,
}

impl KeyedRegistry {
    /// Create a new registry.
    pub fn new(name: impl Into<String>, config: LimiterConfig, idle_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            config,
            limiters: DashMap::new(),
            factory: None,
            idle_timeout,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Create a registry whose limiters are passed through `factory` when
    /// they are built, before any work is scheduled on them.
    pub fn with_factory<F>(
        name: impl Into<String>,
        config: LimiterConfig,
        idle_timeout: Duration,
        factory: F,
    ) -> Self
    where
        F: Fn(Limiter) -> Limiter + Send + Sync + 'static,
    {
        let mut registry = Self::new(name, config, idle_timeout);
        registry.factory = Some(Box::new(factory));
        registry
    }

    /// Get the limiter for `key`, creating it if needed.
    pub fn for_key(&self, key: &LimiterKey) -> Arc<Limiter> {
        self.maybe_sweep();

        if let Some(existing) = self.limiters.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.limiters.entry(key.clone()).or_insert_with(|| {
            debug!(
                registry = %self.name,
                key = %key,
                "Creating new limiter"
            );
            let limiter = Limiter::new(format!("{} {}", self.name, key), self.config.clone());
            let limiter = match &self.factory {
                Some(factory) => factory(limiter),
                None => limiter,
            };
            Arc::new(limiter)
        });
        Arc::clone(entry.value())
    }

    /// Drop every limiter that is idle and not in use elsewhere.
    ///
    /// Returns the number of evicted limiters.
    pub fn evict_idle(&self) -> usize {
        *self.last_sweep.lock() = Instant::now();

        let before = self.limiters.len();
        self.limiters.retain(|key, limiter| {
            let evict = Arc::strong_count(limiter) == 1 && limiter.is_idle(self.idle_timeout);
            if evict {
                debug!(registry = %self.name, key = %key, "Evicting idle limiter");
            }
            !evict
        });
        before.saturating_sub(self.limiters.len())
    }

    /// Sweep at most once per half idle timeout.
    fn maybe_sweep(&self) {
        let due = {
            let last_sweep = self.last_sweep.lock();
            last_sweep.elapsed() >= self.idle_timeout / 2
        };
        if due {
            self.evict_idle();
        }
    }

    /// Whether a limiter currently exists for `key`.
    pub fn contains(&self, key: &LimiterKey) -> bool {
        self.limiters.contains_key(key)
    }

    /// Get the number of live limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Configuration shared by every limiter in this registry.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

impl std::fmt::Debug for KeyedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRegistry")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("limiters", &self.limiters.len())
            .finish()
    }
}
