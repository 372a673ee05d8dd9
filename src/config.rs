//! Configuration management for the throttler.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottlerError};

/// Prefix for environment variable overrides, e.g.
/// `CHAT_THROTTLER__EGRESS__MIN_TIME_MS=50`.
const ENV_PREFIX: &str = "CHAT_THROTTLER";

/// Main configuration for the throttler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Per-group outbound pacing (one limiter per multi-party chat)
    #[serde(default = "LimiterConfig::group_defaults")]
    pub group: LimiterConfig,

    /// Global outbound budget shared by all destinations
    #[serde(default = "LimiterConfig::egress_defaults")]
    pub egress: LimiterConfig,

    /// Per-originator inbound handling
    #[serde(default = "LimiterConfig::inbound_defaults")]
    pub inbound: LimiterConfig,

    /// Methods that skip some or all shaping
    #[serde(default)]
    pub exemptions: ExemptionConfig,

    /// How long an unused keyed limiter lives before eviction
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Log output settings for the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            group: LimiterConfig::group_defaults(),
            egress: LimiterConfig::egress_defaults(),
            inbound: LimiterConfig::inbound_defaults(),
            exemptions: ExemptionConfig::default(),
            idle_timeout_ms: default_idle_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    5 * 60 * 1000
}

/// What a limiter does once its queue reaches the high-water mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Drop the oldest queued unit to make room for the new one
    #[default]
    Leak,
    /// Refuse the new unit
    Overflow,
}

/// Token reservoir settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    /// Tokens available at creation
    pub size: u64,
    /// Token count restored on every refresh
    pub refresh_amount: u64,
    /// Time between refreshes
    pub refresh_interval_ms: u64,
}

impl ReservoirConfig {
    /// A reservoir that starts full and refills to the same size.
    pub fn new(size: u64, refresh_interval: Duration) -> Self {
        Self {
            size,
            refresh_amount: size,
            refresh_interval_ms: refresh_interval.as_millis() as u64,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Settings for a single limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Units allowed to run at once (unlimited when unset)
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Minimum time between two admissions
    #[serde(default)]
    pub min_time_ms: u64,

    /// Burst budget refilled on a fixed interval
    #[serde(default)]
    pub reservoir: Option<ReservoirConfig>,

    /// Maximum number of queued units (unbounded when unset)
    #[serde(default)]
    pub high_water: Option<usize>,

    /// Policy applied when `high_water` is reached
    #[serde(default)]
    pub strategy: Strategy,
}

impl LimiterConfig {
    /// Defaults for per-group outbound pacing: one at a time, 20 per minute.
    pub fn group_defaults() -> Self {
        Self {
            max_concurrent: Some(1),
            min_time_ms: 333,
            reservoir: Some(ReservoirConfig::new(20, Duration::from_secs(60))),
            ..Self::default()
        }
    }

    /// Defaults for the global outbound budget: 30 per second.
    pub fn egress_defaults() -> Self {
        Self {
            min_time_ms: 25,
            reservoir: Some(ReservoirConfig::new(30, Duration::from_secs(1))),
            ..Self::default()
        }
    }

    /// Defaults for inbound handling: one at a time per originator, at most
    /// three waiting.
    pub fn inbound_defaults() -> Self {
        Self {
            max_concurrent: Some(1),
            min_time_ms: 333,
            high_water: Some(3),
            strategy: Strategy::Leak,
            ..Self::default()
        }
    }

    pub fn min_time(&self) -> Duration {
        Duration::from_millis(self.min_time_ms)
    }

    /// Check the settings, naming the tier in the error.
    pub fn validate(&self, tier: &str) -> Result<()> {
        if self.max_concurrent == Some(0) {
            return Err(ThrottlerError::Config(format!(
                "{}: max_concurrent must be at least 1",
                tier
            )));
        }
        if let Some(reservoir) = &self.reservoir {
            if reservoir.refresh_interval_ms == 0 {
                return Err(ThrottlerError::Config(format!(
                    "{}: reservoir refresh_interval_ms must be positive",
                    tier
                )));
            }
        }
        Ok(())
    }
}

/// Method lists that bypass parts of the shaping pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExemptionConfig {
    /// Methods sent unshaped while a synchronous reply window is open
    #[serde(default = "default_inline_methods")]
    pub inline_methods: Vec<String>,

    /// Methods that skip per-group pacing but still pass the egress gate
    #[serde(default = "default_group_exempt_methods")]
    pub group_exempt_methods: Vec<String>,
}

impl Default for ExemptionConfig {
    fn default() -> Self {
        Self {
            inline_methods: default_inline_methods(),
            group_exempt_methods: default_group_exempt_methods(),
        }
    }
}

fn default_inline_methods() -> Vec<String> {
    [
        "answerCallbackQuery",
        "answerInlineQuery",
        "answerShippingQuery",
        "answerPreCheckoutQuery",
        "answerWebAppQuery",
        "deleteMessage",
        "leaveChat",
        "sendChatAction",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_group_exempt_methods() -> Vec<String> {
    [
        "getChat",
        "getChatAdministrators",
        "getChatMember",
        "getChatMemberCount",
        "getChatMembersCount",
        "sendChatAction",
        "deleteMessage",
        "leaveChat",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl ThrottlerConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading throttler configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let config: ThrottlerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottlerConfig = serde_yaml::from_str(yaml).map_err(|e| {
            ThrottlerError::Config(format!("Failed to parse throttler config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every tier before the throttler is built.
    pub fn validate(&self) -> Result<()> {
        self.group.validate("group")?;
        self.egress.validate("egress")?;
        self.inbound.validate("inbound")?;
        if self.idle_timeout_ms == 0 {
            return Err(ThrottlerError::Config(
                "idle_timeout_ms must be positive".to_string(),
            ));
        }
        // An evicted limiter comes back with a full reservoir, so keyed
        // limiters must outlive one refresh period.
        for (tier, limiter) in [("group", &self.group), ("inbound", &self.inbound)] {
            if let Some(reservoir) = &limiter.reservoir {
                if reservoir.refresh_interval_ms > self.idle_timeout_ms {
                    return Err(ThrottlerError::Config(format!(
                        "{}: reservoir refresh_interval_ms ({}) exceeds idle_timeout_ms ({})",
                        tier, reservoir.refresh_interval_ms, self.idle_timeout_ms
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
