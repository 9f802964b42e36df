//! Configuration loading and runtime tuning knobs.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Deserialize;

/// Shortest pacing sleep between background passes, in milliseconds.
pub const DEF_GC_MIN_SLEEP_MS: u64 = 30_000;
/// Longest pacing sleep, in milliseconds.
pub const DEF_GC_MAX_SLEEP_MS: u64 = 60_000;
/// Back-off applied when victim selection comes up empty, in milliseconds.
pub const DEF_GC_NO_GC_SLEEP_MS: u64 = 300_000;
/// Default bound on segments examined per victim-selection call.
pub const DEF_MAX_VICTIM_SEARCH: u32 = 4096;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Shortest pacing sleep in milliseconds.
    pub min_sleep_ms: u64,
    /// Longest pacing sleep in milliseconds.
    pub max_sleep_ms: u64,
    /// Sleep applied after a pass found no victim, in milliseconds.
    pub no_gc_sleep_ms: u64,
    /// Idle-mode policy override: 0 keeps the per-pass default, 1 forces
    /// cost-benefit selection, 2 forces greedy selection.
    pub gc_idle: u8,
    /// Bound on segments examined per victim-selection call.
    pub max_victim_search: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_sleep_ms: DEF_GC_MIN_SLEEP_MS,
            max_sleep_ms: DEF_GC_MAX_SLEEP_MS,
            no_gc_sleep_ms: DEF_GC_NO_GC_SLEEP_MS,
            gc_idle: 0,
            max_victim_search: DEF_MAX_VICTIM_SEARCH,
        }
    }
}

impl GcConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shortest pacing sleep.
    pub fn with_min_sleep_ms(mut self, ms: u64) -> Self {
        self.min_sleep_ms = ms;
        self
    }

    /// Set the longest pacing sleep.
    pub fn with_max_sleep_ms(mut self, ms: u64) -> Self {
        self.max_sleep_ms = ms;
        self
    }

    /// Set the no-victim back-off sleep.
    pub fn with_no_gc_sleep_ms(mut self, ms: u64) -> Self {
        self.no_gc_sleep_ms = ms;
        self
    }

    /// Set the idle-mode policy override.
    pub fn with_gc_idle(mut self, gc_idle: u8) -> Self {
        self.gc_idle = gc_idle;
        self
    }

    /// Set the victim-search bound.
    pub fn with_max_victim_search(mut self, max: u32) -> Self {
        self.max_victim_search = max;
        self
    }

    /// Load configuration from a TOML file with a `[gc]` table.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let schema: ConfigSchema = toml::from_str(&contents)?;
        let mut config = Self::default();
        if let Some(spec) = schema.gc {
            spec.apply_to(&mut config);
        }
        Ok(config)
    }

    /// Load configuration from the `OXIFLASH_GC_CONFIG` env var (if set),
    /// then apply `OXIFLASH__gc__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("OXIFLASH_GC_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIFLASH__") {
                continue;
            }
            let path = key["OXIFLASH__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["gc", "min_sleep_ms"] => self.min_sleep_ms = parse_value(&key, &value)?,
                ["gc", "max_sleep_ms"] => self.max_sleep_ms = parse_value(&key, &value)?,
                ["gc", "no_gc_sleep_ms"] => self.no_gc_sleep_ms = parse_value(&key, &value)?,
                ["gc", "gc_idle"] => self.gc_idle = parse_value(&key, &value)?,
                ["gc", "max_victim_search"] => {
                    self.max_victim_search = parse_value(&key, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSchema {
    gc: Option<GcConfigSpec>,
}

/// Partial configuration as it appears in a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcConfigSpec {
    /// Shortest pacing sleep in milliseconds.
    pub min_sleep_ms: Option<u64>,
    /// Longest pacing sleep in milliseconds.
    pub max_sleep_ms: Option<u64>,
    /// No-victim back-off sleep in milliseconds.
    pub no_gc_sleep_ms: Option<u64>,
    /// Idle-mode policy override.
    pub gc_idle: Option<u8>,
    /// Victim-search bound.
    pub max_victim_search: Option<u32>,
}

impl GcConfigSpec {
    /// Overlay the present fields onto `config`.
    pub fn apply_to(&self, config: &mut GcConfig) {
        if let Some(v) = self.min_sleep_ms {
            config.min_sleep_ms = v;
        }
        if let Some(v) = self.max_sleep_ms {
            config.max_sleep_ms = v;
        }
        if let Some(v) = self.no_gc_sleep_ms {
            config.no_gc_sleep_ms = v;
        }
        if let Some(v) = self.gc_idle {
            config.gc_idle = v;
        }
        if let Some(v) = self.max_victim_search {
            config.max_victim_search = v;
        }
    }
}

/// Live tuning knobs, adjustable while the collector runs.
#[derive(Debug)]
pub struct GcTuning {
    min_sleep_ms: AtomicU64,
    max_sleep_ms: AtomicU64,
    no_gc_sleep_ms: AtomicU64,
    gc_idle: AtomicU8,
    max_victim_search: AtomicU32,
}

impl GcTuning {
    /// Take the initial values from `config`.
    pub fn from_config(config: &GcConfig) -> Self {
        Self {
            min_sleep_ms: AtomicU64::new(config.min_sleep_ms),
            max_sleep_ms: AtomicU64::new(config.max_sleep_ms),
            no_gc_sleep_ms: AtomicU64::new(config.no_gc_sleep_ms),
            gc_idle: AtomicU8::new(config.gc_idle),
            max_victim_search: AtomicU32::new(config.max_victim_search),
        }
    }

    /// Shortest pacing sleep in milliseconds.
    pub fn min_sleep_ms(&self) -> u64 {
        self.min_sleep_ms.load(Ordering::Relaxed)
    }

    /// Longest pacing sleep in milliseconds.
    pub fn max_sleep_ms(&self) -> u64 {
        self.max_sleep_ms.load(Ordering::Relaxed)
    }

    /// No-victim back-off sleep in milliseconds.
    pub fn no_gc_sleep_ms(&self) -> u64 {
        self.no_gc_sleep_ms.load(Ordering::Relaxed)
    }

    /// Idle-mode policy override.
    pub fn gc_idle(&self) -> u8 {
        self.gc_idle.load(Ordering::Relaxed)
    }

    /// Victim-search bound.
    pub fn max_victim_search(&self) -> u32 {
        self.max_victim_search.load(Ordering::Relaxed)
    }

    /// Change the idle-mode policy override.
    pub fn set_gc_idle(&self, gc_idle: u8) {
        self.gc_idle.store(gc_idle, Ordering::Relaxed);
    }

    /// Change the victim-search bound.
    pub fn set_max_victim_search(&self, max: u32) {
        self.max_victim_search.store(max, Ordering::Relaxed);
    }

    /// Back the pacing sleep off by one step, clamped to the maximum.
    pub fn increase_sleep(&self, wait_ms: &mut u64) {
        *wait_ms = wait_ms
            .saturating_add(self.min_sleep_ms())
            .min(self.max_sleep_ms());
    }

    /// Tighten the pacing sleep by one step, clamped to the minimum.
    pub fn decrease_sleep(&self, wait_ms: &mut u64) {
        *wait_ms = wait_ms
            .saturating_sub(self.min_sleep_ms())
            .max(self.min_sleep_ms());
    }
}
