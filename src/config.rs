//! Tunable allocator parameters.
//!
//! Values can be set programmatically through [`Config::builder`] or read
//! once at startup from the environment with [`Config::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TCALLOC_OVERALL_THREAD_CACHE_BYTES` | Budget shared by all thread caches | 16 MiB |
//! | `TCALLOC_MIN_THREAD_CACHE_BYTES` | Per-thread budget floor | 64 KiB |
//! | `TCALLOC_MAX_THREAD_CACHE_BYTES` | Per-thread budget ceiling | 2 MiB |
//! | `TCALLOC_MAX_FREE_LIST_LENGTH` | Objects per class list before draining | 256 |
//! | `TCALLOC_SCAVENGE_DELAY_MS` | Scavenger pause before releasing | 2000 |
//! | `TCALLOC_SCAVENGE_PERCENTAGE` | Share of idle pages released per pass | 0.5 |
//! | `TCALLOC_MIN_FREE_COMMITTED_PAGES` | Free pages always kept committed | 528 |
//! | `TCALLOC_BACKGROUND_SCAVENGER` | Spawn the scavenger thread ("true"/"false") | true |
//! | `TCALLOC_HARDENING` | Mask free-list slot indices ("true"/"false") | false |

use crate::error::ConfigError;
use crate::size_class::MAX_SMALL_SIZE;
use std::env;
use std::time::Duration;

/// Number of span lists (by length) the scavenger always leaves populated.
pub const MIN_SPAN_LISTS_WITH_SPANS: usize = 32;

/// Allocator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Total bytes divided among all live thread caches.
    pub overall_thread_cache_bytes: usize,
    /// Lower clamp for a single thread's budget.
    pub min_thread_cache_bytes: usize,
    /// Upper clamp for a single thread's budget.
    pub max_thread_cache_bytes: usize,
    /// A class list longer than this drains one batch to the central list.
    pub max_free_list_length: usize,
    /// How long the scavenger waits between noticing idle pages and releasing them.
    pub scavenge_delay: Duration,
    /// Fraction of the pages that stayed idle during the delay to release.
    pub scavenge_percentage: f64,
    /// The scavenger never brings committed free pages below this.
    pub min_free_committed_pages: usize,
    /// Spawn the background scavenger thread.
    pub background_scavenger: bool,
    /// XOR-mask slot indices stored in span free lists.
    pub hardening: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            overall_thread_cache_bytes: 16 << 20,
            min_thread_cache_bytes: MAX_SMALL_SIZE * 2,
            max_thread_cache_bytes: 2 << 20,
            max_free_list_length: 256,
            scavenge_delay: Duration::from_secs(2),
            scavenge_percentage: 0.5,
            // One span in each of the first 32 lists: 32 * 33 / 2.
            min_free_committed_pages: MIN_SPAN_LISTS_WITH_SPANS * (MIN_SPAN_LISTS_WITH_SPANS + 1)
                / 2,
            background_scavenger: true,
            hardening: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load from `TCALLOC_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(v) = env_parse("TCALLOC_OVERALL_THREAD_CACHE_BYTES")? {
            config.overall_thread_cache_bytes = v;
        }
        if let Some(v) = env_parse("TCALLOC_MIN_THREAD_CACHE_BYTES")? {
            config.min_thread_cache_bytes = v;
        }
        if let Some(v) = env_parse("TCALLOC_MAX_THREAD_CACHE_BYTES")? {
            config.max_thread_cache_bytes = v;
        }
        if let Some(v) = env_parse("TCALLOC_MAX_FREE_LIST_LENGTH")? {
            config.max_free_list_length = v;
        }
        if let Some(ms) = env_parse::<u64>("TCALLOC_SCAVENGE_DELAY_MS")? {
            config.scavenge_delay = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("TCALLOC_SCAVENGE_PERCENTAGE")? {
            config.scavenge_percentage = v;
        }
        if let Some(v) = env_parse("TCALLOC_MIN_FREE_COMMITTED_PAGES")? {
            config.min_free_committed_pages = v;
        }
        if let Some(v) = env_bool("TCALLOC_BACKGROUND_SCAVENGER")? {
            config.background_scavenger = v;
        }
        if let Some(v) = env_bool("TCALLOC_HARDENING")? {
            config.hardening = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_thread_cache_bytes > self.max_thread_cache_bytes {
            return Err(ConfigError::ThreadCacheBounds {
                min: self.min_thread_cache_bytes,
                max: self.max_thread_cache_bytes,
            });
        }
        if !(0.0..=1.0).contains(&self.scavenge_percentage) {
            return Err(ConfigError::ScavengePercentage(self.scavenge_percentage));
        }
        if self.max_free_list_length == 0 {
            return Err(ConfigError::FreeListLength);
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn overall_thread_cache_bytes(mut self, bytes: usize) -> Self {
        self.config.overall_thread_cache_bytes = bytes;
        self
    }

    pub fn min_thread_cache_bytes(mut self, bytes: usize) -> Self {
        self.config.min_thread_cache_bytes = bytes;
        self
    }

    pub fn max_thread_cache_bytes(mut self, bytes: usize) -> Self {
        self.config.max_thread_cache_bytes = bytes;
        self
    }

    pub fn max_free_list_length(mut self, len: usize) -> Self {
        self.config.max_free_list_length = len;
        self
    }

    pub fn scavenge_delay(mut self, delay: Duration) -> Self {
        self.config.scavenge_delay = delay;
        self
    }

    pub fn scavenge_percentage(mut self, pct: f64) -> Self {
        self.config.scavenge_percentage = pct;
        self
    }

    pub fn min_free_committed_pages(mut self, pages: usize) -> Self {
        self.config.min_free_committed_pages = pages;
        self
    }

    pub fn background_scavenger(mut self, enabled: bool) -> Self {
        self.config.background_scavenger = enabled;
        self
    }

    pub fn hardening(mut self, enabled: bool) -> Self {
        self.config.hardening = enabled;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
        Err(_) => Ok(None),
    }
}

fn env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Env { name, value }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_free_committed_pages, 528);
        assert_eq!(config.min_thread_cache_bytes, 64 * 1024);
    }

    #[test]
    fn test_builder_rejects_inverted_bounds() {
        let err = Config::builder()
            .min_thread_cache_bytes(4 << 20)
            .max_thread_cache_bytes(1 << 20)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ThreadCacheBounds {
                min: 4 << 20,
                max: 1 << 20
            }
        );
    }

    #[test]
    fn test_builder_rejects_bad_percentage() {
        assert!(Config::builder().scavenge_percentage(1.5).build().is_err());
        assert!(Config::builder().scavenge_percentage(-0.1).build().is_err());
        assert!(Config::builder().scavenge_percentage(0.0).build().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::builder()
            .background_scavenger(false)
            .hardening(true)
            .scavenge_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        assert!(!config.background_scavenger);
        assert!(config.hardening);
        assert_eq!(config.scavenge_delay, Duration::from_millis(10));
    }
}
