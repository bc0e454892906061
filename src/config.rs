//! Swap device configuration
//!
//! Loaded from TOML, then optionally overridden by `zns.<field>=<value>`
//! directives taken from a kernel-style command line.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addr::MAX_STREAM_SLOTS;
use crate::device::{RetryPolicy, ZoneGeometry};
use crate::error::{ZnsError, ZnsResult};
use crate::logger::LogLevel;
use crate::policy::AllocPolicy;

/// Reclaim buffer size in pages (4 MiB)
pub const DEFAULT_GC_BATCH_PAGES: u32 = 1024;

const DIRECTIVE_PREFIX: &str = "zns.";

/// ZNS swap configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZnsSwapConfig {
    /// Built-in allocation policy selected at activation
    pub policy: AllocPolicy,
    /// GC wakes when free zones drop to this count
    pub low_wmark: u32,
    /// GC goes idle once free zones reach this count
    pub high_wmark: u32,
    /// Override of the device open-zone limit
    pub max_open_zones: Option<u32>,
    pub gc_batch_pages: u32,
    pub gc_io_retries: u32,
    pub gc_io_backoff_ms: u64,
    pub gc_idle_poll_ms: u64,
    /// Longest time an allocation waits for emergency reclaim
    pub emergency_wait_ms: u64,
    /// Free zones held back from applications for GC destinations
    pub gc_reserve_zones: u32,
    /// Reset closed, fully invalid zones directly on the free path
    pub eager_reset: bool,
    pub log_level: Option<String>,
}

impl Default for ZnsSwapConfig {
    fn default() -> Self {
        Self {
            policy: AllocPolicy::Naive,
            low_wmark: 2,
            high_wmark: 4,
            max_open_zones: None,
            gc_batch_pages: DEFAULT_GC_BATCH_PAGES,
            gc_io_retries: 3,
            gc_io_backoff_ms: 1,
            gc_idle_poll_ms: 100,
            emergency_wait_ms: 2000,
            gc_reserve_zones: 1,
            eager_reset: false,
            log_level: None,
        }
    }
}

impl ZnsSwapConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> ZnsResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> ZnsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ZnsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Apply `zns.<field>=<value>` tokens from a command line.
    ///
    /// Tokens without the `zns.` prefix are ignored so a full kernel command
    /// line can be passed through. Returns the number of directives applied.
    pub fn apply_directives(&mut self, cmdline: &str) -> ZnsResult<usize> {
        let mut applied = 0;

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let Some(field) = key.strip_prefix(DIRECTIVE_PREFIX) else {
                continue;
            };

            match field {
                "policy" => {
                    self.policy = AllocPolicy::from_str(value)
                        .ok_or_else(|| bad_directive(key, value))?;
                }
                "low_wmark" => self.low_wmark = parse_num(key, value)?,
                "high_wmark" => self.high_wmark = parse_num(key, value)?,
                "max_open_zones" => self.max_open_zones = Some(parse_num(key, value)?),
                "gc_batch_pages" => self.gc_batch_pages = parse_num(key, value)?,
                "gc_io_retries" => self.gc_io_retries = parse_num(key, value)?,
                "gc_io_backoff_ms" => self.gc_io_backoff_ms = parse_num(key, value)?,
                "gc_idle_poll_ms" => self.gc_idle_poll_ms = parse_num(key, value)?,
                "emergency_wait_ms" => self.emergency_wait_ms = parse_num(key, value)?,
                "gc_reserve_zones" => self.gc_reserve_zones = parse_num(key, value)?,
                "eager_reset" => {
                    self.eager_reset = match value {
                        "1" | "true" | "on" => true,
                        "0" | "false" | "off" => false,
                        _ => return Err(bad_directive(key, value)),
                    };
                }
                "log" | "loglevel" => {
                    if LogLevel::from_str(value).is_none() {
                        return Err(bad_directive(key, value));
                    }
                    self.log_level = Some(value.to_string());
                }
                _ => return Err(ZnsError::Config(format!("unknown directive `{}`", key))),
            }
            applied += 1;
        }

        self.validate()?;
        Ok(applied)
    }

    /// Check device-independent constraints
    pub fn validate(&self) -> ZnsResult<()> {
        if self.gc_batch_pages == 0 {
            return Err(ZnsError::Config("gc_batch_pages must be non-zero".into()));
        }
        if self.low_wmark >= self.high_wmark {
            return Err(ZnsError::Config(format!(
                "low_wmark ({}) must be below high_wmark ({})",
                self.low_wmark, self.high_wmark
            )));
        }
        if let Some(max_open) = self.max_open_zones {
            // One slot goes to GC, the rest must be nameable by the slot field
            if !(2..=MAX_STREAM_SLOTS as u32 + 1).contains(&max_open) {
                return Err(ZnsError::Config(format!(
                    "max_open_zones ({}) must be within 2..={}",
                    max_open,
                    MAX_STREAM_SLOTS + 1
                )));
            }
        }
        if let Some(level) = &self.log_level {
            if LogLevel::from_str(level).is_none() {
                return Err(ZnsError::Config(format!("unknown log level `{}`", level)));
            }
        }
        Ok(())
    }

    /// Check the configuration against a concrete device
    pub fn validate_for(&self, geometry: &ZoneGeometry) -> ZnsResult<()> {
        self.validate()?;

        if geometry.num_zones < 2 || geometry.zone_capacity == 0 {
            return Err(ZnsError::Config(format!(
                "device geometry {}x{} is too small",
                geometry.num_zones, geometry.zone_capacity
            )));
        }
        if geometry.num_zones > u16::MAX as u32 + 1 {
            return Err(ZnsError::Config(format!(
                "{} zones exceed the addressable range",
                geometry.num_zones
            )));
        }
        if self.high_wmark > geometry.num_zones {
            return Err(ZnsError::Config(format!(
                "high_wmark ({}) exceeds zone count ({})",
                self.high_wmark, geometry.num_zones
            )));
        }
        if let Some(max_open) = self.max_open_zones {
            if max_open > geometry.max_open_zones {
                return Err(ZnsError::Config(format!(
                    "max_open_zones ({}) exceeds device limit ({})",
                    max_open, geometry.max_open_zones
                )));
            }
        } else if geometry.max_open_zones < 2 {
            return Err(ZnsError::Config(format!(
                "device open-zone limit ({}) leaves no room for GC",
                geometry.max_open_zones
            )));
        }
        if self.gc_reserve_zones >= geometry.num_zones {
            return Err(ZnsError::Config(format!(
                "gc_reserve_zones ({}) must be below zone count ({})",
                self.gc_reserve_zones, geometry.num_zones
            )));
        }
        Ok(())
    }

    /// Open-zone limit in effect on `geometry`, capped to what the slot
    /// field can address
    pub fn effective_max_open(&self, geometry: &ZoneGeometry) -> u32 {
        self.max_open_zones
            .unwrap_or(geometry.max_open_zones)
            .min(MAX_STREAM_SLOTS as u32 + 1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.gc_io_retries,
            Duration::from_millis(self.gc_io_backoff_ms),
        )
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().and_then(LogLevel::from_str)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> ZnsResult<T> {
    value.parse().map_err(|_| bad_directive(key, value))
}

fn bad_directive(key: &str, value: &str) -> ZnsError {
    ZnsError::Config(format!("invalid value `{}` for `{}`", value, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ZnsSwapConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gc_batch_pages, 1024);
        assert_eq!(config.policy, AllocPolicy::Naive);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ZnsSwapConfig::from_toml_str(
            r#"
            policy = "static_heat"
            low_wmark = 3
            high_wmark = 6
            eager_reset = true
            "#,
        )
        .unwrap();

        assert_eq!(config.policy, AllocPolicy::StaticHeat);
        assert_eq!(config.low_wmark, 3);
        assert_eq!(config.high_wmark, 6);
        assert!(config.eager_reset);
        assert_eq!(config.gc_io_retries, 3);
    }

    #[test]
    fn test_from_toml_rejects_bad_input() {
        assert!(matches!(
            ZnsSwapConfig::from_toml_str("low_wmark = \"two\""),
            Err(ZnsError::Config(_))
        ));
        assert!(matches!(
            ZnsSwapConfig::from_toml_str("low_wmark = 5\nhigh_wmark = 5"),
            Err(ZnsError::Config(_))
        ));
    }

    #[test]
    fn test_apply_directives() {
        let mut config = ZnsSwapConfig::default();
        let n = config
            .apply_directives("root=/dev/vda zns.policy=cpu zns.low_wmark=1 quiet zns.log=debug")
            .unwrap();

        assert_eq!(n, 3);
        assert_eq!(config.policy, AllocPolicy::Cpu);
        assert_eq!(config.low_wmark, 1);
        assert_eq!(config.log_level(), Some(LogLevel::DEBUG));
    }

    #[test]
    fn test_apply_directives_rejects_unknown() {
        let mut config = ZnsSwapConfig::default();
        assert!(config.apply_directives("zns.bogus=1").is_err());
        assert!(config.apply_directives("zns.policy=lru").is_err());
        assert!(config.apply_directives("zns.gc_batch_pages=-4").is_err());
    }

    #[test]
    fn test_max_open_range() {
        let mut config = ZnsSwapConfig::default();
        config.max_open_zones = Some(1);
        assert!(config.validate().is_err());
        config.max_open_zones = Some(17);
        assert!(config.validate().is_ok());
        config.max_open_zones = Some(18);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_for_geometry() {
        let geometry = ZoneGeometry::new(3, 16, 4);
        let mut config = ZnsSwapConfig::default();
        // high_wmark 4 > 3 zones
        assert!(config.validate_for(&geometry).is_err());

        config.low_wmark = 1;
        config.high_wmark = 2;
        config.validate_for(&geometry).unwrap();

        config.max_open_zones = Some(6);
        assert!(config.validate_for(&geometry).is_err());

        config.max_open_zones = None;
        assert_eq!(config.effective_max_open(&geometry), 4);
        assert_eq!(
            config.effective_max_open(&ZoneGeometry::new(64, 16, 32)),
            17
        );
    }
}
