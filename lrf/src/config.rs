//! Configuration surface of the storage engine, an enumerated set of
//! options applied onto defaults. Options can be set programmatically or
//! picked up from `LRF_*` environment variables.

use std::env;
use std::time::Duration;

use crate::codec::CompressionKind;

/// Which on-disk format is authoritative for a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPolicy {
    /// Serve only legacy sector-based files.
    Legacy,
    /// Serve only LRF files.
    Lrf,
    /// Infer per file, preferring LRF when both exist.
    Auto,
}

/// When legacy files are converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    /// Convert the whole region directory at startup.
    Full,
    /// Convert a region the first time it is touched.
    OnDemand,
    /// Convert in the background at low priority.
    Background,
    /// Never convert implicitly; only an explicit migration call does.
    Manual,
}

/// Pool sizing: explicit or derived from the CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSize {
    Auto,
    Fixed(usize),
}

impl PoolSize {

    /// Resolve against the CPU count with a ratio and a hard ceiling.
    pub fn resolve(self, ratio: f64, cap: usize) -> usize {
        match self {
            Self::Fixed(n) => n.clamp(1, cap),
            Self::Auto => {
                let cpus = num_cpus::get() as f64;
                ((cpus * ratio).ceil() as usize).clamp(1, cap)
            }
        }
    }

}

/// All recognized options. Construct with [`Default::default`] and adjust,
/// or call [`StorageConfig::from_env`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub format: FormatPolicy,
    pub conversion_mode: ConversionMode,
    /// Default algorithm for new writes, fast or high-ratio.
    pub compression_algorithm: CompressionKind,
    pub compression_level: u32,
    /// Max chunks per write batch.
    pub batch_size: usize,
    /// Soft timer for flushing a partial batch.
    pub auto_flush_delay: Duration,
    pub load_threads: PoolSize,
    pub write_threads: PoolSize,
    pub compress_threads: PoolSize,
    pub decompress_threads: PoolSize,
    /// Disabling this falls every read back to channel I/O.
    pub mmap_enabled: bool,
    /// Spiral prefetch radius in chunks.
    pub prefetch_distance: i32,
    /// Base lookahead scale of the predictive prefetch.
    pub prediction_scale: usize,
    pub max_cache_size_bytes: usize,
    pub max_cache_entries: usize,
    /// Probability of validating a read against the checksum ledger in
    /// normal operation.
    pub integrity_sampling_probability: f64,
    /// Cap on concurrently admitted batch-reader loads.
    pub max_concurrent_loads: usize,
    /// Global switch for the rate-limited page-cache warmup sweep.
    pub ultra_scan_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format: FormatPolicy::Auto,
            conversion_mode: ConversionMode::OnDemand,
            compression_algorithm: CompressionKind::Fast,
            compression_level: 6,
            batch_size: 64,
            auto_flush_delay: Duration::from_millis(100),
            load_threads: PoolSize::Auto,
            write_threads: PoolSize::Auto,
            compress_threads: PoolSize::Auto,
            decompress_threads: PoolSize::Auto,
            mmap_enabled: true,
            prefetch_distance: 4,
            prediction_scale: 8,
            max_cache_size_bytes: 64 << 20,
            max_cache_entries: 1024,
            integrity_sampling_probability: 0.01,
            max_concurrent_loads: 16,
            ultra_scan_enabled: false,
        }
    }
}

impl StorageConfig {

    /// Defaults overridden by any `LRF_*` environment variables present.
    /// Unparseable values are reported, not silently dropped.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in [
            "format",
            "conversion_mode",
            "compression_algorithm",
            "compression_level",
            "batch_size",
            "auto_flush_delay_ms",
            "load_threads",
            "write_threads",
            "compress_threads",
            "decompress_threads",
            "mmap_enabled",
            "prefetch_distance",
            "prediction_scale",
            "max_cache_size_bytes",
            "max_cache_entries",
            "integrity_sampling_probability",
            "max_concurrent_loads",
            "ultra_scan_enabled",
        ] {
            let var = format!("LRF_{}", key.to_uppercase());
            if let Ok(value) = env::var(&var) {
                config.set(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Apply one option by name. The recognized names match the environment
    /// variables without their `LRF_` prefix, lowercased.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {

        fn invalid(key: &str, value: &str) -> ConfigError {
            ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
        }

        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| invalid(key, value))
        }

        match key {
            "format" => {
                self.format = match value {
                    "legacy" => FormatPolicy::Legacy,
                    "lrf" => FormatPolicy::Lrf,
                    "auto" => FormatPolicy::Auto,
                    _ => return Err(invalid(key, value)),
                };
            }
            "conversion_mode" => {
                self.conversion_mode = match value {
                    "full" => ConversionMode::Full,
                    "on_demand" => ConversionMode::OnDemand,
                    "background" => ConversionMode::Background,
                    "manual" => ConversionMode::Manual,
                    _ => return Err(invalid(key, value)),
                };
            }
            "compression_algorithm" => {
                self.compression_algorithm = match value {
                    "fast" => CompressionKind::Fast,
                    "high_ratio" => CompressionKind::HighRatio,
                    _ => return Err(invalid(key, value)),
                };
            }
            "compression_level" => {
                let level: u32 = parse(key, value)?;
                if !(1..=9).contains(&level) {
                    return Err(invalid(key, value));
                }
                self.compression_level = level;
            }
            "batch_size" => {
                let size: usize = parse(key, value)?;
                if !(1..=256).contains(&size) {
                    return Err(invalid(key, value));
                }
                self.batch_size = size;
            }
            "auto_flush_delay_ms" => {
                let ms: u64 = parse(key, value)?;
                if ms == 0 {
                    return Err(invalid(key, value));
                }
                self.auto_flush_delay = Duration::from_millis(ms);
            }
            "load_threads" => self.load_threads = Self::parse_pool(key, value)?,
            "write_threads" => self.write_threads = Self::parse_pool(key, value)?,
            "compress_threads" => self.compress_threads = Self::parse_pool(key, value)?,
            "decompress_threads" => self.decompress_threads = Self::parse_pool(key, value)?,
            "mmap_enabled" => self.mmap_enabled = parse(key, value)?,
            "prefetch_distance" => self.prefetch_distance = parse(key, value)?,
            "prediction_scale" => self.prediction_scale = parse(key, value)?,
            "max_cache_size_bytes" => self.max_cache_size_bytes = parse(key, value)?,
            "max_cache_entries" => self.max_cache_entries = parse(key, value)?,
            "integrity_sampling_probability" => {
                let p: f64 = parse(key, value)?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(invalid(key, value));
                }
                self.integrity_sampling_probability = p;
            }
            "max_concurrent_loads" => {
                let n: usize = parse(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value));
                }
                self.max_concurrent_loads = n;
            }
            "ultra_scan_enabled" => self.ultra_scan_enabled = parse(key, value)?,
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }

        Ok(())

    }

    fn parse_pool(key: &str, value: &str) -> Result<PoolSize, ConfigError> {
        if value == "auto" {
            return Ok(PoolSize::Auto);
        }
        match value.parse::<usize>() {
            Ok(n) if n > 0 => Ok(PoolSize::Fixed(n)),
            _ => Err(ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }),
        }
    }

}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StorageConfig::default();
        assert_eq!(config.format, FormatPolicy::Auto);
        assert!(config.batch_size >= 1 && config.batch_size <= 256);
        assert!((0.0..=1.0).contains(&config.integrity_sampling_probability));
    }

    #[test]
    fn set_known_options() {
        let mut config = StorageConfig::default();
        config.set("format", "lrf").unwrap();
        config.set("compression_algorithm", "high_ratio").unwrap();
        config.set("compression_level", "9").unwrap();
        config.set("batch_size", "128").unwrap();
        config.set("auto_flush_delay_ms", "250").unwrap();
        config.set("load_threads", "4").unwrap();
        config.set("write_threads", "auto").unwrap();
        config.set("mmap_enabled", "false").unwrap();
        config.set("integrity_sampling_probability", "0.5").unwrap();

        assert_eq!(config.format, FormatPolicy::Lrf);
        assert_eq!(config.compression_algorithm, CompressionKind::HighRatio);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.auto_flush_delay, Duration::from_millis(250));
        assert_eq!(config.load_threads, PoolSize::Fixed(4));
        assert_eq!(config.write_threads, PoolSize::Auto);
        assert!(!config.mmap_enabled);
        assert_eq!(config.integrity_sampling_probability, 0.5);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut config = StorageConfig::default();
        assert!(config.set("compression_level", "0").is_err());
        assert!(config.set("compression_level", "10").is_err());
        assert!(config.set("batch_size", "0").is_err());
        assert!(config.set("batch_size", "257").is_err());
        assert!(config.set("auto_flush_delay_ms", "0").is_err());
        assert!(config.set("integrity_sampling_probability", "1.5").is_err());
        assert!(config.set("format", "sideways").is_err());
        assert!(config.set("no_such_option", "1").is_err());
    }

    #[test]
    fn pool_resolution_bounded() {
        assert_eq!(PoolSize::Fixed(99).resolve(1.0, 8), 8);
        assert_eq!(PoolSize::Fixed(2).resolve(1.0, 8), 2);
        let auto = PoolSize::Auto.resolve(0.5, 8);
        assert!((1..=8).contains(&auto));
    }

}
