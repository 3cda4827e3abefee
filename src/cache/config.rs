//! Read-cache configuration.

use serde::{Deserialize, Serialize};

use crate::status::Status;
use crate::utility::{is_power_of_two, round_down_to_power_of_two};

/// Configuration for the read cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCacheConfig {
    /// Whether the store creates a read cache at all.
    pub enabled: bool,
    /// Page granularity in bytes; rounded down to a power of two.
    pub page_size: u64,
    /// Total capacity in bytes; must be a power of two and a multiple of
    /// the page size.
    pub memory_size: u64,
    /// Fraction of the cache, at the tail, that eviction never advances
    /// into (0.0 to 1.0).
    pub second_chance_fraction: f64,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 1 << 25,    // 32 MB
            memory_size: 1 << 28,  // 256 MB
            second_chance_fraction: 0.1,
        }
    }
}

impl ReadCacheConfig {
    /// Create a configuration with the given capacity.
    pub fn new(memory_size: u64) -> Self {
        Self {
            memory_size,
            ..Default::default()
        }
    }

    /// Set the page size (rounded down to a power of two).
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = round_down_to_power_of_two(page_size);
        self
    }

    /// Enable or disable the cache.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the second-chance fraction.
    pub fn with_second_chance_fraction(mut self, fraction: f64) -> Self {
        self.second_chance_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Validate the geometry.
    pub fn validate(&self) -> Result<(), Status> {
        if !is_power_of_two(self.page_size) || !is_power_of_two(self.memory_size) {
            return Err(Status::InvalidArgument);
        }
        if self.memory_size < self.page_size || self.page_size < 512 {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    /// Number of pages in the cache.
    pub fn num_pages(&self) -> u64 {
        self.memory_size / self.page_size
    }

    /// Size of the protected tail region in bytes.
    pub fn second_chance_size(&self) -> u64 {
        ((self.memory_size as f64) * self.second_chance_fraction) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ReadCacheConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert_eq!(config.num_pages(), 8);
    }

    #[test]
    fn test_page_size_rounds_down() {
        let config = ReadCacheConfig::new(1 << 20).with_page_size(5000);
        assert_eq!(config.page_size, 4096);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let config = ReadCacheConfig::new(1 << 20).with_second_chance_fraction(1.5);
        assert_eq!(config.second_chance_fraction, 1.0);
        let config = ReadCacheConfig::new(1 << 20).with_second_chance_fraction(-0.5);
        assert_eq!(config.second_chance_fraction, 0.0);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let config = ReadCacheConfig {
            enabled: true,
            page_size: 4096,
            memory_size: 3000,
            second_chance_fraction: 0.1,
        };
        assert_eq!(config.validate(), Err(Status::InvalidArgument));

        let config = ReadCacheConfig::new(1 << 20).with_page_size(256);
        assert_eq!(config.validate(), Err(Status::InvalidArgument));
    }
}
