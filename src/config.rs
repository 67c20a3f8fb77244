//! Configuration for the NVM tier
//!
//! Everything here is supplied by the outer engine; the core only reads it.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NvmError, Result};

/// Main NVM tier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// NUMA placement and capacity budget
    #[serde(default)]
    pub numa: NumaConfig,

    /// Per-table mergeable filter sizing
    #[serde(default)]
    pub filter: FilterConfig,

    /// Elastic buffer shape
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Arena block sizing
    #[serde(default)]
    pub arena: ArenaConfig,
}

/// NUMA node placement (primary PM node with an optional failover node)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumaConfig {
    /// Node that receives persistent-memory allocations first
    pub primary_node: i32,

    /// Node used once the primary node nears capacity
    pub secondary_node: Option<i32>,

    /// DRAM node for filters and volatile metadata
    pub dram_node: i32,

    /// Usable bytes on the primary node (None = read from sysfs)
    pub capacity_bytes: Option<usize>,

    /// Bytes kept free on the primary node before failing over
    pub reserved_bytes: usize,

    /// Bind block memory to its node with mbind(2)
    pub bind_memory: bool,
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self {
            primary_node: 2,
            secondary_node: Some(4),
            dram_node: 0,
            capacity_bytes: None,
            reserved_bytes: 16 * 1024 * 1024 * 1024, // 16 GB
            bind_memory: true,
        }
    }
}

/// Mergeable Bloom filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Build a filter for every frozen table
    pub enabled: bool,

    /// Filter bits per key
    pub bits_per_key: usize,

    /// Expected keys in the largest table; fixes the bitmap size
    pub keys_per_table: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bits_per_key: 10,
            keys_per_table: 1024 * 1024,
        }
    }
}

/// Elastic buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of levels in the elastic buffer
    pub num_levels: usize,

    /// Byte budget of one young memtable
    pub memtable_size: usize,

    /// Initial slots in each level's metadata ring
    pub ring_capacity: usize,

    /// Merge the terminal level into a resident last-tier table
    pub use_last_table: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            num_levels: 4,
            memtable_size: 64 * 1024 * 1024, // 64 MB
            ring_capacity: 512,
            use_last_table: false,
        }
    }
}

/// Arena configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Block size for tiered (PM) arenas
    pub block_size: usize,

    /// Extra bytes reserved past the memtable budget for the young block
    pub young_headroom: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,             // 4 KB
            young_headroom: 4 * 1024 * 1024,  // 4 MB
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NvmError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a config sized for tests and single-node machines
    pub fn small() -> Self {
        let mut config = Self::default();
        config.numa.primary_node = 0;
        config.numa.secondary_node = None;
        config.numa.capacity_bytes = Some(1024 * 1024 * 1024); // 1 GB
        config.numa.reserved_bytes = 0;
        config.numa.bind_memory = false;
        config.filter.keys_per_table = 16 * 1024;
        config.buffer.memtable_size = 256 * 1024; // 256 KB
        config.buffer.ring_capacity = 8;
        config.arena.young_headroom = 64 * 1024;
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer.num_levels < 2 {
            return Err(NvmError::InvalidConfig("num_levels must be >= 2".into()));
        }
        if self.buffer.memtable_size == 0 {
            return Err(NvmError::InvalidConfig("memtable_size must be > 0".into()));
        }
        if self.buffer.ring_capacity < 2 {
            return Err(NvmError::InvalidConfig("ring_capacity must be >= 2".into()));
        }
        if self.arena.block_size < 64 || !self.arena.block_size.is_power_of_two() {
            return Err(NvmError::InvalidConfig(
                "block_size must be a power of two >= 64".into(),
            ));
        }
        if self.filter.enabled && (self.filter.bits_per_key == 0 || self.filter.keys_per_table == 0) {
            return Err(NvmError::InvalidConfig(
                "filter needs bits_per_key > 0 and keys_per_table > 0".into(),
            ));
        }
        if self.numa.secondary_node == Some(self.numa.primary_node) {
            return Err(NvmError::InvalidConfig(
                "secondary_node must differ from primary_node".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
        Config::small().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::small();
        config.buffer.num_levels = 1;
        assert!(config.validate().is_err());

        let mut config = Config::small();
        config.arena.block_size = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.numa.secondary_node = Some(config.numa.primary_node);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [numa]
            primary_node = 1
            secondary_node = 3
            dram_node = 0
            reserved_bytes = 0
            bind_memory = false

            [buffer]
            num_levels = 3
            memtable_size = 1048576
            ring_capacity = 16
            use_last_table = true
            "#,
        )
        .unwrap();

        assert_eq!(config.numa.primary_node, 1);
        assert_eq!(config.numa.secondary_node, Some(3));
        assert_eq!(config.buffer.num_levels, 3);
        assert!(config.buffer.use_last_table);
        assert_eq!(config.filter.bits_per_key, 10);
        assert_eq!(config.arena.block_size, 4096);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvm.json");
        let json = serde_json::to_string(&Config::small()).unwrap();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(json.as_bytes())
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.buffer.memtable_size, 256 * 1024);
        assert!(!config.numa.bind_memory);
    }
}
