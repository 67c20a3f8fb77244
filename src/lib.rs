//! # luma-nvm
//!
//! NUMA-aware persistent-memory tier for the LumaDB storage engine.
//!
//! Writes land in a young [`MemTable`] in DRAM. A full memtable is frozen
//! into a [`Table`] whose skip list lives in persistent-memory blocks, and
//! the [`ElasticBuffer`] merges tables level by level by relinking nodes
//! instead of copying them. Placement across NUMA nodes is accounted by
//! [`NvmBudget`], which fails over to a secondary node once the primary
//! runs short.
//!
//! ## Example
//!
//! ```rust,ignore
//! use luma_nvm::{Config, ElasticBuffer, InternalKeyComparator, LookupKey, MemTable, NvmBudget, ValueType};
//! use std::sync::Arc;
//!
//! let config = Config::small();
//! let budget = Arc::new(NvmBudget::new(&config.numa));
//! let buffer = ElasticBuffer::new(&config, InternalKeyComparator::default(), budget);
//!
//! let mem = MemTable::new(InternalKeyComparator::default(), &config);
//! mem.add(1, ValueType::Value, b"key", b"value")?;
//! buffer.flush_memtable(&mem, &config);
//! let found = buffer.get(&LookupKey::new(b"key", 1));
//! ```

pub mod arena;
pub mod budget;
pub mod comparator;
pub mod config;
pub mod elastic_buffer;
pub mod error;
pub mod filter;
pub mod memtable;
pub mod numa;
pub mod ring;
pub mod skiplist;
pub mod stats;
pub mod table;
pub mod telemetry;
pub mod types;

pub use arena::Arena;
pub use budget::NvmBudget;
pub use comparator::{BytewiseComparator, InternalKeyComparator, UserComparator};
pub use config::Config;
pub use elastic_buffer::{ElasticBuffer, FileMeta};
pub use error::{NvmError, Result};
pub use filter::MergeableFilter;
pub use memtable::MemTable;
pub use ring::NumaRing;
pub use skiplist::{Placement, SkipList};
pub use stats::StatsSnapshot;
pub use table::{GetResult, Table, TableIterator};
pub use types::{LookupKey, SequenceNumber, ValueType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
