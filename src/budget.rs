//! Process-wide NVM capacity tracking
//!
//! Querying a node's free memory from the kernel is slow, so every PM
//! allocation site reports its size here instead. Once the primary node
//! runs out of budgeted space the [`FailoverPolicy`] moves all further
//! allocations to the secondary node.
//!
//! Counters use relaxed atomics; the numbers are an estimate by design of
//! the allocation hot path, not an exact ledger.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::config::NumaConfig;
use crate::numa::{self, page_round, NodeId};

/// Primary → secondary node failover rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    pub primary: NodeId,
    pub secondary: Option<NodeId>,
}

impl FailoverPolicy {
    pub fn new(primary: NodeId, secondary: Option<NodeId>) -> Self {
        Self { primary, secondary }
    }

    /// Node to move to once `current` is exhausted
    pub fn fallback(&self, current: NodeId) -> Option<NodeId> {
        match self.secondary {
            Some(next) if current == self.primary => Some(next),
            _ => None,
        }
    }
}

/// Shared allocation budget for PM nodes
#[derive(Debug)]
pub struct NvmBudget {
    policy: FailoverPolicy,
    dram_node: NodeId,
    bind_memory: bool,
    current_node: AtomicI32,
    failed_over: AtomicBool,
    free_space: AtomicUsize,
    allocated: AtomicUsize,
}

impl NvmBudget {
    /// Build a budget from configuration. Without an explicit capacity the
    /// primary node's size is read from sysfs.
    pub fn new(config: &NumaConfig) -> Self {
        let capacity = match config.capacity_bytes {
            Some(bytes) => bytes,
            None => match numa::node_capacity(config.primary_node) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(node = config.primary_node, error = %e, "cannot read node size, assuming empty budget");
                    0
                }
            },
        };
        let free = capacity.saturating_sub(config.reserved_bytes);

        info!(
            primary = config.primary_node,
            secondary = ?config.secondary_node,
            free_bytes = free,
            "NVM budget initialised"
        );

        Self {
            policy: FailoverPolicy::new(config.primary_node, config.secondary_node),
            dram_node: config.dram_node,
            bind_memory: config.bind_memory,
            current_node: AtomicI32::new(config.primary_node),
            failed_over: AtomicBool::new(false),
            free_space: AtomicUsize::new(free),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Record a PM allocation of `bytes` and return the node it goes to.
    ///
    /// Sizes are rounded to 4 KB pages, the granularity the kernel hands
    /// node-bound memory out in.
    pub fn record_alloc(&self, bytes: usize) -> NodeId {
        let rounded = page_round(bytes);
        self.allocated.fetch_add(rounded, Ordering::Relaxed);

        if !self.failed_over.load(Ordering::Relaxed) {
            let charged = self
                .free_space
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |free| free.checked_sub(rounded));
            if charged.is_err() {
                self.fail_over();
            }
        }
        self.current_node()
    }

    /// Record that `bytes` previously charged to `node` were released
    pub fn record_free(&self, bytes: usize, node: NodeId) {
        let rounded = page_round(bytes);
        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| Some(used.saturating_sub(rounded)));
        if node == self.policy.primary && !self.failed_over.load(Ordering::Relaxed) {
            self.free_space.fetch_add(rounded, Ordering::Relaxed);
        }
    }

    fn fail_over(&self) {
        let current = self.current_node();
        match self.policy.fallback(current) {
            Some(next) => {
                if !self.failed_over.swap(true, Ordering::Relaxed) {
                    self.current_node.store(next, Ordering::Relaxed);
                    warn!(from = current, to = next, "primary NVM node exhausted, failing over");
                }
            }
            None => {
                // No secondary configured: keep allocating on the primary
                // and let the allocator decide.
                if !self.failed_over.swap(true, Ordering::Relaxed) {
                    warn!(node = current, "NVM node exhausted and no secondary node configured");
                }
            }
        }
    }

    #[inline]
    pub fn current_node(&self) -> NodeId {
        self.current_node.load(Ordering::Relaxed)
    }

    pub fn has_failed_over(&self) -> bool {
        self.failed_over.load(Ordering::Relaxed)
    }

    pub fn free_space(&self) -> usize {
        self.free_space.load(Ordering::Relaxed)
    }

    /// Bytes currently charged (page rounded)
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
    }

    pub fn dram_node(&self) -> NodeId {
        self.dram_node
    }

    pub fn bind_memory(&self) -> bool {
        self.bind_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize, secondary: Option<NodeId>) -> NumaConfig {
        NumaConfig {
            primary_node: 2,
            secondary_node: secondary,
            dram_node: 0,
            capacity_bytes: Some(capacity),
            reserved_bytes: 4096,
            bind_memory: false,
        }
    }

    #[test]
    fn test_reserve_is_subtracted() {
        let budget = NvmBudget::new(&config(16 * 4096, Some(4)));
        assert_eq!(budget.free_space(), 15 * 4096);
        assert_eq!(budget.current_node(), 2);
    }

    #[test]
    fn test_failover_happens_once() {
        let budget = NvmBudget::new(&config(3 * 4096, Some(4)));

        assert_eq!(budget.record_alloc(100), 2);
        assert_eq!(budget.free_space(), 4096);
        assert!(!budget.has_failed_over());

        // Needs two pages, only one left
        assert_eq!(budget.record_alloc(5000), 4);
        assert!(budget.has_failed_over());
        assert_eq!(budget.record_alloc(1), 4);
        assert_eq!(budget.allocated(), 4 * 4096);
    }

    #[test]
    fn test_no_secondary_stays_on_primary() {
        let budget = NvmBudget::new(&config(4096, None));
        assert_eq!(budget.record_alloc(8192), 2);
        assert!(budget.has_failed_over());
    }

    #[test]
    fn test_record_free_returns_space() {
        let budget = NvmBudget::new(&config(10 * 4096, Some(4)));
        budget.record_alloc(4096 * 2);
        assert_eq!(budget.free_space(), 7 * 4096);

        budget.record_free(4096 * 2, 2);
        assert_eq!(budget.free_space(), 9 * 4096);
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_policy_fallback() {
        let policy = FailoverPolicy::new(1, Some(3));
        assert_eq!(policy.fallback(1), Some(3));
        assert_eq!(policy.fallback(3), None);
    }
}
