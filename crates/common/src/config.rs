use serde::{Deserialize, Serialize};

/// Strategy used by aggregate window executors to answer frame queries.
///
/// This is the one operator-level option the engine recognizes; every other
/// knob below is shared pipeline plumbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Use the combine tree, keeping the door open for specialized windowed
    /// aggregation kernels. Currently behaves like [`WindowMode::Combine`].
    Window,
    /// Build a segment tree of combinable states during finalize and answer
    /// each frame from O(log n) tree slices.
    Combine,
    /// No auxiliary structure; re-aggregate every frame from the raw values.
    /// Mostly useful to cross-check the tree path in tests.
    Separate,
}

impl Default for WindowMode {
    fn default() -> Self {
        Self::Window
    }
}

impl WindowMode {
    /// Returns whether this mode builds the combine tree during finalize.
    pub fn builds_tree(self) -> bool {
        !matches!(self, Self::Separate)
    }
}

/// Engine/session configuration shared across the plan and execution layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target rows per row block and per emitted output batch.
    pub batch_size_rows: usize,
    /// Soft memory budget; hash bins whose sorted payload exceeds their share
    /// of the budget spill their blocks to disk.
    pub mem_budget_bytes: usize,
    /// Directory used for spill files.
    pub spill_dir: String,
    /// Number of hash bins the partition sink scatters rows into.
    pub hash_bins: usize,
    /// Worker threads the source phase is driven with. `0` means "use
    /// available parallelism".
    pub worker_threads: usize,
    /// Frame-answering strategy for aggregate window executors.
    #[serde(default)]
    pub window_mode: WindowMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 2048,
            mem_budget_bytes: 512 * 1024 * 1024, // 512MB
            spill_dir: "./wf_spill".to_string(),
            hash_bins: 16,
            worker_threads: 0,
            window_mode: WindowMode::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve the effective worker thread count.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate the configuration contract.
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size_rows == 0 {
            return Err(crate::WfError::InvalidConfig(
                "batch_size_rows must be at least 1".to_string(),
            ));
        }
        if self.hash_bins == 0 {
            return Err(crate::WfError::InvalidConfig(
                "hash_bins must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
