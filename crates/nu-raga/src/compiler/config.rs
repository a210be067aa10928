//! Allocator configuration
//!
//! Every variant of the algorithm is selected here at construction time.

use serde::{Deserialize, Serialize};

use super::RegAllocError;

/// Default ceiling on the node table, reached only by a runaway spill loop
pub const DEFAULT_MAX_NODE_COUNT: usize = 1 << 16;

/// What the allocator writes back into the function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Full allocation: every candidate operand becomes a hard register
    #[default]
    Allocate,
    /// Coalesce only: candidates are renamed to their coalescing
    /// representative and coalesced copies are deleted; nothing is colored.
    /// A stack parameter merged away is loaded into its representative.
    CoalesceOnly,
}

/// How precolored hard registers are represented in the interference graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardRegPolicy {
    /// Hard registers are not graph nodes; interference with one is
    /// recorded in the candidate's excluded-register set
    #[default]
    Excluded,
    /// Hard registers are ordinary (precolored) graph nodes with edges
    InGraph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagaConfig {
    pub mode: OutputMode,
    pub hard_regs: HardRegPolicy,
    /// Leung-George lazy move enabling through per-move countdowns. When
    /// off, a failed coalescing test leaves no countdown and any degree
    /// change re-enables the moves around it.
    pub lazy_move_enabling: bool,
    /// Stop counting squeeze from a neighbor class once the node already
    /// has as many neighbors of that class as the class has registers
    pub neighbor_census: bool,
    /// Always take the lowest free caller-saved register instead of
    /// rotating through them
    pub min_caller_saved: bool,
    /// Mark inserted fills and spills with [`InstNote::SpillCode`](super::InstNote)
    pub note_spills: bool,
    /// Delete frozen copies whose two ends happened to get the same color
    pub eliminate_frozen_nops: bool,
    pub max_node_count: usize,
}

impl Default for RagaConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Allocate,
            hard_regs: HardRegPolicy::Excluded,
            lazy_move_enabling: true,
            neighbor_census: false,
            min_caller_saved: false,
            note_spills: false,
            eliminate_frozen_nops: true,
            max_node_count: DEFAULT_MAX_NODE_COUNT,
        }
    }
}

impl RagaConfig {
    /// Parse a configuration from JSON; omitted fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, RegAllocError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn coalesce_only() -> Self {
        Self {
            mode: OutputMode::CoalesceOnly,
            ..Self::default()
        }
    }
}
