//! Allocation statistics
//!
//! Counters are accumulated over every coloring round of one function.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    /// Coloring rounds run (one more than the number of spill rewrites)
    pub rounds: usize,
    /// Node table size at the start of the last round
    pub nodes: usize,
    /// Interference edges recorded
    pub edges: usize,
    /// Calls to `add_edge`, including redundant ones
    pub add_edge_calls: usize,
    /// Candidate moves recorded by graph construction
    pub moves: usize,
    pub coalesced_moves: usize,
    pub constrained_moves: usize,
    pub frozen_moves: usize,
    pub briggs_tests: usize,
    pub george_tests: usize,
    /// Calls to `enable_moves_adjacent`
    pub enable_moves_calls: usize,
    /// Moves returned from the active set to the worklist
    pub moves_reenabled: usize,
    /// Neighbors visited by the coalescing tests
    pub neighbor_visits: usize,
    pub select_spill_calls: usize,
    /// Spill-work nodes examined by `select_spill`
    pub spill_candidates_tested: usize,
    /// Candidates that failed to color
    pub spilled_nodes: usize,
    pub spill_loads: usize,
    pub spill_stores: usize,
    /// Copies deleted by `finish`
    pub eliminated_moves: usize,
    pub build_time: Duration,
    pub coalesce_time: Duration,
    pub total_time: Duration,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rounds:                  {:>9}", self.rounds)?;
        writeln!(f, "graph nodes:             {:>9}", self.nodes)?;
        writeln!(f, "graph edges:             {:>9}", self.edges)?;
        writeln!(f, "calls on add_edge:       {:>9}", self.add_edge_calls)?;
        writeln!(f, "candidate moves:         {:>9}", self.moves)?;
        writeln!(f, "coalesced moves:         {:>9}", self.coalesced_moves)?;
        writeln!(f, "constrained moves:       {:>9}", self.constrained_moves)?;
        writeln!(f, "frozen moves:            {:>9}", self.frozen_moves)?;
        writeln!(f, "Briggs tests:            {:>9}", self.briggs_tests)?;
        writeln!(f, "George tests:            {:>9}", self.george_tests)?;
        writeln!(f, "enable_moves calls:      {:>9}", self.enable_moves_calls)?;
        writeln!(f, "moves re-enabled:        {:>9}", self.moves_reenabled)?;
        writeln!(f, "neighbors visited:       {:>9}", self.neighbor_visits)?;
        writeln!(f, "select_spill calls:      {:>9}", self.select_spill_calls)?;
        writeln!(f, "spill candidates tested: {:>9}", self.spill_candidates_tested)?;
        writeln!(f, "spilled nodes:           {:>9}", self.spilled_nodes)?;
        writeln!(
            f,
            "spill code:              {:>9} loads, {} stores",
            self.spill_loads, self.spill_stores
        )?;
        writeln!(f, "eliminated moves:        {:>9}", self.eliminated_moves)?;
        writeln!(f, "build time:              {:>9.3?}", self.build_time)?;
        writeln!(f, "coalesce time:           {:>9.3?}", self.coalesce_time)?;
        write!(f, "total time:              {:>9.3?}", self.total_time)
    }
}
