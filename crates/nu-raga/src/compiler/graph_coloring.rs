//! Graph Coloring Register Allocator (Iterated Register Coalescing)
//!
//! This implements George and Appel's iterated register coalescing with the
//! Leung-George extensions, generalized to machines whose registers are
//! split into overlapping classes.
//!
//! ## Algorithm Overview
//!
//! 1. **Build**: Construct the interference graph from liveness and record
//!    every register-to-register copy as a candidate move
//! 2. **Simplify**: Remove insignificant, non-move-related nodes (push to stack)
//! 3. **Coalesce**: Merge move-related nodes using the Briggs and George tests
//! 4. **Freeze**: Give up coalescing on some insignificant move-related node
//! 5. **Spill**: Push the cheapest significant node as a potential spill
//! 6. **Select**: Pop from the stack and assign colors (registers)
//! 7. **Rewrite**: If some nodes got no color, insert spill code and restart
//!
//! ## Unequal Register Classes
//!
//! A node does not have a degree. It has a *squeeze*: the sum, over its
//! neighbors, of the worst-case number of registers of its class each
//! neighbor can block. A node is *significant* (high degree) once its
//! squeeze reaches its number of *placements*, the size of its class less
//! any hard registers it already conflicts with.
//!
//! Hard registers are either kept out of the graph, with a conflict recorded
//! as an excluded-register set on the candidate ([`HardRegPolicy::Excluded`]),
//! or entered as precolored nodes ([`HardRegPolicy::InGraph`]).
//!
//! ## Lazy Move Enabling
//!
//! A move that fails a coalescing test stays Active with a countdown `hi`:
//! the amount of significant-neighbor pressure that must disappear before
//! the test could pass. Losing a significant neighbor decrements the
//! countdowns of nearby moves, and only moves that reach zero return to the
//! worklist.
//!
//! ## References
//!
//! - George, L. and Appel, A. "Iterated Register Coalescing" (1996)
//! - Leung, A. and George, L. "A New MLRISC Register Allocator" (1998)
//! - Smith, M., Ramsey, N. and Holloway, G. "A Generalized Algorithm for
//!   Graph-Coloring Register Allocation" (2004)

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Instant;

use bitvec::prelude::*;
use log::{Level, debug, info, log_enabled, trace};

use super::RegAllocError;
use super::cfg::{CFG, DefUse, LivenessInfo, LoopInfo};
use super::config::{HardRegPolicy, OutputMode, RagaConfig};
use super::lir::{Function, Inst, InstHandle, InstNote, Operand, OperandSlot, VReg, VarId};
use super::reg_info::{HardReg, RegClassId, RegSet, RegisterModel};
use super::stats::Stats;
use super::target::Target;

mod build;
mod catalog;
mod coalesce;
mod coloring;
mod finish;
mod freeze;
mod rewrite;
mod simplify;
mod worklist;

#[cfg(test)]
mod tests;

use worklist::{Links, NodeMoveLink, WorkList};

/// Index into the node table
type NodeId = usize;
/// Index into the move table
type MoveId = usize;

/// Worklist state for each node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Not yet categorized
    Initial,
    /// A hard register; never on a list
    Precolored,
    /// Assigned a register
    Colored,
    /// Merged into its alias
    Coalesced,
    /// Failed to color
    Spilled,
    /// Insignificant, not move-related
    SimplifyWork,
    /// Insignificant, move-related
    FreezeWork,
    /// Significant
    SpillWork,
    /// On the select stack
    SelectStacked,
}

/// Move state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    /// Ready to be tested for coalescing
    Worklist,
    /// Failed a test; waiting for its countdown to reach zero
    Active,
    /// Successfully coalesced
    Coalesced,
    /// Endpoints interfere
    Constrained,
    /// Given up on
    Frozen,
}

/// One register candidate or allocatable hard register
#[derive(Debug, Clone)]
struct RagaNode {
    id: NodeId,
    opnd: Operand,
    state: NodeState,
    links: Links,
    /// Occurrence count weighted by loop depth
    frequency: f64,
    squeeze: i32,
    /// How much this node squeezes its neighbors, scaled by their class sizes
    antisqueeze: f64,
    /// Neighbors counted per class (neighbor census only)
    class_degree: Vec<i32>,
    excluded: RegSet,
    class_id: RegClassId,
    adj_list: Vec<NodeId>,
    movee_index: Option<usize>,
    alias: Option<NodeId>,
    color: Option<HardReg>,
}

impl RagaNode {
    fn new(id: NodeId, opnd: Operand, class_id: RegClassId, census_classes: usize) -> Self {
        Self {
            id,
            opnd,
            state: NodeState::Initial,
            links: Links::default(),
            frequency: 0.0,
            squeeze: 0,
            antisqueeze: 0.0,
            class_degree: vec![0; census_classes],
            excluded: RegSet::empty(),
            class_id,
            adj_list: Vec::new(),
            movee_index: None,
            alias: None,
            color: None,
        }
    }

    /// Forget everything the last interference graph said about this node
    fn clear_graph(&mut self) {
        self.squeeze = 0;
        self.antisqueeze = 0.0;
        self.class_degree.iter_mut().for_each(|d| *d = 0);
        self.adj_list.clear();
    }
}

/// A copy instruction that may be coalesced
#[derive(Debug, Clone)]
struct MoveInfo {
    /// Destination and source nodes
    node: [NodeId; 2],
    state: MoveState,
    /// Lazy enabling countdown
    hi: i32,
    handle: InstHandle,
    links: Links,
    node_links: [NodeMoveLink; 2],
}

/// Occurrence weight of an instruction at loop depth `depth`
fn loop_weight(depth: usize) -> f64 {
    8f64.powi(depth.min(i32::MAX as usize) as i32)
}

/// Result of register allocation
#[derive(Debug, Clone, Default)]
pub struct AllocationResult {
    /// Register held by each candidate operand that was colored
    pub assignments: HashMap<Operand, HardReg>,
    /// Candidate each coalesced operand was merged into
    pub aliases: HashMap<Operand, Operand>,
    /// Candidates that were sent to memory, in spill order
    pub spilled: Vec<Operand>,
    pub stats: Stats,
}

/// The register allocator
///
/// One instance may allocate any number of functions in turn; all per-function
/// state is reset at the start of [`Raga::allocate`].
pub struct Raga<'t, T: Target + ?Sized> {
    target: &'t T,
    config: RagaConfig,
    stats: Stats,

    nodes: Vec<RagaNode>,
    catalog: HashMap<Operand, NodeId>,
    /// Node of each allocatable hard register
    hard_nodes: Vec<Option<NodeId>>,
    /// Class of each node before coalescing narrowed it
    opnd_classes: Vec<RegClassId>,
    /// Lower triangle of the adjacency matrix
    adj_matrix: BitVec,

    moves: Vec<MoveInfo>,
    /// Heads of the per-node move lists, by link slot and movee index
    node_moves: [Vec<Option<MoveId>>; 2],
    movee_count: usize,

    initial: WorkList<NodeState>,
    simplify_work: WorkList<NodeState>,
    freeze_work: WorkList<NodeState>,
    spill_work: WorkList<NodeState>,
    spilled: WorkList<NodeState>,
    coalesced: WorkList<NodeState>,
    colored: WorkList<NodeState>,
    select_stack: WorkList<NodeState>,

    move_worklist: WorkList<MoveState>,
    active_moves: WorkList<MoveState>,
    coalesced_moves: WorkList<MoveState>,
    constrained_moves: WorkList<MoveState>,
    frozen_moves: WorkList<MoveState>,

    /// Round-robin position in the caller-saved pool
    caller_cursor: usize,
    liveness: Option<LivenessInfo>,
    spilled_operands: Vec<Operand>,
}

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    pub fn new(target: &'t T, config: RagaConfig) -> Self {
        Self {
            target,
            config,
            stats: Stats::default(),
            nodes: Vec::new(),
            catalog: HashMap::new(),
            hard_nodes: Vec::new(),
            opnd_classes: Vec::new(),
            adj_matrix: BitVec::new(),
            moves: Vec::new(),
            node_moves: [Vec::new(), Vec::new()],
            movee_count: 0,
            initial: WorkList::new(NodeState::Initial),
            simplify_work: WorkList::new(NodeState::SimplifyWork),
            freeze_work: WorkList::new(NodeState::FreezeWork),
            spill_work: WorkList::new(NodeState::SpillWork),
            spilled: WorkList::new(NodeState::Spilled),
            coalesced: WorkList::new(NodeState::Coalesced),
            colored: WorkList::new(NodeState::Colored),
            select_stack: WorkList::new(NodeState::SelectStacked),
            move_worklist: WorkList::new(MoveState::Worklist),
            active_moves: WorkList::new(MoveState::Active),
            coalesced_moves: WorkList::new(MoveState::Coalesced),
            constrained_moves: WorkList::new(MoveState::Constrained),
            frozen_moves: WorkList::new(MoveState::Frozen),
            caller_cursor: 0,
            liveness: None,
            spilled_operands: Vec::new(),
        }
    }

    pub fn config(&self) -> &RagaConfig {
        &self.config
    }

    /// Statistics of the most recent allocation
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn model(&self) -> &'t RegisterModel {
        let target: &'t T = self.target;
        target.registers()
    }

    fn omits_hard_regs(&self) -> bool {
        self.config.hard_regs == HardRegPolicy::Excluded
    }

    /// Allocate registers for `func`, rewriting it in place
    pub fn allocate(&mut self, func: &mut Function) -> Result<AllocationResult, RegAllocError> {
        let start = Instant::now();
        self.reset();

        if !func.has_block(func.entry) {
            return Err(RegAllocError::MalformedFunction(format!(
                "entry block {} does not exist",
                func.entry
            )));
        }
        debug!(
            "allocating registers for {}",
            func.name.as_deref().unwrap_or("<anon>")
        );

        self.enter_hard_reg_nodes();
        self.gather(func)?;
        self.init()?;

        loop {
            self.stats.rounds += 1;
            self.color_graph(func)?;

            if self.config.mode == OutputMode::CoalesceOnly {
                self.propagate_alias_colors();
                break;
            }

            self.assign_colors();
            if self.spilled.is_empty() {
                break;
            }
            debug!(
                "round {}: {} nodes spilled",
                self.stats.rounds,
                self.spilled.len()
            );
            self.rewrite_program(func)?;
            self.reinit()?;
        }

        self.finish(func)?;
        self.stats.total_time = start.elapsed();
        info!(
            "allocated {} in {} rounds: {} moves coalesced, {} nodes spilled",
            func.name.as_deref().unwrap_or("<anon>"),
            self.stats.rounds,
            self.stats.coalesced_moves,
            self.stats.spilled_nodes
        );
        Ok(self.result())
    }

    fn reset(&mut self) {
        self.stats = Stats::default();
        self.nodes.clear();
        self.catalog.clear();
        self.hard_nodes = vec![None; self.model().reg_count()];
        self.opnd_classes.clear();
        self.adj_matrix.clear();
        self.clear_moves();
        self.initial = WorkList::new(NodeState::Initial);
        self.simplify_work = WorkList::new(NodeState::SimplifyWork);
        self.freeze_work = WorkList::new(NodeState::FreezeWork);
        self.spill_work = WorkList::new(NodeState::SpillWork);
        self.spilled = WorkList::new(NodeState::Spilled);
        self.coalesced = WorkList::new(NodeState::Coalesced);
        self.colored = WorkList::new(NodeState::Colored);
        self.select_stack = WorkList::new(NodeState::SelectStacked);
        self.caller_cursor = 0;
        self.liveness = None;
        self.spilled_operands.clear();
    }

    fn clear_moves(&mut self) {
        self.moves.clear();
        self.move_worklist = WorkList::new(MoveState::Worklist);
        self.active_moves = WorkList::new(MoveState::Active);
        self.coalesced_moves = WorkList::new(MoveState::Coalesced);
        self.constrained_moves = WorkList::new(MoveState::Constrained);
        self.frozen_moves = WorkList::new(MoveState::Frozen);
    }

    /// Precolor the hard-register nodes and queue every candidate
    fn init(&mut self) -> Result<(), RegAllocError> {
        for id in 0..self.nodes.len() {
            if let Operand::Hard(reg) = self.nodes[id].opnd {
                let node = &mut self.nodes[id];
                node.state = NodeState::Precolored;
                node.squeeze = i32::MAX;
                node.color = Some(reg);
            } else {
                self.initial.push(&mut self.nodes, id);
            }
        }
        self.reinit()
    }

    /// Prepare for a coloring round over the current node table
    fn reinit(&mut self) -> Result<(), RegAllocError> {
        let count = self.nodes.len();
        if count >= self.config.max_node_count {
            return Err(RegAllocError::TooManyCandidates {
                count,
                limit: self.config.max_node_count,
            });
        }

        self.adj_matrix = bitvec![0; count * count.saturating_sub(1) / 2];
        for (node, &class) in self.nodes.iter_mut().zip(&self.opnd_classes) {
            node.class_id = class;
            node.excluded = RegSet::empty();
            node.movee_index = None;
        }
        self.node_moves = [Vec::new(), Vec::new()];
        self.movee_count = 0;
        Ok(())
    }

    /// One pass of build, then simplify/coalesce/freeze/spill until every
    /// node is on the select stack or coalesced
    fn color_graph(&mut self, func: &Function) -> Result<(), RegAllocError> {
        let build_start = Instant::now();
        let cfg = CFG::build(func);
        let liveness =
            LivenessInfo::compute(func, &cfg, self.nodes.len(), |inst| self.defs_and_uses(inst));
        self.build(func, &liveness)?;
        self.liveness = Some(liveness);
        self.stats.build_time += build_start.elapsed();
        self.stats.nodes = self.nodes.len();

        if log_enabled!(Level::Trace) {
            trace!("interference graph, round {}:\n{}", self.stats.rounds, self.dump_graph());
        }

        self.mk_worklist();
        loop {
            if !self.simplify_work.is_empty() {
                self.simplify();
            } else if !self.move_worklist.is_empty() {
                self.coalesce();
            } else if !self.freeze_work.is_empty() {
                self.freeze();
            } else if !self.spill_work.is_empty() {
                self.select_spill()?;
            } else {
                break;
            }
        }

        self.dispose_stranded_moves();
        Ok(())
    }

    /// With hard registers out of the graph, a move whose ends both became
    /// precolored is never re-enabled and is left Active
    fn dispose_stranded_moves(&mut self) {
        if !self.omits_hard_regs() {
            assert!(
                self.active_moves.is_empty(),
                "active moves left after coloring"
            );
            return;
        }
        while let Some(m) = self.active_moves.pop(&mut self.moves) {
            let [x, y] = self.moves[m].node;
            assert!(
                self.nodes[x].state == NodeState::Precolored
                    && self.nodes[y].state == NodeState::Precolored,
                "stranded move {} has a candidate endpoint",
                m
            );
            if x == y {
                self.coalesced_moves.push(&mut self.moves, m);
                self.stats.coalesced_moves += 1;
            } else {
                self.constrained_moves.push(&mut self.moves, m);
                self.stats.constrained_moves += 1;
            }
        }
    }

    /// Follow alias links to the node a coalesced node was merged into
    fn representative(&self, mut n: NodeId) -> NodeId {
        while let Some(alias) = self.nodes[n].alias {
            n = alias;
        }
        n
    }

    fn result(&self) -> AllocationResult {
        let mut result = AllocationResult {
            spilled: self.spilled_operands.clone(),
            stats: self.stats.clone(),
            ..AllocationResult::default()
        };
        for node in &self.nodes {
            if node.opnd.is_hard_reg() || node.state == NodeState::Spilled {
                continue;
            }
            if let Some(color) = node.color {
                result.assignments.insert(node.opnd, color);
            }
            if node.alias.is_some() {
                let rep = self.representative(node.id);
                result.aliases.insert(node.opnd, self.nodes[rep].opnd);
            }
        }
        result
    }

    fn dump_graph(&self) -> String {
        let model = self.model();
        let mut out = String::new();
        for node in &self.nodes {
            let _ = write!(
                out,
                "  n{:<4} {:<8} {:?} class={} squeeze={} antisqueeze={:.3} freq={}",
                node.id,
                node.opnd.to_string(),
                node.state,
                model.class_name(node.class_id),
                if node.state == NodeState::Precolored {
                    "max".to_string()
                } else {
                    node.squeeze.to_string()
                },
                node.antisqueeze,
                node.frequency
            );
            if !node.excluded.is_empty() {
                let _ = write!(out, " excluded={:?}", node.excluded);
            }
            if !node.adj_list.is_empty() {
                let _ = write!(out, " adj={:?}", node.adj_list);
            }
            out.push('\n');
        }
        for m in self.move_worklist.iter(&self.moves) {
            let [d, s] = self.moves[m].node;
            let _ = writeln!(out, "  move n{} <- n{}", d, s);
        }
        out
    }
}

/// Convenience function to allocate `func` with the default configuration
pub fn allocate_registers<T: Target + ?Sized>(
    func: &mut Function,
    target: &T,
) -> Result<AllocationResult, RegAllocError> {
    Raga::new(target, RagaConfig::default()).allocate(func)
}
