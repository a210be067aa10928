//! Control Flow Graph construction and analysis
//!
//! This module builds a CFG from LIR and provides the analyses the
//! allocator consumes:
//! - Predecessor/successor relationships
//! - Dominator tree
//! - Liveness analysis over a dense id space
//! - Loop detection (for spill-cost weighting)

use std::collections::{HashMap, HashSet, VecDeque};

use bitvec::prelude::*;

use super::lir::{BlockId, Function, Inst};

/// A dense set of node ids
pub type IdSet = BitVec;

/// Control Flow Graph built from LIR
#[derive(Debug)]
pub struct CFG {
    /// Entry block
    pub entry: BlockId,
    /// Predecessors for each block
    pub predecessors: HashMap<BlockId, Vec<BlockId>>,
    /// Successors for each block (computed from terminators)
    pub successors: HashMap<BlockId, Vec<BlockId>>,
    /// Immediate dominator for each block
    pub idom: HashMap<BlockId, BlockId>,
    /// Reverse post-order traversal
    pub rpo: Vec<BlockId>,
    /// Post-order traversal (for backward dataflow analysis)
    pub post_order: Vec<BlockId>,
}

impl CFG {
    /// Build a CFG from a LIR function
    pub fn build(func: &Function) -> Self {
        let mut cfg = CFG {
            entry: func.entry,
            predecessors: HashMap::new(),
            successors: HashMap::new(),
            idom: HashMap::new(),
            rpo: Vec::new(),
            post_order: Vec::new(),
        };

        for block in &func.blocks {
            cfg.predecessors.insert(block.id, Vec::new());
            cfg.successors.insert(block.id, Vec::new());
        }

        for block in &func.blocks {
            let succs: Vec<BlockId> = block
                .successors()
                .into_iter()
                .filter(|&succ| func.has_block(succ))
                .collect();
            for &succ in &succs {
                cfg.predecessors.entry(succ).or_default().push(block.id);
            }
            cfg.successors.insert(block.id, succs);
        }

        cfg.compute_post_order(func);
        cfg.compute_dominators(func);

        cfg
    }

    /// Compute post-order traversal using an explicit DFS stack
    fn compute_post_order(&mut self, func: &Function) {
        if !func.has_block(func.entry) {
            return;
        }

        let mut visited = HashSet::new();
        let mut post_order = Vec::new();
        // (block, index of next successor to visit)
        let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
        visited.insert(func.entry);

        while let Some(top) = stack.last_mut() {
            let (block_id, next) = *top;
            top.1 += 1;
            let succs = self.successors.get(&block_id).map_or(&[][..], Vec::as_slice);
            if let Some(&succ) = succs.get(next) {
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                post_order.push(block_id);
                stack.pop();
            }
        }

        self.rpo = post_order.iter().rev().copied().collect();
        self.post_order = post_order;
    }

    /// Compute immediate dominators using the Cooper-Harvey-Kennedy algorithm
    fn compute_dominators(&mut self, func: &Function) {
        if self.rpo.is_empty() {
            return;
        }

        let rpo_index: HashMap<BlockId, usize> =
            self.rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut doms: HashMap<BlockId, Option<BlockId>> = HashMap::new();
        for block in &func.blocks {
            doms.insert(block.id, None);
        }
        doms.insert(func.entry, Some(func.entry));

        let mut changed = true;
        while changed {
            changed = false;

            for &block_id in &self.rpo {
                if block_id == func.entry {
                    continue;
                }

                let preds = self
                    .predecessors
                    .get(&block_id)
                    .cloned()
                    .unwrap_or_default();

                let mut new_idom = None;
                for &pred in &preds {
                    if doms.get(&pred).and_then(|d| *d).is_some() {
                        new_idom = Some(pred);
                        break;
                    }
                }

                if let Some(mut idom) = new_idom {
                    for &pred in &preds {
                        if pred == idom {
                            continue;
                        }
                        if doms.get(&pred).and_then(|d| *d).is_some() {
                            idom = Self::intersect(pred, idom, &doms, &rpo_index);
                        }
                    }

                    if doms.get(&block_id).and_then(|d| *d) != Some(idom) {
                        doms.insert(block_id, Some(idom));
                        changed = true;
                    }
                }
            }
        }

        for (block_id, dom) in doms {
            if let Some(idom) = dom
                && block_id != idom
            {
                self.idom.insert(block_id, idom);
            }
        }
    }

    /// Walk both fingers up the dominator tree until they meet
    fn intersect(
        b1: BlockId,
        b2: BlockId,
        doms: &HashMap<BlockId, Option<BlockId>>,
        rpo_index: &HashMap<BlockId, usize>,
    ) -> BlockId {
        let get_idx = |b: BlockId| rpo_index.get(&b).copied().unwrap_or(usize::MAX);

        let mut finger1 = b1;
        let mut finger2 = b2;

        while finger1 != finger2 {
            while get_idx(finger1) > get_idx(finger2) {
                match doms.get(&finger1).and_then(|d| *d) {
                    Some(dom) if dom != finger1 => finger1 = dom,
                    _ => return finger2,
                }
            }
            while get_idx(finger2) > get_idx(finger1) {
                match doms.get(&finger2).and_then(|d| *d) {
                    Some(dom) if dom != finger2 => finger2 = dom,
                    _ => return finger1,
                }
            }
        }
        finger1
    }

    /// Check if block A dominates block B
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(&idom) = self.idom.get(&current) {
            if idom == a {
                return true;
            }
            if idom == current {
                break;
            }
            current = idom;
        }
        false
    }
}

/// Node ids an instruction defines and uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefUse {
    pub defs: Vec<usize>,
    pub uses: Vec<usize>,
}

/// Liveness analysis results
#[derive(Debug)]
pub struct LivenessInfo {
    /// Ids live at the start of each block
    pub live_in: HashMap<BlockId, IdSet>,
    /// Ids live at the end of each block
    pub live_out: HashMap<BlockId, IdSet>,
}

impl LivenessInfo {
    /// Compute liveness for ids in `0..universe`, using `def_use` to
    /// extract each instruction's effects
    pub fn compute<F>(func: &Function, cfg: &CFG, universe: usize, mut def_use: F) -> Self
    where
        F: FnMut(&Inst) -> DefUse,
    {
        let mut info = LivenessInfo {
            live_in: HashMap::new(),
            live_out: HashMap::new(),
        };

        // Upward-exposed uses and definitions of each block
        let mut gen_kill: HashMap<BlockId, (IdSet, IdSet)> = HashMap::new();
        for block in &func.blocks {
            let mut uses = bitvec![0; universe];
            let mut defs = bitvec![0; universe];
            for inst in block.iter().rev() {
                let du = def_use(inst);
                for &d in &du.defs {
                    uses.set(d, false);
                    defs.set(d, true);
                }
                for &u in &du.uses {
                    uses.set(u, true);
                }
            }
            gen_kill.insert(block.id, (uses, defs));
            info.live_in.insert(block.id, bitvec![0; universe]);
            info.live_out.insert(block.id, bitvec![0; universe]);
        }

        // live_in[B] = use[B] ∪ (live_out[B] - def[B])
        // live_out[B] = ∪ live_in[S] for all successors S of B
        let mut changed = true;
        while changed {
            changed = false;

            for &block_id in &cfg.post_order {
                let mut live_out = bitvec![0; universe];
                for succ in cfg.successors.get(&block_id).into_iter().flatten() {
                    if let Some(succ_in) = info.live_in.get(succ) {
                        for id in succ_in.iter_ones() {
                            live_out.set(id, true);
                        }
                    }
                }

                let mut live_in = live_out.clone();
                if let Some((uses, defs)) = gen_kill.get(&block_id) {
                    for id in defs.iter_ones() {
                        live_in.set(id, false);
                    }
                    for id in uses.iter_ones() {
                        live_in.set(id, true);
                    }
                }

                if info.live_in.get(&block_id) != Some(&live_in)
                    || info.live_out.get(&block_id) != Some(&live_out)
                {
                    changed = true;
                    info.live_in.insert(block_id, live_in);
                    info.live_out.insert(block_id, live_out);
                }
            }
        }

        info
    }

    pub fn is_live_in(&self, block: BlockId, id: usize) -> bool {
        self.live_in
            .get(&block)
            .is_some_and(|set| set.get(id).is_some_and(|bit| *bit))
    }
}

/// Loop information
#[derive(Debug)]
pub struct LoopInfo {
    /// Natural loops: header -> set of blocks in loop
    pub loops: HashMap<BlockId, HashSet<BlockId>>,
    /// Loop depth for each block (0 = not in a loop)
    pub loop_depth: HashMap<BlockId, usize>,
}

impl LoopInfo {
    /// Detect natural loops in the CFG
    pub fn compute(func: &Function, cfg: &CFG) -> Self {
        let mut info = LoopInfo {
            loops: HashMap::new(),
            loop_depth: HashMap::new(),
        };

        for block in &func.blocks {
            info.loop_depth.insert(block.id, 0);
        }

        // Back edge: B -> H where H dominates B
        let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
        for &block_id in &cfg.rpo {
            for &succ in cfg.successors.get(&block_id).into_iter().flatten() {
                if cfg.dominates(succ, block_id) {
                    back_edges.push((block_id, succ));
                }
            }
        }

        for (tail, header) in back_edges {
            let mut loop_blocks = HashSet::new();
            loop_blocks.insert(header);

            // Everything that reaches tail without passing through header
            let mut worklist = VecDeque::new();
            if tail != header {
                loop_blocks.insert(tail);
                worklist.push_back(tail);
            }

            while let Some(block) = worklist.pop_front() {
                for &pred in cfg.predecessors.get(&block).into_iter().flatten() {
                    if loop_blocks.insert(pred) {
                        worklist.push_back(pred);
                    }
                }
            }

            // Loops can have multiple back edges
            info.loops.entry(header).or_default().extend(loop_blocks);
        }

        for blocks in info.loops.values() {
            for &block in blocks {
                *info.loop_depth.entry(block).or_insert(0) += 1;
            }
        }

        info
    }

    /// Get the loop depth of a block
    pub fn depth(&self, block: BlockId) -> usize {
        self.loop_depth.get(&block).copied().unwrap_or(0)
    }
}
