//! Interference graph construction

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Nodes defined and used by `inst`, implicit hard-register effects included
    pub(super) fn defs_and_uses(&self, inst: &Inst) -> DefUse {
        let hard = |set: RegSet| {
            set.iter()
                .filter_map(|reg| self.hard_nodes.get(reg.index()).copied().flatten())
                .collect::<Vec<_>>()
        };

        let mut du = DefUse::default();
        du.defs.extend(inst.dsts.iter().filter_map(|opnd| self.node_of(opnd)));
        du.defs.extend(hard(self.target.implicit_defs(inst)));
        du.uses.extend(inst.srcs.iter().filter_map(|opnd| self.node_of(opnd)));
        du.uses.extend(hard(self.target.implicit_uses(inst)));
        du
    }

    /// Walk each block backwards from its live-out set, adding an edge
    /// from every definition to everything live across it, and record the
    /// copies that are candidates for coalescing
    pub(super) fn build(
        &mut self,
        func: &Function,
        liveness: &LivenessInfo,
    ) -> Result<(), RegAllocError> {
        for block in &func.blocks {
            let mut live = liveness
                .live_out
                .get(&block.id)
                .ok_or(RegAllocError::MissingLiveness(block.id))?
                .clone();

            for index in (0..block.inst_count()).rev() {
                let inst = block.inst(index);
                let du = self.defs_and_uses(inst);

                if let Some((d, s)) = self.move_endpoints(inst) {
                    // The source does not interfere with the destination
                    for &u in &du.uses {
                        live.set(u, false);
                    }
                    self.record_move(
                        d,
                        s,
                        InstHandle {
                            block: block.id,
                            index,
                        },
                    );
                }

                for &d in &du.defs {
                    live.set(d, true);
                }
                let live_now: Vec<NodeId> = live.iter_ones().collect();
                for &d in &du.defs {
                    for &l in &live_now {
                        if l != d {
                            self.add_edge(l, d);
                        }
                    }
                }
                for &d in &du.defs {
                    live.set(d, false);
                }
                for &u in &du.uses {
                    live.set(u, true);
                }
            }
        }

        self.entry_interferences(func, liveness);
        Ok(())
    }

    /// Destination and source nodes of a copy the allocator may coalesce
    fn move_endpoints(&self, inst: &Inst) -> Option<(NodeId, NodeId)> {
        if !self.target.is_move(inst) {
            return None;
        }
        let (dst, src) = (inst.dsts.first()?, inst.srcs.first()?);
        if dst.is_hard_reg() && src.is_hard_reg() {
            return None;
        }
        let (d, s) = (self.node_of(dst)?, self.node_of(src)?);
        self.model()
            .intersect(self.nodes[d].class_id, self.nodes[s].class_id)?;
        Some((d, s))
    }

    pub(super) fn record_move(&mut self, d: NodeId, s: NodeId, handle: InstHandle) {
        let m = self.moves.len();
        self.moves.push(MoveInfo {
            node: [d, s],
            state: MoveState::Worklist,
            hi: 0,
            handle,
            links: Links::default(),
            node_links: [NodeMoveLink::default(); 2],
        });
        self.add_node_move(d, m, 0);
        self.add_node_move(s, m, 1);
        self.move_worklist.push(&mut self.moves, m);
        self.stats.moves += 1;
    }

    /// Stack parameters live into the entry block are all loaded together
    /// on entry, so each one interferes with everything else live there
    fn entry_interferences(&mut self, func: &Function, liveness: &LivenessInfo) {
        let Some(live) = liveness.live_in.get(&func.entry) else {
            return;
        };
        let live_now: Vec<NodeId> = live.iter_ones().collect();

        for &param in &func.params {
            let Some(var) = func.var(param) else {
                continue;
            };
            if var.addr_taken || !var.is_stack_param() {
                continue;
            }
            let Some(p) = self.node_of(&Operand::Var(param)) else {
                continue;
            };
            if !live[p] {
                continue;
            }
            for &l in &live_now {
                if l != p {
                    self.add_edge(l, p);
                }
            }
        }
    }

    /// Record that `u` and `v` interfere; true if the graph changed
    pub(super) fn add_edge(&mut self, u: NodeId, v: NodeId) -> bool {
        self.stats.add_edge_calls += 1;
        if u == v {
            return false;
        }

        let u_hard = self.nodes[u].state == NodeState::Precolored;
        let v_hard = self.nodes[v].state == NodeState::Precolored;
        match (u_hard, v_hard) {
            (true, true) => false,
            (true, false) => self.add_hard_edge(v, u),
            (false, true) => self.add_hard_edge(u, v),
            (false, false) => {
                if !self.set_adjacent(u, v) {
                    return false;
                }
                self.nodes[u].adj_list.push(v);
                self.nodes[v].adj_list.push(u);
                self.add_squeeze(u, v);
                self.add_squeeze(v, u);
                self.stats.edges += 1;
                true
            }
        }
    }

    /// Edge between candidate `c` and precolored `r`
    fn add_hard_edge(&mut self, c: NodeId, r: NodeId) -> bool {
        let model = self.model();
        let Some(color) = self.nodes[r].color else {
            return false;
        };

        if self.omits_hard_regs() {
            let blocked = model.aliases_in_class(color, self.nodes[c].class_id);
            let excluded = self.nodes[c].excluded;
            if excluded.is_superset(&blocked) {
                return false;
            }
            self.nodes[c].excluded = excluded.union(blocked);
            self.stats.edges += 1;
            return true;
        }

        // The matrix records a conflict with everything `r` overlaps, but
        // only `r` itself squeezes `c`
        let mut changed = false;
        for reg in model.aliases(color).iter() {
            if let Some(h) = self.hard_nodes.get(reg.index()).copied().flatten() {
                changed |= self.set_adjacent(c, h);
            }
        }
        if changed {
            self.nodes[c].adj_list.push(r);
            self.add_squeeze(c, r);
            self.stats.edges += 1;
        }
        changed
    }

    fn matrix_index(u: NodeId, v: NodeId) -> usize {
        let (lo, hi) = if u < v { (u, v) } else { (v, u) };
        hi * (hi - 1) / 2 + lo
    }

    pub(super) fn adjacent(&self, u: NodeId, v: NodeId) -> bool {
        u != v
            && self
                .adj_matrix
                .get(Self::matrix_index(u, v))
                .is_some_and(|bit| *bit)
    }

    /// Set the matrix bit for `u` and `v`; true if it was clear
    fn set_adjacent(&mut self, u: NodeId, v: NodeId) -> bool {
        let index = Self::matrix_index(u, v);
        if index >= self.adj_matrix.len() {
            return false;
        }
        !self.adj_matrix.replace(index, true)
    }
}
