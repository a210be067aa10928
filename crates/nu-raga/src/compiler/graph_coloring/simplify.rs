//! Simplification and squeeze bookkeeping

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Registers of its class that node `n` could still be given
    pub(super) fn placements(&self, n: NodeId) -> i32 {
        let node = &self.nodes[n];
        let size = self.model().class_size(node.class_id) as i32;
        if self.omits_hard_regs() {
            size - node.excluded.len() as i32
        } else {
            size
        }
    }

    /// A significant node might not find a color once its neighbors have
    pub(super) fn significant(&self, n: NodeId) -> bool {
        self.nodes[n].squeeze >= self.placements(n)
    }

    /// Neighbors of `n` still in the graph
    pub(super) fn live_neighbors(&self, n: NodeId) -> Vec<NodeId> {
        self.nodes[n]
            .adj_list
            .iter()
            .copied()
            .filter(|&a| {
                !matches!(
                    self.nodes[a].state,
                    NodeState::SelectStacked | NodeState::Coalesced
                )
            })
            .collect()
    }

    /// Account for the registers neighbor `v` can take away from `u`
    pub(super) fn add_squeeze(&mut self, u: NodeId, v: NodeId) {
        let model = self.model();
        let u_class = self.nodes[u].class_id;
        let v_class = self.nodes[v].class_id;

        if self.config.neighbor_census {
            let degree = &mut self.nodes[u].class_degree[v_class.index()];
            let saturated = *degree >= model.class_size(v_class) as i32;
            *degree += 1;
            if saturated {
                return;
            }
        }

        let displacement = model.displacement(u_class, v_class);
        self.nodes[u].squeeze += displacement;
        if self.nodes[v].state != NodeState::Precolored {
            self.nodes[v].antisqueeze +=
                f64::from(displacement) / model.class_size(u_class) as f64;
        }
    }

    /// Remove the squeeze neighbor `v` put on `u`, and the part of `u`'s
    /// antisqueeze earned by constraining `v`
    pub(super) fn relax_squeeze(&mut self, u: NodeId, v: NodeId) {
        let model = self.model();
        let u_class = self.nodes[u].class_id;
        let v_class = self.nodes[v].class_id;
        let census = self.config.neighbor_census;

        if !census
            || self.nodes[u].class_degree[v_class.index()] <= model.class_size(v_class) as i32
        {
            self.nodes[u].squeeze -= model.displacement(u_class, v_class);
        }
        if !census
            || self.nodes[v].class_degree[u_class.index()] <= model.class_size(u_class) as i32
        {
            self.nodes[u].antisqueeze -=
                f64::from(model.displacement(v_class, u_class)) / model.class_size(v_class) as f64;
        }
        if census {
            self.nodes[u].class_degree[v_class.index()] -= 1;
        }
    }

    pub(super) fn simplify(&mut self) {
        let Some(n) = self.simplify_work.pop(&mut self.nodes) else {
            return;
        };
        self.select_stack.push(&mut self.nodes, n);
        trace!("simplify n{}", n);

        // Its neighbors lose a significant neighbor
        if self.significant(n) {
            self.enable_moves_adjacent(n, false);
        }
        for m in self.live_neighbors(n) {
            self.decrement_degree(m, n);
        }
    }

    /// Node `n` is leaving the graph; take its squeeze off neighbor `m`
    pub(super) fn decrement_degree(&mut self, m: NodeId, n: NodeId) {
        if self.nodes[m].state == NodeState::Precolored {
            return;
        }

        let pre_squeeze = self.nodes[m].squeeze;
        self.relax_squeeze(m, n);
        let placements = self.placements(m);

        if pre_squeeze >= placements && self.nodes[m].squeeze < placements {
            self.enable_moves_adjacent(m, false);
            if !self.config.lazy_move_enabling {
                self.enable_own_moves(m);
            }

            if self.nodes[m].state == NodeState::SpillWork {
                self.spill_work.remove(&mut self.nodes, m);
                if self.move_related(m) {
                    self.freeze_work.push(&mut self.nodes, m);
                } else {
                    self.simplify_work.push(&mut self.nodes, m);
                }
            }
        }
    }

    /// Count down the active moves of `t`'s neighbors, returning those that
    /// reach zero to the worklist.
    ///
    /// With `hr_only`, `t` has not lost anything but has just picked up a
    /// hard-register conflict; only moves to a hard register that `t` now
    /// conflicts with are counted down.
    pub(super) fn enable_moves_adjacent(&mut self, t: NodeId, hr_only: bool) {
        self.stats.enable_moves_calls += 1;
        let model = self.model();
        let t_class = self.nodes[t].class_id;

        for n in self.live_neighbors(t) {
            if self.nodes[n].movee_index.is_none() {
                continue;
            }
            let n_class = self.nodes[n].class_id;
            for m in self.node_move_ids(n) {
                if self.moves[m].state != MoveState::Active {
                    debug_assert_eq!(self.moves[m].state, MoveState::Worklist);
                    continue;
                }
                if self.moves[m].hi > 0 {
                    let [x, y] = self.moves[m].node;
                    let hard_end = [x, y]
                        .into_iter()
                        .find(|&e| self.nodes[e].state == NodeState::Precolored);
                    match hard_end {
                        Some(r) => {
                            if !hr_only || self.is_in_conflict(r, t) {
                                self.moves[m].hi -= 1;
                            }
                        }
                        None => {
                            if !hr_only {
                                self.moves[m].hi -= model.displacement(n_class, t_class);
                            }
                        }
                    }
                }
                if self.moves[m].hi <= 0 {
                    self.active_moves.remove(&mut self.moves, m);
                    self.move_worklist.push(&mut self.moves, m);
                    self.stats.moves_reenabled += 1;
                }
            }
        }
    }

    /// Return every active move of `m` itself to the worklist
    fn enable_own_moves(&mut self, m: NodeId) {
        for mv in self.node_move_ids(m) {
            if self.moves[mv].state == MoveState::Active {
                self.active_moves.remove(&mut self.moves, mv);
                self.move_worklist.push(&mut self.moves, mv);
                self.stats.moves_reenabled += 1;
            }
        }
    }
}
