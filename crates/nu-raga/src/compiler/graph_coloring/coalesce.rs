//! Coalescing: the Briggs and George tests, and merging nodes

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Test one move from the worklist
    pub(super) fn coalesce(&mut self) {
        let Some(m) = self.move_worklist.pop(&mut self.moves) else {
            return;
        };
        let start = Instant::now();

        let [x, y] = self.moves[m].node;
        let (u, v) = if self.nodes[y].state == NodeState::Precolored {
            (y, x)
        } else {
            (x, y)
        };
        debug_assert!(self.nodes[u].alias.is_none() && self.nodes[v].alias.is_none());

        if u == v {
            self.remove_node_move(u, m);
            self.coalesced_moves.push(&mut self.moves, m);
            self.stats.coalesced_moves += 1;
            self.add_work_list(u);
        } else if self.nodes[v].state == NodeState::Precolored || self.is_in_conflict(u, v) {
            self.remove_node_move(u, m);
            self.remove_node_move(v, m);
            self.constrained_moves.push(&mut self.moves, m);
            self.stats.constrained_moves += 1;
            self.add_work_list(u);
            self.add_work_list(v);
        } else if (self.nodes[u].state == NodeState::Precolored && self.adjacent_ok(v, u, m))
            || (self.nodes[u].state != NodeState::Precolored
                && self.adjacent_conservative(u, v, m))
        {
            self.remove_node_move(u, m);
            self.remove_node_move(v, m);
            self.coalesced_moves.push(&mut self.moves, m);
            self.stats.coalesced_moves += 1;
            trace!("coalesce n{} into n{}", v, u);
            self.combine(u, v);
            self.add_work_list(u);
        } else {
            self.active_moves.push(&mut self.moves, m);
        }

        self.stats.coalesce_time += start.elapsed();
    }

    /// Send `u` to simplification once it is insignificant and has no moves left
    pub(super) fn add_work_list(&mut self, u: NodeId) {
        if self.nodes[u].state == NodeState::FreezeWork
            && !self.move_related(u)
            && !self.significant(u)
        {
            self.freeze_work.remove(&mut self.nodes, u);
            self.simplify_work.push(&mut self.nodes, u);
        }
    }

    /// Whether `u` (possibly precolored) and candidate `v` may not share a register
    pub(super) fn is_in_conflict(&self, u: NodeId, v: NodeId) -> bool {
        if self.omits_hard_regs() && self.nodes[u].state == NodeState::Precolored {
            return self.nodes[u]
                .color
                .is_some_and(|reg| self.nodes[v].excluded.contains(reg));
        }
        self.adjacent(u, v)
    }

    /// George's test for merging `v` into precolored `r`: every significant
    /// neighbor of `v` must already conflict with `r`. On failure the number
    /// of offending neighbors becomes the move's countdown.
    fn adjacent_ok(&mut self, v: NodeId, r: NodeId, m: MoveId) -> bool {
        self.stats.george_tests += 1;
        let Some(color) = self.nodes[r].color else {
            return false;
        };

        let neighbors = self.live_neighbors(v);
        self.stats.neighbor_visits += neighbors.len();
        let offending = neighbors
            .into_iter()
            .filter(|&t| {
                if self.omits_hard_regs() {
                    !(!self.significant(t) || self.nodes[t].excluded.contains(color))
                } else {
                    !(self.nodes[t].state == NodeState::Precolored
                        || !self.significant(t)
                        || self.adjacent(t, r))
                }
            })
            .count() as i32;

        if offending > 0 {
            self.moves[m].hi = if self.config.lazy_move_enabling {
                offending
            } else {
                0
            };
            return false;
        }
        true
    }

    /// Briggs' test for merging candidates `u` and `v`: the significant
    /// neighbors of the merged node must squeeze it less than its placements.
    /// On success `u` takes the joint class; on failure the excess pressure
    /// becomes the move's countdown.
    fn adjacent_conservative(&mut self, u: NodeId, v: NodeId, m: MoveId) -> bool {
        self.stats.briggs_tests += 1;
        let model = self.model();
        let Some(joint) = model.intersect(self.nodes[u].class_id, self.nodes[v].class_id) else {
            return false;
        };

        let (excluded, placements) = if self.omits_hard_regs() {
            let excluded = self.nodes[u]
                .excluded
                .union(self.nodes[v].excluded)
                .intersection(model.members(joint));
            (
                excluded,
                model.class_size(joint) as i32 - excluded.len() as i32,
            )
        } else {
            (RegSet::empty(), model.class_size(joint) as i32)
        };

        let mut visited = bitvec![0; self.nodes.len()];
        let mut hard_squeeze = 0;
        for a in self
            .live_neighbors(u)
            .into_iter()
            .chain(self.live_neighbors(v))
        {
            if visited.replace(a, true) {
                continue;
            }
            self.stats.neighbor_visits += 1;
            if self.significant(a) {
                hard_squeeze += model.displacement(joint, self.nodes[a].class_id);
            }
        }

        if hard_squeeze >= placements {
            self.moves[m].hi = if self.config.lazy_move_enabling {
                hard_squeeze - (placements - 1)
            } else {
                0
            };
            return false;
        }

        self.nodes[u].class_id = joint;
        if self.omits_hard_regs() {
            self.nodes[u].excluded = excluded;
        }
        true
    }

    /// The node `n` has been merged into, compressing the path on the way
    pub(super) fn get_alias(&mut self, n: NodeId) -> NodeId {
        let mut root = n;
        while self.nodes[root].state == NodeState::Coalesced {
            match self.nodes[root].alias {
                Some(alias) => root = alias,
                None => break,
            }
        }
        let mut cursor = n;
        while cursor != root && self.nodes[cursor].state == NodeState::Coalesced {
            match self.nodes[cursor].alias.replace(root) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        root
    }

    /// Merge `v` into `u`
    fn combine(&mut self, u: NodeId, v: NodeId) {
        if self.nodes[v].state == NodeState::FreezeWork {
            self.freeze_work.remove(&mut self.nodes, v);
        } else {
            self.spill_work.remove(&mut self.nodes, v);
        }
        self.coalesced.push(&mut self.nodes, v);
        self.nodes[v].alias = Some(u);

        let u_precolored = self.nodes[u].state == NodeState::Precolored;

        while let Some(vm) = self.pop_node_move(v) {
            if u_precolored {
                let [a, b] = self.moves[vm].node;
                if self.nodes[a].state != NodeState::Precolored
                    || self.nodes[b].state != NodeState::Precolored
                {
                    self.moves[vm].hi = 0;
                }
            }
            // Move endpoints are never coalesced nodes
            for link in 0..2 {
                if self.moves[vm].node[link] == v {
                    self.moves[vm].node[link] = u;
                    self.add_node_move(u, vm, link);
                }
            }
            // Nothing can unfreeze a move between two hard registers
            let [a, b] = self.moves[vm].node;
            if self.moves[vm].state == MoveState::Active
                && self.nodes[a].state == NodeState::Precolored
                && self.nodes[b].state == NodeState::Precolored
            {
                self.active_moves.remove(&mut self.moves, vm);
                self.move_worklist.push(&mut self.moves, vm);
            }
        }

        let u_significant = self.significant(u);
        let v_significant = self.significant(v);

        // A precolored u has no adjacency list to reach v's neighbors through later
        if v_significant && u_precolored {
            self.enable_moves_adjacent(v, false);
        }

        for t in self.live_neighbors(v) {
            self.transfer_edge(t, v);
        }

        if self.significant(u) && self.nodes[u].state == NodeState::FreezeWork {
            self.freeze_work.remove(&mut self.nodes, u);
            self.spill_work.push(&mut self.nodes, u);
        }

        if !u_precolored && (u_significant || v_significant) {
            self.enable_moves_adjacent(u, false);
        }
    }

    /// Move the edge between `t` and coalesced `v` over to `v`'s alias
    fn transfer_edge(&mut self, t: NodeId, v: NodeId) {
        let Some(u) = self.nodes[v].alias else {
            return;
        };
        let t_significant = self.significant(t);
        if self.add_edge(t, u)
            && self.nodes[u].state == NodeState::Precolored
            && t_significant
            && self.config.lazy_move_enabling
        {
            self.enable_moves_adjacent(t, true);
        }
        self.decrement_degree(t, v);
    }
}
