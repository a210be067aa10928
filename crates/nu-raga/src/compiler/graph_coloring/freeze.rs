//! Freezing moves and choosing spill candidates

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Give up on coalescing some insignificant move-related node
    pub(super) fn freeze(&mut self) {
        let Some(u) = self.freeze_work.pop(&mut self.nodes) else {
            return;
        };
        debug_assert!(!self.significant(u), "froze significant node n{}", u);
        self.simplify_work.push(&mut self.nodes, u);
        self.freeze_moves(u);
    }

    pub(super) fn freeze_moves(&mut self, u: NodeId) {
        while let Some(m) = self.pop_node_move(u) {
            self.active_moves.remove(&mut self.moves, m);

            let [x, y] = self.moves[m].node;
            let v = if x == u { y } else { x };
            debug_assert!(self.nodes[u].alias.is_none() && self.nodes[v].alias.is_none());

            self.remove_node_move(v, m);
            self.frozen_moves.push(&mut self.moves, m);
            self.stats.frozen_moves += 1;

            if self.nodes[v].state == NodeState::FreezeWork
                && !self.move_related(v)
                && !self.significant(v)
            {
                self.freeze_work.remove(&mut self.nodes, v);
                self.simplify_work.push(&mut self.nodes, v);
            }
        }
    }

    /// Optimistically push the significant node that is cheapest to spill:
    /// least frequent use per unit of pressure it puts on its neighbors
    pub(super) fn select_spill(&mut self) -> Result<(), RegAllocError> {
        self.stats.select_spill_calls += 1;

        let mut least = f64::INFINITY;
        let mut choice = None;
        for n in self.spill_work.iter(&self.nodes) {
            self.stats.spill_candidates_tested += 1;
            // Point-lifetime temps are never spilled
            let Some(cost) = self.spill_cost(n) else {
                continue;
            };
            if choice.is_none() || cost < least {
                least = cost;
                choice = Some(n);
            }
        }
        let m = choice.ok_or(RegAllocError::NoSpillCandidate)?;
        trace!("potential spill n{} ({}), cost {:.3}", m, self.nodes[m].opnd, least);

        self.spill_work.remove(&mut self.nodes, m);
        self.simplify_work.push(&mut self.nodes, m);
        self.freeze_moves(m);
        Ok(())
    }

    /// Uses per unit of antisqueeze; `None` for a node that must not be
    /// spilled. A node that relieves no pressure costs nothing to spill.
    pub(super) fn spill_cost(&self, n: NodeId) -> Option<f64> {
        let node = &self.nodes[n];
        if node.frequency.is_infinite() {
            None
        } else if node.antisqueeze <= 0.0 {
            Some(0.0)
        } else {
            Some(node.frequency / node.antisqueeze)
        }
    }
}
