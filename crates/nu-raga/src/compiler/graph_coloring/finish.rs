//! Writing the allocation back into the function

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Delete copies made redundant, load stack parameters on entry, and
    /// replace every candidate operand by its register (or, when only
    /// coalescing, by its representative)
    pub(super) fn finish(&mut self, func: &mut Function) -> Result<(), RegAllocError> {
        self.delete_redundant_moves(func);
        self.load_stack_params(func);
        self.substitute_operands(func)?;

        if log_enabled!(Level::Trace) {
            trace!("after register allocation:\n{}", func);
        }
        Ok(())
    }

    fn delete_redundant_moves(&mut self, func: &mut Function) {
        let same_color = |raga: &Self, m: MoveId| {
            let [x, y] = raga.moves[m].node;
            raga.nodes[x].color.is_some() && raga.nodes[x].color == raga.nodes[y].color
        };

        let mut handles: Vec<InstHandle> = self
            .coalesced_moves
            .iter(&self.moves)
            .map(|m| self.moves[m].handle)
            .collect();
        if self.config.eliminate_frozen_nops && self.config.mode == OutputMode::Allocate {
            handles.extend(
                self.frozen_moves
                    .iter(&self.moves)
                    .filter(|&m| same_color(self, m))
                    .map(|m| self.moves[m].handle),
            );
        }
        debug_assert!(
            self.config.mode != OutputMode::Allocate
                || self
                    .constrained_moves
                    .iter(&self.moves)
                    .all(|m| !same_color(self, m)
                        || self.moves[m].node[0] == self.moves[m].node[1]),
            "constrained move between nodes of the same color"
        );

        // Highest index first, so earlier handles in a block stay valid
        handles.sort_by(|a, b| b.block.cmp(&a.block).then(b.index.cmp(&a.index)));
        handles.dedup();
        for handle in handles {
            if !func.has_block(handle.block) {
                continue;
            }
            let block = func.block_mut(handle.block);
            if handle.index < block.instructions.len() {
                block.instructions.remove(handle.index);
                self.stats.eliminated_moves += 1;
            }
        }
    }

    /// Stack parameters that live in a register are loaded at the top of
    /// the entry block. When only coalescing, a parameter merged into
    /// another candidate or a hard register is loaded into that one, since
    /// the copy that set it has been deleted.
    fn load_stack_params(&mut self, func: &mut Function) {
        let Some(liveness) = &self.liveness else {
            return;
        };
        let mut loads = Vec::new();
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
            if !liveness.is_live_in(func.entry, p) {
                continue;
            }
            let dst = match self.config.mode {
                OutputMode::Allocate => match (self.nodes[p].state, self.nodes[p].color) {
                    (NodeState::Colored, Some(color)) => Operand::Hard(color),
                    _ => continue,
                },
                OutputMode::CoalesceOnly => {
                    let rep = self.representative(p);
                    if rep == p {
                        continue;
                    }
                    self.nodes[rep].opnd
                }
            };
            loads.extend(
                self.target
                    .noted_fill(dst, param, Some(InstNote::ParamInit)),
            );
        }
        if loads.is_empty() {
            return;
        }
        debug!("loading {} stack parameters on entry", loads.len());
        let entry = func.entry;
        func.block_mut(entry).instructions.splice(0..0, loads);
    }

    fn substitute_operands(&mut self, func: &mut Function) -> Result<(), RegAllocError> {
        let allocate = self.config.mode == OutputMode::Allocate;
        for block in &mut func.blocks {
            for index in 0..block.inst_count() {
                let inst = block.inst_mut(index);
                for opnd in inst.dsts.iter_mut().chain(inst.srcs.iter_mut()) {
                    if opnd.is_hard_reg() {
                        continue;
                    }
                    let Some(n) = self.node_of(opnd) else {
                        continue;
                    };
                    *opnd = if allocate {
                        match (self.nodes[n].state, self.nodes[n].color) {
                            (NodeState::Colored, Some(color)) => Operand::Hard(color),
                            _ => return Err(RegAllocError::UncoloredOperand(opnd.to_string())),
                        }
                    } else {
                        self.nodes[self.representative(n)].opnd
                    };
                }
            }
        }
        Ok(())
    }
}
