//! Spill code insertion

use super::*;

/// An operand to be replaced by a point-lifetime temp
pub(super) struct SpillSite {
    pub(super) slot: OperandSlot,
    /// Occurrences of the same operand in one instruction share a temp
    pub(super) opnd: Operand,
    /// Memory home the value is filled from and spilled to
    pub(super) home: VarId,
}

/// What [`Raga::replace_with_temps`] did to one instruction
pub(super) struct Replacement {
    /// Instructions inserted ahead of it
    pub(super) before: usize,
    /// Instructions inserted after it
    pub(super) after: usize,
    /// Temp chosen for each replaced operand
    pub(super) temps: Vec<(Operand, VReg)>,
}

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Replace each site in instruction `index` of `block` by a fresh
    /// virtual register, filled from memory before the instruction when read
    /// and spilled to memory after it when written
    pub(super) fn replace_with_temps(
        &mut self,
        func: &mut Function,
        block: usize,
        index: usize,
        sites: Vec<SpillSite>,
        note: Option<InstNote>,
    ) -> Result<Replacement, RegAllocError> {
        let mut temps: Vec<(Operand, VReg)> = Vec::new();
        let mut fills = Vec::new();
        let mut spills = Vec::new();

        let mut filled = Vec::new();
        let mut stored = Vec::new();

        for site in sites {
            let temp = match temps.iter().find(|(opnd, _)| *opnd == site.opnd) {
                Some(&(_, temp)) => temp,
                None => {
                    let temp = func.alloc_vreg();
                    temps.push((site.opnd, temp));
                    temp
                }
            };
            if site.slot.is_src() {
                if !filled.contains(&temp) {
                    filled.push(temp);
                    fills.extend(self.target.noted_fill(Operand::VReg(temp), site.home, note));
                }
            } else if !stored.contains(&temp) {
                stored.push(temp);
                spills.extend(self.target.noted_spill(site.home, Operand::VReg(temp), note));
            }
            if let Some(opnd) = func.blocks[block].inst_mut(index).operand_mut(site.slot) {
                *opnd = Operand::VReg(temp);
            }
        }

        let block = &mut func.blocks[block];
        if index == block.instructions.len() && !spills.is_empty() {
            return Err(RegAllocError::MalformedFunction(format!(
                "terminator of {} writes a value that must live in memory",
                block.id
            )));
        }

        let (before, after) = (fills.len(), spills.len());
        for (k, inst) in spills.into_iter().enumerate() {
            block.instructions.insert(index + 1 + k, inst);
        }
        for (k, inst) in fills.into_iter().enumerate() {
            block.instructions.insert(index + k, inst);
        }
        Ok(Replacement {
            before,
            after,
            temps,
        })
    }

    /// Send every spilled node to memory and prepare the surviving nodes for
    /// another round
    pub(super) fn rewrite_program(&mut self, func: &mut Function) -> Result<(), RegAllocError> {
        // Spilled virtual registers need a memory home; variables have one
        let spillees: Vec<NodeId> = self.spilled.iter(&self.nodes).collect();
        for &n in &spillees {
            let opnd = self.nodes[n].opnd;
            self.spilled_operands.push(opnd);
            if let Operand::VReg(vreg) = opnd {
                self.nodes[n].opnd = Operand::Var(func.alloc_spill_var(vreg));
            }
            debug!("spilling {} to {}", opnd, self.nodes[n].opnd);
        }
        self.stats.spilled_nodes += spillees.len();

        let cfg = CFG::build(func);
        let loops = LoopInfo::compute(func, &cfg);
        let note = self.config.note_spills.then_some(InstNote::SpillCode);

        for block in 0..func.blocks.len() {
            let weight = loop_weight(loops.depth(func.blocks[block].id));
            let mut index = 0;
            while index < func.blocks[block].inst_count() {
                let sites: Vec<SpillSite> = func.blocks[block]
                    .inst(index)
                    .operands()
                    .filter_map(|(slot, opnd)| {
                        let n = self.node_of(opnd)?;
                        if self.nodes[n].state != NodeState::Spilled {
                            return None;
                        }
                        Some(SpillSite {
                            slot,
                            opnd: *opnd,
                            home: self.nodes[n].opnd.as_var()?,
                        })
                    })
                    .collect();
                if sites.is_empty() {
                    index += 1;
                    continue;
                }

                let first_new = self.nodes.len();
                let replaced = self.replace_with_temps(func, block, index, sites, note)?;
                self.stats.spill_loads += replaced.before;
                self.stats.spill_stores += replaced.after;

                // Temps start out as constrained as the values they stand for
                for &(spillee, temp) in &replaced.temps {
                    let class = match self.node_of(&spillee) {
                        Some(n) => self.opnd_classes[n],
                        None => self.model().any_class(),
                    };
                    let id = self.new_node(Operand::VReg(temp), class);
                    self.nodes[id].frequency = f64::INFINITY;
                }

                let original = index + replaced.before;
                let last = original + replaced.after;
                for i in index..=last {
                    if i == original {
                        self.classify(func.blocks[block].inst(i))?;
                    } else {
                        self.gather_inst(func, block, i, weight)?;
                    }
                }
                for id in first_new..self.nodes.len() {
                    self.initial.push(&mut self.nodes, id);
                }
                index = last + 1;
            }
        }

        // Spilled nodes are retired: they stay Spilled and off every list
        while let Some(n) = self.spilled.pop(&mut self.nodes) {
            self.nodes[n].clear_graph();
        }
        while let Some(n) = self.colored.pop(&mut self.nodes) {
            let node = &mut self.nodes[n];
            node.clear_graph();
            node.color = None;
            self.initial.push(&mut self.nodes, n);
        }
        while let Some(n) = self.coalesced.pop(&mut self.nodes) {
            let node = &mut self.nodes[n];
            node.clear_graph();
            node.movee_index = None;
            node.alias = None;
            self.initial.push(&mut self.nodes, n);
        }
        self.clear_moves();
        Ok(())
    }
}
