//! Operand catalog: which operands are graph nodes, and their classes
//!
//! Allocatable hard registers are enrolled first, so their nodes occupy the
//! low ids. Candidates (virtual registers, and variables that are neither
//! global nor address-taken) are enrolled as a forward scan of the code meets
//! them. The same scan weighs each occurrence by loop depth and moves
//! volatile variables (globals and address-taken locals) out of register
//! operand positions.

use super::rewrite::SpillSite;
use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    pub(super) fn node_of(&self, opnd: &Operand) -> Option<NodeId> {
        self.catalog.get(opnd).copied()
    }

    pub(super) fn new_node(&mut self, opnd: Operand, class: RegClassId) -> NodeId {
        let id = self.nodes.len();
        let census_classes = if self.config.neighbor_census {
            self.model().class_count()
        } else {
            0
        };
        self.nodes
            .push(RagaNode::new(id, opnd, class, census_classes));
        self.opnd_classes.push(class);
        self.catalog.insert(opnd, id);
        id
    }

    pub(super) fn enter_hard_reg_nodes(&mut self) {
        let model = self.model();
        for reg in model.allocatable().iter() {
            let Some(class) = model.singleton(reg) else {
                continue;
            };
            let id = self.new_node(Operand::Hard(reg), class);
            self.hard_nodes[reg.index()] = Some(id);
        }
    }

    /// Node for `opnd`, enrolling it if it is a candidate seen for the first time
    fn record(&mut self, func: &Function, opnd: &Operand) -> Option<NodeId> {
        match *opnd {
            Operand::Hard(reg) => self.hard_nodes.get(reg.index()).copied().flatten(),
            Operand::VReg(vreg) => Some(match self.node_of(opnd) {
                Some(id) => id,
                None => {
                    let class = func
                        .vreg_classes
                        .get(&vreg)
                        .copied()
                        .unwrap_or_else(|| self.model().any_class());
                    self.new_node(*opnd, class)
                }
            }),
            Operand::Var(var) if func.var(var).is_some_and(|v| v.is_register_candidate()) => {
                Some(match self.node_of(opnd) {
                    Some(id) => id,
                    None => self.new_node(*opnd, self.model().any_class()),
                })
            }
            _ => None,
        }
    }

    /// Narrow the class of each candidate in `inst` by the target's
    /// per-operand constraint
    pub(super) fn classify(&mut self, inst: &Inst) -> Result<(), RegAllocError> {
        let model = self.model();
        for (slot, opnd) in inst.operands() {
            if opnd.is_hard_reg() {
                continue;
            }
            let Some(id) = self.node_of(opnd) else {
                continue;
            };
            let Some(required) = self.target.operand_class(inst, slot) else {
                continue;
            };
            self.opnd_classes[id] = model
                .intersect(self.opnd_classes[id], required)
                .ok_or_else(|| RegAllocError::OverConstrained(opnd.to_string()))?;
        }
        Ok(())
    }

    /// Enroll and classify the operands of one instruction
    pub(super) fn gather_inst(
        &mut self,
        func: &Function,
        block: usize,
        index: usize,
        weight: f64,
    ) -> Result<(), RegAllocError> {
        let inst = func.blocks[block].inst(index);
        for (_, opnd) in inst.operands() {
            if let Some(id) = self.record(func, opnd)
                && !opnd.is_hard_reg()
            {
                self.nodes[id].frequency += weight;
            }
        }
        self.classify(inst)
    }

    /// Operands of `inst` naming variables that must stay in memory
    fn volatile_sites(&self, func: &Function, inst: &Inst) -> Result<Vec<SpillSite>, RegAllocError> {
        let mut sites = Vec::new();
        for (slot, opnd) in inst.operands() {
            let Some(var) = opnd.as_var() else {
                continue;
            };
            let variable = func.var(var).ok_or_else(|| {
                RegAllocError::MalformedFunction(format!("undeclared variable {}", var))
            })?;
            if !variable.is_register_candidate() {
                sites.push(SpillSite {
                    slot,
                    opnd: *opnd,
                    home: var,
                });
            }
        }
        Ok(sites)
    }

    /// Build the node table from the code of `func`
    pub(super) fn gather(&mut self, func: &mut Function) -> Result<(), RegAllocError> {
        let cfg = CFG::build(func);
        let loops = LoopInfo::compute(func, &cfg);

        for block in 0..func.blocks.len() {
            let weight = loop_weight(loops.depth(func.blocks[block].id));
            let mut index = 0;
            while index < func.blocks[block].inst_count() {
                let sites = self.volatile_sites(func, func.blocks[block].inst(index))?;
                let (before, after, temps) = if sites.is_empty() {
                    (0, 0, Vec::new())
                } else {
                    let r = self.replace_with_temps(func, block, index, sites, None)?;
                    (r.before, r.after, r.temps)
                };

                let last = index + before + after;
                for i in index..=last {
                    self.gather_inst(func, block, i, weight)?;
                }
                // Point-lifetime temps must never be chosen for spilling
                for (_, temp) in temps {
                    if let Some(id) = self.node_of(&Operand::VReg(temp)) {
                        self.nodes[id].frequency = f64::INFINITY;
                    }
                }
                index = last + 1;
            }
        }

        debug!(
            "catalogued {} nodes ({} hard registers)",
            self.nodes.len(),
            self.hard_nodes.iter().flatten().count()
        );
        Ok(())
    }
}
